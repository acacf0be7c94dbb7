use crate::history::{
    HistoryScope, format_artifact_list, format_history, load_history, scoped_artifacts,
};
use crate::prompts::{
    PlanningPromptInputs, StructuredPromptInputs, build_planning_prompt, build_structured_prompt,
};
use crate::schema::structured_output_schema;
use maestro_core::{
    MaestroError, ModelSettings, ModelSettingsMap, Repository, Result, Scope, SubAgentDefinition,
    TemplateMode, render_template,
};
use maestro_a2a::TransferData;
use maestro_artifact::{
    ArtifactEnricher, ArtifactExtractor, PartialObjectAdapter, StreamParser, StreamPart,
    is_artifact_create_entry,
};
use maestro_context::{ContextRequest, ContextResolver};
use maestro_model::{
    LanguageModel, ModelMessage, ModelPart, ModelRequest, ModelResponse, ModelRole, ToolChoice,
    ToolDeclaration,
};
use maestro_session::{AgentSession, SessionEvent, ToolSessionData};
use maestro_tool::{Tool, ToolInvocation, ToolRegistry, ToolSetRequest};
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Hard cap on any single model call.
const HARD_MAX_TIMEOUT: Duration = Duration::from_secs(600);
/// First-call default when streaming to the client.
const DEFAULT_STREAMING_TIMEOUT: Duration = Duration::from_secs(120);
/// First-call default for blocking generation.
const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(300);
/// Phase-2 calls run against an already-gathered context.
const DEFAULT_PHASE2_TIMEOUT: Duration = Duration::from_secs(60);

/// Step cap when the sub-agent does not configure one.
const DEFAULT_MAX_STEPS: u32 = 20;

/// Instantiates concrete models from resolved settings. Tests inject
/// scripted models through this seam.
pub trait ModelFactory: Send + Sync {
    fn create(&self, settings: &ModelSettings) -> Result<Arc<dyn LanguageModel>>;
}

/// Model settings after sub-agent → agent → project inheritance.
#[derive(Debug, Clone)]
pub struct ResolvedModels {
    pub base: ModelSettings,
    pub structured_output: ModelSettings,
    pub summarizer: ModelSettings,
}

pub fn resolve_model_settings(
    sub_agent: &ModelSettingsMap,
    agent: &ModelSettingsMap,
    project: &ModelSettingsMap,
) -> Result<ResolvedModels> {
    let pick = |get: fn(&ModelSettingsMap) -> Option<&ModelSettings>| {
        get(sub_agent).or_else(|| get(agent)).or_else(|| get(project)).cloned()
    };

    let base = pick(|m| m.base.as_ref())
        .ok_or_else(|| MaestroError::Config("no base model configured".into()))?;
    let structured_output =
        pick(|m| m.structured_output.as_ref()).unwrap_or_else(|| base.clone());
    let summarizer = pick(|m| m.summarizer.as_ref()).unwrap_or_else(|| base.clone());

    Ok(ResolvedModels { base, structured_output, summarizer })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    TextGeneration,
    ObjectGeneration,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::TextGeneration => "text_generation",
            GenerationKind::ObjectGeneration => "object_generation",
        }
    }
}

/// Final product of one turn.
pub struct GenerationOutcome {
    pub parts: Vec<StreamPart>,
    pub transfer: Option<TransferData>,
    pub generation_type: GenerationKind,
}

/// One generation request, carrying the turn's sessions and channels.
pub struct GenerateRequest {
    pub user_message: String,
    pub conversation_id: String,
    pub task_id: String,
    pub stream_request_id: String,
    pub request_headers: HashMap<String, String>,
    /// Client-facing streaming; suppressed for delegated calls.
    pub streaming: bool,
    pub part_sink: Option<mpsc::UnboundedSender<StreamPart>>,
    pub agent_session: Arc<AgentSession>,
    pub tool_session: Arc<ToolSessionData>,
    pub cancellation: CancellationToken,
}

/// The two-phase generation engine for one sub-agent.
pub struct Agent {
    scope: Scope,
    sub_agent: SubAgentDefinition,
    models: ResolvedModels,
    factory: Arc<dyn ModelFactory>,
    repository: Arc<dyn Repository>,
    registry: Arc<ToolRegistry>,
    context_resolver: Arc<ContextResolver>,
    local_base_url: String,
    service_token: Option<String>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: Scope,
        sub_agent: SubAgentDefinition,
        models: ResolvedModels,
        factory: Arc<dyn ModelFactory>,
        repository: Arc<dyn Repository>,
        registry: Arc<ToolRegistry>,
        context_resolver: Arc<ContextResolver>,
        local_base_url: String,
        service_token: Option<String>,
    ) -> Self {
        Self {
            scope,
            sub_agent,
            models,
            factory,
            repository,
            registry,
            context_resolver,
            local_base_url,
            service_token,
        }
    }

    pub fn sub_agent(&self) -> &SubAgentDefinition {
        &self.sub_agent
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerationOutcome> {
        let base_model = self.factory.create(&self.models.base)?;
        let structured = !self.sub_agent.data_components.is_empty();
        let streaming_mode = request.streaming && !structured;

        // ----- context + prompt rendering -----
        let resolved_context = match &self.sub_agent.context_config_id {
            Some(config_id) => {
                self.context_resolver
                    .resolve(
                        &self.scope,
                        config_id,
                        &ContextRequest {
                            conversation_id: request.conversation_id.clone(),
                            request_headers: request.request_headers.clone(),
                            strict: false,
                        },
                    )
                    .await?
            }
            None => ContextResolver::baseline(),
        };
        let core_prompt =
            render_template(&self.sub_agent.prompt, &resolved_context, TemplateMode::Lenient)?;

        // ----- tools and history load in parallel -----
        let tool_set_request = ToolSetRequest {
            scope: self.scope.clone(),
            sub_agent: self.sub_agent.clone(),
            resolved_context: resolved_context.clone(),
            conversation_id: request.conversation_id.clone(),
            task_id: request.task_id.clone(),
            agent_session: request.agent_session.clone(),
            tool_session: request.tool_session.clone(),
            local_base_url: self.local_base_url.clone(),
            service_token: self.service_token.clone(),
        };
        let history_scope = HistoryScope {
            sub_agent_id: self.sub_agent.id.clone(),
            task_id: request.task_id.clone(),
        };
        let (tool_set, history) = tokio::join!(
            self.registry.build_tool_set(&tool_set_request),
            load_history(
                &self.repository,
                &self.scope,
                &request.conversation_id,
                &self.sub_agent.conversation_history_config,
                &history_scope,
            ),
        );
        let tool_set = tool_set?;
        let history = history?;

        let artifacts =
            scoped_artifacts(&self.repository, &self.scope, &history, &request.task_id).await?;
        let artifact_list = format_artifact_list(&artifacts);

        // ----- system prompts -----
        let ordered_tools: BTreeMap<String, Arc<dyn Tool>> =
            tool_set.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let planning_prompt = build_planning_prompt(&PlanningPromptInputs {
            core_prompt: &core_prompt,
            tools: &ordered_tools,
            artifact_list: &artifact_list,
            data_components: &self.sub_agent.data_components,
            artifact_components: &self.sub_agent.artifact_components,
            can_transfer: !self.sub_agent.can_transfer_to.is_empty(),
            can_delegate: !self.sub_agent.can_delegate_to.is_empty(),
            structured_output: structured,
        });

        let mut messages = vec![ModelMessage::text(ModelRole::System, planning_prompt)];
        let history_block = format_history(&history);
        if !history_block.is_empty() {
            messages.push(ModelMessage::text(ModelRole::User, history_block));
        }
        messages.push(ModelMessage::text(ModelRole::User, request.user_message.clone()));

        // ----- artifact pipeline -----
        let enricher = Arc::new(ArtifactEnricher::new(
            self.repository.clone(),
            self.scope.clone(),
            Some((self.factory.create(&self.models.summarizer)?, self.models.summarizer.model.clone())),
        ));
        let extractor = Arc::new(ArtifactExtractor::new(
            request.agent_session.clone(),
            request.tool_session.clone(),
            self.sub_agent.artifact_components.clone(),
            enricher,
        ));

        // ----- Phase 1: planning with tools -----
        let phase1 = self
            .run_phase1(
                &request,
                base_model.as_ref(),
                &tool_set,
                messages,
                streaming_mode,
                structured,
                extractor.clone(),
            )
            .await?;

        // ----- transfer short-circuit -----
        if let Some(transfer_value) = phase1.transfer {
            let target = transfer_value
                .get("targetSubAgentId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let from = transfer_value
                .get("fromSubAgentId")
                .and_then(Value::as_str)
                .map(String::from);
            let reason = if phase1.final_text.is_empty() {
                format!("Transferring conversation to {target}")
            } else {
                phase1.final_text.clone()
            };

            request.agent_session.record_event(SessionEvent::transfer(
                from.as_deref().unwrap_or(&self.sub_agent.id),
                &target,
                &reason,
            ));
            request
                .agent_session
                .record_event(SessionEvent::agent_generate(&self.sub_agent.id, "text_generation"));

            return Ok(GenerationOutcome {
                parts: Vec::new(),
                transfer: Some(TransferData::new(
                    target,
                    from,
                    request.task_id.clone(),
                    reason,
                    request.user_message.clone(),
                )),
                generation_type: GenerationKind::TextGeneration,
            });
        }

        // ----- Phase 2: structured output -----
        let (parts, generation_type) = if structured {
            if !phase1.thinking_complete {
                tracing::warn!(
                    sub_agent = %self.sub_agent.id,
                    "phase 1 hit the step limit without thinking_complete; proceeding to structured output"
                );
            }
            let phase2_parts = self
                .run_phase2(&request, &core_prompt, &artifact_list, &history, &phase1, extractor)
                .await?;
            let mut parts = phase1.parts;
            parts.extend(phase2_parts);
            (parts, GenerationKind::ObjectGeneration)
        } else {
            (phase1.parts, GenerationKind::TextGeneration)
        };

        request.agent_session.record_event(SessionEvent::agent_generate(
            &self.sub_agent.id,
            generation_type.as_str(),
        ));

        Ok(GenerationOutcome { parts, transfer: None, generation_type })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phase1(
        &self,
        request: &GenerateRequest,
        model: &dyn LanguageModel,
        tool_set: &HashMap<String, Arc<dyn Tool>>,
        mut messages: Vec<ModelMessage>,
        streaming_mode: bool,
        structured: bool,
        extractor: Arc<ArtifactExtractor>,
    ) -> Result<Phase1Outcome> {
        let declarations: Vec<ToolDeclaration> = tool_set
            .values()
            .map(|tool| ToolDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool
                    .parameters_schema()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            })
            .collect();

        let tool_choice = if streaming_mode {
            ToolChoice::Auto
        } else if structured {
            ToolChoice::Required
        } else {
            ToolChoice::Auto
        };
        let timeout = phase1_timeout(&self.models.base, streaming_mode);
        let max_steps = self.sub_agent.stop_when.step_count_is.unwrap_or(DEFAULT_MAX_STEPS);

        let mut outcome = Phase1Outcome::default();
        let mut parser = StreamParser::new(extractor);

        for _step in 0..max_steps {
            let model_request =
                ModelRequest::new(self.models.base.model.clone(), messages.clone())
                    .with_tools(declarations.clone())
                    .with_tool_choice(tool_choice);

            let response = if streaming_mode {
                request.agent_session.set_text_streaming(true);
                let result = self
                    .consume_stream(model, model_request, timeout, request, Some(&mut parser), &mut outcome.parts)
                    .await;
                request.agent_session.set_text_streaming(false);
                result?
            } else {
                self.consume_stream(model, model_request, timeout, request, None, &mut outcome.parts)
                    .await?
            };

            let Some(content) = response.content else { break };

            let text = content.text_content();
            if !text.is_empty() {
                request
                    .agent_session
                    .record_event(SessionEvent::agent_reasoning(&self.sub_agent.id, &text));
                outcome.final_text = text.clone();
            }

            let calls: Vec<(String, String, Value)> = content
                .tool_calls()
                .into_iter()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                .collect();

            if calls.is_empty() {
                // Plain text answer: in non-streaming mode it has not been
                // through the directive parser yet.
                if !streaming_mode && !text.is_empty() {
                    outcome.parts.extend(parser.push_text(&text).await?);
                }
                break;
            }

            messages.push(content.clone());
            outcome.reasoning_flow.push(content);

            let mut tool_message = ModelMessage::new(ModelRole::Tool);
            for (call_id, name, args) in calls {
                let invocation = ToolInvocation::new(call_id.clone(), &request.stream_request_id)
                    .with_cancellation(request.cancellation.clone());

                let result_value = match tool_set.get(&name) {
                    Some(tool) => match tool.execute(&invocation, args).await {
                        Ok(value) => value,
                        Err(MaestroError::Cancelled) => return Err(MaestroError::Cancelled),
                        Err(e) => json!({ "error": e.to_string() }),
                    },
                    None => {
                        tracing::warn!(tool = %name, "model called an unknown tool");
                        json!({ "error": format!("unknown tool: {name}") })
                    }
                };

                if result_value.get("type").and_then(Value::as_str) == Some("transfer") {
                    outcome.transfer = Some(result_value.clone());
                }
                if result_value.get("status").and_then(Value::as_str)
                    == Some("thinking_complete")
                {
                    outcome.thinking_complete = true;
                }

                tool_message.parts.push(ModelPart::ToolResult {
                    id: call_id,
                    name,
                    result: result_value,
                });
            }

            messages.push(tool_message.clone());
            outcome.reasoning_flow.push(tool_message);

            // Stop conditions: a transfer result landed, or the
            // thinking_complete sentinel landed.
            if outcome.transfer.is_some() || outcome.thinking_complete {
                break;
            }
        }

        outcome.parts.extend(parser.finish().await?);
        Ok(outcome)
    }

    async fn run_phase2(
        &self,
        request: &GenerateRequest,
        core_prompt: &str,
        artifact_list: &str,
        history: &[maestro_core::MessageRecord],
        phase1: &Phase1Outcome,
        extractor: Arc<ArtifactExtractor>,
    ) -> Result<Vec<StreamPart>> {
        let model = self.factory.create(&self.models.structured_output)?;
        let prompt = build_structured_prompt(&StructuredPromptInputs {
            core_prompt,
            data_components: &self.sub_agent.data_components,
            artifact_components: &self.sub_agent.artifact_components,
            artifact_list,
        });

        let mut messages = vec![ModelMessage::text(ModelRole::System, prompt)];
        let history_block = format_history(history);
        if !history_block.is_empty() {
            messages.push(ModelMessage::text(ModelRole::User, history_block));
        }
        messages.push(ModelMessage::text(ModelRole::User, request.user_message.clone()));
        messages.extend(serialize_reasoning_flow(&phase1.reasoning_flow));

        let schema = structured_output_schema(
            &self.sub_agent.data_components,
            &self.sub_agent.artifact_components,
        );
        let model_request =
            ModelRequest::new(self.models.structured_output.model.clone(), messages)
                .with_tool_choice(ToolChoice::None)
                .with_response_schema(schema);

        let timeout = self
            .models
            .structured_output
            .max_duration
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PHASE2_TIMEOUT)
            .min(HARD_MAX_TIMEOUT);

        if request.streaming {
            let mut adapter = PartialObjectAdapter::new(extractor);
            let mut parts = Vec::new();
            let mut stream = model.generate(model_request, true).await?;

            let consume = async {
                while let Some(item) = stream.next().await {
                    let response = item?;
                    if let Some(message) = response.error_message.clone() {
                        return Err(MaestroError::Model(message));
                    }
                    if response.partial {
                        let delta = response.text_content();
                        for part in adapter.push(&delta).await? {
                            forward(&request.part_sink, &part);
                            parts.push(part);
                        }
                    }
                }
                Ok(())
            };
            run_bounded(consume, timeout, &request.cancellation).await?;

            for part in adapter.finish().await? {
                forward(&request.part_sink, &part);
                parts.push(part);
            }
            Ok(parts)
        } else {
            let mut stream = model.generate(model_request, false).await?;
            let mut final_response = None;
            let consume = async {
                while let Some(item) = stream.next().await {
                    let response = item?;
                    if let Some(message) = response.error_message.clone() {
                        return Err(MaestroError::Model(message));
                    }
                    if response.turn_complete {
                        final_response = Some(response);
                    }
                }
                Ok(())
            };
            run_bounded(consume, timeout, &request.cancellation).await?;

            let text = final_response.map(|r| r.text_content()).unwrap_or_default();
            let parsed: Value = serde_json::from_str(text.trim()).map_err(|e| {
                MaestroError::Model(format!("structured output is not valid JSON: {e}"))
            })?;

            let mut parts = Vec::new();
            for entry in parsed
                .get("dataComponents")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
            {
                if is_artifact_create_entry(&entry) {
                    if let Some(data) = extractor.handle_structured(&entry).await {
                        parts.push(StreamPart::Data { data });
                    }
                } else {
                    parts.push(StreamPart::Data { data: entry });
                }
            }
            Ok(parts)
        }
    }

    /// Drive one model call to completion under the phase deadline,
    /// optionally routing text deltas through the stream parser.
    async fn consume_stream(
        &self,
        model: &dyn LanguageModel,
        model_request: ModelRequest,
        timeout: Duration,
        request: &GenerateRequest,
        mut parser: Option<&mut StreamParser>,
        parts: &mut Vec<StreamPart>,
    ) -> Result<ModelResponse> {
        let streaming = parser.is_some();
        let mut stream = model.generate(model_request, streaming).await?;
        let mut final_response = None;

        let consume = async {
            while let Some(item) = stream.next().await {
                let response = item?;
                if let Some(message) = response.error_message.clone() {
                    return Err(MaestroError::Model(message));
                }
                if response.partial {
                    if let Some(parser) = parser.as_deref_mut() {
                        let delta = response.text_content();
                        for part in parser.push_text(&delta).await? {
                            forward(&request.part_sink, &part);
                            parts.push(part);
                        }
                    }
                } else if response.turn_complete {
                    final_response = Some(response);
                }
            }
            Ok(())
        };
        run_bounded(consume, timeout, &request.cancellation).await?;

        final_response
            .ok_or_else(|| MaestroError::Model("model stream ended without a response".into()))
    }
}

#[derive(Default)]
struct Phase1Outcome {
    parts: Vec<StreamPart>,
    reasoning_flow: Vec<ModelMessage>,
    transfer: Option<Value>,
    thinking_complete: bool,
    final_text: String,
}

fn phase1_timeout(settings: &ModelSettings, streaming: bool) -> Duration {
    let configured = settings.max_duration.map(Duration::from_secs);
    let default =
        if streaming { DEFAULT_STREAMING_TIMEOUT } else { DEFAULT_BLOCKING_TIMEOUT };
    configured.unwrap_or(default).min(HARD_MAX_TIMEOUT)
}

/// Bound a future by the phase deadline and the turn's cancellation.
async fn run_bounded<F>(
    future: F,
    timeout: Duration,
    cancellation: &CancellationToken,
) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        _ = cancellation.cancelled() => Err(MaestroError::Cancelled),
        bounded = tokio::time::timeout(timeout, future) => match bounded {
            Ok(result) => result,
            Err(_) => Err(MaestroError::ModelTimeout(format!(
                "model call exceeded {}s",
                timeout.as_secs()
            ))),
        },
    }
}

fn forward(sink: &Option<mpsc::UnboundedSender<StreamPart>>, part: &StreamPart) {
    if let Some(sink) = sink {
        let _ = sink.send(part.clone());
    }
}

/// Phase-1 tool activity rendered as assistant messages for the Phase-2
/// context. `_structureHints` annotations are stripped.
fn serialize_reasoning_flow(flow: &[ModelMessage]) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for message in flow {
        for part in &message.parts {
            match part {
                ModelPart::ToolCall { name, args, .. } => {
                    out.push(ModelMessage::text(
                        ModelRole::Assistant,
                        format!("Called tool `{name}` with {args}"),
                    ));
                }
                ModelPart::ToolResult { name, result, .. } => {
                    let mut result = result.clone();
                    if let Value::Object(ref mut map) = result {
                        map.remove("_structureHints");
                    }
                    out.push(ModelMessage::text(
                        ModelRole::Assistant,
                        format!("Tool `{name}` returned {result}"),
                    ));
                }
                ModelPart::Text { text } if !text.is_empty() => {
                    out.push(ModelMessage::text(ModelRole::Assistant, text.clone()));
                }
                _ => {}
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_inheritance_chain() {
        let sub = ModelSettingsMap::default();
        let agent = ModelSettingsMap {
            base: Some(ModelSettings::new("agent-base")),
            structured_output: None,
            summarizer: Some(ModelSettings::new("agent-summarizer")),
        };
        let project = ModelSettingsMap {
            base: Some(ModelSettings::new("project-base")),
            structured_output: Some(ModelSettings::new("project-structured")),
            summarizer: None,
        };

        let resolved = resolve_model_settings(&sub, &agent, &project).unwrap();
        assert_eq!(resolved.base.model, "agent-base");
        assert_eq!(resolved.structured_output.model, "project-structured");
        assert_eq!(resolved.summarizer.model, "agent-summarizer");
    }

    #[test]
    fn test_missing_base_model_fails() {
        let empty = ModelSettingsMap::default();
        let err = resolve_model_settings(&empty, &empty, &empty).unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));
    }

    #[test]
    fn test_structured_falls_back_to_base() {
        let sub = ModelSettingsMap {
            base: Some(ModelSettings::new("only-base")),
            structured_output: None,
            summarizer: None,
        };
        let empty = ModelSettingsMap::default();
        let resolved = resolve_model_settings(&sub, &empty, &empty).unwrap();
        assert_eq!(resolved.structured_output.model, "only-base");
        assert_eq!(resolved.summarizer.model, "only-base");
    }

    #[test]
    fn test_phase1_timeout_rules() {
        let mut settings = ModelSettings::new("m");
        assert_eq!(phase1_timeout(&settings, true), DEFAULT_STREAMING_TIMEOUT);
        assert_eq!(phase1_timeout(&settings, false), DEFAULT_BLOCKING_TIMEOUT);

        settings.max_duration = Some(30);
        assert_eq!(phase1_timeout(&settings, false), Duration::from_secs(30));

        settings.max_duration = Some(100_000);
        assert_eq!(phase1_timeout(&settings, false), HARD_MAX_TIMEOUT);
    }

    #[test]
    fn test_reasoning_flow_strips_structure_hints() {
        let flow = vec![
            ModelMessage::new(ModelRole::Assistant).with_part(ModelPart::ToolCall {
                id: "tc-1".into(),
                name: "search".into(),
                args: json!({"q": "k"}),
            }),
            ModelMessage::new(ModelRole::Tool).with_part(ModelPart::ToolResult {
                id: "tc-1".into(),
                name: "search".into(),
                result: json!({"items": [], "_structureHints": {"arrayPaths": ["items"]}}),
            }),
        ];
        let serialized = serialize_reasoning_flow(&flow);
        assert_eq!(serialized.len(), 2);
        assert!(serialized[0].text_content().contains("search"));
        assert!(!serialized[1].text_content().contains("_structureHints"));
    }
}
