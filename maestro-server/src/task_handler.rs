use crate::ServerConfig;
use maestro_core::{
    Conversation, MaestroError, MessageRole, NewMessage, Repository, Result, TaskRecord, TaskState,
};
use maestro_a2a::TransferData;
use maestro_agent::{Agent, GenerateRequest, ModelFactory, resolve_model_settings};
use maestro_artifact::StreamPart;
use maestro_context::ContextResolver;
use maestro_model::LanguageModel;
use maestro_session::{
    AgentSessionManager, CreateSessionRequest, StatusUpdateConfig, SummaryEmission,
};
use maestro_tool::ToolRegistry;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything the transport hands over for one turn.
pub struct TurnRequest {
    pub message_id: String,
    pub text: String,
    pub conversation_id: Option<String>,
    pub task_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub request_headers: HashMap<String, String>,
    pub streaming: bool,
    pub part_sink: Option<mpsc::UnboundedSender<StreamPart>>,
    pub summary_sink: Option<mpsc::UnboundedSender<SummaryEmission>>,
    pub cancellation: CancellationToken,
}

impl TurnRequest {
    pub fn blocking(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            text: text.into(),
            conversation_id: None,
            task_id: None,
            metadata: Map::new(),
            request_headers: HashMap::new(),
            streaming: false,
            part_sink: None,
            summary_sink: None,
            cancellation: CancellationToken::new(),
        }
    }

    fn is_delegation(&self) -> bool {
        self.metadata.get("is_delegation").and_then(Value::as_bool).unwrap_or(false)
    }

    fn target_sub_agent_id(&self) -> Option<&str> {
        self.metadata.get("target_sub_agent_id").and_then(Value::as_str)
    }

    fn stream_request_id(&self, task_id: &str) -> String {
        self.metadata
            .get("stream_request_id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| task_id.to_string())
    }
}

/// What one turn produced.
pub struct TurnOutcome {
    pub task_id: String,
    pub conversation_id: String,
    pub sub_agent_id: String,
    pub parts: Vec<StreamPart>,
    pub transfer: Option<TransferData>,
}

/// The transport-facing entry point: hydrates the agent configuration
/// from the repository, runs generation, detects transfer, persists
/// messages, and maintains task rows.
pub struct TaskHandler {
    config: ServerConfig,
    repository: Arc<dyn Repository>,
    registry: Arc<ToolRegistry>,
    context_resolver: Arc<ContextResolver>,
    sessions: Arc<AgentSessionManager>,
    model_factory: Arc<dyn ModelFactory>,
}

impl TaskHandler {
    pub fn new(
        config: ServerConfig,
        repository: Arc<dyn Repository>,
        registry: Arc<ToolRegistry>,
        context_resolver: Arc<ContextResolver>,
        sessions: Arc<AgentSessionManager>,
        model_factory: Arc<dyn ModelFactory>,
    ) -> Self {
        Self { config, repository, registry, context_resolver, sessions, model_factory }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        self.repository.clone()
    }

    /// Run one turn end to end.
    pub async fn execute_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let scope = self.config.scope.clone();
        tracing::info!(
            message_id = %request.message_id,
            delegation = request.is_delegation(),
            "handling turn"
        );

        let conversation_id = request
            .conversation_id
            .clone()
            .or_else(|| request.task_id.as_deref().and_then(parse_conversation_from_task_id))
            .unwrap_or_else(|| "default".to_string());

        let agent = self
            .repository
            .get_agent_with_sub_agents(&scope, &self.config.agent_id)
            .await?
            .ok_or_else(|| {
                MaestroError::BadRequest(format!("agent not found: {}", self.config.agent_id))
            })?;

        // First user message creates the conversation.
        let conversation = match self.repository.get_conversation(&scope, &conversation_id).await? {
            Some(conversation) => conversation,
            None => {
                let conversation = Conversation {
                    id: conversation_id.clone(),
                    tenant_id: scope.tenant_id.clone(),
                    project_id: scope.project_id.clone(),
                    active_sub_agent_id: agent.agent.default_sub_agent_id.clone(),
                    created_at: Utc::now(),
                };
                self.repository.create_conversation(&scope, conversation.clone()).await?;
                conversation
            }
        };

        let is_delegation = request.is_delegation();
        let sub_agent_id = request
            .target_sub_agent_id()
            .map(String::from)
            .unwrap_or_else(|| conversation.active_sub_agent_id.clone());
        let sub_agent =
            self.repository.get_sub_agent(&scope, &sub_agent_id).await?.ok_or_else(|| {
                MaestroError::BadRequest(format!("sub-agent not found: {sub_agent_id}"))
            })?;

        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| make_task_id(&conversation_id));
        let stream_request_id = request.stream_request_id(&task_id);

        let mut task_metadata = HashMap::new();
        task_metadata.insert("stream_request_id".to_string(), json!(stream_request_id));
        if is_delegation {
            task_metadata.insert("is_delegation".to_string(), json!(true));
        }
        self.repository
            .create_task(
                &scope,
                TaskRecord {
                    id: task_id.clone(),
                    conversation_id: conversation_id.clone(),
                    sub_agent_id: sub_agent_id.clone(),
                    status: TaskState::Working,
                    metadata: task_metadata,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            )
            .await?;

        // Delegated turns already have their request persisted as an
        // a2a-request message by the delegating side.
        if !is_delegation {
            let mut user_message =
                NewMessage::chat(&conversation_id, MessageRole::User, &request.text);
            user_message.task_id = Some(task_id.clone());
            self.repository.create_message(&scope, user_message).await?;
        }

        // Delegation never streams to the client and shares the parent's
        // sessions.
        let streaming = request.streaming && !is_delegation;
        let status = self.status_update_config(&agent.agent, streaming, &request);
        let agent_session = self.sessions.get_or_create(CreateSessionRequest {
            session_id: stream_request_id.clone(),
            scope: scope.clone(),
            conversation_id: conversation_id.clone(),
            task_id: task_id.clone(),
            sub_agent_id: sub_agent_id.clone(),
            status,
        });
        let tool_session = self.sessions.tool_sessions().ensure(
            &stream_request_id,
            &scope.tenant_id,
            &scope.project_id,
            &conversation_id,
            &task_id,
        );

        let models = resolve_model_settings(
            &sub_agent.models,
            &agent.agent.models,
            &Default::default(),
        )?;
        let engine = Agent::new(
            scope.clone(),
            sub_agent,
            models,
            self.model_factory.clone(),
            self.repository.clone(),
            self.registry.clone(),
            self.context_resolver.clone(),
            self.config.base_url.clone(),
            self.config.service_token.clone(),
        );

        let result = engine
            .generate(GenerateRequest {
                user_message: request.text.clone(),
                conversation_id: conversation_id.clone(),
                task_id: task_id.clone(),
                stream_request_id: stream_request_id.clone(),
                request_headers: request.request_headers.clone(),
                streaming,
                part_sink: request.part_sink.clone(),
                agent_session,
                tool_session,
                cancellation: request.cancellation.clone(),
            })
            .await;

        let outcome = match result {
            Ok(generation) => {
                if let Some(transfer) = &generation.transfer {
                    self.repository
                        .set_active_sub_agent_for_thread(
                            &scope,
                            &conversation_id,
                            &transfer.target_subagent_id,
                        )
                        .await?;
                } else {
                    let text = collect_text(&generation.parts);
                    let mut agent_message = NewMessage::chat(
                        &conversation_id,
                        MessageRole::Agent,
                        text,
                    );
                    agent_message.task_id = Some(task_id.clone());
                    agent_message.from_sub_agent_id = Some(sub_agent_id.clone());
                    if is_delegation {
                        agent_message.visibility = maestro_core::MessageVisibility::Internal;
                    }
                    self.repository.create_message(&scope, agent_message).await?;
                }

                self.repository
                    .update_task(&scope, &task_id, TaskState::Completed, None)
                    .await?;

                Ok(TurnOutcome {
                    task_id: task_id.clone(),
                    conversation_id,
                    sub_agent_id,
                    parts: generation.parts,
                    transfer: generation.transfer,
                })
            }
            Err(MaestroError::Cancelled) => {
                self.repository
                    .update_task(&scope, &task_id, TaskState::Canceled, None)
                    .await?;
                Err(MaestroError::Cancelled)
            }
            Err(e) => {
                self.repository
                    .update_task(&scope, &task_id, TaskState::Failed, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        };

        // Turn end: only the top-level turn owns the session.
        if !is_delegation {
            self.sessions.end_session(&stream_request_id);
        }

        outcome
    }

    fn status_update_config(
        &self,
        agent: &maestro_core::AgentDefinition,
        streaming: bool,
        request: &TurnRequest,
    ) -> Option<StatusUpdateConfig> {
        if !streaming {
            return None;
        }
        let settings = agent.status_updates.clone()?;
        let emitter = request.summary_sink.clone()?;

        let summarizer_settings = agent
            .models
            .summarizer
            .clone()
            .or_else(|| agent.models.base.clone())?;
        let summarizer: Arc<dyn LanguageModel> =
            self.model_factory.create(&summarizer_settings).ok()?;

        Some(StatusUpdateConfig {
            settings,
            summarizer,
            model_name: summarizer_settings.model,
            repository: self.repository.clone(),
            emitter,
        })
    }
}

/// Delegation-style task ids carry the conversation:
/// `task_<conversation>-<n>-<suffix>`. The suffix has no dashes, so the
/// conversation id may contain them.
pub fn parse_conversation_from_task_id(task_id: &str) -> Option<String> {
    let rest = task_id.strip_prefix("task_")?;
    let mut pieces = rest.rsplitn(3, '-');
    let _suffix = pieces.next()?;
    let _sequence = pieces.next()?;
    let conversation = pieces.next()?;
    if conversation.is_empty() { None } else { Some(conversation.to_string()) }
}

fn make_task_id(conversation_id: &str) -> String {
    format!("task_{}-0-{}", conversation_id, uuid::Uuid::new_v4().simple())
}

fn collect_text(parts: &[StreamPart]) -> String {
    parts.iter().filter_map(StreamPart::as_text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conversation_from_task_id() {
        assert_eq!(
            parse_conversation_from_task_id("task_conv-42-1-abcdef").as_deref(),
            Some("conv-42")
        );
        assert_eq!(parse_conversation_from_task_id("task_c1-0-xyz").as_deref(), Some("c1"));
        assert_eq!(parse_conversation_from_task_id("nope"), None);
        assert_eq!(parse_conversation_from_task_id("task_only"), None);
    }

    #[test]
    fn test_task_id_roundtrip() {
        let task_id = make_task_id("conv-with-dashes");
        assert_eq!(
            parse_conversation_from_task_id(&task_id).as_deref(),
            Some("conv-with-dashes")
        );
    }
}
