use crate::{EventKind, SessionEvent, ToolSessionManager};
use maestro_core::{HistoryQuery, MessageType, Repository, Scope, StatusComponent, StatusUpdateSettings};
use maestro_model::{LanguageModel, ModelMessage, ModelRequest, ModelRole};
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Hard bound on artifacts awaiting enrichment per session.
pub const MAX_PENDING_ARTIFACTS: usize = 100;

/// Bounded history of prior summaries kept to discourage repetition.
const MAX_SUMMARY_HISTORY: usize = 10;

/// A model-authored progress update pushed to the client SSE channel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SummaryEmission {
    #[serde(rename = "type")]
    pub component_type: String,
    pub label: String,
    pub details: Value,
}

/// Artifact projections cached for same-turn reference resolution.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub artifact_id: String,
    pub tool_call_id: String,
    pub task_id: String,
    pub artifact_type: String,
    pub summary: Value,
    pub full: Value,
    pub base_selector: Option<String>,
}

/// Everything the status generator needs: the settings, the summarizer
/// model, conversation access, and the outbound channel.
pub struct StatusUpdateConfig {
    pub settings: StatusUpdateSettings,
    pub summarizer: Arc<dyn LanguageModel>,
    pub model_name: String,
    pub repository: Arc<dyn Repository>,
    pub emitter: mpsc::UnboundedSender<SummaryEmission>,
}

pub struct CreateSessionRequest {
    pub session_id: String,
    pub scope: Scope,
    pub conversation_id: String,
    pub task_id: String,
    pub sub_agent_id: String,
    pub status: Option<StatusUpdateConfig>,
}

/// Per-turn event ledger. Events are totally ordered by `record_event`
/// call order; post-end events are dropped with a debug log.
pub struct AgentSession {
    pub session_id: String,
    pub scope: Scope,
    pub conversation_id: String,
    pub task_id: String,
    pub sub_agent_id: String,

    events: Mutex<Vec<SessionEvent>>,
    ended: AtomicBool,
    text_streaming: AtomicBool,
    last_emitted_event_count: AtomicUsize,
    update_lock: tokio::sync::Mutex<()>,
    status: Option<StatusUpdateConfig>,
    summary_history: Mutex<Vec<String>>,
    pending_artifacts: Mutex<HashSet<String>>,
    artifact_cache: Mutex<HashMap<String, CachedArtifact>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    fn new(request: CreateSessionRequest) -> Self {
        Self {
            session_id: request.session_id,
            scope: request.scope,
            conversation_id: request.conversation_id,
            task_id: request.task_id,
            sub_agent_id: request.sub_agent_id,
            events: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
            text_streaming: AtomicBool::new(false),
            last_emitted_event_count: AtomicUsize::new(0),
            update_lock: tokio::sync::Mutex::new(()),
            status: request.status,
            summary_history: Mutex::new(Vec::new()),
            pending_artifacts: Mutex::new(HashSet::new()),
            artifact_cache: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        }
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Record one event. Synchronous; ordering is the call order. May
    /// schedule a status-update attempt when the event-count trigger fires.
    pub fn record_event(self: &Arc<Self>, event: SessionEvent) {
        if self.ended() {
            tracing::debug!(session_id = %self.session_id, kind = ?event.kind, "event after session end dropped");
            return;
        }

        let count = {
            let mut events = self.events.lock().unwrap();
            events.push(event);
            events.len()
        };

        if let Some(status) = &self.status {
            let num_events = status.settings.num_events;
            if num_events > 0
                && count - self.last_emitted_event_count.load(Ordering::SeqCst) >= num_events
                && !self.is_text_streaming()
            {
                let session = self.clone();
                let handle = tokio::spawn(async move {
                    session.attempt_status_update().await;
                });
                self.background.lock().unwrap().push(handle);
            }
        }
    }

    pub fn events_snapshot(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Text streaming and status generation are mutually exclusive.
    pub fn set_text_streaming(&self, streaming: bool) {
        self.text_streaming.store(streaming, Ordering::SeqCst);
    }

    pub fn is_text_streaming(&self) -> bool {
        self.text_streaming.load(Ordering::SeqCst)
    }

    // ----- artifact bookkeeping (used by the extraction pipeline) -----

    /// Returns false when the pending set is full; the caller drops the
    /// artifact with a warning.
    pub fn add_pending_artifact(&self, key: impl Into<String>) -> bool {
        let mut pending = self.pending_artifacts.lock().unwrap();
        if pending.len() >= MAX_PENDING_ARTIFACTS {
            tracing::warn!(session_id = %self.session_id, "pending artifact set full, dropping");
            return false;
        }
        pending.insert(key.into());
        true
    }

    pub fn remove_pending_artifact(&self, key: &str) {
        self.pending_artifacts.lock().unwrap().remove(key);
    }

    pub fn pending_artifact_count(&self) -> usize {
        self.pending_artifacts.lock().unwrap().len()
    }

    pub fn cache_artifact(&self, key: impl Into<String>, artifact: CachedArtifact) {
        self.artifact_cache.lock().unwrap().insert(key.into(), artifact);
    }

    pub fn cached_artifact(&self, key: &str) -> Option<CachedArtifact> {
        self.artifact_cache.lock().unwrap().get(key).cloned()
    }

    /// Track a background task (artifact enrichment) for cleanup.
    pub fn track_background(&self, handle: JoinHandle<()>) {
        self.background.lock().unwrap().push(handle);
    }

    // ----- status updates -----

    /// Single-flight status generation; duplicate attempts return at once.
    pub async fn attempt_status_update(self: Arc<Self>) {
        let Some(status) = &self.status else { return };
        if self.ended() || self.is_text_streaming() {
            return;
        }
        let Ok(_guard) = self.update_lock.try_lock() else {
            return;
        };

        let (new_events, total) = {
            let events = self.events.lock().unwrap();
            let last = self.last_emitted_event_count.load(Ordering::SeqCst).min(events.len());
            (events[last..].to_vec(), events.len())
        };
        if new_events.is_empty() {
            return;
        }

        let history = status
            .repository
            .get_conversation_history(
                &self.scope,
                &self.conversation_id,
                &HistoryQuery {
                    limit: 10,
                    include_internal: false,
                    message_types: vec![MessageType::Chat],
                    max_output_tokens: 1000,
                },
            )
            .await
            .unwrap_or_default();

        let prior = self.summary_history.lock().unwrap().clone();
        let prompt = build_status_prompt(
            status.settings.prompt.as_deref(),
            &new_events,
            &history,
            &prior,
        );
        let schema = status_update_schema(&status.settings.status_components);

        let request = ModelRequest::new(
            status.model_name.clone(),
            vec![
                ModelMessage::text(ModelRole::System, STATUS_SYSTEM_PROMPT),
                ModelMessage::text(ModelRole::User, prompt),
            ],
        )
        .with_response_schema(schema);

        let updates = match generate_updates(status.summarizer.as_ref(), request).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "status update generation failed");
                self.last_emitted_event_count.store(total, Ordering::SeqCst);
                return;
            }
        };

        for update in updates {
            let component_type =
                update.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
            if component_type.is_empty() || component_type == "no_relevant_updates" {
                continue;
            }
            let label =
                update.get("label").and_then(Value::as_str).unwrap_or_default().to_string();
            if label.is_empty() {
                continue;
            }
            let emission = SummaryEmission {
                component_type,
                label,
                details: update.get("details").cloned().unwrap_or(Value::Null),
            };

            {
                let mut summaries = self.summary_history.lock().unwrap();
                summaries.push(serde_json::to_string(&emission).unwrap_or_default());
                let overflow = summaries.len().saturating_sub(MAX_SUMMARY_HISTORY);
                if overflow > 0 {
                    summaries.drain(..overflow);
                }
            }

            if status.emitter.send(emission).is_err() {
                tracing::debug!(session_id = %self.session_id, "summary receiver gone");
            }
        }

        self.last_emitted_event_count.store(total, Ordering::SeqCst);
    }

    fn start_timer(self: &Arc<Self>) {
        let Some(status) = &self.status else { return };
        let seconds = status.settings.time_in_seconds;
        if seconds == 0 {
            return;
        }

        let session = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(seconds));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                let Some(session) = session.upgrade() else { break };
                if session.ended() {
                    break;
                }
                session.attempt_status_update().await;
            }
        });
        *self.timer.lock().unwrap() = Some(handle);
    }

    /// End the session: cancel the timer, release background tasks, clear
    /// artifact state. Idempotent. Background tasks are detached rather
    /// than aborted — in-flight artifact persistence must still land, and
    /// every task checks the ended flag before touching the session.
    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
        self.background.lock().unwrap().clear();
        self.pending_artifacts.lock().unwrap().clear();
        self.artifact_cache.lock().unwrap().clear();
        tracing::debug!(session_id = %self.session_id, "agent session ended");
    }
}

const STATUS_SYSTEM_PROMPT: &str = "You summarize in-flight agent work for the end user. \
Produce at most one short update per category. If nothing new is worth telling the user, \
return a single no_relevant_updates entry. Never repeat an earlier update.";

fn build_status_prompt(
    custom: Option<&str>,
    events: &[SessionEvent],
    history: &[maestro_core::MessageRecord],
    prior_summaries: &[String],
) -> String {
    let mut sections = Vec::new();
    if let Some(custom) = custom {
        sections.push(custom.to_string());
    }

    let event_lines: Vec<String> = events
        .iter()
        .map(|e| format!("- {}: {}", status_event_label(e.kind), e.data))
        .collect();
    sections.push(format!("New activity since the last update:\n{}", event_lines.join("\n")));

    if !history.is_empty() {
        let lines: Vec<String> =
            history.iter().map(|m| format!("{:?}: {}", m.role, m.content.text)).collect();
        sections.push(format!("Recent conversation:\n{}", lines.join("\n")));
    }

    if !prior_summaries.is_empty() {
        sections.push(format!(
            "Updates already shown to the user (do not repeat):\n{}",
            prior_summaries.join("\n")
        ));
    }

    sections.join("\n\n")
}

fn status_event_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::AgentGenerate => "generation",
        EventKind::AgentReasoning => "reasoning",
        EventKind::Transfer => "transfer",
        EventKind::DelegationSent => "delegation sent",
        EventKind::DelegationReturned => "delegation returned",
        EventKind::ArtifactSaved => "artifact saved",
        EventKind::ToolCall => "tool call",
        EventKind::ToolResult => "tool result",
        EventKind::Error => "error",
    }
}

/// Union schema over `no_relevant_updates` plus one branch per configured
/// component. With zero components the union still accepts
/// `no_relevant_updates` alone.
pub fn status_update_schema(components: &[StatusComponent]) -> Value {
    let mut variants = vec![json!({
        "type": "object",
        "properties": { "type": { "const": "no_relevant_updates" } },
        "required": ["type"],
    })];

    for component in components {
        let details = component
            .detail_schema
            .clone()
            .unwrap_or_else(|| json!({ "type": "object", "additionalProperties": true }));
        variants.push(json!({
            "type": "object",
            "description": component.description,
            "properties": {
                "type": { "const": component.component_type },
                "label": { "type": "string" },
                "details": details,
            },
            "required": ["type", "label"],
        }));
    }

    json!({
        "type": "object",
        "properties": {
            "updates": { "type": "array", "items": { "oneOf": variants } },
        },
        "required": ["updates"],
    })
}

async fn generate_updates(
    summarizer: &dyn LanguageModel,
    request: ModelRequest,
) -> maestro_core::Result<Vec<Value>> {
    let mut stream = summarizer.generate(request, false).await?;
    let mut last = None;
    while let Some(item) = stream.next().await {
        let response = item?;
        if response.turn_complete {
            last = Some(response);
        }
    }
    let Some(response) = last else { return Ok(vec![]) };

    let text = response.text_content();
    let parsed: Value = serde_json::from_str(text.trim()).unwrap_or(Value::Null);
    Ok(parsed
        .get("updates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

/// Process-wide registry of agent sessions keyed by stream-request id.
pub struct AgentSessionManager {
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
    tool_sessions: Arc<ToolSessionManager>,
}

impl AgentSessionManager {
    pub fn new(tool_sessions: Arc<ToolSessionManager>) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), tool_sessions }
    }

    pub fn tool_sessions(&self) -> Arc<ToolSessionManager> {
        self.tool_sessions.clone()
    }

    pub fn create_session(&self, request: CreateSessionRequest) -> Arc<AgentSession> {
        let session_id = request.session_id.clone();
        let session = Arc::new(AgentSession::new(request));
        session.start_timer();
        self.sessions.write().unwrap().insert(session_id, session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Delegated turns share the parent's session; everyone else gets a
    /// fresh one.
    pub fn get_or_create(&self, request: CreateSessionRequest) -> Arc<AgentSession> {
        if let Some(existing) = self.get(&request.session_id) {
            return existing;
        }
        self.create_session(request)
    }

    /// Cleanup: ends the agent session and the matching tool session.
    pub fn end_session(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().unwrap().remove(session_id) {
            session.end();
        }
        self.tool_sessions.end(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_model::{FinishReason, MockModel, ModelResponse};
    use maestro_store::MemoryRepository;

    fn create_request(status: Option<StatusUpdateConfig>) -> CreateSessionRequest {
        CreateSessionRequest {
            session_id: "sr-1".into(),
            scope: Scope::new("tenant", "project"),
            conversation_id: "c1".into(),
            task_id: "t1".into(),
            sub_agent_id: "router".into(),
            status,
        }
    }

    fn status_config(
        num_events: usize,
        summarizer: Arc<dyn LanguageModel>,
    ) -> (StatusUpdateConfig, mpsc::UnboundedReceiver<SummaryEmission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = StatusUpdateConfig {
            settings: StatusUpdateSettings {
                num_events,
                time_in_seconds: 0,
                prompt: None,
                status_components: vec![StatusComponent {
                    component_type: "progress".into(),
                    description: "Work progress".into(),
                    detail_schema: None,
                }],
            },
            summarizer,
            model_name: "summarizer".into(),
            repository: Arc::new(MemoryRepository::new()),
            emitter: tx,
        };
        (config, rx)
    }

    fn summarizer_with(updates: Value) -> Arc<MockModel> {
        Arc::new(MockModel::new("summarizer").with_response(ModelResponse::complete(
            ModelMessage::text(ModelRole::Assistant, updates.to_string()),
            FinishReason::Stop,
        )))
    }

    #[tokio::test]
    async fn test_event_order_preserved() {
        let manager = AgentSessionManager::new(Arc::new(ToolSessionManager::new()));
        let session = manager.create_session(create_request(None));

        session.record_event(SessionEvent::tool_call("a", "1", &json!({})));
        session.record_event(SessionEvent::tool_result("a", "1", &json!({})));
        session.record_event(SessionEvent::error("x"));

        let events = session.events_snapshot();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::ToolCall);
        assert_eq!(events[1].kind, EventKind::ToolResult);
        assert_eq!(events[2].kind, EventKind::Error);
    }

    #[tokio::test]
    async fn test_events_after_end_dropped() {
        let manager = AgentSessionManager::new(Arc::new(ToolSessionManager::new()));
        let session = manager.create_session(create_request(None));
        manager.end_session("sr-1");

        session.record_event(SessionEvent::error("late"));
        assert_eq!(session.event_count(), 0);
    }

    #[tokio::test]
    async fn test_status_update_emitted_after_threshold() {
        let summarizer = summarizer_with(json!({
            "updates": [{ "type": "progress", "label": "Searched two sources" }]
        }));
        let (config, mut rx) = status_config(3, summarizer.clone());

        let manager = AgentSessionManager::new(Arc::new(ToolSessionManager::new()));
        let session = manager.create_session(create_request(Some(config)));

        for i in 0..3 {
            session.record_event(SessionEvent::tool_result("search", &format!("tc-{i}"), &json!({})));
        }

        let emission =
            tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await.unwrap();
        let emission = emission.unwrap();
        assert_eq!(emission.component_type, "progress");
        assert_eq!(emission.label, "Searched two sources");
        // Only one generation for three events.
        assert_eq!(summarizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_relevant_updates_suppressed() {
        let summarizer = summarizer_with(json!({
            "updates": [{ "type": "no_relevant_updates" }]
        }));
        let (config, mut rx) = status_config(1, summarizer);

        let manager = AgentSessionManager::new(Arc::new(ToolSessionManager::new()));
        let session = manager.create_session(create_request(Some(config)));
        session.record_event(SessionEvent::tool_result("search", "tc-1", &json!({})));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_text_streaming_suppresses_updates() {
        let summarizer = summarizer_with(json!({"updates": []}));
        let (config, mut rx) = status_config(1, summarizer.clone());

        let manager = AgentSessionManager::new(Arc::new(ToolSessionManager::new()));
        let session = manager.create_session(create_request(Some(config)));
        session.set_text_streaming(true);
        session.record_event(SessionEvent::tool_result("search", "tc-1", &json!({})));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_pending_artifact_bound() {
        let manager = AgentSessionManager::new(Arc::new(ToolSessionManager::new()));
        let session = manager.create_session(create_request(None));

        for i in 0..MAX_PENDING_ARTIFACTS {
            assert!(session.add_pending_artifact(format!("a{i}")));
        }
        assert!(!session.add_pending_artifact("overflow"));
        session.remove_pending_artifact("a0");
        assert!(session.add_pending_artifact("overflow"));
    }

    #[test]
    fn test_empty_component_schema_accepts_no_relevant_updates() {
        let schema = status_update_schema(&[]);
        let variants = schema["properties"]["updates"]["items"]["oneOf"].as_array().unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0]["properties"]["type"]["const"], json!("no_relevant_updates"));
    }
}
