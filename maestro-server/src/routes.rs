use crate::task_handler::{TaskHandler, TurnOutcome, TurnRequest};
use maestro_core::{MaestroError, TaskState as CoreTaskState};
use maestro_a2a::{
    A2aArtifact, A2aMessage, A2aTask, A2aTaskRequest, A2aTaskResult, AgentCapabilities, AgentCard,
    AgentSkill, JsonRpcError, JsonRpcRequest, JsonRpcResponse, MessageSendParams, Part,
    TaskQueryParams, TaskResubscribeParams, TaskStatus, methods, transfer_task,
};
use maestro_artifact::StreamPart;
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Json,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::stream::Stream;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

/// In-memory store of finished wire tasks for tasks/get and resubscribe.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, A2aTask>>,
}

impl TaskStore {
    pub async fn store(&self, task: A2aTask) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }

    pub async fn get(&self, task_id: &str) -> Option<A2aTask> {
        self.tasks.read().await.get(task_id).cloned()
    }
}

/// Shared state behind the A2A routes.
pub struct AppState {
    pub handler: Arc<TaskHandler>,
    pub task_store: TaskStore,
    pub cancellations: RwLock<HashMap<String, CancellationToken>>,
}

impl AppState {
    pub fn new(handler: Arc<TaskHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            task_store: TaskStore::default(),
            cancellations: RwLock::new(HashMap::new()),
        })
    }
}

/// Build the A2A router: JSON-RPC endpoint, SSE endpoint, discovery card.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/a2a", post(handle_jsonrpc))
        .route("/a2a/stream", post(handle_jsonrpc_stream))
        .route("/.well-known/agent.json", get(get_agent_card))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// GET /.well-known/agent.json
async fn get_agent_card(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(build_agent_card(&state).await)
}

pub async fn build_agent_card(state: &Arc<AppState>) -> AgentCard {
    let config = state.handler.config();
    let repository = state.handler.repository();

    let (name, description, skills) = match repository
        .get_agent_with_sub_agents(&config.scope, &config.agent_id)
        .await
    {
        Ok(Some(agent)) => {
            let skills = agent
                .sub_agents
                .iter()
                .map(|s| AgentSkill {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    description: s.description.clone(),
                    tags: Vec::new(),
                })
                .collect();
            (agent.agent.name.clone(), agent.agent.description.clone(), skills)
        }
        _ => (config.agent_id.clone(), String::new(), Vec::new()),
    };

    AgentCard {
        name,
        description,
        url: format!("{}/a2a", config.base_url.trim_end_matches('/')),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: AgentCapabilities {
            streaming: true,
            push_notifications: false,
            state_transition_history: false,
        },
        default_input_modes: vec!["text/plain".to_string()],
        default_output_modes: vec!["text/plain".to_string(), "application/json".to_string()],
        skills,
        provider: None,
    }
}

/// POST /a2a — JSON-RPC endpoint.
async fn handle_jsonrpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    if request.jsonrpc != "2.0" {
        return Json(JsonRpcResponse::error(
            request.id,
            JsonRpcError::invalid_request("Invalid JSON-RPC version"),
        ));
    }

    let id = request.id.clone();
    match request.method.as_str() {
        methods::MESSAGE_SEND => handle_message_send(&state, &headers, request.params, id).await,
        methods::AGENT_INVOKE => handle_agent_invoke(&state, &headers, request.params, id).await,
        methods::TASKS_GET => handle_tasks_get(&state, request.params, id).await,
        methods::TASKS_CANCEL => handle_tasks_cancel(&state, request.params, id).await,
        methods::AGENT_GET_CAPABILITIES => Json(JsonRpcResponse::success(
            id,
            json!({
                "streaming": true,
                "pushNotifications": false,
                "stateTransitionHistory": false,
            }),
        )),
        methods::AGENT_GET_STATUS => handle_agent_status(&state, id).await,
        methods::MESSAGE_STREAM | methods::TASKS_RESUBSCRIBE => {
            Json(JsonRpcResponse::error(id, JsonRpcError::streaming_unsupported()))
        }
        _ => Json(JsonRpcResponse::error(id, JsonRpcError::method_not_found(&request.method))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
    id: &Option<Value>,
) -> Result<T, Json<JsonRpcResponse>> {
    let Some(params) = params else {
        return Err(Json(JsonRpcResponse::error(
            id.clone(),
            JsonRpcError::invalid_params("Missing params"),
        )));
    };
    serde_json::from_value(params).map_err(|e| {
        Json(JsonRpcResponse::error(id.clone(), JsonRpcError::invalid_params(e.to_string())))
    })
}

fn turn_request_from_message(
    message: &A2aMessage,
    headers: &HeaderMap,
    streaming: bool,
) -> TurnRequest {
    let mut request = TurnRequest::blocking(message.message_id.clone(), message.text_content());
    request.conversation_id = message.context_id.clone();
    request.task_id = message.task_id.clone();
    request.metadata = message.metadata.clone().unwrap_or_default();
    request.streaming = streaming;
    request.request_headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    request
}

fn error_response(state: &Arc<AppState>, id: Option<Value>, error: &MaestroError) -> Json<JsonRpcResponse> {
    let expose = state.handler.config().expose_error_details;
    let rpc_error = match error {
        MaestroError::BadRequest(message) => JsonRpcError::invalid_params(message.clone()),
        other => JsonRpcError::internal_error_sanitized(other, expose),
    };
    Json(JsonRpcResponse::error(id, rpc_error))
}

async fn handle_message_send(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    params: Option<Value>,
    id: Option<Value>,
) -> Json<JsonRpcResponse> {
    let params: MessageSendParams = match parse_params(params, &id) {
        Ok(params) => params,
        Err(response) => return response,
    };

    let blocking =
        params.configuration.as_ref().and_then(|c| c.blocking).unwrap_or(true);
    let turn = turn_request_from_message(&params.message, headers, false);

    match state.handler.execute_turn(turn).await {
        Ok(outcome) => {
            let result = outcome_to_wire(&outcome, blocking);
            if let WireResult::Task(task) = &result {
                state.task_store.store(task.clone()).await;
            }
            Json(JsonRpcResponse::success(id, result.into_value()))
        }
        Err(e) => error_response(state, id, &e),
    }
}

async fn handle_agent_invoke(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    params: Option<Value>,
    id: Option<Value>,
) -> Json<JsonRpcResponse> {
    let task: A2aTaskRequest = match parse_params(params, &id) {
        Ok(task) => task,
        Err(response) => return response,
    };

    let mut turn = turn_request_from_message(&task.message, headers, false);
    turn.task_id = Some(task.id.clone());
    if turn.conversation_id.is_none() {
        turn.conversation_id = task.context.conversation_id.clone();
    }
    // agent.invoke metadata rides on the task context as well.
    for (key, value) in &task.context.metadata {
        turn.metadata.entry(key.clone()).or_insert_with(|| value.clone());
    }

    match state.handler.execute_turn(turn).await {
        Ok(outcome) => {
            let result = A2aTaskResult {
                task_id: outcome.task_id.clone(),
                status: TaskStatus::completed(),
                artifacts: outcome_artifacts(&outcome),
            };
            Json(JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default()))
        }
        Err(e) => error_response(state, id, &e),
    }
}

async fn handle_tasks_get(
    state: &Arc<AppState>,
    params: Option<Value>,
    id: Option<Value>,
) -> Json<JsonRpcResponse> {
    let params: TaskQueryParams = match parse_params(params, &id) {
        Ok(params) => params,
        Err(response) => return response,
    };

    if let Some(task) = state.task_store.get(&params.id).await {
        return Json(JsonRpcResponse::success(id, serde_json::to_value(task).unwrap_or_default()));
    }

    // Fall back to the persisted task row.
    let config = state.handler.config();
    match state.handler.repository().get_task(&config.scope, &params.id).await {
        Ok(Some(record)) => {
            let task = record_to_wire_task(&record);
            Json(JsonRpcResponse::success(id, serde_json::to_value(task).unwrap_or_default()))
        }
        Ok(None) => Json(JsonRpcResponse::error(
            id,
            JsonRpcError::internal_error(format!("Task not found: {}", params.id)),
        )),
        Err(e) => error_response(state, id, &e),
    }
}

async fn handle_tasks_cancel(
    state: &Arc<AppState>,
    params: Option<Value>,
    id: Option<Value>,
) -> Json<JsonRpcResponse> {
    let params: TaskQueryParams = match parse_params(params, &id) {
        Ok(params) => params,
        Err(response) => return response,
    };

    if let Some(token) = state.cancellations.write().await.remove(&params.id) {
        token.cancel();
    }
    let config = state.handler.config();
    let _ = state
        .handler
        .repository()
        .update_task(&config.scope, &params.id, CoreTaskState::Canceled, None)
        .await;

    Json(JsonRpcResponse::success(id, json!({ "success": true })))
}

async fn handle_agent_status(state: &Arc<AppState>, id: Option<Value>) -> Json<JsonRpcResponse> {
    let config = state.handler.config();
    let sub_agent_id = state
        .handler
        .repository()
        .get_agent_with_sub_agents(&config.scope, &config.agent_id)
        .await
        .ok()
        .flatten()
        .map(|a| a.agent.default_sub_agent_id)
        .unwrap_or_default();

    Json(JsonRpcResponse::success(
        id,
        json!({ "status": "ready", "subAgentId": sub_agent_id }),
    ))
}

/// POST /a2a/stream — SSE endpoint for message/stream and
/// tasks/resubscribe.
async fn handle_jsonrpc_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<JsonRpcResponse>)>
{
    if request.jsonrpc != "2.0" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(JsonRpcResponse::error(
                request.id.clone(),
                JsonRpcError::invalid_request("Invalid JSON-RPC version"),
            )),
        ));
    }

    let stream = match request.method.as_str() {
        methods::MESSAGE_STREAM | methods::MESSAGE_SEND => {
            let params: MessageSendParams = match request.params {
                Some(p) => serde_json::from_value(p).map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(JsonRpcResponse::error(
                            request.id.clone(),
                            JsonRpcError::invalid_params(e.to_string()),
                        )),
                    )
                })?,
                None => {
                    return Err((
                        StatusCode::BAD_REQUEST,
                        Json(JsonRpcResponse::error(
                            request.id.clone(),
                            JsonRpcError::invalid_params("Missing params"),
                        )),
                    ));
                }
            };
            create_message_stream(state, params, headers, request.id.clone())
        }
        methods::TASKS_RESUBSCRIBE => {
            let params: TaskResubscribeParams = match request.params {
                Some(p) => serde_json::from_value(p).map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(JsonRpcResponse::error(
                            request.id.clone(),
                            JsonRpcError::invalid_params(e.to_string()),
                        )),
                    )
                })?,
                None => {
                    return Err((
                        StatusCode::BAD_REQUEST,
                        Json(JsonRpcResponse::error(
                            request.id.clone(),
                            JsonRpcError::invalid_params("Missing params"),
                        )),
                    ));
                }
            };
            create_resubscribe_stream(state, params.task_id, request.id.clone())
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(
                    request.id.clone(),
                    JsonRpcError::method_not_found(&request.method),
                )),
            ));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)).text("ping"),
    ))
}

type SseStream = std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn summary_frame(summary: &maestro_session::SummaryEmission) -> Value {
    json!({
        "type": "summary",
        "label": summary.label,
        "summaryType": summary.component_type,
        "details": summary.details,
    })
}

fn frame(request_id: &Option<Value>, result: Value) -> Event {
    let envelope = JsonRpcResponse::success(request_id.clone(), result);
    Event::default().data(serde_json::to_string(&envelope).unwrap_or_default())
}

fn error_frame(request_id: &Option<Value>, error: JsonRpcError) -> Event {
    let envelope = JsonRpcResponse::error(request_id.clone(), error);
    Event::default().data(serde_json::to_string(&envelope).unwrap_or_default())
}

fn create_message_stream(
    state: Arc<AppState>,
    params: MessageSendParams,
    headers: HeaderMap,
    request_id: Option<Value>,
) -> SseStream {
    Box::pin(async_stream::stream! {
        let (part_tx, mut part_rx) = mpsc::unbounded_channel::<StreamPart>();
        let (summary_tx, mut summary_rx) = mpsc::unbounded_channel();

        let mut turn = turn_request_from_message(&params.message, &headers, true);
        turn.part_sink = Some(part_tx);
        turn.summary_sink = Some(summary_tx);
        let cancellation = turn.cancellation.clone();

        let provisional_task_id = turn
            .task_id
            .clone()
            .unwrap_or_else(|| format!("task_{}", uuid::Uuid::new_v4().simple()));
        let context_id = turn.conversation_id.clone().unwrap_or_else(|| "default".to_string());
        state
            .cancellations
            .write()
            .await
            .insert(provisional_task_id.clone(), cancellation.clone());

        // Initial working frame.
        yield Ok(frame(
            &request_id,
            serde_json::to_value(A2aTask::working(&provisional_task_id, &context_id))
                .unwrap_or_default(),
        ));

        let handler = state.handler.clone();
        let mut turn_handle = tokio::spawn(async move { handler.execute_turn(turn).await });

        enum StreamStep {
            Summary(maestro_session::SummaryEmission),
            Part(StreamPart),
            Finished(Result<maestro_core::Result<TurnOutcome>, tokio::task::JoinError>),
        }

        let outcome = loop {
            let step = tokio::select! {
                Some(summary) = summary_rx.recv() => StreamStep::Summary(summary),
                Some(part) = part_rx.recv() => StreamStep::Part(part),
                joined = &mut turn_handle => StreamStep::Finished(joined),
            };
            match step {
                StreamStep::Summary(summary) => {
                    yield Ok(frame(&request_id, summary_frame(&summary)));
                }
                StreamStep::Part(part) => {
                    yield Ok(frame(&request_id, serde_json::to_value(intermediate_message(&part))
                        .unwrap_or_default()));
                }
                StreamStep::Finished(joined) => break joined,
            }
        };

        // Drain anything buffered before the turn finished.
        while let Ok(summary) = summary_rx.try_recv() {
            yield Ok(frame(&request_id, summary_frame(&summary)));
        }
        while let Ok(part) = part_rx.try_recv() {
            yield Ok(frame(&request_id, serde_json::to_value(intermediate_message(&part))
                .unwrap_or_default()));
        }

        state.cancellations.write().await.remove(&provisional_task_id);

        match outcome {
            Ok(Ok(outcome)) => {
                let task = final_task(&outcome);
                state.task_store.store(task.clone()).await;
                yield Ok(frame(&request_id, serde_json::to_value(task).unwrap_or_default()));
            }
            Ok(Err(e)) => {
                let expose = state.handler.config().expose_error_details;
                yield Ok(error_frame(&request_id, JsonRpcError::internal_error_sanitized(&e, expose)));
            }
            Err(join_error) => {
                yield Ok(error_frame(
                    &request_id,
                    JsonRpcError::internal_error(format!("turn panicked: {join_error}")),
                ));
            }
        }

        yield Ok(Event::default().event("done").data(""));
    })
}

fn create_resubscribe_stream(
    state: Arc<AppState>,
    task_id: String,
    request_id: Option<Value>,
) -> SseStream {
    Box::pin(async_stream::stream! {
        match state.task_store.get(&task_id).await {
            Some(task) => {
                yield Ok(frame(&request_id, serde_json::to_value(task).unwrap_or_default()));
            }
            None => {
                yield Ok(error_frame(
                    &request_id,
                    JsonRpcError::internal_error(format!("Task not found: {task_id}")),
                ));
            }
        }
        yield Ok(Event::default().event("done").data(""));
    })
}

// ----- wire shaping -----

enum WireResult {
    Message(A2aMessage),
    Task(A2aTask),
}

impl WireResult {
    fn into_value(self) -> Value {
        match self {
            WireResult::Message(message) => serde_json::to_value(message).unwrap_or_default(),
            WireResult::Task(task) => serde_json::to_value(task).unwrap_or_default(),
        }
    }
}

fn parts_to_wire(parts: &[StreamPart]) -> Vec<Part> {
    parts
        .iter()
        .map(|part| match part {
            StreamPart::Text { text } => Part::text(text.clone()),
            StreamPart::Data { data } => Part::data(data.clone()),
        })
        .collect()
}

fn intermediate_message(part: &StreamPart) -> A2aMessage {
    let mut message = A2aMessage::agent(
        format!("msg_{}", uuid::Uuid::new_v4().simple()),
        parts_to_wire(std::slice::from_ref(part)),
    );
    let mut metadata = Map::new();
    metadata.insert("intermediate".to_string(), Value::Bool(true));
    message.metadata = Some(metadata);
    message
}

fn outcome_artifacts(outcome: &TurnOutcome) -> Vec<A2aArtifact> {
    if let Some(transfer) = &outcome.transfer {
        return transfer_task(&outcome.task_id, Some(&outcome.conversation_id), transfer)
            .artifacts
            .unwrap_or_default();
    }
    if outcome.parts.is_empty() {
        return Vec::new();
    }
    vec![A2aArtifact {
        artifact_id: format!("result-{}", outcome.task_id),
        name: None,
        description: None,
        parts: parts_to_wire(&outcome.parts),
        metadata: None,
    }]
}

/// Blocking message/send returns a Message; a transfer or non-blocking
/// call returns the Task form.
fn outcome_to_wire(outcome: &TurnOutcome, blocking: bool) -> WireResult {
    if let Some(transfer) = &outcome.transfer {
        return WireResult::Task(transfer_task(
            &outcome.task_id,
            Some(&outcome.conversation_id),
            transfer,
        ));
    }
    if blocking {
        let mut message = A2aMessage::agent(
            format!("msg_{}", uuid::Uuid::new_v4().simple()),
            parts_to_wire(&outcome.parts),
        );
        message.task_id = Some(outcome.task_id.clone());
        message.context_id = Some(outcome.conversation_id.clone());
        WireResult::Message(message)
    } else {
        WireResult::Task(final_task(outcome))
    }
}

fn final_task(outcome: &TurnOutcome) -> A2aTask {
    if let Some(transfer) = &outcome.transfer {
        return transfer_task(&outcome.task_id, Some(&outcome.conversation_id), transfer);
    }
    A2aTask {
        id: outcome.task_id.clone(),
        context_id: Some(outcome.conversation_id.clone()),
        status: TaskStatus::completed(),
        artifacts: Some(outcome_artifacts(outcome)),
        history: None,
        metadata: None,
    }
}

fn record_to_wire_task(record: &maestro_core::TaskRecord) -> A2aTask {
    let state = match record.status {
        CoreTaskState::Working => maestro_a2a::TaskState::Working,
        CoreTaskState::Completed => maestro_a2a::TaskState::Completed,
        CoreTaskState::Failed => maestro_a2a::TaskState::Failed,
        CoreTaskState::Canceled => maestro_a2a::TaskState::Canceled,
    };
    let message = record
        .metadata
        .get("failure_message")
        .and_then(Value::as_str)
        .map(String::from);
    A2aTask {
        id: record.id.clone(),
        context_id: Some(record.conversation_id.clone()),
        status: TaskStatus { state, message },
        artifacts: None,
        history: None,
        metadata: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_a2a::TransferData;

    fn outcome(transfer: Option<TransferData>) -> TurnOutcome {
        TurnOutcome {
            task_id: "t1".into(),
            conversation_id: "c1".into(),
            sub_agent_id: "router".into(),
            parts: vec![StreamPart::text("Hello")],
            transfer,
        }
    }

    #[test]
    fn test_blocking_send_returns_message() {
        let wire = outcome_to_wire(&outcome(None), true).into_value();
        assert_eq!(wire["role"], json!("agent"));
        assert_eq!(wire["parts"][0], json!({"kind": "text", "text": "Hello"}));
    }

    #[test]
    fn test_nonblocking_send_returns_task() {
        let wire = outcome_to_wire(&outcome(None), false).into_value();
        assert_eq!(wire["status"]["state"], json!("completed"));
        assert_eq!(wire["artifacts"][0]["parts"][0]["text"], json!("Hello"));
    }

    #[test]
    fn test_transfer_always_returns_envelope() {
        let transfer = TransferData::new("billing", Some("router".into()), "t1", "why", "Hi");
        let wire = outcome_to_wire(&outcome(Some(transfer)), true).into_value();
        assert_eq!(wire["artifacts"][0]["parts"][0]["data"]["type"], json!("transfer"));
        assert_eq!(
            wire["artifacts"][0]["parts"][0]["data"]["target_subagent_id"],
            json!("billing")
        );
    }

    #[test]
    fn test_record_to_wire_task_failure_message() {
        let mut record = maestro_core::TaskRecord {
            id: "t1".into(),
            conversation_id: "c1".into(),
            sub_agent_id: "router".into(),
            status: CoreTaskState::Failed,
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        record.metadata.insert("failure_message".into(), json!("model exploded"));

        let task = record_to_wire_task(&record);
        assert_eq!(task.status.state, maestro_a2a::TaskState::Failed);
        assert_eq!(task.status.message.as_deref(), Some("model exploded"));
    }
}
