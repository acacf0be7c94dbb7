use maestro_a2a::{
    A2aClient, A2aMessage, MessageSendParams, TaskState, extract_transfer, unwrap_rpc,
};
use maestro_agent::ModelFactory;
use maestro_core::{
    AgentDefinition, MessageType, ModelSettings, ModelSettingsMap, RelationTarget, Repository,
    Result, Scope, SubAgentDefinition,
};
use maestro_model::{
    FinishReason, LanguageModel, MockModel, ModelMessage, ModelPart, ModelResponse, ModelRole,
};
use maestro_server::{AppState, ServerConfig, TurnRequest, build_app_state, router};
use maestro_store::MemoryRepository;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct MockFactory {
    models: Mutex<HashMap<String, Arc<MockModel>>>,
}

impl MockFactory {
    fn new() -> Self {
        Self { models: Mutex::new(HashMap::new()) }
    }

    fn register(&self, name: &str, model: Arc<MockModel>) {
        self.models.lock().unwrap().insert(name.to_string(), model);
    }
}

impl ModelFactory for MockFactory {
    fn create(&self, settings: &ModelSettings) -> Result<Arc<dyn LanguageModel>> {
        let mut models = self.models.lock().unwrap();
        let model = models
            .entry(settings.model.clone())
            .or_insert_with(|| Arc::new(MockModel::new(&settings.model)));
        Ok(model.clone())
    }
}

fn scope() -> Scope {
    Scope::new("tenant", "project")
}

fn sub_agent(id: &str) -> SubAgentDefinition {
    SubAgentDefinition {
        id: id.to_string(),
        name: id.to_string(),
        description: format!("The {id} agent"),
        prompt: "You are helpful.".to_string(),
        models: ModelSettingsMap {
            base: Some(ModelSettings::new("base-model")),
            structured_output: None,
            summarizer: None,
        },
        stop_when: Default::default(),
        conversation_history_config: Default::default(),
        context_config_id: None,
        data_components: vec![],
        artifact_components: vec![],
        can_transfer_to: vec![],
        can_delegate_to: vec![],
    }
}

async fn seed_project(repo: &Arc<MemoryRepository>, sub_agents: Vec<SubAgentDefinition>) {
    let ids = sub_agents.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
    for sub_agent in sub_agents {
        repo.put_sub_agent(&scope(), sub_agent).await;
    }
    repo.put_agent(
        &scope(),
        AgentDefinition {
            id: "support".into(),
            name: "Support".into(),
            description: "Customer support project".into(),
            default_sub_agent_id: ids[0].clone(),
            models: ModelSettingsMap::default(),
            sub_agent_ids: ids,
            status_updates: None,
        },
    )
    .await;
}

fn text_response(text: &str) -> ModelResponse {
    ModelResponse::complete(ModelMessage::text(ModelRole::Assistant, text), FinishReason::Stop)
}

fn tool_call_response(id: &str, name: &str, args: Value) -> ModelResponse {
    ModelResponse::complete(
        ModelMessage::new(ModelRole::Assistant).with_part(ModelPart::ToolCall {
            id: id.into(),
            name: name.into(),
            args,
        }),
        FinishReason::ToolCalls,
    )
}

/// Bind the app on an ephemeral port and return the state plus base URL.
async fn serve(
    repo: Arc<MemoryRepository>,
    factory: Arc<MockFactory>,
) -> (Arc<AppState>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let config = ServerConfig::new(scope(), "support")
        .with_base_url(base_url.clone())
        .with_service_token("svc-token")
        .expose_error_details(true);
    let state = build_app_state(config, repo, factory);
    let app = router(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, base_url)
}

#[tokio::test]
async fn simple_message_send_returns_message() {
    let repo = Arc::new(MemoryRepository::new());
    seed_project(&repo, vec![sub_agent("router")]).await;

    let factory = Arc::new(MockFactory::new());
    factory.register(
        "base-model",
        Arc::new(MockModel::new("base-model").with_response(text_response("Hello"))),
    );

    let (_state, base_url) = serve(repo.clone(), factory).await;

    let client = A2aClient::new(base_url);
    let mut message = A2aMessage::user_text("m1", "Hi");
    message.context_id = Some("c1".into());
    let response =
        client.send_message(MessageSendParams { message, configuration: None }).await.unwrap();
    let result = unwrap_rpc(response).unwrap();

    assert_eq!(result["role"], json!("agent"));
    assert_eq!(result["parts"], json!([{ "kind": "text", "text": "Hello" }]));

    // Conversation history gained a user and an agent message.
    let messages = repo.raw_messages(&scope(), "c1");
    assert_eq!(messages.len(), 2);
    assert!(messages[0].is_user_facing());
    assert_eq!(messages[0].content.text, "Hi");
    assert_eq!(messages[1].content.text, "Hello");
}

#[tokio::test]
async fn transfer_returns_envelope_and_switches_active_agent() {
    let repo = Arc::new(MemoryRepository::new());
    let mut router_agent = sub_agent("router");
    router_agent.can_transfer_to =
        vec![RelationTarget::Internal { sub_agent_id: "billing".into() }];
    seed_project(&repo, vec![router_agent, sub_agent("billing")]).await;

    let factory = Arc::new(MockFactory::new());
    factory.register(
        "base-model",
        Arc::new(MockModel::new("base-model").with_response(tool_call_response(
            "tc-1",
            "transfer_to_billing",
            json!({}),
        ))),
    );

    let (state, _base_url) = serve(repo.clone(), factory).await;

    let mut turn = TurnRequest::blocking("m1", "I have an invoice question");
    turn.conversation_id = Some("c1".into());
    let outcome = state.handler.execute_turn(turn).await.unwrap();

    let transfer = outcome.transfer.expect("transfer expected");
    assert_eq!(transfer.target_subagent_id, "billing");
    assert_eq!(transfer.original_message, "I have an invoice question");

    // The envelope task carries exactly one transfer data part.
    let envelope = maestro_a2a::transfer_task(&outcome.task_id, Some("c1"), &transfer);
    assert_eq!(envelope.status.state, TaskState::Completed);
    assert_eq!(extract_transfer(&envelope).unwrap(), transfer);

    let conversation = repo.get_conversation(&scope(), "c1").await.unwrap().unwrap();
    assert_eq!(conversation.active_sub_agent_id, "billing");
}

#[tokio::test]
async fn delegation_roundtrip_persists_a2a_messages() {
    let repo = Arc::new(MemoryRepository::new());
    let mut router_agent = sub_agent("router");
    router_agent.can_delegate_to =
        vec![RelationTarget::Internal { sub_agent_id: "research".into() }];
    seed_project(&repo, vec![router_agent, sub_agent("research")]).await;

    let factory = Arc::new(MockFactory::new());
    // Call order: router plans a delegation, research answers, router
    // composes the final reply.
    factory.register(
        "base-model",
        Arc::new(
            MockModel::new("base-model")
                .with_response(tool_call_response(
                    "tc-1",
                    "delegate_to_research",
                    json!({"message": "what is 6 times 7?"}),
                ))
                .with_response(text_response("42"))
                .with_response(text_response("The answer is 42")),
        ),
    );

    let (_state, base_url) = serve(repo.clone(), factory).await;

    let client = A2aClient::new(base_url);
    let mut message = A2aMessage::user_text("m1", "Ask research for 6x7");
    message.context_id = Some("c1".into());
    let response =
        client.send_message(MessageSendParams { message, configuration: None }).await.unwrap();
    let result = unwrap_rpc(response).unwrap();

    assert_eq!(result["parts"][0]["text"], json!("The answer is 42"));

    let messages = repo.raw_messages(&scope(), "c1");
    let request = messages
        .iter()
        .find(|m| m.message_type == MessageType::A2aRequest)
        .expect("a2a-request persisted before the call");
    assert_eq!(request.from_sub_agent_id.as_deref(), Some("router"));
    assert_eq!(request.to_sub_agent_id.as_deref(), Some("research"));
    assert_eq!(request.content.text, "what is 6 times 7?");

    let reply = messages
        .iter()
        .find(|m| m.message_type == MessageType::A2aResponse)
        .expect("a2a-response persisted after the call");
    assert_eq!(reply.from_sub_agent_id.as_deref(), Some("research"));
    assert_eq!(reply.to_sub_agent_id.as_deref(), Some("router"));
    assert_eq!(reply.content.text, "42");
}

#[tokio::test]
async fn tasks_get_and_agent_card() {
    let repo = Arc::new(MemoryRepository::new());
    seed_project(&repo, vec![sub_agent("router")]).await;

    let factory = Arc::new(MockFactory::new());
    factory.register(
        "base-model",
        Arc::new(MockModel::new("base-model").with_response(text_response("Hello"))),
    );

    let (_state, base_url) = serve(repo.clone(), factory).await;
    let client = A2aClient::new(base_url.clone());

    let card = A2aClient::resolve_agent_card(&base_url).await.unwrap();
    assert_eq!(card.name, "Support");
    assert!(card.capabilities.streaming);
    assert_eq!(card.skills.len(), 1);
    assert_eq!(card.skills[0].id, "router");

    let mut message = A2aMessage::user_text("m1", "Hi");
    message.context_id = Some("c1".into());
    let response =
        client.send_message(MessageSendParams { message, configuration: None }).await.unwrap();
    let result = unwrap_rpc(response).unwrap();
    let task_id = result["taskId"].as_str().unwrap().to_string();

    // The persisted task row is visible through tasks/get.
    let rpc = maestro_a2a::JsonRpcRequest::new("tasks/get", json!({ "id": task_id }));
    let http = reqwest::Client::new();
    let raw: maestro_a2a::JsonRpcResponse = http
        .post(format!("{base_url}/a2a"))
        .json(&rpc)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task = unwrap_rpc(raw).unwrap();
    assert_eq!(task["status"]["state"], json!("completed"));
}

#[tokio::test]
async fn unknown_method_and_streaming_unsupported_codes() {
    let repo = Arc::new(MemoryRepository::new());
    seed_project(&repo, vec![sub_agent("router")]).await;
    let (_state, base_url) = serve(repo, Arc::new(MockFactory::new())).await;

    let http = reqwest::Client::new();
    let raw: maestro_a2a::JsonRpcResponse = http
        .post(format!("{base_url}/a2a"))
        .json(&maestro_a2a::JsonRpcRequest::new("no/such", json!({})))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(raw.error.unwrap().code, -32601);

    let raw: maestro_a2a::JsonRpcResponse = http
        .post(format!("{base_url}/a2a"))
        .json(&maestro_a2a::JsonRpcRequest::new(
            "message/stream",
            json!({ "message": { "messageId": "m1", "parts": [], "role": "user" } }),
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(raw.error.unwrap().code, -32604);
}
