//! # maestro-server
//!
//! The A2A transport for a Maestro agent project:
//!
//! - [`TaskHandler`] - hydrates the sub-agent from the repository, runs
//!   the two-phase engine, persists messages/tasks, detects transfer
//! - [`routes::router`] - axum routes: `POST /a2a` (JSON-RPC), `POST
//!   /a2a/stream` (SSE), `GET /.well-known/agent.json` (discovery)
//!
//! A transfer is returned to the caller as an envelope task; the
//! conversation's active sub-agent is updated, and the client re-sends to
//! continue with the target.

pub mod config;
pub mod routes;
pub mod task_handler;

pub use config::ServerConfig;
pub use routes::{AppState, TaskStore, build_agent_card, router};
pub use task_handler::{TaskHandler, TurnOutcome, TurnRequest, parse_conversation_from_task_id};

use maestro_agent::ModelFactory;
use maestro_core::{ModelSettings, Repository, Result};
use maestro_context::{ContextResolver, CredentialResolver};
use maestro_model::{LanguageModel, OpenAiCompatibleConfig, OpenAiCompatibleModel};
use maestro_session::{AgentSessionManager, ToolSessionManager};
use maestro_tool::{McpConnectionFactory, NativeProcessExecutor, RemoteConnectionCache, ToolRegistry};
use std::sync::Arc;

/// Default model factory: every configured model name is served through
/// an OpenAI-compatible gateway. The API key and base URL come from the
/// settings' provider options or the process environment.
pub struct GatewayModelFactory {
    api_key: String,
    base_url: String,
}

impl GatewayModelFactory {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), base_url: base_url.into() }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("MODEL_GATEWAY_API_KEY").map_err(|_| {
            maestro_core::MaestroError::Config("MODEL_GATEWAY_API_KEY not set".into())
        })?;
        let base_url = std::env::var("MODEL_GATEWAY_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Ok(Self::new(api_key, base_url))
    }
}

impl ModelFactory for GatewayModelFactory {
    fn create(&self, settings: &ModelSettings) -> Result<Arc<dyn LanguageModel>> {
        let mut config = OpenAiCompatibleConfig::new(self.api_key.clone(), settings.model.clone())
            .with_base_url(self.base_url.clone());
        if let Some(options) = &settings.provider_options {
            if let Some(base_url) = options.get("base_url").and_then(|v| v.as_str()) {
                config = config.with_base_url(base_url);
            }
        }
        Ok(Arc::new(OpenAiCompatibleModel::new(config)))
    }
}

/// Wire the whole runtime together over a repository and model factory.
pub fn build_app_state(
    config: ServerConfig,
    repository: Arc<dyn Repository>,
    model_factory: Arc<dyn ModelFactory>,
) -> Arc<AppState> {
    let credentials = Arc::new(CredentialResolver::new(repository.clone()));
    let registry = Arc::new(ToolRegistry::new(
        repository.clone(),
        credentials.clone(),
        Arc::new(RemoteConnectionCache::new(Arc::new(McpConnectionFactory))),
        Arc::new(NativeProcessExecutor::new()),
    ));
    let context_resolver = Arc::new(ContextResolver::new(repository.clone(), credentials));
    let sessions = Arc::new(AgentSessionManager::new(Arc::new(ToolSessionManager::new())));

    let handler = Arc::new(TaskHandler::new(
        config,
        repository,
        registry,
        context_resolver,
        sessions,
        model_factory,
    ));
    AppState::new(handler)
}
