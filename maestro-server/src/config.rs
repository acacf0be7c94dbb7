use maestro_core::Scope;

/// Runtime configuration for one served agent project.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub scope: Scope,
    /// Root agent definition id in the repository.
    pub agent_id: String,
    /// Public base URL of this process; internal delegation targets it.
    pub base_url: String,
    /// Service token attached to internal and team delegation calls.
    pub service_token: Option<String>,
    /// Return detailed error messages to clients (development only).
    pub expose_error_details: bool,
}

impl ServerConfig {
    pub fn new(scope: Scope, agent_id: impl Into<String>) -> Self {
        Self {
            scope,
            agent_id: agent_id.into(),
            base_url: "http://localhost:3002".to_string(),
            service_token: None,
            expose_error_details: false,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }

    pub fn expose_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }
}
