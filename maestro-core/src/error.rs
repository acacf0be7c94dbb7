#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Model timeout: {0}")]
    ModelTimeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MaestroError {
    /// Whether the error terminates the whole turn. Tool failures are
    /// recovered locally by feeding them back to the model as results.
    pub fn is_turn_fatal(&self) -> bool {
        !matches!(self, MaestroError::Tool(_) | MaestroError::CredentialUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, MaestroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MaestroError::Tool("boom".to_string());
        assert_eq!(err.to_string(), "Tool error: boom");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MaestroError = serde_err.into();
        assert!(matches!(err, MaestroError::Serde(_)));
    }

    #[test]
    fn test_tool_errors_are_recoverable() {
        assert!(!MaestroError::Tool("x".into()).is_turn_fatal());
        assert!(!MaestroError::CredentialUnavailable("x".into()).is_turn_fatal());
        assert!(MaestroError::ModelTimeout("x".into()).is_turn_fatal());
        assert!(MaestroError::Cancelled.is_turn_fatal());
    }
}
