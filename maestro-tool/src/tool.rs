use maestro_core::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call context handed to a tool's `execute`.
#[derive(Clone)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    /// The turn's stream-request id.
    pub session_id: String,
    /// Cancelled on client disconnect or turn timeout.
    pub cancellation: CancellationToken,
}

impl ToolInvocation {
    pub fn new(tool_call_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            session_id: session_id.into(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Option<Value> {
        None
    }

    /// Internal tools (transfer, delegation, sentinels) never surface in
    /// user-visible session events.
    fn is_internal(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &ToolInvocation, args: Value) -> Result<Value>;
}

/// The merged tool surface handed to a sub-agent for one turn.
pub type ToolSet = HashMap<String, Arc<dyn Tool>>;

/// Names treated as internal when classifying wrapped tools.
pub fn is_internal_tool_name(name: &str) -> bool {
    name.starts_with("transfer_to_")
        || name.starts_with("delegate_to_")
        || name == "thinking_complete"
        || name == "save_tool_result"
        || name == "get_reference_artifact"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_classification() {
        assert!(is_internal_tool_name("transfer_to_billing"));
        assert!(is_internal_tool_name("delegate_to_research"));
        assert!(is_internal_tool_name("thinking_complete"));
        assert!(is_internal_tool_name("get_reference_artifact"));
        assert!(!is_internal_tool_name("search"));
        assert!(!is_internal_tool_name("transfer"));
    }
}
