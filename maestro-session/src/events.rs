use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

/// Event kinds recorded in the per-turn ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentGenerate,
    AgentReasoning,
    Transfer,
    DelegationSent,
    DelegationReturned,
    ArtifactSaved,
    ToolCall,
    ToolResult,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub data: Value,
}

impl SessionEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, at: Utc::now(), data }
    }

    pub fn agent_generate(sub_agent_id: &str, generation_type: &str) -> Self {
        Self::new(
            EventKind::AgentGenerate,
            json!({ "sub_agent_id": sub_agent_id, "generation_type": generation_type }),
        )
    }

    pub fn agent_reasoning(sub_agent_id: &str, text: &str) -> Self {
        Self::new(
            EventKind::AgentReasoning,
            json!({ "sub_agent_id": sub_agent_id, "text": text }),
        )
    }

    pub fn transfer(from: &str, target: &str, reason: &str) -> Self {
        Self::new(
            EventKind::Transfer,
            json!({ "from_sub_agent_id": from, "target_sub_agent_id": target, "reason": reason }),
        )
    }

    pub fn delegation_sent(from: &str, to: &str, task_id: &str, message: &str) -> Self {
        Self::new(
            EventKind::DelegationSent,
            json!({ "from": from, "to": to, "task_id": task_id, "message": message }),
        )
    }

    pub fn delegation_returned(from: &str, to: &str, task_id: &str, result: Value) -> Self {
        Self::new(
            EventKind::DelegationReturned,
            json!({ "from": from, "to": to, "task_id": task_id, "result": result }),
        )
    }

    pub fn artifact_saved(artifact_id: &str, tool_call_id: &str, artifact_type: &str) -> Self {
        Self::new(
            EventKind::ArtifactSaved,
            json!({
                "artifact_id": artifact_id,
                "tool_call_id": tool_call_id,
                "artifact_type": artifact_type,
            }),
        )
    }

    pub fn tool_call(tool_name: &str, tool_call_id: &str, args: &Value) -> Self {
        Self::new(
            EventKind::ToolCall,
            json!({ "tool_name": tool_name, "tool_call_id": tool_call_id, "args": args }),
        )
    }

    pub fn tool_result(tool_name: &str, tool_call_id: &str, result: &Value) -> Self {
        Self::new(
            EventKind::ToolResult,
            json!({ "tool_name": tool_name, "tool_call_id": tool_call_id, "result": result }),
        )
    }

    pub fn error(message: &str) -> Self {
        Self::new(EventKind::Error, json!({ "message": message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(serde_json::to_string(&EventKind::ArtifactSaved).unwrap(), "\"artifact_saved\"");
        assert_eq!(serde_json::to_string(&EventKind::ToolResult).unwrap(), "\"tool_result\"");
    }

    #[test]
    fn test_constructors_carry_payload() {
        let event = SessionEvent::tool_call("search", "tc-1", &json!({"q": 1}));
        assert_eq!(event.kind, EventKind::ToolCall);
        assert_eq!(event.data["tool_name"], json!("search"));
    }
}
