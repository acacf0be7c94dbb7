use crate::{Tool, ToolInvocation};
use maestro_core::{
    MaestroError, MessageRole, MessageType, MessageVisibility, NewMessage, Repository, Result,
    Scope,
};
use maestro_a2a::{A2aClient, A2aMessage, MessageSendParams, unwrap_rpc};
use maestro_session::{AgentSession, SessionEvent};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands conversation control to another sub-agent. No input; the engine
/// detects the returned shape and short-circuits the turn.
pub struct TransferTool {
    target_sub_agent_id: String,
    from_sub_agent_id: String,
    description: String,
    name: String,
}

impl TransferTool {
    pub fn new(target_sub_agent_id: &str, target_description: &str, from_sub_agent_id: &str) -> Self {
        Self {
            name: format!("transfer_to_{target_sub_agent_id}"),
            description: format!(
                "Hand the conversation over to the {target_sub_agent_id} agent. {target_description}"
            ),
            target_sub_agent_id: target_sub_agent_id.to_string(),
            from_sub_agent_id: from_sub_agent_id.to_string(),
        }
    }
}

#[async_trait]
impl Tool for TransferTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(json!({ "type": "object", "properties": {} }))
    }

    fn is_internal(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &ToolInvocation, _args: Value) -> Result<Value> {
        Ok(json!({
            "type": "transfer",
            "targetSubAgentId": self.target_sub_agent_id,
            "fromSubAgentId": self.from_sub_agent_id,
        }))
    }
}

/// Everything a delegation needs besides the task message.
pub struct DelegateConfig {
    pub target_agent_id: String,
    pub target_description: String,
    pub from_sub_agent_id: String,
    pub scope: Scope,
    pub conversation_id: String,
    pub parent_task_id: String,
    /// Prebuilt client: localhost + service token for internal targets,
    /// resolved credential headers for external, signed token + templated
    /// headers for team peers.
    pub client: A2aClient,
    pub repository: Arc<dyn Repository>,
    pub session: Arc<AgentSession>,
    /// True when the target lives outside this process.
    pub external: bool,
}

/// Requests a bounded sub-task from another agent; control returns with
/// the response folded into the parent's tool session.
pub struct DelegateTool {
    name: String,
    description: String,
    config: DelegateConfig,
    sequence: AtomicUsize,
}

impl DelegateTool {
    pub fn new(config: DelegateConfig) -> Self {
        Self {
            name: format!("delegate_to_{}", config.target_agent_id),
            description: format!(
                "Delegate a task to the {} agent and wait for its answer. {}",
                config.target_agent_id, config.target_description
            ),
            config,
            sequence: AtomicUsize::new(1),
        }
    }

    fn child_task_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("task_{}-{}-{}", self.config.conversation_id, n, suffix)
    }

    async fn persist_request(&self, task_id: &str, message: &str) -> Result<()> {
        let config = &self.config;
        let mut record = NewMessage::chat(&config.conversation_id, MessageRole::Agent, message);
        record.message_type = MessageType::A2aRequest;
        record.visibility = MessageVisibility::Internal;
        record.from_sub_agent_id = Some(config.from_sub_agent_id.clone());
        if config.external {
            record.to_external_agent_id = Some(config.target_agent_id.clone());
        } else {
            record.to_sub_agent_id = Some(config.target_agent_id.clone());
        }
        record.task_id = Some(config.parent_task_id.clone());
        record.a2a_task_id = Some(task_id.to_string());
        config.repository.create_message(&config.scope, record).await?;
        Ok(())
    }

    async fn persist_response(&self, task_id: &str, text: &str) -> Result<()> {
        let config = &self.config;
        let mut record = NewMessage::chat(&config.conversation_id, MessageRole::Agent, text);
        record.message_type = MessageType::A2aResponse;
        record.visibility = MessageVisibility::Internal;
        record.to_sub_agent_id = Some(config.from_sub_agent_id.clone());
        if config.external {
            record.from_external_agent_id = Some(config.target_agent_id.clone());
        } else {
            record.from_sub_agent_id = Some(config.target_agent_id.clone());
        }
        record.task_id = Some(config.parent_task_id.clone());
        record.a2a_task_id = Some(task_id.to_string());
        config.repository.create_message(&config.scope, record).await?;
        Ok(())
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The task for the delegated agent, phrased as a complete request.",
                },
            },
            "required": ["message"],
        }))
    }

    fn is_internal(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &ToolInvocation, args: Value) -> Result<Value> {
        let task_message = args
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| MaestroError::BadRequest("delegate requires a message".into()))?;

        let config = &self.config;
        let child_task_id = self.child_task_id();

        self.persist_request(&child_task_id, task_message).await?;
        config.session.record_event(SessionEvent::delegation_sent(
            &config.from_sub_agent_id,
            &config.target_agent_id,
            &child_task_id,
            task_message,
        ));

        let mut metadata = Map::new();
        metadata.insert("is_delegation".to_string(), Value::Bool(true));
        metadata
            .insert("target_sub_agent_id".to_string(), json!(config.target_agent_id));
        metadata.insert("stream_request_id".to_string(), json!(config.session.session_id));

        let mut message =
            A2aMessage::user_text(format!("msg_{}", uuid::Uuid::new_v4().simple()), task_message);
        message.context_id = Some(config.conversation_id.clone());
        message.task_id = Some(child_task_id.clone());
        message.metadata = Some(metadata);

        let response = config
            .client
            .send_message(MessageSendParams { message, configuration: None })
            .await?;
        let result = unwrap_rpc(response)?;
        let text = delegation_result_text(&result);

        self.persist_response(&child_task_id, &text).await?;
        config.session.record_event(SessionEvent::delegation_returned(
            &config.target_agent_id,
            &config.from_sub_agent_id,
            &child_task_id,
            json!({ "text": text }),
        ));

        Ok(json!({ "result": text, "task_id": child_task_id }))
    }
}

/// Pull the response text out of a `message/send` result, which is either
/// a Message or a completed Task.
fn delegation_result_text(result: &Value) -> String {
    // Message shape: { parts: [...] }
    if let Some(parts) = result.get("parts").and_then(Value::as_array) {
        return collect_text(parts);
    }
    // Task shape: { artifacts: [{ parts: [...] }] }
    if let Some(artifacts) = result.get("artifacts").and_then(Value::as_array) {
        let mut out = Vec::new();
        for artifact in artifacts {
            if let Some(parts) = artifact.get("parts").and_then(Value::as_array) {
                let text = collect_text(parts);
                if !text.is_empty() {
                    out.push(text);
                }
            }
        }
        return out.join("\n");
    }
    String::new()
}

fn collect_text(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transfer_tool_shape() {
        let tool = TransferTool::new("billing", "Handles invoices.", "router");
        assert_eq!(tool.name(), "transfer_to_billing");
        assert!(tool.is_internal());

        let ctx = ToolInvocation::new("tc-1", "sr-1");
        let result = tool.execute(&ctx, json!({})).await.unwrap();
        assert_eq!(result["type"], json!("transfer"));
        assert_eq!(result["targetSubAgentId"], json!("billing"));
        assert_eq!(result["fromSubAgentId"], json!("router"));
    }

    #[test]
    fn test_delegation_result_text_from_message() {
        let result = json!({ "parts": [{ "kind": "text", "text": "42" }], "messageId": "m" });
        assert_eq!(delegation_result_text(&result), "42");
    }

    #[test]
    fn test_delegation_result_text_from_task() {
        let result = json!({
            "id": "t1",
            "artifacts": [
                { "parts": [{ "kind": "text", "text": "first" }] },
                { "parts": [{ "kind": "text", "text": "second" }] }
            ]
        });
        assert_eq!(delegation_result_text(&result), "first\nsecond");
    }
}
