use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One content part; `kind` is the wire discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
    Data {
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into(), metadata: None }
    }

    pub fn data(data: Value) -> Self {
        Part::Data { data, metadata: None }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text, .. } => Some(text),
            Part::Data { .. } => None,
        }
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Part::Data { data, .. } => Some(data),
            Part::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aMessage {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "taskId")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "contextId")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl A2aMessage {
    pub fn user_text(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
            message_id: message_id.into(),
            task_id: None,
            context_id: None,
            metadata: None,
        }
    }

    pub fn agent(message_id: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            role: Role::Agent,
            parts,
            message_id: message_id.into(),
            task_id: None,
            context_id: None,
            metadata: None,
        }
    }

    /// Concatenated text parts.
    pub fn text_content(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect::<Vec<_>>().join("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Working,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskStatus {
    pub fn working() -> Self {
        Self { state: TaskState::Working, message: None }
    }

    pub fn completed() -> Self {
        Self { state: TaskState::Completed, message: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { state: TaskState::Failed, message: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aArtifact {
    #[serde(rename = "artifactId")]
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aTask {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "contextId")]
    pub context_id: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<A2aArtifact>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<A2aMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl A2aTask {
    pub fn working(id: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_id: Some(context_id.into()),
            status: TaskStatus::working(),
            artifacts: None,
            history: None,
            metadata: None,
        }
    }
}

/// Parameters for message/send and message/stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSendParams {
    pub message: A2aMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<MessageSendConfiguration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageSendConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,
}

/// Parameters for tasks/get and tasks/cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueryParams {
    pub id: String,
}

/// Parameters for tasks/resubscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResubscribeParams {
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// Raw task passed to agent.invoke (delegation and direct invocation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aTaskRequest {
    pub id: String,
    #[serde(default)]
    pub context: A2aTaskContext,
    pub message: A2aMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aTaskContext {
    #[serde(skip_serializing_if = "Option::is_none", rename = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aTaskResult {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub artifacts: Vec<A2aArtifact>,
}

/// Payload of a transfer envelope: `artifacts[0].parts[0]` of a completed
/// task whose generation handed control to another sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferData {
    #[serde(rename = "type")]
    pub kind: String,
    pub target_subagent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_subagent_id: Option<String>,
    pub task_id: String,
    pub reason: String,
    pub original_message: String,
}

impl TransferData {
    pub fn new(
        target_subagent_id: impl Into<String>,
        from_subagent_id: Option<String>,
        task_id: impl Into<String>,
        reason: impl Into<String>,
        original_message: impl Into<String>,
    ) -> Self {
        Self {
            kind: "transfer".to_string(),
            target_subagent_id: target_subagent_id.into(),
            from_subagent_id,
            task_id: task_id.into(),
            reason: reason.into(),
            original_message: original_message.into(),
        }
    }
}

/// Build the completed transfer envelope task.
pub fn transfer_task(task_id: &str, context_id: Option<&str>, data: &TransferData) -> A2aTask {
    A2aTask {
        id: task_id.to_string(),
        context_id: context_id.map(String::from),
        status: TaskStatus::completed(),
        artifacts: Some(vec![A2aArtifact {
            artifact_id: format!("transfer-{task_id}"),
            name: None,
            description: None,
            parts: vec![Part::data(json!(data))],
            metadata: None,
        }]),
        history: None,
        metadata: None,
    }
}

/// Extract transfer data from a task, if it is a transfer envelope.
pub fn extract_transfer(task: &A2aTask) -> Option<TransferData> {
    let part = task.artifacts.as_ref()?.first()?.parts.first()?;
    let data = part.as_data()?;
    if data.get("type").and_then(Value::as_str) != Some("transfer") {
        return None;
    }
    serde_json::from_value(data.clone()).ok()
}

/// Agent discovery card served at `/.well-known/agent.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub capabilities: AgentCapabilities,
    #[serde(rename = "defaultInputModes")]
    pub default_input_modes: Vec<String>,
    #[serde(rename = "defaultOutputModes")]
    pub default_output_modes: Vec<String>,
    pub skills: Vec<AgentSkill>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<AgentProvider>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub streaming: bool,
    #[serde(rename = "pushNotifications")]
    pub push_notifications: bool,
    #[serde(rename = "stateTransitionHistory")]
    pub state_transition_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProvider {
    pub organization: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_kind_discriminator() {
        let text = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(text["kind"], json!("text"));
        let data = serde_json::to_value(Part::data(json!({"a": 1}))).unwrap();
        assert_eq!(data["kind"], json!("data"));
    }

    #[test]
    fn test_message_wire_field_names() {
        let msg = A2aMessage::user_text("m1", "Hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["messageId"], json!("m1"));
        assert_eq!(value["role"], json!("user"));
    }

    #[test]
    fn test_transfer_roundtrip() {
        let data = TransferData::new("billing", Some("router".into()), "t1", "why", "Hi");
        let task = transfer_task("t1", Some("c1"), &data);
        assert_eq!(task.status.state, TaskState::Completed);
        let extracted = extract_transfer(&task).unwrap();
        assert_eq!(extracted, data);
        assert_eq!(extracted.target_subagent_id, "billing");
    }

    #[test]
    fn test_extract_transfer_ignores_other_tasks() {
        let task = A2aTask::working("t1", "c1");
        assert!(extract_transfer(&task).is_none());

        let mut with_artifact = A2aTask::working("t2", "c1");
        with_artifact.artifacts = Some(vec![A2aArtifact {
            artifact_id: "a1".into(),
            name: None,
            description: None,
            parts: vec![Part::data(json!({"type": "other"}))],
            metadata: None,
        }]);
        assert!(extract_transfer(&with_artifact).is_none());
    }

    #[test]
    fn test_task_request_context_parsing() {
        let raw = json!({
            "id": "task_c42-1-xyz",
            "context": { "conversationId": "c42" },
            "message": { "role": "user", "parts": [{"kind": "text", "text": "Hi"}], "messageId": "m1" }
        });
        let req: A2aTaskRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.context.conversation_id.as_deref(), Some("c42"));
        assert_eq!(req.message.text_content(), "Hi");
    }
}
