use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Tenant/project scope attached to every repository operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub project_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), project_id: project_id.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub active_sub_agent_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Chat,
    A2aRequest,
    A2aResponse,
    ToolResult,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageVisibility {
    UserFacing,
    Internal,
    External,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Append-only conversation message. `visibility == UserFacing` together
/// with `message_type == Chat` is what end users see; everything else is
/// internal provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub visibility: MessageVisibility,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_sub_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_sub_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_external_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_external_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a2a_task_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn is_user_facing(&self) -> bool {
        self.visibility == MessageVisibility::UserFacing && self.message_type == MessageType::Chat
    }

    /// Name of the tool that produced a tool-result message, if recorded.
    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.get("tool_name").and_then(Value::as_str)
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

/// One task per top-level user turn. Delegation spawns child tasks with
/// fresh ids sharing the same conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub conversation_id: String,
    pub sub_agent_id: String,
    pub status: TaskState,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn stream_request_id(&self) -> Option<&str> {
        self.metadata.get("stream_request_id").and_then(Value::as_str)
    }

    pub fn is_delegation(&self) -> bool {
        self.metadata.get("is_delegation").and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Persisted artifact ledger row, unique per `(artifact_id, tool_call_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub artifact_type: String,
    pub summary: Value,
    pub full: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.get("tool_call_id").and_then(Value::as_str)
    }
}

/// Model selection for a sub-agent, inherited sub-agent → agent → project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSettingsMap {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<ModelSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<ModelSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarizer: Option<ModelSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_options: Option<Value>,
    /// Per-call deadline in seconds; capped by the engine's hard maximum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<u64>,
}

impl ModelSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into(), provider_options: None, max_duration: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopWhen {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_count_is: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    Full,
    Scoped,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub mode: HistoryMode,
    pub limit: usize,
    pub include_internal: bool,
    pub message_types: Vec<MessageType>,
    pub max_output_tokens: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            mode: HistoryMode::Full,
            limit: 100,
            include_internal: true,
            message_types: vec![MessageType::Chat, MessageType::ToolResult],
            max_output_tokens: 4000,
        }
    }
}

/// Declared structured-output fragment the model emits in Phase 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataComponentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    /// JSON-Schema shape of the component's props.
    pub props: Value,
}

/// Declared artifact projection: summary/full prop schemas drive both the
/// creation directive and the persisted views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactComponentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub summary_props: Value,
    pub full_props: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RelationTarget {
    /// Another sub-agent in the same project, reached in-process.
    Internal { sub_agent_id: String },
    /// A remote agent reached over A2A with resolved credential headers.
    External {
        agent_id: String,
        base_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        credential_reference_id: Option<String>,
    },
    /// A trusted peer: signed service token plus templated headers.
    Team {
        agent_id: String,
        base_url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl RelationTarget {
    pub fn agent_id(&self) -> &str {
        match self {
            RelationTarget::Internal { sub_agent_id } => sub_agent_id,
            RelationTarget::External { agent_id, .. } => agent_id,
            RelationTarget::Team { agent_id, .. } => agent_id,
        }
    }
}

/// A node in the agent graph: prompt, models, tools, and its
/// transfer/delegate relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub models: ModelSettingsMap,
    #[serde(default)]
    pub stop_when: StopWhen,
    #[serde(default)]
    pub conversation_history_config: HistoryConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_config_id: Option<String>,
    #[serde(default)]
    pub data_components: Vec<DataComponentDefinition>,
    #[serde(default)]
    pub artifact_components: Vec<ArtifactComponentDefinition>,
    #[serde(default)]
    pub can_transfer_to: Vec<RelationTarget>,
    #[serde(default)]
    pub can_delegate_to: Vec<RelationTarget>,
}

/// Related agents reachable from a sub-agent, split by locality.
#[derive(Debug, Clone, Default)]
pub struct RelatedAgents {
    pub internal: Vec<SubAgentDefinition>,
    pub external: Vec<RelationTarget>,
}

/// Project-level agent definition: the graph root plus shared defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub default_sub_agent_id: String,
    #[serde(default)]
    pub models: ModelSettingsMap,
    #[serde(default)]
    pub sub_agent_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_updates: Option<StatusUpdateSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWithSubAgents {
    pub agent: AgentDefinition,
    pub sub_agents: Vec<SubAgentDefinition>,
}

/// Named reference into a credential store; the material itself never
/// enters the data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialReference {
    pub id: String,
    pub credential_store_type: String,
    #[serde(default)]
    pub retrieval_params: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTransport {
    StreamableHttp,
    Sse,
}

/// A configured remote MCP-style tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolDefinition {
    pub id: String,
    pub name: String,
    pub server_url: String,
    pub transport: RemoteTransport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_reference_id: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// User-supplied sandboxed function tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub execute_code: String,
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
}

/// One named definition inside a [`ContextConfig`] DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextDefinition {
    Constant { value: Value },
    RequestHeader { header: String },
    Credential { credential_reference_id: String },
    Template { template: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub id: String,
    /// Evaluation follows insertion order; templates may reference any
    /// earlier definition.
    pub definitions: Vec<(String, ContextDefinition)>,
}

/// Declared status-update branch the summarizer may emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusComponent {
    pub component_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateSettings {
    pub num_events: usize,
    pub time_in_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub status_components: Vec<StatusComponent>,
}
