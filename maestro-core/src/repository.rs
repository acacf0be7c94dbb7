use crate::{
    AgentWithSubAgents, ArtifactRecord, ContextConfig, Conversation, CredentialReference,
    FunctionDefinition, MessageRecord, MessageType, RelatedAgents, RemoteToolDefinition, Result,
    Scope, SubAgentDefinition, TaskRecord, TaskState,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Filters applied when loading conversation history.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub limit: usize,
    pub include_internal: bool,
    pub message_types: Vec<MessageType>,
    /// Soft output budget; the loader drops oldest messages past it.
    pub max_output_tokens: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            include_internal: true,
            message_types: vec![MessageType::Chat, MessageType::ToolResult],
            max_output_tokens: 4000,
        }
    }
}

/// Fields for appending one conversation message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: crate::MessageRole,
    pub message_type: MessageType,
    pub visibility: crate::MessageVisibility,
    pub text: String,
    pub from_sub_agent_id: Option<String>,
    pub to_sub_agent_id: Option<String>,
    pub from_external_agent_id: Option<String>,
    pub to_external_agent_id: Option<String>,
    pub task_id: Option<String>,
    pub a2a_task_id: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl NewMessage {
    pub fn chat(conversation_id: impl Into<String>, role: crate::MessageRole, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            message_type: MessageType::Chat,
            visibility: crate::MessageVisibility::UserFacing,
            text: text.into(),
            from_sub_agent_id: None,
            to_sub_agent_id: None,
            from_external_agent_id: None,
            to_external_agent_id: None,
            task_id: None,
            a2a_task_id: None,
            metadata: HashMap::new(),
        }
    }
}

/// Storage boundary for the runtime. Reads return `Ok(None)` for missing
/// rows; writes are idempotent by primary key.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_sub_agent(&self, scope: &Scope, sub_agent_id: &str)
    -> Result<Option<SubAgentDefinition>>;

    async fn get_agent_with_sub_agents(
        &self,
        scope: &Scope,
        agent_id: &str,
    ) -> Result<Option<AgentWithSubAgents>>;

    /// One-hop transfer/delegate neighbours of a sub-agent.
    async fn get_related_agents(&self, scope: &Scope, sub_agent_id: &str) -> Result<RelatedAgents>;

    async fn get_tools_for_sub_agent(
        &self,
        scope: &Scope,
        sub_agent_id: &str,
    ) -> Result<Vec<RemoteToolDefinition>>;

    async fn get_function_tools_for_sub_agent(
        &self,
        scope: &Scope,
        sub_agent_id: &str,
    ) -> Result<Vec<FunctionDefinition>>;

    async fn get_function(&self, scope: &Scope, function_id: &str)
    -> Result<Option<FunctionDefinition>>;

    async fn get_credential_reference(
        &self,
        scope: &Scope,
        reference_id: &str,
    ) -> Result<Option<CredentialReference>>;

    async fn get_context_config_by_id(
        &self,
        scope: &Scope,
        config_id: &str,
    ) -> Result<Option<ContextConfig>>;

    async fn get_conversation(&self, scope: &Scope, conversation_id: &str)
    -> Result<Option<Conversation>>;

    async fn create_conversation(&self, scope: &Scope, conversation: Conversation) -> Result<()>;

    async fn set_active_sub_agent_for_thread(
        &self,
        scope: &Scope,
        conversation_id: &str,
        sub_agent_id: &str,
    ) -> Result<()>;

    async fn get_conversation_history(
        &self,
        scope: &Scope,
        conversation_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<MessageRecord>>;

    async fn create_message(&self, scope: &Scope, message: NewMessage) -> Result<MessageRecord>;

    async fn create_task(&self, scope: &Scope, task: TaskRecord) -> Result<()>;

    async fn update_task(
        &self,
        scope: &Scope,
        task_id: &str,
        status: TaskState,
        failure_message: Option<String>,
    ) -> Result<()>;

    async fn get_task(&self, scope: &Scope, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Task ids that have run within a conversation (context).
    async fn list_task_ids_by_context(&self, scope: &Scope, context_id: &str) -> Result<Vec<String>>;

    /// Artifact ledger rows for one task.
    async fn get_ledger_artifacts(&self, scope: &Scope, task_id: &str) -> Result<Vec<ArtifactRecord>>;

    /// Idempotent by `(artifact_id, tool_call_id)`; duplicate writes keep
    /// the first row.
    async fn upsert_artifact(&self, scope: &Scope, artifact: ArtifactRecord) -> Result<()>;
}
