use crate::compression::{CompressionConfig, compress_messages};
use maestro_core::{
    AgentDefinition, AgentWithSubAgents, ArtifactRecord, ContextConfig, Conversation,
    CredentialReference, FunctionDefinition, HistoryQuery, MessageContent, MessageRecord,
    MessageVisibility, NewMessage, RelatedAgents, RelationTarget, Repository, RemoteToolDefinition,
    Result, Scope, SubAgentDefinition, TaskRecord, TaskState,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

type ScopedMap<T> = HashMap<String, HashMap<String, T>>;

fn scope_key(scope: &Scope) -> String {
    format!("{}:{}", scope.tenant_id, scope.project_id)
}

/// In-memory repository backing the runtime and the test suites.
/// Reads return `Ok(None)` on miss; writes are idempotent by primary key.
pub struct MemoryRepository {
    sub_agents: RwLock<ScopedMap<SubAgentDefinition>>,
    agents: RwLock<ScopedMap<AgentDefinition>>,
    remote_tools: RwLock<ScopedMap<Vec<RemoteToolDefinition>>>,
    function_tools: RwLock<ScopedMap<Vec<FunctionDefinition>>>,
    functions: RwLock<ScopedMap<FunctionDefinition>>,
    credentials: RwLock<ScopedMap<CredentialReference>>,
    context_configs: RwLock<ScopedMap<ContextConfig>>,
    conversations: RwLock<ScopedMap<Conversation>>,
    /// conversation id → ordered messages
    messages: RwLock<ScopedMap<Vec<MessageRecord>>>,
    tasks: RwLock<ScopedMap<TaskRecord>>,
    /// task id → artifact rows, deduplicated by `(artifact_id, tool_call_id)`
    artifacts: RwLock<ScopedMap<Vec<ArtifactRecord>>>,
    compression: CompressionConfig,
    compression_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_compression(CompressionConfig::from_env())
    }

    pub fn with_compression(compression: CompressionConfig) -> Self {
        Self {
            sub_agents: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            remote_tools: RwLock::new(HashMap::new()),
            function_tools: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            context_configs: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            artifacts: RwLock::new(HashMap::new()),
            compression,
            compression_locks: Mutex::new(HashMap::new()),
        }
    }

    // ----- seeding helpers (used by server bootstrap and tests) -----

    pub async fn put_sub_agent(&self, scope: &Scope, sub_agent: SubAgentDefinition) {
        self.sub_agents
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .insert(sub_agent.id.clone(), sub_agent);
    }

    pub async fn put_agent(&self, scope: &Scope, agent: AgentDefinition) {
        self.agents
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .insert(agent.id.clone(), agent);
    }

    pub async fn put_tools_for_sub_agent(
        &self,
        scope: &Scope,
        sub_agent_id: &str,
        tools: Vec<RemoteToolDefinition>,
    ) {
        self.remote_tools
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .insert(sub_agent_id.to_string(), tools);
    }

    pub async fn put_function_tools_for_sub_agent(
        &self,
        scope: &Scope,
        sub_agent_id: &str,
        functions: Vec<FunctionDefinition>,
    ) {
        let mut by_id = self.functions.write().unwrap();
        let scoped = by_id.entry(scope_key(scope)).or_default();
        for function in &functions {
            scoped.insert(function.id.clone(), function.clone());
        }
        drop(by_id);

        self.function_tools
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .insert(sub_agent_id.to_string(), functions);
    }

    pub async fn put_credential_reference(&self, scope: &Scope, reference: CredentialReference) {
        self.credentials
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .insert(reference.id.clone(), reference);
    }

    pub async fn put_context_config(&self, scope: &Scope, config: ContextConfig) {
        self.context_configs
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .insert(config.id.clone(), config);
    }

    /// All messages of a conversation, unfiltered (tests and compression).
    pub fn raw_messages(&self, scope: &Scope, conversation_id: &str) -> Vec<MessageRecord> {
        self.messages
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(conversation_id))
            .cloned()
            .unwrap_or_default()
    }

    async fn compression_lock(&self, key: String) -> Arc<Mutex<()>> {
        self.compression_locks.lock().await.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Compress a conversation in place if it exceeds the threshold.
    /// Single-flight per `(tenant, project, conversation)`.
    async fn maybe_compress(&self, scope: &Scope, conversation_id: &str) {
        let key = format!("{}:{}", scope_key(scope), conversation_id);
        let lock = self.compression_lock(key).await;
        let _guard = lock.lock().await;

        let current = self.raw_messages(scope, conversation_id);
        if let Some(compressed) = compress_messages(&self.compression, &current) {
            self.messages
                .write()
                .unwrap()
                .entry(scope_key(scope))
                .or_default()
                .insert(conversation_id.to_string(), compressed);
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_sub_agent(
        &self,
        scope: &Scope,
        sub_agent_id: &str,
    ) -> Result<Option<SubAgentDefinition>> {
        Ok(self
            .sub_agents
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(sub_agent_id))
            .cloned())
    }

    async fn get_agent_with_sub_agents(
        &self,
        scope: &Scope,
        agent_id: &str,
    ) -> Result<Option<AgentWithSubAgents>> {
        let Some(agent) = self
            .agents
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(agent_id))
            .cloned()
        else {
            return Ok(None);
        };

        let sub_agents = {
            let lock = self.sub_agents.read().unwrap();
            let scoped = lock.get(&scope_key(scope));
            agent
                .sub_agent_ids
                .iter()
                .filter_map(|id| scoped.and_then(|m| m.get(id)).cloned())
                .collect()
        };

        Ok(Some(AgentWithSubAgents { agent, sub_agents }))
    }

    async fn get_related_agents(&self, scope: &Scope, sub_agent_id: &str) -> Result<RelatedAgents> {
        let Some(sub_agent) = self.get_sub_agent(scope, sub_agent_id).await? else {
            return Ok(RelatedAgents::default());
        };

        let mut related = RelatedAgents::default();
        let lock = self.sub_agents.read().unwrap();
        let scoped = lock.get(&scope_key(scope));

        for target in sub_agent.can_transfer_to.iter().chain(sub_agent.can_delegate_to.iter()) {
            match target {
                RelationTarget::Internal { sub_agent_id } => {
                    if let Some(definition) = scoped.and_then(|m| m.get(sub_agent_id)) {
                        if !related.internal.iter().any(|a| a.id == definition.id) {
                            related.internal.push(definition.clone());
                        }
                    }
                }
                external => {
                    if !related.external.iter().any(|t| t.agent_id() == external.agent_id()) {
                        related.external.push(external.clone());
                    }
                }
            }
        }

        Ok(related)
    }

    async fn get_tools_for_sub_agent(
        &self,
        scope: &Scope,
        sub_agent_id: &str,
    ) -> Result<Vec<RemoteToolDefinition>> {
        Ok(self
            .remote_tools
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(sub_agent_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_function_tools_for_sub_agent(
        &self,
        scope: &Scope,
        sub_agent_id: &str,
    ) -> Result<Vec<FunctionDefinition>> {
        Ok(self
            .function_tools
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(sub_agent_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_function(
        &self,
        scope: &Scope,
        function_id: &str,
    ) -> Result<Option<FunctionDefinition>> {
        Ok(self
            .functions
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(function_id))
            .cloned())
    }

    async fn get_credential_reference(
        &self,
        scope: &Scope,
        reference_id: &str,
    ) -> Result<Option<CredentialReference>> {
        Ok(self
            .credentials
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(reference_id))
            .cloned())
    }

    async fn get_context_config_by_id(
        &self,
        scope: &Scope,
        config_id: &str,
    ) -> Result<Option<ContextConfig>> {
        Ok(self
            .context_configs
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(config_id))
            .cloned())
    }

    async fn get_conversation(
        &self,
        scope: &Scope,
        conversation_id: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(conversation_id))
            .cloned())
    }

    async fn create_conversation(&self, scope: &Scope, conversation: Conversation) -> Result<()> {
        self.conversations
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .entry(conversation.id.clone())
            .or_insert(conversation);
        Ok(())
    }

    async fn set_active_sub_agent_for_thread(
        &self,
        scope: &Scope,
        conversation_id: &str,
        sub_agent_id: &str,
    ) -> Result<()> {
        if let Some(conversation) = self
            .conversations
            .write()
            .unwrap()
            .get_mut(&scope_key(scope))
            .and_then(|m| m.get_mut(conversation_id))
        {
            conversation.active_sub_agent_id = sub_agent_id.to_string();
        }
        Ok(())
    }

    async fn get_conversation_history(
        &self,
        scope: &Scope,
        conversation_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<MessageRecord>> {
        self.maybe_compress(scope, conversation_id).await;

        let all = self.raw_messages(scope, conversation_id);
        let mut filtered: Vec<MessageRecord> = all
            .into_iter()
            .filter(|m| query.message_types.contains(&m.message_type))
            .filter(|m| query.include_internal || m.visibility != MessageVisibility::Internal)
            .collect();

        // Most recent `limit` messages, chronological order preserved.
        if filtered.len() > query.limit {
            filtered.drain(..filtered.len() - query.limit);
        }

        // Soft character budget derived from the token budget.
        let char_budget = query.max_output_tokens.saturating_mul(4);
        let mut used = 0usize;
        let mut start = 0usize;
        for (index, message) in filtered.iter().enumerate().rev() {
            used += message.content.text.len();
            if used > char_budget {
                start = index + 1;
                break;
            }
        }
        if start > 0 {
            filtered.drain(..start);
        }

        Ok(filtered)
    }

    async fn create_message(&self, scope: &Scope, message: NewMessage) -> Result<MessageRecord> {
        let record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id.clone(),
            role: message.role,
            message_type: message.message_type,
            visibility: message.visibility,
            content: MessageContent::text(message.text),
            from_sub_agent_id: message.from_sub_agent_id,
            to_sub_agent_id: message.to_sub_agent_id,
            from_external_agent_id: message.from_external_agent_id,
            to_external_agent_id: message.to_external_agent_id,
            task_id: message.task_id,
            a2a_task_id: message.a2a_task_id,
            metadata: message.metadata,
            created_at: Utc::now(),
        };

        self.messages
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .entry(message.conversation_id)
            .or_default()
            .push(record.clone());

        Ok(record)
    }

    async fn create_task(&self, scope: &Scope, task: TaskRecord) -> Result<()> {
        self.tasks
            .write()
            .unwrap()
            .entry(scope_key(scope))
            .or_default()
            .entry(task.id.clone())
            .or_insert(task);
        Ok(())
    }

    async fn update_task(
        &self,
        scope: &Scope,
        task_id: &str,
        status: TaskState,
        failure_message: Option<String>,
    ) -> Result<()> {
        if let Some(task) = self
            .tasks
            .write()
            .unwrap()
            .get_mut(&scope_key(scope))
            .and_then(|m| m.get_mut(task_id))
        {
            task.status = status;
            task.updated_at = Utc::now();
            if let Some(message) = failure_message {
                task.metadata.insert("failure_message".to_string(), message.into());
            }
        }
        Ok(())
    }

    async fn get_task(&self, scope: &Scope, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().unwrap().get(&scope_key(scope)).and_then(|m| m.get(task_id)).cloned())
    }

    async fn list_task_ids_by_context(&self, scope: &Scope, context_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<(chrono::DateTime<Utc>, String)> = self
            .tasks
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .map(|m| {
                m.values()
                    .filter(|t| t.conversation_id == context_id)
                    .map(|t| (t.created_at, t.id.clone()))
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn get_ledger_artifacts(
        &self,
        scope: &Scope,
        task_id: &str,
    ) -> Result<Vec<ArtifactRecord>> {
        Ok(self
            .artifacts
            .read()
            .unwrap()
            .get(&scope_key(scope))
            .and_then(|m| m.get(task_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_artifact(&self, scope: &Scope, artifact: ArtifactRecord) -> Result<()> {
        let mut lock = self.artifacts.write().unwrap();
        let rows = lock
            .entry(scope_key(scope))
            .or_default()
            .entry(artifact.task_id.clone())
            .or_default();

        let duplicate = rows.iter().any(|existing| {
            existing.artifact_id == artifact.artifact_id
                && existing.tool_call_id() == artifact.tool_call_id()
        });
        if duplicate {
            tracing::debug!(
                artifact_id = %artifact.artifact_id,
                "duplicate artifact write collapsed"
            );
            return Ok(());
        }
        rows.push(artifact);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{MessageRole, MessageType};
    use serde_json::json;

    fn scope() -> Scope {
        Scope::new("tenant", "project")
    }

    fn sub_agent(id: &str) -> SubAgentDefinition {
        SubAgentDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: format!("{id} agent"),
            prompt: "You are {id}".to_string(),
            models: Default::default(),
            stop_when: Default::default(),
            conversation_history_config: Default::default(),
            context_config_id: None,
            data_components: vec![],
            artifact_components: vec![],
            can_transfer_to: vec![],
            can_delegate_to: vec![],
        }
    }

    #[tokio::test]
    async fn test_missing_rows_return_none() {
        let repo = MemoryRepository::new();
        assert!(repo.get_sub_agent(&scope(), "nope").await.unwrap().is_none());
        assert!(repo.get_task(&scope(), "nope").await.unwrap().is_none());
        assert!(repo.get_conversation(&scope(), "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_related_agents_one_hop() {
        let repo = MemoryRepository::new();
        let mut router = sub_agent("router");
        router.can_transfer_to =
            vec![RelationTarget::Internal { sub_agent_id: "billing".to_string() }];
        router.can_delegate_to = vec![RelationTarget::External {
            agent_id: "weather".to_string(),
            base_url: "https://weather.example.com".to_string(),
            credential_reference_id: None,
        }];
        repo.put_sub_agent(&scope(), router).await;
        repo.put_sub_agent(&scope(), sub_agent("billing")).await;

        let related = repo.get_related_agents(&scope(), "router").await.unwrap();
        assert_eq!(related.internal.len(), 1);
        assert_eq!(related.internal[0].id, "billing");
        assert_eq!(related.external.len(), 1);
        assert_eq!(related.external[0].agent_id(), "weather");
    }

    #[tokio::test]
    async fn test_history_filters_and_limit() {
        let repo = MemoryRepository::new();
        let s = scope();
        for i in 0..5 {
            repo.create_message(&s, NewMessage::chat("c1", MessageRole::User, format!("msg {i}")))
                .await
                .unwrap();
        }
        let mut internal = NewMessage::chat("c1", MessageRole::Agent, "internal note");
        internal.message_type = MessageType::ToolResult;
        internal.visibility = MessageVisibility::Internal;
        repo.create_message(&s, internal).await.unwrap();

        let query = HistoryQuery {
            limit: 3,
            include_internal: false,
            message_types: vec![MessageType::Chat],
            max_output_tokens: 4000,
        };
        let history = repo.get_conversation_history(&s, "c1", &query).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content.text, "msg 2");
        assert_eq!(history[2].content.text, "msg 4");

        let include_all = HistoryQuery {
            limit: 10,
            include_internal: true,
            message_types: vec![MessageType::Chat, MessageType::ToolResult],
            max_output_tokens: 4000,
        };
        let history = repo.get_conversation_history(&s, "c1", &include_all).await.unwrap();
        assert_eq!(history.len(), 6);
    }

    #[tokio::test]
    async fn test_artifact_upsert_idempotent() {
        let repo = MemoryRepository::new();
        let s = scope();
        let mut metadata = HashMap::new();
        metadata.insert("tool_call_id".to_string(), json!("tc-1"));
        let artifact = ArtifactRecord {
            artifact_id: "x".to_string(),
            task_id: "t1".to_string(),
            name: "Doc".to_string(),
            description: "A doc".to_string(),
            artifact_type: "Document".to_string(),
            summary: json!({"title": "A"}),
            full: json!({"title": "A", "body": "..."}),
            metadata,
            created_at: Utc::now(),
        };

        repo.upsert_artifact(&s, artifact.clone()).await.unwrap();
        repo.upsert_artifact(&s, artifact).await.unwrap();
        assert_eq!(repo.get_ledger_artifacts(&s, "t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_active_sub_agent_transition() {
        let repo = MemoryRepository::new();
        let s = scope();
        repo.create_conversation(
            &s,
            Conversation {
                id: "c1".to_string(),
                tenant_id: s.tenant_id.clone(),
                project_id: s.project_id.clone(),
                active_sub_agent_id: "router".to_string(),
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        repo.set_active_sub_agent_for_thread(&s, "c1", "billing").await.unwrap();
        let conversation = repo.get_conversation(&s, "c1").await.unwrap().unwrap();
        assert_eq!(conversation.active_sub_agent_id, "billing");
    }

    #[tokio::test]
    async fn test_history_compression_trips_at_threshold() {
        let config = CompressionConfig { hard_limit: 400, safety_buffer: 100, enabled: true };
        let repo = MemoryRepository::with_compression(config);
        let s = scope();
        for i in 0..20 {
            repo.create_message(
                &s,
                NewMessage::chat("c1", MessageRole::User, format!("{i}-{}", "x".repeat(50))),
            )
            .await
            .unwrap();
        }

        let query = HistoryQuery::default();
        let _ = repo.get_conversation_history(&s, "c1", &query).await.unwrap();
        let raw = repo.raw_messages(&s, "c1");
        assert!(raw.len() < 20);
        assert!(raw[0].content.text.contains("elided"));
    }
}
