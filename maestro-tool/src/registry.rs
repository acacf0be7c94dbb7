use crate::{
    DelegateConfig, DelegateTool, GetReferenceArtifactTool, RemoteConnectionCache, RemoteTool,
    SandboxExecutor, SandboxedFunctionTool, ThinkingCompleteTool, Tool, ToolEnvelope,
    ToolInvocation, TransferTool, sanitize_tool_name,
};
use maestro_core::{
    RelationTarget, Repository, Result, Scope, SubAgentDefinition, TemplateMode, render_template,
};
use maestro_a2a::A2aClient;
use maestro_context::CredentialResolver;
use maestro_session::{AgentSession, ToolSessionData};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything one ToolSet build needs beyond the registry itself.
pub struct ToolSetRequest {
    pub scope: Scope,
    pub sub_agent: SubAgentDefinition,
    pub resolved_context: HashMap<String, Value>,
    pub conversation_id: String,
    pub task_id: String,
    pub agent_session: Arc<AgentSession>,
    pub tool_session: Arc<ToolSessionData>,
    /// Base URL of this process, for internal delegation.
    pub local_base_url: String,
    pub service_token: Option<String>,
}

/// Builds the merged tool surface for a sub-agent: remote servers,
/// sandboxed functions, relation tools, built-ins — in that order, later
/// wins on name collision.
pub struct ToolRegistry {
    repository: Arc<dyn Repository>,
    credentials: Arc<CredentialResolver>,
    connections: Arc<RemoteConnectionCache>,
    sandbox: Arc<dyn SandboxExecutor>,
}

impl ToolRegistry {
    pub fn new(
        repository: Arc<dyn Repository>,
        credentials: Arc<CredentialResolver>,
        connections: Arc<RemoteConnectionCache>,
        sandbox: Arc<dyn SandboxExecutor>,
    ) -> Self {
        Self { repository, credentials, connections, sandbox }
    }

    pub async fn build_tool_set(
        &self,
        request: &ToolSetRequest,
    ) -> Result<HashMap<String, Arc<dyn Tool>>> {
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();

        for tool in self.load_remote_tools(request).await? {
            insert_tool(&mut tools, tool);
        }
        for tool in self.load_function_tools(request).await? {
            insert_tool(&mut tools, tool);
        }
        for tool in self.build_relation_tools(request).await? {
            insert_tool(&mut tools, tool);
        }
        for tool in self.build_builtins(request) {
            insert_tool(&mut tools, tool);
        }

        // Lifecycle envelope goes on last so every source is covered.
        let wrapped = tools
            .into_iter()
            .map(|(name, tool)| {
                (
                    name,
                    ToolEnvelope::wrap(
                        tool,
                        request.agent_session.clone(),
                        request.tool_session.clone(),
                    ),
                )
            })
            .collect();
        Ok(wrapped)
    }

    async fn load_remote_tools(&self, request: &ToolSetRequest) -> Result<Vec<Arc<dyn Tool>>> {
        let definitions = self
            .repository
            .get_tools_for_sub_agent(&request.scope, &request.sub_agent.id)
            .await?;
        let structure_hints = !request.sub_agent.artifact_components.is_empty();

        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for definition in definitions {
            let headers = match self.remote_headers(&definition, request).await {
                Ok(headers) => headers,
                Err(e) => {
                    tracing::warn!(tool = %definition.name, error = %e, "skipping remote tool server");
                    continue;
                }
            };

            let key = RemoteConnectionCache::cache_key(
                &request.scope.tenant_id,
                &request.scope.project_id,
                &definition.id,
                definition.credential_reference_id.as_deref(),
            );

            let connection = match self.connections.get_or_connect(&key, &definition, &headers).await
            {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(tool = %definition.name, error = %e, "remote tool server unreachable");
                    continue;
                }
            };

            let specs = match connection.list_tools().await {
                Ok(specs) => specs,
                Err(e) => {
                    tracing::warn!(tool = %definition.name, error = %e, "failed to list remote tools");
                    self.connections.evict(&key).await;
                    continue;
                }
            };

            for spec in specs {
                tools.push(Arc::new(RemoteTool::new(
                    spec,
                    key.clone(),
                    definition.clone(),
                    headers.clone(),
                    self.connections.clone(),
                    structure_hints,
                )));
            }
        }
        Ok(tools)
    }

    async fn remote_headers(
        &self,
        definition: &maestro_core::RemoteToolDefinition,
        request: &ToolSetRequest,
    ) -> Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        for (name, template) in &definition.headers {
            headers.insert(
                name.clone(),
                render_template(template, &request.resolved_context, TemplateMode::Lenient)?,
            );
        }
        if let Some(reference_id) = &definition.credential_reference_id {
            let resolved = self
                .credentials
                .resolve(&request.scope, reference_id, &request.resolved_context)
                .await?;
            headers.extend(resolved);
        }
        Ok(headers)
    }

    async fn load_function_tools(&self, request: &ToolSetRequest) -> Result<Vec<Arc<dyn Tool>>> {
        let definitions = self
            .repository
            .get_function_tools_for_sub_agent(&request.scope, &request.sub_agent.id)
            .await?;
        Ok(definitions
            .into_iter()
            .map(|definition| {
                Arc::new(SandboxedFunctionTool::new(definition, self.sandbox.clone()))
                    as Arc<dyn Tool>
            })
            .collect())
    }

    async fn build_relation_tools(&self, request: &ToolSetRequest) -> Result<Vec<Arc<dyn Tool>>> {
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        let sub_agent = &request.sub_agent;

        for target in &sub_agent.can_transfer_to {
            let RelationTarget::Internal { sub_agent_id } = target else {
                continue; // transfer only changes the local active sub-agent
            };
            let description = self.enhanced_description(&request.scope, sub_agent_id).await?;
            tools.push(Arc::new(TransferTool::new(sub_agent_id, &description, &sub_agent.id)));
        }

        for target in &sub_agent.can_delegate_to {
            let (client, agent_id, description, external) = match target {
                RelationTarget::Internal { sub_agent_id } => {
                    let description =
                        self.enhanced_description(&request.scope, sub_agent_id).await?;
                    let mut client = A2aClient::new(request.local_base_url.clone());
                    if let Some(token) = &request.service_token {
                        client = client.with_bearer(token);
                    }
                    (client, sub_agent_id.clone(), description, false)
                }
                RelationTarget::External { agent_id, base_url, credential_reference_id } => {
                    let mut client = A2aClient::new(base_url.clone());
                    if let Some(reference_id) = credential_reference_id {
                        let headers = self
                            .credentials
                            .resolve(&request.scope, reference_id, &request.resolved_context)
                            .await?;
                        client = client.with_headers(headers);
                    }
                    (client, agent_id.clone(), String::new(), true)
                }
                RelationTarget::Team { agent_id, base_url, headers } => {
                    let mut rendered = HashMap::new();
                    for (name, template) in headers {
                        rendered.insert(
                            name.clone(),
                            render_template(
                                template,
                                &request.resolved_context,
                                TemplateMode::Lenient,
                            )?,
                        );
                    }
                    let mut client = A2aClient::new(base_url.clone()).with_headers(rendered);
                    if let Some(token) = &request.service_token {
                        client = client.with_bearer(token);
                    }
                    (client, agent_id.clone(), String::new(), true)
                }
            };

            tools.push(Arc::new(DelegateTool::new(DelegateConfig {
                target_agent_id: agent_id,
                target_description: description,
                from_sub_agent_id: sub_agent.id.clone(),
                scope: request.scope.clone(),
                conversation_id: request.conversation_id.clone(),
                parent_task_id: request.task_id.clone(),
                client,
                repository: self.repository.clone(),
                session: request.agent_session.clone(),
                external,
            })));
        }

        Ok(tools)
    }

    /// Target description enhanced with its own transfer/delegate
    /// capabilities. One hop only; the graph may contain cycles.
    async fn enhanced_description(&self, scope: &Scope, sub_agent_id: &str) -> Result<String> {
        let Some(target) = self.repository.get_sub_agent(scope, sub_agent_id).await? else {
            return Ok(String::new());
        };

        let mut description = target.description.clone();
        let transfer_names: Vec<&str> =
            target.can_transfer_to.iter().map(|t| t.agent_id()).collect();
        let delegate_names: Vec<&str> =
            target.can_delegate_to.iter().map(|t| t.agent_id()).collect();

        if !transfer_names.is_empty() {
            description.push_str(&format!(" Can hand off to: {}.", transfer_names.join(", ")));
        }
        if !delegate_names.is_empty() {
            description.push_str(&format!(" Can delegate to: {}.", delegate_names.join(", ")));
        }
        Ok(description)
    }

    fn build_builtins(&self, request: &ToolSetRequest) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(ThinkingCompleteTool) as Arc<dyn Tool>,
            Arc::new(GetReferenceArtifactTool::new(
                request.agent_session.clone(),
                self.repository.clone(),
                request.scope.clone(),
            )),
        ]
    }
}

/// Tool renamed to its sanitized form; everything else delegates.
struct NamedTool {
    name: String,
    inner: Arc<dyn Tool>,
}

#[async_trait]
impl Tool for NamedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> Option<Value> {
        self.inner.parameters_schema()
    }

    fn is_internal(&self) -> bool {
        self.inner.is_internal()
    }

    async fn execute(&self, ctx: &ToolInvocation, args: Value) -> Result<Value> {
        self.inner.execute(ctx, args).await
    }
}

fn insert_tool(tools: &mut HashMap<String, Arc<dyn Tool>>, tool: Arc<dyn Tool>) {
    let sanitized = sanitize_tool_name(tool.name());
    let tool: Arc<dyn Tool> = if sanitized == tool.name() {
        tool
    } else {
        Arc::new(NamedTool { name: sanitized.clone(), inner: tool })
    };

    if tools.insert(sanitized.clone(), tool).is_some() {
        tracing::warn!(tool = %sanitized, "tool name collision, later source wins");
    }
}
