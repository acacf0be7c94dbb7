use crate::{Tool, ToolInvocation};
use maestro_core::{MaestroError, Repository, Result, Scope};
use maestro_session::AgentSession;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Sentinel that terminates Phase 1 when structured output is required.
/// The engine stops planning once this tool's result has landed.
pub struct ThinkingCompleteTool;

#[async_trait]
impl Tool for ThinkingCompleteTool {
    fn name(&self) -> &str {
        "thinking_complete"
    }

    fn description(&self) -> &str {
        "Call this once you have gathered everything needed to produce the final structured answer. \
         Do not call any other tool afterwards."
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(json!({ "type": "object", "properties": {} }))
    }

    fn is_internal(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &ToolInvocation, _args: Value) -> Result<Value> {
        Ok(json!({ "status": "thinking_complete" }))
    }
}

/// Fetch the full payload of a previously created artifact by
/// `(artifactId, toolCallId)`. Same-turn artifacts resolve from the
/// session cache; older ones fall back to the persisted ledger.
pub struct GetReferenceArtifactTool {
    session: Arc<AgentSession>,
    repository: Arc<dyn Repository>,
    scope: Scope,
}

impl GetReferenceArtifactTool {
    pub fn new(session: Arc<AgentSession>, repository: Arc<dyn Repository>, scope: Scope) -> Self {
        Self { session, repository, scope }
    }
}

#[async_trait]
impl Tool for GetReferenceArtifactTool {
    fn name(&self) -> &str {
        "get_reference_artifact"
    }

    fn description(&self) -> &str {
        "Retrieve the full content of an artifact previously shown in summary form. \
         Provide the artifact_id and the tool_call_id it was created from."
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "artifact_id": { "type": "string" },
                "tool_call_id": { "type": "string" },
            },
            "required": ["artifact_id", "tool_call_id"],
        }))
    }

    fn is_internal(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &ToolInvocation, args: Value) -> Result<Value> {
        let artifact_id = args
            .get("artifact_id")
            .and_then(Value::as_str)
            .ok_or_else(|| MaestroError::BadRequest("artifact_id is required".into()))?;
        let tool_call_id = args
            .get("tool_call_id")
            .and_then(Value::as_str)
            .ok_or_else(|| MaestroError::BadRequest("tool_call_id is required".into()))?;

        if let Some(cached) = self.session.cached_artifact(&format!("{artifact_id}:{tool_call_id}"))
        {
            return Ok(json!({
                "artifact_id": cached.artifact_id,
                "artifact_type": cached.artifact_type,
                "full": cached.full,
            }));
        }

        // Fall back to the ledger: scan the conversation's tasks.
        let task_ids = self
            .repository
            .list_task_ids_by_context(&self.scope, &self.session.conversation_id)
            .await?;
        for task_id in task_ids {
            let artifacts = self.repository.get_ledger_artifacts(&self.scope, &task_id).await?;
            if let Some(artifact) = artifacts.iter().find(|a| {
                a.artifact_id == artifact_id && a.tool_call_id() == Some(tool_call_id)
            }) {
                return Ok(json!({
                    "artifact_id": artifact.artifact_id,
                    "artifact_type": artifact.artifact_type,
                    "name": artifact.name,
                    "description": artifact.description,
                    "full": artifact.full,
                }));
            }
        }

        Err(MaestroError::Tool(format!(
            "artifact not found: {artifact_id} (tool call {tool_call_id})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_session::{
        AgentSessionManager, CachedArtifact, CreateSessionRequest, ToolSessionManager,
    };
    use maestro_store::MemoryRepository;

    fn session() -> Arc<AgentSession> {
        let manager = AgentSessionManager::new(Arc::new(ToolSessionManager::new()));
        manager.create_session(CreateSessionRequest {
            session_id: "sr-1".into(),
            scope: Scope::new("t", "p"),
            conversation_id: "c1".into(),
            task_id: "t1".into(),
            sub_agent_id: "router".into(),
            status: None,
        })
    }

    #[tokio::test]
    async fn test_thinking_complete_sentinel() {
        let tool = ThinkingCompleteTool;
        let ctx = ToolInvocation::new("tc-1", "sr-1");
        let result = tool.execute(&ctx, json!({})).await.unwrap();
        assert_eq!(result["status"], json!("thinking_complete"));
        assert!(tool.is_internal());
    }

    #[tokio::test]
    async fn test_reference_artifact_from_cache() {
        let session = session();
        session.cache_artifact(
            "x:tc-1",
            CachedArtifact {
                artifact_id: "x".into(),
                tool_call_id: "tc-1".into(),
                task_id: "t1".into(),
                artifact_type: "Document".into(),
                summary: json!({"title": "A"}),
                full: json!({"title": "A", "url": "/a"}),
                base_selector: None,
            },
        );

        let tool = GetReferenceArtifactTool::new(
            session,
            Arc::new(MemoryRepository::new()),
            Scope::new("t", "p"),
        );
        let ctx = ToolInvocation::new("tc-9", "sr-1");
        let result = tool
            .execute(&ctx, json!({"artifact_id": "x", "tool_call_id": "tc-1"}))
            .await
            .unwrap();
        assert_eq!(result["full"]["url"], json!("/a"));
    }

    #[tokio::test]
    async fn test_reference_artifact_missing() {
        let tool = GetReferenceArtifactTool::new(
            session(),
            Arc::new(MemoryRepository::new()),
            Scope::new("t", "p"),
        );
        let ctx = ToolInvocation::new("tc-9", "sr-1");
        let err = tool
            .execute(&ctx, json!({"artifact_id": "nope", "tool_call_id": "tc-0"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Tool(_)));
    }
}
