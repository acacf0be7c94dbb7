use maestro_core::{ArtifactRecord, Repository, Result, Scope};
use maestro_model::{LanguageModel, ModelMessage, ModelRequest, ModelRole};
use maestro_session::AgentSession;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Retry budget for background persistence.
pub const MAX_ARTIFACT_RETRIES: u32 = 3;

const ENRICH_BACKOFF_BASE: Duration = Duration::from_millis(500);

const MAX_NAME_LEN: usize = 50;
const MAX_DESCRIPTION_LEN: usize = 150;

/// Work item scheduled when an `artifact_saved` event lands.
#[derive(Debug, Clone)]
pub struct PendingArtifact {
    pub artifact_id: String,
    pub tool_call_id: String,
    pub task_id: String,
    pub artifact_type: String,
    pub base_selector: Option<String>,
    pub summary: Value,
    pub full: Value,
    pub tool_name: String,
    /// Recent conversation text given to the summarizer for context.
    pub conversation_context: String,
}

impl PendingArtifact {
    pub fn pending_key(&self) -> String {
        format!("{}:{}", self.artifact_id, self.tool_call_id)
    }
}

/// Enriches freshly extracted artifacts with a model-generated name and
/// description, then persists them. Failures never affect the visible
/// turn; after the retry budget the artifact persists with fallback
/// metadata.
pub struct ArtifactEnricher {
    repository: Arc<dyn Repository>,
    scope: Scope,
    summarizer: Option<(Arc<dyn LanguageModel>, String)>,
    backoff_base: Duration,
}

impl ArtifactEnricher {
    pub fn new(
        repository: Arc<dyn Repository>,
        scope: Scope,
        summarizer: Option<(Arc<dyn LanguageModel>, String)>,
    ) -> Self {
        Self { repository, scope, summarizer, backoff_base: ENRICH_BACKOFF_BASE }
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Spawn the background enrichment task; tracked on the session so
    /// cleanup can release it.
    pub fn schedule(self: &Arc<Self>, session: &Arc<AgentSession>, pending: PendingArtifact) {
        let enricher = self.clone();
        let session_owned = session.clone();
        let handle = tokio::spawn(async move {
            enricher.run(session_owned, pending).await;
        });
        session.track_background(handle);
    }

    async fn run(&self, session: Arc<AgentSession>, pending: PendingArtifact) {
        let key = pending.pending_key();

        for attempt in 0..=MAX_ARTIFACT_RETRIES {
            let outcome = self.enrich_and_persist(&pending).await;
            match outcome {
                Ok(()) => {
                    session.remove_pending_artifact(&key);
                    return;
                }
                Err(e) if attempt < MAX_ARTIFACT_RETRIES => {
                    let delay = self.backoff_base * 2u32.pow(attempt);
                    tracing::warn!(
                        artifact_id = %pending.artifact_id,
                        attempt = attempt + 1,
                        error = %e,
                        "artifact enrichment failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        artifact_id = %pending.artifact_id,
                        error = %e,
                        "artifact enrichment exhausted retries, writing fallback metadata"
                    );
                    let (name, description) = fallback_metadata(&pending);
                    if let Err(persist_err) =
                        self.persist(&pending, name, description).await
                    {
                        tracing::error!(
                            artifact_id = %pending.artifact_id,
                            error = %persist_err,
                            "artifact fallback persist failed"
                        );
                    }
                    session.remove_pending_artifact(&key);
                    return;
                }
            }
        }
    }

    async fn enrich_and_persist(&self, pending: &PendingArtifact) -> Result<()> {
        let (name, description) = match &self.summarizer {
            Some((model, model_name)) => {
                self.generate_metadata(model.as_ref(), model_name, pending).await?
            }
            None => fallback_metadata(pending),
        };
        self.persist(pending, name, description).await
    }

    async fn generate_metadata(
        &self,
        model: &dyn LanguageModel,
        model_name: &str,
        pending: &PendingArtifact,
    ) -> Result<(String, String)> {
        let prompt = format!(
            "A tool named `{}` produced this artifact of type {}:\n{}\n\nRecent conversation:\n{}\n\n\
             Name the artifact (max {MAX_NAME_LEN} chars) and describe it (max {MAX_DESCRIPTION_LEN} chars).",
            pending.tool_name,
            pending.artifact_type,
            pending.summary,
            pending.conversation_context,
        );

        let request = ModelRequest::new(
            model_name.to_string(),
            vec![
                ModelMessage::text(
                    ModelRole::System,
                    "You label artifacts for display. Respond with the requested JSON only.",
                ),
                ModelMessage::text(ModelRole::User, prompt),
            ],
        )
        .with_response_schema(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "maxLength": MAX_NAME_LEN },
                "description": { "type": "string", "maxLength": MAX_DESCRIPTION_LEN },
            },
            "required": ["name", "description"],
        }));

        let mut stream = model.generate(request, false).await?;
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            let response = item?;
            if response.turn_complete {
                text = response.text_content();
            }
        }

        let parsed: Value = serde_json::from_str(text.trim())
            .map_err(|e| maestro_core::MaestroError::Artifact(format!("bad summarizer output: {e}")))?;
        let name = truncate(
            parsed.get("name").and_then(Value::as_str).unwrap_or_default(),
            MAX_NAME_LEN,
        );
        let description = truncate(
            parsed.get("description").and_then(Value::as_str).unwrap_or_default(),
            MAX_DESCRIPTION_LEN,
        );
        if name.is_empty() {
            return Err(maestro_core::MaestroError::Artifact(
                "summarizer returned an empty name".into(),
            ));
        }
        Ok((name, description))
    }

    /// Idempotent by `(artifact_id, tool_call_id)`; duplicate-key writes
    /// collapse inside the repository.
    async fn persist(
        &self,
        pending: &PendingArtifact,
        name: String,
        description: String,
    ) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("tool_call_id".to_string(), json!(pending.tool_call_id));
        metadata.insert("artifact_type".to_string(), json!(pending.artifact_type));
        if let Some(base) = &pending.base_selector {
            metadata.insert("base_selector".to_string(), json!(base));
        }

        self.repository
            .upsert_artifact(
                &self.scope,
                ArtifactRecord {
                    artifact_id: pending.artifact_id.clone(),
                    task_id: pending.task_id.clone(),
                    name,
                    description,
                    artifact_type: pending.artifact_type.clone(),
                    summary: pending.summary.clone(),
                    full: pending.full.clone(),
                    metadata,
                    created_at: Utc::now(),
                },
            )
            .await
    }
}

fn fallback_metadata(pending: &PendingArtifact) -> (String, String) {
    (
        truncate(&format!("{} {}", pending.artifact_type, pending.artifact_id), MAX_NAME_LEN),
        truncate(
            &format!("Artifact produced by {} ({})", pending.tool_name, pending.tool_call_id),
            MAX_DESCRIPTION_LEN,
        ),
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max { s.to_string() } else { s.chars().take(max).collect() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::Repository;
    use maestro_model::{FinishReason, MockModel, ModelResponse};
    use maestro_session::{AgentSessionManager, CreateSessionRequest, ToolSessionManager};
    use maestro_store::MemoryRepository;

    fn pending() -> PendingArtifact {
        PendingArtifact {
            artifact_id: "x".into(),
            tool_call_id: "tc-1".into(),
            task_id: "t1".into(),
            artifact_type: "Document".into(),
            base_selector: Some("items | [0]".into()),
            summary: json!({"title": "A"}),
            full: json!({"title": "A", "url": "/a"}),
            tool_name: "search".into(),
            conversation_context: "user: find A".into(),
        }
    }

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
    async fn test_enrichment_persists_generated_metadata() {
        let repo = Arc::new(MemoryRepository::new());
        let summarizer = Arc::new(MockModel::new("sum").with_response(ModelResponse::complete(
            ModelMessage::text(
                ModelRole::Assistant,
                json!({"name": "Result A", "description": "First search hit"}).to_string(),
            ),
            FinishReason::Stop,
        )));

        let enricher = Arc::new(ArtifactEnricher::new(
            repo.clone(),
            Scope::new("t", "p"),
            Some((summarizer, "sum".into())),
        ));

        let session = session();
        session.add_pending_artifact("x:tc-1");
        enricher.schedule(&session, pending());

        // Wait for the background task to land the row.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if session.pending_artifact_count() == 0 {
                break;
            }
        }

        let rows = repo.get_ledger_artifacts(&Scope::new("t", "p"), "t1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Result A");
        assert_eq!(rows[0].tool_call_id(), Some("tc-1"));
        assert_eq!(session.pending_artifact_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_after_exhausted_retries() {
        let repo = Arc::new(MemoryRepository::new());
        // Summarizer with no scripted turns: every generate call errors.
        let summarizer = Arc::new(MockModel::new("sum"));

        let enricher = Arc::new(
            ArtifactEnricher::new(
                repo.clone(),
                Scope::new("t", "p"),
                Some((summarizer, "sum".into())),
            )
            .with_backoff_base(Duration::from_millis(1)),
        );

        let session = session();
        session.add_pending_artifact("x:tc-1");
        enricher.schedule(&session, pending());

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if session.pending_artifact_count() == 0 {
                break;
            }
        }

        let rows = repo.get_ledger_artifacts(&Scope::new("t", "p"), "t1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].name.contains("Document"));
        assert!(rows[0].description.contains("search"));
    }

    #[tokio::test]
    async fn test_duplicate_persist_collapses() {
        let repo = Arc::new(MemoryRepository::new());
        let enricher =
            Arc::new(ArtifactEnricher::new(repo.clone(), Scope::new("t", "p"), None));

        enricher.enrich_and_persist(&pending()).await.unwrap();
        enricher.enrich_and_persist(&pending()).await.unwrap();

        let rows = repo.get_ledger_artifacts(&Scope::new("t", "p"), "t1").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_truncation_limits() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long, MAX_NAME_LEN).len(), MAX_NAME_LEN);
        assert_eq!(truncate("short", MAX_NAME_LEN), "short");
    }
}
