use crate::enrich::{ArtifactEnricher, PendingArtifact};
use crate::selector::{
    apply_base_selector, parse_selector_map, project_props, validate_against_schema,
};
use maestro_core::ArtifactComponentDefinition;
use maestro_session::{AgentSession, CachedArtifact, SessionEvent, ToolSessionData};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::{Arc, OnceLock};

static ATTR_REGEX: OnceLock<Regex> = OnceLock::new();

/// `key="…"`, `key='…'`, or `key={…}` attribute pairs.
fn attr_regex() -> &'static Regex {
    ATTR_REGEX.get_or_init(|| {
        Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)'|(\{[^}]*\}))"#)
            .expect("Invalid regex pattern")
    })
}

/// Parsed `<artifact:create>` / `<artifact:ref>` attributes.
#[derive(Debug, Clone, Default)]
pub struct DirectiveAttrs {
    pub id: String,
    pub tool_call_id: String,
    pub artifact_type: String,
    pub base: Option<String>,
    pub summary: Option<String>,
    pub full: Option<String>,
}

pub fn parse_directive_attrs(raw: &str) -> DirectiveAttrs {
    let mut attrs = DirectiveAttrs::default();
    for capture in attr_regex().captures_iter(raw) {
        let key = capture.get(1).map(|m| m.as_str()).unwrap_or_default();
        let value = capture
            .get(2)
            .or_else(|| capture.get(3))
            .or_else(|| capture.get(4))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        match key {
            "id" => attrs.id = value,
            "tool" => attrs.tool_call_id = value,
            "type" => attrs.artifact_type = value,
            "base" => attrs.base = Some(value),
            "summary" => attrs.summary = Some(value),
            "full" => attrs.full = Some(value),
            other => tracing::debug!(attr = other, "unknown directive attribute ignored"),
        }
    }
    attrs
}

/// Extracts artifacts from model output: inline textual directives and
/// structured `ArtifactCreate_<Type>` entries both run the same pipeline.
pub struct ArtifactExtractor {
    session: Arc<AgentSession>,
    tool_session: Arc<ToolSessionData>,
    components: Vec<ArtifactComponentDefinition>,
    enricher: Arc<ArtifactEnricher>,
}

impl ArtifactExtractor {
    pub fn new(
        session: Arc<AgentSession>,
        tool_session: Arc<ToolSessionData>,
        components: Vec<ArtifactComponentDefinition>,
        enricher: Arc<ArtifactEnricher>,
    ) -> Self {
        Self { session, tool_session, components, enricher }
    }

    fn component_for(&self, artifact_type: &str) -> Option<&ArtifactComponentDefinition> {
        self.components.iter().find(|c| c.name == artifact_type)
    }

    /// Run one `<artifact:create>` directive through the pipeline.
    /// Returns the streamed data part, or `None` when the directive is
    /// dropped (never surfaced to the user).
    pub async fn handle_create(&self, attrs: DirectiveAttrs) -> Option<Value> {
        if attrs.id.is_empty() || attrs.tool_call_id.is_empty() {
            tracing::warn!("artifact directive missing id or tool attribute, dropped");
            return None;
        }

        let Some(record) = self.tool_session.get_result(&attrs.tool_call_id).await else {
            tracing::warn!(
                tool_call_id = %attrs.tool_call_id,
                "artifact directive references unknown tool call, dropped"
            );
            return None;
        };

        let mut result = record.result.clone();
        if let Value::Object(ref mut map) = result {
            map.remove("_structureHints");
        }

        let base = match apply_base_selector(&result, attrs.base.as_deref()) {
            Ok(base) => base,
            Err(e) => {
                tracing::warn!(error = %e, "artifact base selector failed, dropped");
                return None;
            }
        };

        let summary_props = match attrs.summary.as_deref().map(parse_selector_map).transpose() {
            Ok(props) => props.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "artifact summary map unparseable, dropped");
                return None;
            }
        };
        let full_props = match attrs.full.as_deref().map(parse_selector_map).transpose() {
            Ok(props) => props.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "artifact full map unparseable, dropped");
                return None;
            }
        };

        let mut summary = project_props(&base, &summary_props);
        let full = if full_props.is_empty() {
            base.clone()
        } else {
            project_props(&base, &full_props)
        };

        if let Some(component) = self.component_for(&attrs.artifact_type) {
            summary = validate_against_schema(summary, &component.summary_props);
        }

        let cache_entry = CachedArtifact {
            artifact_id: attrs.id.clone(),
            tool_call_id: attrs.tool_call_id.clone(),
            task_id: self.session.task_id.clone(),
            artifact_type: attrs.artifact_type.clone(),
            summary: summary.clone(),
            full: full.clone(),
            base_selector: attrs.base.clone(),
        };
        self.session
            .cache_artifact(format!("{}:{}", attrs.id, attrs.tool_call_id), cache_entry.clone());
        self.session
            .cache_artifact(format!("{}:{}", attrs.id, self.session.task_id), cache_entry);

        let pending = PendingArtifact {
            artifact_id: attrs.id.clone(),
            tool_call_id: attrs.tool_call_id.clone(),
            task_id: self.session.task_id.clone(),
            artifact_type: attrs.artifact_type.clone(),
            base_selector: attrs.base.clone(),
            summary: summary.clone(),
            full,
            tool_name: record.tool_name.clone(),
            conversation_context: String::new(),
        };

        if self.session.add_pending_artifact(pending.pending_key()) {
            self.session.record_event(SessionEvent::artifact_saved(
                &attrs.id,
                &attrs.tool_call_id,
                &attrs.artifact_type,
            ));
            self.enricher.schedule(&self.session, pending);
        }

        Some(json!({
            "artifactId": attrs.id,
            "toolCallId": attrs.tool_call_id,
            "name": "Processing…",
            "description": "Generating name and description",
            "type": attrs.artifact_type,
            "artifactSummary": summary,
        }))
    }

    /// Resolve an `<artifact:ref>` against the same-turn cache.
    pub async fn handle_ref(&self, id: &str, tool_call_id: &str) -> Option<Value> {
        let cached = self
            .session
            .cached_artifact(&format!("{id}:{tool_call_id}"))
            .or_else(|| self.session.cached_artifact(&format!("{id}:{}", self.session.task_id)))?;

        Some(json!({
            "artifactId": cached.artifact_id,
            "toolCallId": cached.tool_call_id,
            "name": "Processing…",
            "description": "Generating name and description",
            "type": cached.artifact_type,
            "artifactSummary": cached.summary,
        }))
    }

    /// Translate one structured `ArtifactCreate_<Type>` entry into the
    /// directive form and run the same pipeline.
    pub async fn handle_structured(&self, entry: &Value) -> Option<Value> {
        let type_name = entry
            .get("name")
            .or_else(|| entry.get("type"))
            .and_then(Value::as_str)?
            .strip_prefix("ArtifactCreate_")?
            .to_string();

        let props = entry.get("props").unwrap_or(entry);
        let attrs = DirectiveAttrs {
            id: props
                .get("id")
                .or_else(|| props.get("artifact_id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_call_id: props
                .get("tool")
                .or_else(|| props.get("tool_call_id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            artifact_type: type_name,
            base: props.get("base").and_then(Value::as_str).map(String::from),
            summary: selector_map_attr(props.get("summary")),
            full: selector_map_attr(props.get("full")),
        };

        self.handle_create(attrs).await
    }
}

/// Structured entries may carry the selector map as a string or an object.
fn selector_map_attr(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        object @ Value::Object(_) => Some(object.to_string()),
        _ => None,
    }
}

/// Whether a structured dataComponents entry is an artifact-creation
/// directive rather than a plain data part.
pub fn is_artifact_create_entry(entry: &Value) -> bool {
    entry
        .get("name")
        .or_else(|| entry.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|name| name.starts_with("ArtifactCreate_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::Scope;
    use maestro_session::{
        AgentSessionManager, CreateSessionRequest, EventKind, ToolSessionManager,
    };
    use maestro_store::MemoryRepository;

    fn component() -> ArtifactComponentDefinition {
        ArtifactComponentDefinition {
            id: "doc".into(),
            name: "Document".into(),
            description: "A document".into(),
            summary_props: json!({
                "type": "object",
                "properties": { "title": {"type": "string"}, "url": {"type": "string"} },
            }),
            full_props: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "url": {"type": "string"},
                    "body": {"type": "string"},
                },
            }),
        }
    }

    async fn extractor() -> (ArtifactExtractor, Arc<AgentSession>, Arc<ToolSessionData>) {
        let tool_sessions = Arc::new(ToolSessionManager::new());
        let manager = AgentSessionManager::new(tool_sessions.clone());
        let session = manager.create_session(CreateSessionRequest {
            session_id: "sr-1".into(),
            scope: Scope::new("t", "p"),
            conversation_id: "c1".into(),
            task_id: "t1".into(),
            sub_agent_id: "router".into(),
            status: None,
        });
        let tool_session = tool_sessions.ensure("sr-1", "t", "p", "c1", "t1");
        let enricher =
            Arc::new(ArtifactEnricher::new(Arc::new(MemoryRepository::new()), Scope::new("t", "p"), None));
        let extractor = ArtifactExtractor::new(
            session.clone(),
            tool_session.clone(),
            vec![component()],
            enricher,
        );
        (extractor, session, tool_session)
    }

    #[test]
    fn test_parse_attrs_quote_styles() {
        let attrs = parse_directive_attrs(
            r#"id="x" tool='tc-1' type="Document" base="items | [0]" summary='{title:title}'"#,
        );
        assert_eq!(attrs.id, "x");
        assert_eq!(attrs.tool_call_id, "tc-1");
        assert_eq!(attrs.artifact_type, "Document");
        assert_eq!(attrs.base.as_deref(), Some("items | [0]"));
        assert_eq!(attrs.summary.as_deref(), Some("{title:title}"));
    }

    #[tokio::test]
    async fn test_create_pipeline_happy_path() {
        let (extractor, session, tool_session) = extractor().await;
        tool_session
            .record_result(
                "tc-1",
                "search",
                json!({"query": "a"}),
                json!({"items": [{"id": 1, "title": "A", "url": "/a", "secret": "s"}]}),
            )
            .await;

        let attrs = parse_directive_attrs(
            r#"id="x" tool="tc-1" type="Document" base="items | [?id==`1`] | [0]" summary="{title:title,url:url,secret:secret}""#,
        );
        let part = extractor.handle_create(attrs).await.unwrap();

        assert_eq!(part["artifactId"], json!("x"));
        // Schema validation drops the undeclared field.
        assert_eq!(part["artifactSummary"], json!({"title": "A", "url": "/a"}));

        let events = session.events_snapshot();
        assert!(events.iter().any(|e| e.kind == EventKind::ArtifactSaved));
        assert!(session.cached_artifact("x:tc-1").is_some());
        assert!(session.cached_artifact("x:t1").is_some());
    }

    #[tokio::test]
    async fn test_unknown_tool_call_dropped() {
        let (extractor, session, _) = extractor().await;
        let attrs = parse_directive_attrs(r#"id="x" tool="missing" type="Document""#);
        assert!(extractor.handle_create(attrs).await.is_none());
        assert!(session.events_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_ref_resolves_same_projection() {
        let (extractor, _session, tool_session) = extractor().await;
        tool_session
            .record_result(
                "tc-1",
                "search",
                json!({}),
                json!({"items": [{"id": 1, "title": "A", "url": "/a"}]}),
            )
            .await;

        let attrs = parse_directive_attrs(
            r#"id="x" tool="tc-1" type="Document" base="items | [0]" summary="{title:title,url:url}""#,
        );
        let created = extractor.handle_create(attrs).await.unwrap();
        let referenced = extractor.handle_ref("x", "tc-1").await.unwrap();

        assert_eq!(created["artifactId"], referenced["artifactId"]);
        assert_eq!(created["artifactSummary"], referenced["artifactSummary"]);
    }

    #[tokio::test]
    async fn test_structured_entry_translation() {
        let (extractor, _session, tool_session) = extractor().await;
        tool_session
            .record_result("tc-2", "search", json!({}), json!({"title": "B", "url": "/b"}))
            .await;

        let entry = json!({
            "name": "ArtifactCreate_Document",
            "props": {
                "id": "y",
                "tool": "tc-2",
                "summary": { "title": "title", "url": "url" },
            }
        });
        assert!(is_artifact_create_entry(&entry));
        let part = extractor.handle_structured(&entry).await.unwrap();
        assert_eq!(part["type"], json!("Document"));
        assert_eq!(part["artifactSummary"], json!({"title": "B", "url": "/b"}));
    }

    #[tokio::test]
    async fn test_null_base_proceeds_with_placeholders() {
        let (extractor, _session, tool_session) = extractor().await;
        tool_session.record_result("tc-3", "search", json!({}), json!({"items": []})).await;

        let attrs = parse_directive_attrs(
            r#"id="z" tool="tc-3" type="Document" base="missing.path" summary="{title:title}""#,
        );
        let part = extractor.handle_create(attrs).await.unwrap();
        assert_eq!(part["artifactSummary"], json!({}));
    }
}
