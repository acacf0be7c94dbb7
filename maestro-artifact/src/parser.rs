use crate::extractor::{ArtifactExtractor, is_artifact_create_entry, parse_directive_attrs};
use maestro_core::Result;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

static DIRECTIVE_REGEX: OnceLock<Regex> = OnceLock::new();

fn directive_regex() -> &'static Regex {
    DIRECTIVE_REGEX.get_or_init(|| {
        Regex::new(r"<artifact:(create|ref)\s+([^>]*?)/?>").expect("Invalid regex pattern")
    })
}

const DIRECTIVE_PREFIX: &str = "<artifact:";

/// One emitted stream part, in strict source order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    Text { text: String },
    Data { data: Value },
}

impl StreamPart {
    pub fn text(text: impl Into<String>) -> Self {
        StreamPart::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StreamPart::Text { text } => Some(text),
            StreamPart::Data { .. } => None,
        }
    }
}

/// Last index of `buffer` that can be emitted without risking a partial
/// artifact directive on the wire. A trailing `<…` that could still grow
/// into `<artifact:` is withheld.
pub fn find_safe_text_boundary(buffer: &str) -> usize {
    if let Some(pos) = buffer.rfind('<') {
        let tail = &buffer[pos..];
        let potential = if tail.len() < DIRECTIVE_PREFIX.len() {
            DIRECTIVE_PREFIX.starts_with(tail)
        } else {
            tail.starts_with(DIRECTIVE_PREFIX) && !tail.contains('>')
        };
        if potential {
            return pos;
        }
    }
    buffer.len()
}

/// Incremental text parser: emits ordered text and data parts, holding
/// back incomplete directives until they complete or turn out not to be
/// directives. Invalid directives are dropped and logged, never surfaced.
pub struct StreamParser {
    extractor: Arc<ArtifactExtractor>,
    buffer: String,
}

impl StreamParser {
    pub fn new(extractor: Arc<ArtifactExtractor>) -> Self {
        Self { extractor, buffer: String::new() }
    }

    pub async fn push_text(&mut self, delta: &str) -> Result<Vec<StreamPart>> {
        self.buffer.push_str(delta);
        let mut parts = self.drain_complete_directives().await?;

        let boundary = find_safe_text_boundary(&self.buffer);
        if boundary > 0 {
            let safe: String = self.buffer.drain(..boundary).collect();
            if !safe.is_empty() {
                parts.push(StreamPart::text(safe));
            }
        }
        Ok(parts)
    }

    /// Flush at end of stream. An unterminated directive tail is invalid
    /// and removed.
    pub async fn finish(&mut self) -> Result<Vec<StreamPart>> {
        let mut parts = self.drain_complete_directives().await?;
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            if rest.trim_start().starts_with(DIRECTIVE_PREFIX) {
                tracing::warn!("unterminated artifact directive at end of stream, dropped");
            } else {
                parts.push(StreamPart::text(rest));
            }
        }
        Ok(parts)
    }

    async fn drain_complete_directives(&mut self) -> Result<Vec<StreamPart>> {
        let mut parts = Vec::new();

        loop {
            let (start, end, kind, raw_attrs) = {
                let Some(found) = directive_regex().captures(&self.buffer) else { break };
                let whole = found.get(0).expect("capture 0 always present");
                (
                    whole.start(),
                    whole.end(),
                    found.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
                    found.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                )
            };

            if start > 0 {
                parts.push(StreamPart::text(&self.buffer[..start]));
            }
            self.buffer.drain(..end);

            let data = match kind.as_str() {
                "create" => {
                    let attrs = parse_directive_attrs(&raw_attrs);
                    self.extractor.handle_create(attrs).await
                }
                "ref" => {
                    let attrs = parse_directive_attrs(&raw_attrs);
                    self.extractor.handle_ref(&attrs.id, &attrs.tool_call_id).await
                }
                _ => None,
            };
            if let Some(data) = data {
                parts.push(StreamPart::Data { data });
            }
        }

        Ok(parts)
    }
}

/// Buffers Phase-2 partial-object JSON and emits complete top-level
/// `dataComponents` entries as they stabilize. `ArtifactCreate_*` entries
/// route through the extractor; everything else becomes a data part.
pub struct PartialObjectAdapter {
    extractor: Arc<ArtifactExtractor>,
    buffer: String,
    emitted: usize,
}

impl PartialObjectAdapter {
    pub fn new(extractor: Arc<ArtifactExtractor>) -> Self {
        Self { extractor, buffer: String::new(), emitted: 0 }
    }

    /// Absorb one JSON text delta; returns parts for entries that are now
    /// stable (every entry except the still-growing last one).
    pub async fn push(&mut self, delta: &str) -> Result<Vec<StreamPart>> {
        self.buffer.push_str(delta);

        let Some(entries) = parse_partial_components(&self.buffer) else {
            return Ok(Vec::new());
        };
        let stable = entries.len().saturating_sub(1);
        self.emit_range(&entries, stable).await
    }

    /// Flush every remaining entry at end of stream.
    pub async fn finish(&mut self) -> Result<Vec<StreamPart>> {
        let buffer = std::mem::take(&mut self.buffer);
        let entries = serde_json::from_str::<Value>(&buffer)
            .ok()
            .and_then(|v| v.get("dataComponents").and_then(Value::as_array).cloned())
            .or_else(|| parse_partial_components(&buffer))
            .unwrap_or_default();
        self.emit_range(&entries, entries.len()).await
    }

    async fn emit_range(&mut self, entries: &[Value], until: usize) -> Result<Vec<StreamPart>> {
        let mut parts = Vec::new();
        while self.emitted < until {
            let entry = &entries[self.emitted];
            self.emitted += 1;
            if is_artifact_create_entry(entry) {
                if let Some(data) = self.extractor.handle_structured(entry).await {
                    parts.push(StreamPart::Data { data });
                }
            } else {
                parts.push(StreamPart::Data { data: entry.clone() });
            }
        }
        Ok(parts)
    }
}

/// Best-effort parse of a JSON prefix: close any open strings/brackets
/// and read out `dataComponents`. Returns `None` while the prefix is
/// still unparseable.
fn parse_partial_components(buffer: &str) -> Option<Vec<Value>> {
    let completed = complete_json_prefix(buffer)?;
    let value: Value = serde_json::from_str(&completed).ok()?;
    value.get("dataComponents").and_then(Value::as_array).cloned()
}

fn complete_json_prefix(buffer: &str) -> Option<String> {
    let trimmed = buffer.trim_start();
    if trimmed.is_empty() {
        return None;
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut completed = trimmed.to_string();
    if in_string {
        completed.push('"');
    }
    // Trim a dangling separator before closing.
    while completed.ends_with(',') || completed.ends_with(':') {
        completed.pop();
    }
    for close in stack.into_iter().rev() {
        completed.push(close);
    }
    Some(completed)
}
