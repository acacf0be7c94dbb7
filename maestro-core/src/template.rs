use crate::{MaestroError, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Matches `{variable}` and `{{variable.path}}` placeholders.
static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER_REGEX.get_or_init(|| Regex::new(r"\{+[^{}]*\}+").expect("Invalid regex pattern"))
}

/// How unresolved placeholders are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateMode {
    /// Unresolved placeholders render as empty strings.
    #[default]
    Lenient,
    /// Unresolved placeholders are an error.
    Strict,
}

fn is_identifier_segment(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn is_variable_path(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_identifier_segment)
}

/// Dotted-path lookup into a resolved context map.
fn lookup<'a>(context: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render `{var}` / `{{var.path}}` placeholders from the resolved context.
///
/// A trailing `?` marks a placeholder optional even in strict mode.
/// Placeholders that are not valid variable paths (e.g. inline JSON braces)
/// are passed through untouched.
pub fn render_template(
    template: &str,
    context: &HashMap<String, Value>,
    mode: TemplateMode,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for m in placeholder_regex().find_iter(template) {
        out.push_str(&template[last..m.start()]);
        last = m.end();

        let inner = m.as_str().trim_matches(|c| c == '{' || c == '}').trim();
        let (path, optional) = match inner.strip_suffix('?') {
            Some(stripped) => (stripped.trim(), true),
            None => (inner, false),
        };

        if !is_variable_path(path) {
            // Not a placeholder (literal braces, JSON snippets); keep as-is.
            out.push_str(m.as_str());
            continue;
        }

        match lookup(context, path) {
            Some(value) => out.push_str(&value_to_text(value)),
            None => {
                if mode == TemplateMode::Strict && !optional {
                    return Err(MaestroError::Config(format!(
                        "Unresolved template variable: {path}"
                    )));
                }
                tracing::debug!(variable = path, "template variable unresolved, dropped");
            }
        }
    }

    out.push_str(&template[last..]);
    Ok(out)
}
