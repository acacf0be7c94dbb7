//! JMESPath selector evaluation for artifact projections.
//!
//! Model-authored selectors arrive with small dialect mistakes; sanitation
//! fixes the common ones before compilation.

use maestro_core::{MaestroError, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

static DOUBLE_QUOTED_LITERAL: OnceLock<Regex> = OnceLock::new();

fn double_quoted_literal() -> &'static Regex {
    DOUBLE_QUOTED_LITERAL
        .get_or_init(|| Regex::new(r#"==\s*"([^"]*)""#).expect("Invalid regex pattern"))
}

/// Normalize a model-authored selector:
/// double-quoted `==` literals become raw-string literals, unsupported
/// `~` and current-node `@.` forms are dropped, whitespace is trimmed.
pub fn sanitize_selector(selector: &str) -> String {
    let mut out = double_quoted_literal().replace_all(selector, "=='$1'").to_string();
    out = out.replace('~', "");
    out = out.replace("@.", "");
    out.trim().to_string()
}

/// Apply one selector to a JSON value.
pub fn apply_selector(data: &Value, selector: &str) -> Result<Value> {
    let selector = sanitize_selector(selector);
    if selector.is_empty() {
        return Ok(data.clone());
    }

    let expression = jmespath::compile(&selector)
        .map_err(|e| MaestroError::Artifact(format!("invalid selector '{selector}': {e}")))?;

    let variable = jmespath::Variable::from_json(&serde_json::to_string(data)?)
        .map_err(|e| MaestroError::Artifact(format!("selector input not JSON: {e}")))?;

    let result = expression
        .search(variable)
        .map_err(|e| MaestroError::Artifact(format!("selector '{selector}' failed: {e}")))?;

    serde_json::to_value(&*result).map_err(MaestroError::from)
}

/// Apply `base` to a tool result per the extraction algorithm: an array
/// result collapses to its first element; null becomes an empty object so
/// downstream projections proceed with placeholders.
pub fn apply_base_selector(data: &Value, base: Option<&str>) -> Result<Value> {
    let selected = match base {
        Some(base) if !base.trim().is_empty() => apply_selector(data, base)?,
        _ => data.clone(),
    };

    Ok(match selected {
        Value::Array(items) => items.into_iter().next().unwrap_or(Value::Object(Map::new())),
        Value::Null => Value::Object(Map::new()),
        other => other,
    })
}

/// Parse a `{prop: SELECTOR, …}` attribute. Accepts strict JSON as well
/// as the unquoted shorthand models tend to write.
pub fn parse_selector_map(raw: &str) -> Result<Vec<(String, String)>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        return Ok(map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect());
    }

    let inner = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')).ok_or_else(|| {
        MaestroError::Artifact(format!("selector map is not an object: {raw}"))
    })?;

    let mut entries = Vec::new();
    for field in split_top_level(inner, ',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let Some((key, selector)) = split_key_value(field) else {
            return Err(MaestroError::Artifact(format!("bad selector map entry: {field}")));
        };
        entries.push((unquote(key), unquote(selector)));
    }
    Ok(entries)
}

/// Project a selector map against base-selected data.
pub fn project_props(data: &Value, props: &[(String, String)]) -> Value {
    let mut out = Map::new();
    for (name, selector) in props {
        match apply_selector(data, selector) {
            Ok(Value::Null) => {}
            Ok(value) => {
                out.insert(name.clone(), value);
            }
            Err(e) => {
                tracing::warn!(prop = %name, error = %e, "projection selector failed, skipped");
            }
        }
    }
    Value::Object(out)
}

/// Drop projection fields the component's prop schema does not declare.
pub fn validate_against_schema(projection: Value, schema: &Value) -> Value {
    let Some(allowed) = schema.get("properties").and_then(Value::as_object) else {
        return projection;
    };
    let Value::Object(map) = projection else { return projection };
    Value::Object(map.into_iter().filter(|(k, _)| allowed.contains_key(k)).collect())
}

/// Split on `separator` outside quotes, brackets, and braces.
fn split_top_level(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '{' | '[' | '(' => {
                    depth += 1;
                    current.push(c);
                }
                '}' | ']' | ')' => {
                    depth -= 1;
                    current.push(c);
                }
                c if c == separator && depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Split `key: selector` at the first top-level colon.
fn split_key_value(field: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (index, c) in field.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '{' | '[' | '(' => depth += 1,
                '}' | ']' | ')' => depth -= 1,
                ':' if depth == 0 => {
                    return Some((&field[..index], &field[index + 1..]));
                }
                _ => {}
            },
        }
    }
    None
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_double_quoted_literals() {
        assert_eq!(sanitize_selector(r#"items | [?id=="1"]"#), "items | [?id=='1']");
        assert_eq!(sanitize_selector("a.b~c"), "a.bc");
        assert_eq!(sanitize_selector("@.items"), "items");
    }

    #[test]
    fn test_apply_selector_basic_paths() {
        let data = json!({"items": [{"id": 1, "title": "A", "url": "/a"}]});
        assert_eq!(apply_selector(&data, "items[0].title").unwrap(), json!("A"));
        assert_eq!(apply_selector(&data, "items | [0] | url").unwrap(), json!("/a"));
    }

    #[test]
    fn test_apply_selector_filter_with_backtick_literal() {
        let data = json!({"items": [{"id": 1, "title": "A"}, {"id": 2, "title": "B"}]});
        let result = apply_selector(&data, "items | [?id==`2`] | [0]").unwrap();
        assert_eq!(result["title"], json!("B"));
    }

    #[test]
    fn test_base_selector_array_and_null_handling() {
        let data = json!({"items": [{"id": 1, "title": "A"}]});
        let selected = apply_base_selector(&data, Some("items")).unwrap();
        assert_eq!(selected["title"], json!("A"));

        let empty = apply_base_selector(&data, Some("missing")).unwrap();
        assert_eq!(empty, json!({}));
    }

    #[test]
    fn test_parse_selector_map_shorthand() {
        let entries = parse_selector_map("{title:title,url:url}").unwrap();
        assert_eq!(entries, vec![
            ("title".to_string(), "title".to_string()),
            ("url".to_string(), "url".to_string()),
        ]);
    }

    #[test]
    fn test_parse_selector_map_json_and_nested() {
        let entries = parse_selector_map(r#"{"title": "meta.title", "first": "items[0]"}"#).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("title".to_string(), "meta.title".to_string()));

        let nested = parse_selector_map("{pick: items | [?id==`1`] | [0].name, n: total}").unwrap();
        assert_eq!(nested[0].1, "items | [?id==`1`] | [0].name");
        assert_eq!(nested[1], ("n".to_string(), "total".to_string()));
    }

    #[test]
    fn test_projection_and_validation() {
        let data = json!({"title": "A", "url": "/a", "secret": "x"});
        let props = vec![
            ("title".to_string(), "title".to_string()),
            ("url".to_string(), "url".to_string()),
            ("secret".to_string(), "secret".to_string()),
        ];
        let projection = project_props(&data, &props);

        let schema = json!({
            "type": "object",
            "properties": { "title": {"type": "string"}, "url": {"type": "string"} },
        });
        let validated = validate_against_schema(projection, &schema);
        assert_eq!(validated, json!({"title": "A", "url": "/a"}));
    }

    #[test]
    fn test_same_inputs_same_projection() {
        let data = json!({"items": [{"id": 1, "title": "A", "url": "/a"}]});
        let base = apply_base_selector(&data, Some("items | [?id==`1`] | [0]")).unwrap();
        let props = vec![
            ("title".to_string(), "title".to_string()),
            ("url".to_string(), "url".to_string()),
        ];
        let first = project_props(&base, &props);
        let second = project_props(&base, &props);
        assert_eq!(first, second);
        assert_eq!(first, json!({"title": "A", "url": "/a"}));
    }
}
