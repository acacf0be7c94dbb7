use maestro_core::{MaestroError, Result};
use serde_json::{Value, json};

/// Depth cap for structure-hint traversal.
const MAX_HINT_DEPTH: usize = 5;
/// Per-category cap on collected hint paths.
const MAX_HINT_PATHS: usize = 20;

/// Post-process one remote tool result: surface error envelopes, parse
/// embedded JSON strings, and (when artifact components are configured)
/// attach `_structureHints` describing the result's shape.
pub fn postprocess_remote_result(
    tool_name: &str,
    mut result: Value,
    with_structure_hints: bool,
) -> Result<Value> {
    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = result
            .get("content")
            .and_then(extract_error_text)
            .unwrap_or_else(|| "remote tool returned an error".to_string());
        return Err(MaestroError::Tool(format!("{tool_name}: {message}")));
    }

    parse_embedded_json(&mut result);

    if with_structure_hints {
        if let Value::Object(ref mut map) = result {
            let hints = structure_hints(&Value::Object(map.clone()));
            map.insert("_structureHints".to_string(), hints);
        }
    }

    Ok(result)
}

fn extract_error_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str).map(String::from)),
        _ => None,
    }
}

/// Recursively replace string values that parse as JSON objects/arrays
/// with their parsed form.
pub fn parse_embedded_json(value: &mut Value) {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(mut parsed) = serde_json::from_str::<Value>(trimmed) {
                    if parsed.is_object() || parsed.is_array() {
                        parse_embedded_json(&mut parsed);
                        *value = parsed;
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                parse_embedded_json(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                parse_embedded_json(v);
            }
        }
        _ => {}
    }
}

#[derive(Default)]
struct HintCollector {
    terminal_paths: Vec<String>,
    array_paths: Vec<String>,
    object_paths: Vec<String>,
}

/// Summarize the shape of a tool result so the model can write artifact
/// selectors against it. Bounded by depth and path-count caps.
pub fn structure_hints(result: &Value) -> Value {
    let mut collector = HintCollector::default();
    collect_hints(result, "", 0, &mut collector);

    let example_selectors = example_selectors(&collector);
    json!({
        "terminalPaths": collector.terminal_paths,
        "arrayPaths": collector.array_paths,
        "objectPaths": collector.object_paths,
        "exampleSelectors": example_selectors,
    })
}

fn collect_hints(value: &Value, path: &str, depth: usize, out: &mut HintCollector) {
    if depth > MAX_HINT_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            if !path.is_empty() && out.object_paths.len() < MAX_HINT_PATHS {
                out.object_paths.push(path.to_string());
            }
            for (key, child) in map {
                let child_path =
                    if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                collect_hints(child, &child_path, depth + 1, out);
            }
        }
        Value::Array(items) => {
            if !path.is_empty() && out.array_paths.len() < MAX_HINT_PATHS {
                out.array_paths.push(path.to_string());
            }
            if let Some(first) = items.first() {
                collect_hints(first, &format!("{path}[0]"), depth + 1, out);
            }
        }
        _ => {
            if !path.is_empty() && out.terminal_paths.len() < MAX_HINT_PATHS {
                out.terminal_paths.push(path.to_string());
            }
        }
    }
}

fn example_selectors(collector: &HintCollector) -> Vec<String> {
    let mut examples = Vec::new();
    if let Some(array_path) = collector.array_paths.first() {
        examples.push(format!("{array_path} | [0]"));
        examples.push(format!("{array_path}[0]"));
    }
    if let Some(terminal) = collector.terminal_paths.first() {
        examples.push(terminal.clone());
    }
    examples.truncate(3);
    examples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_raises() {
        let result = json!({
            "isError": true,
            "content": [{ "type": "text", "text": "upstream exploded" }],
        });
        let err = postprocess_remote_result("search", result, false).unwrap_err();
        assert!(matches!(err, MaestroError::Tool(_)));
        assert!(err.to_string().contains("upstream exploded"));
    }

    #[test]
    fn test_embedded_json_parsed_recursively() {
        let mut value = json!({
            "payload": "{\"inner\": \"[1, 2, 3]\"}",
            "plain": "not json",
        });
        parse_embedded_json(&mut value);
        assert_eq!(value["payload"]["inner"], json!([1, 2, 3]));
        assert_eq!(value["plain"], json!("not json"));
    }

    #[test]
    fn test_structure_hints_attached_when_requested() {
        let result = json!({ "items": [{ "title": "A", "url": "/a" }] });
        let processed = postprocess_remote_result("search", result, true).unwrap();

        let hints = &processed["_structureHints"];
        let arrays: Vec<&str> =
            hints["arrayPaths"].as_array().unwrap().iter().filter_map(Value::as_str).collect();
        assert!(arrays.contains(&"items"));
        let terminals: Vec<&str> =
            hints["terminalPaths"].as_array().unwrap().iter().filter_map(Value::as_str).collect();
        assert!(terminals.contains(&"items[0].title"));
        assert!(!hints["exampleSelectors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_hints_depth_capped() {
        // Build nesting deeper than the cap; the innermost leaf never shows.
        let mut value = json!("leaf");
        for i in 0..10 {
            let mut map = serde_json::Map::new();
            map.insert(format!("level{i}"), value);
            value = Value::Object(map);
        }
        let hints = structure_hints(&value);
        let terminals = hints["terminalPaths"].as_array().unwrap();
        assert!(terminals.iter().all(|p| p.as_str().unwrap().matches('.').count() <= MAX_HINT_DEPTH));
    }

    #[test]
    fn test_no_hints_without_components() {
        let result = json!({ "items": [] });
        let processed = postprocess_remote_result("search", result, false).unwrap();
        assert!(processed.get("_structureHints").is_none());
    }
}
