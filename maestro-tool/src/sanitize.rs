/// Longest name handed to a model after sanitization.
const MAX_TOOL_NAME_LEN: usize = 100;

/// Normalize a runtime tool name to `[A-Za-z0-9_-]{1,100}`: illegal
/// characters become `_`, underscore runs collapse, leading/trailing `_`
/// are trimmed, and empty results default to `unnamed_tool`. Idempotent.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;

    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches('_');
    let mut result: String = trimmed.chars().take(MAX_TOOL_NAME_LEN).collect();
    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        return "unnamed_tool".to_string();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_legal_names_unchanged() {
        assert_eq!(sanitize_tool_name("search"), "search");
        assert_eq!(sanitize_tool_name("get-user_info2"), "get-user_info2");
    }

    #[test]
    fn test_illegal_chars_replaced_and_collapsed() {
        assert_eq!(sanitize_tool_name("my tool!name"), "my_tool_name");
        assert_eq!(sanitize_tool_name("a...b///c"), "a_b_c");
        assert_eq!(sanitize_tool_name("weird🤖emoji"), "weird_emoji");
    }

    #[test]
    fn test_edges_trimmed() {
        assert_eq!(sanitize_tool_name("__tool__"), "tool");
        assert_eq!(sanitize_tool_name("!!tool!!"), "tool");
    }

    #[test]
    fn test_empty_defaults() {
        assert_eq!(sanitize_tool_name(""), "unnamed_tool");
        assert_eq!(sanitize_tool_name("___"), "unnamed_tool");
        assert_eq!(sanitize_tool_name("!!!"), "unnamed_tool");
    }

    #[test]
    fn test_truncation() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_tool_name(&long).len(), 100);
        // Truncation never leaves a trailing underscore behind.
        let tricky = format!("{}_{}", "a".repeat(99), "b".repeat(50));
        let out = sanitize_tool_name(&tricky);
        assert!(!out.ends_with('_'));
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(name in ".{0,160}") {
            let once = sanitize_tool_name(&name);
            prop_assert_eq!(sanitize_tool_name(&once), once.clone());
        }

        #[test]
        fn sanitized_names_match_charset(name in ".{0,160}") {
            let out = sanitize_tool_name(&name);
            prop_assert!(!out.is_empty());
            prop_assert!(out.len() <= 100 || out == "unnamed_tool");
            prop_assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
            prop_assert!(!out.starts_with('_'));
            prop_assert!(!out.ends_with('_'));
        }
    }
}
