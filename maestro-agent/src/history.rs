use maestro_core::{
    ArtifactRecord, HistoryConfig, HistoryMode, HistoryQuery, MessageRecord, MessageRole,
    MessageType, Repository, Result, Scope,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Who the history is being assembled for.
#[derive(Debug, Clone)]
pub struct HistoryScope {
    pub sub_agent_id: String,
    pub task_id: String,
}

/// Load conversation history per the sub-agent's history config.
pub async fn load_history(
    repository: &Arc<dyn Repository>,
    scope: &Scope,
    conversation_id: &str,
    config: &HistoryConfig,
    history_scope: &HistoryScope,
) -> Result<Vec<MessageRecord>> {
    if config.mode == HistoryMode::None {
        return Ok(Vec::new());
    }

    let query = HistoryQuery {
        limit: config.limit,
        include_internal: config.include_internal,
        message_types: config.message_types.clone(),
        max_output_tokens: config.max_output_tokens,
    };
    let messages = repository.get_conversation_history(scope, conversation_id, &query).await?;

    Ok(match config.mode {
        HistoryMode::Full | HistoryMode::None => messages,
        HistoryMode::Scoped => {
            messages.into_iter().filter(|m| in_scope(m, history_scope)).collect()
        }
    })
}

/// Scoped mode keeps messages where the sub-agent is sender or recipient,
/// or the user speaks. Tool results additionally stay task-local so
/// delegated work never leaks into the parent's view.
fn in_scope(message: &MessageRecord, history_scope: &HistoryScope) -> bool {
    if message.message_type == MessageType::ToolResult
        && message.task_id.as_deref() != Some(history_scope.task_id.as_str())
    {
        return false;
    }
    if message.role == MessageRole::User {
        return true;
    }
    message.from_sub_agent_id.as_deref() == Some(history_scope.sub_agent_id.as_str())
        || message.to_sub_agent_id.as_deref() == Some(history_scope.sub_agent_id.as_str())
}

fn role_label(message: &MessageRecord) -> String {
    match message.message_type {
        MessageType::Chat => match message.role {
            MessageRole::User => "User".to_string(),
            _ => "agent to User".to_string(),
        },
        MessageType::A2aRequest | MessageType::A2aResponse => {
            let from = message
                .from_sub_agent_id
                .as_deref()
                .or(message.from_external_agent_id.as_deref())
                .unwrap_or("agent");
            let to = message
                .to_sub_agent_id
                .as_deref()
                .or(message.to_external_agent_id.as_deref())
                .unwrap_or("agent");
            format!("{from} to {to}")
        }
        MessageType::ToolResult => {
            format!("agent tool: {}", message.tool_name().unwrap_or("unknown"))
        }
        MessageType::System => "system".to_string(),
    }
}

/// Render history as the `<conversation_history>` block appended to the
/// model input.
pub fn format_history(messages: &[MessageRecord]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = messages
        .iter()
        .map(|m| format!("{}: \"\"\"{}\"\"\"", role_label(m), m.content.text))
        .collect();
    format!("<conversation_history>\n{}\n</conversation_history>", lines.join("\n"))
}

/// Artifacts referenced by the scoped message set: distinct task ids,
/// ledger rows concatenated.
pub async fn scoped_artifacts(
    repository: &Arc<dyn Repository>,
    scope: &Scope,
    messages: &[MessageRecord],
    current_task_id: &str,
) -> Result<Vec<ArtifactRecord>> {
    let mut task_ids: BTreeSet<String> =
        messages.iter().filter_map(|m| m.task_id.clone()).collect();
    task_ids.insert(current_task_id.to_string());

    let mut artifacts = Vec::new();
    for task_id in task_ids {
        artifacts.extend(repository.get_ledger_artifacts(scope, &task_id).await?);
    }
    Ok(artifacts)
}

/// Compact artifact list shown to the model (ids and summaries only,
/// never full payloads).
pub fn format_artifact_list(artifacts: &[ArtifactRecord]) -> String {
    if artifacts.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = artifacts
        .iter()
        .map(|a| {
            format!(
                "- {} (artifact_id={}, tool_call_id={}, type={}): {}",
                a.name,
                a.artifact_id,
                a.tool_call_id().unwrap_or("-"),
                a.artifact_type,
                a.description,
            )
        })
        .collect();
    format!("Artifacts available for reference:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_core::{MessageContent, MessageVisibility};
    use std::collections::HashMap;

    fn message(
        role: MessageRole,
        message_type: MessageType,
        text: &str,
        from: Option<&str>,
        to: Option<&str>,
        task: Option<&str>,
    ) -> MessageRecord {
        MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "c1".into(),
            role,
            message_type,
            visibility: MessageVisibility::UserFacing,
            content: MessageContent::text(text),
            from_sub_agent_id: from.map(String::from),
            to_sub_agent_id: to.map(String::from),
            from_external_agent_id: None,
            to_external_agent_id: None,
            task_id: task.map(String::from),
            a2a_task_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_role_labels() {
        let user = message(MessageRole::User, MessageType::Chat, "hi", None, None, None);
        assert_eq!(role_label(&user), "User");

        let agent = message(MessageRole::Agent, MessageType::Chat, "hello", None, None, None);
        assert_eq!(role_label(&agent), "agent to User");

        let request = message(
            MessageRole::Agent,
            MessageType::A2aRequest,
            "do it",
            Some("router"),
            Some("billing"),
            None,
        );
        assert_eq!(role_label(&request), "router to billing");

        let mut tool = message(MessageRole::Agent, MessageType::ToolResult, "{}", None, None, None);
        tool.metadata.insert("tool_name".into(), serde_json::json!("search"));
        assert_eq!(role_label(&tool), "agent tool: search");
    }

    #[test]
    fn test_format_history_block() {
        let messages = vec![
            message(MessageRole::User, MessageType::Chat, "Hi", None, None, None),
            message(MessageRole::Agent, MessageType::Chat, "Hello", None, None, None),
        ];
        let block = format_history(&messages);
        assert!(block.starts_with("<conversation_history>\n"));
        assert!(block.ends_with("\n</conversation_history>"));
        assert!(block.contains("User: \"\"\"Hi\"\"\""));
        assert!(block.contains("agent to User: \"\"\"Hello\"\"\""));
    }

    #[test]
    fn test_scoped_filter() {
        let scope = HistoryScope { sub_agent_id: "router".into(), task_id: "t1".into() };

        let user = message(MessageRole::User, MessageType::Chat, "hi", None, None, None);
        assert!(in_scope(&user, &scope));

        let mine = message(
            MessageRole::Agent,
            MessageType::Chat,
            "x",
            Some("router"),
            None,
            Some("t1"),
        );
        assert!(in_scope(&mine, &scope));

        let other_agent =
            message(MessageRole::Agent, MessageType::Chat, "x", Some("billing"), Some("other"), None);
        assert!(!in_scope(&other_agent, &scope));

        // Tool result from a different task stays hidden even if addressed
        // to this sub-agent.
        let foreign_tool = message(
            MessageRole::Agent,
            MessageType::ToolResult,
            "{}",
            Some("router"),
            None,
            Some("t-other"),
        );
        assert!(!in_scope(&foreign_tool, &scope));

        let local_tool = message(
            MessageRole::Agent,
            MessageType::ToolResult,
            "{}",
            Some("router"),
            None,
            Some("t1"),
        );
        assert!(in_scope(&local_tool, &scope));
    }
}
