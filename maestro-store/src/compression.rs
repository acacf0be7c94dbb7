use maestro_core::{MessageContent, MessageRecord, MessageRole, MessageType, MessageVisibility};
use chrono::Utc;
use std::collections::HashMap;

/// Limits for per-conversation history compression, read from the
/// environment once per config construction.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub hard_limit: usize,
    pub safety_buffer: usize,
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { hard_limit: 120_000, safety_buffer: 20_000, enabled: true }
    }
}

impl CompressionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hard_limit: read_env_usize("AGENTS_COMPRESSION_HARD_LIMIT", defaults.hard_limit),
            safety_buffer: read_env_usize("AGENTS_COMPRESSION_SAFETY_BUFFER", defaults.safety_buffer),
            enabled: std::env::var("AGENTS_COMPRESSION_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.enabled),
        }
    }

    /// Compression trips once accumulated text passes this threshold.
    pub fn threshold(&self) -> usize {
        self.hard_limit.saturating_sub(self.safety_buffer)
    }
}

fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn total_chars(messages: &[MessageRecord]) -> usize {
    messages.iter().map(|m| m.content.text.len()).sum()
}

/// Elide aging messages behind a synthetic summary marker so the retained
/// tail fits under the threshold. Returns `None` when nothing changed.
pub fn compress_messages(
    config: &CompressionConfig,
    messages: &[MessageRecord],
) -> Option<Vec<MessageRecord>> {
    if !config.enabled || messages.is_empty() {
        return None;
    }
    if total_chars(messages) <= config.threshold() {
        return None;
    }

    // Keep the newest messages up to half the threshold; everything older
    // collapses into one marker.
    let keep_budget = config.threshold() / 2;
    let mut kept = 0usize;
    let mut cut = messages.len();
    for (index, message) in messages.iter().enumerate().rev() {
        kept += message.content.text.len();
        if kept > keep_budget {
            cut = index + 1;
            break;
        }
        cut = index;
    }

    if cut == 0 {
        return None;
    }

    let elided = &messages[..cut];
    let marker = MessageRecord {
        id: format!("compaction-{}", uuid::Uuid::new_v4()),
        conversation_id: messages[0].conversation_id.clone(),
        role: MessageRole::System,
        message_type: MessageType::System,
        visibility: MessageVisibility::Internal,
        content: MessageContent::text(format!(
            "[{} earlier messages elided; {} characters summarized]",
            elided.len(),
            total_chars(elided)
        )),
        from_sub_agent_id: None,
        to_sub_agent_id: None,
        from_external_agent_id: None,
        to_external_agent_id: None,
        task_id: None,
        a2a_task_id: None,
        metadata: HashMap::new(),
        created_at: Utc::now(),
    };

    let mut compressed = Vec::with_capacity(messages.len() - cut + 1);
    compressed.push(marker);
    compressed.extend_from_slice(&messages[cut..]);
    tracing::info!(
        elided = elided.len(),
        retained = compressed.len() - 1,
        "compressed conversation history"
    );
    Some(compressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> MessageRecord {
        MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "c1".into(),
            role: MessageRole::User,
            message_type: MessageType::Chat,
            visibility: MessageVisibility::UserFacing,
            content: MessageContent::text(text),
            from_sub_agent_id: None,
            to_sub_agent_id: None,
            from_external_agent_id: None,
            to_external_agent_id: None,
            task_id: None,
            a2a_task_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_below_threshold_untouched() {
        let config = CompressionConfig { hard_limit: 1000, safety_buffer: 100, enabled: true };
        let messages = vec![message("short"), message("also short")];
        assert!(compress_messages(&config, &messages).is_none());
    }

    #[test]
    fn test_disabled_never_compresses() {
        let config = CompressionConfig { hard_limit: 10, safety_buffer: 0, enabled: false };
        let messages = vec![message(&"x".repeat(100))];
        assert!(compress_messages(&config, &messages).is_none());
    }

    #[test]
    fn test_compression_keeps_tail_and_inserts_marker() {
        let config = CompressionConfig { hard_limit: 200, safety_buffer: 0, enabled: true };
        let messages: Vec<_> = (0..10).map(|i| message(&format!("{i}-{}", "x".repeat(40)))).collect();

        let compressed = compress_messages(&config, &messages).unwrap();
        assert!(compressed.len() < messages.len());
        assert_eq!(compressed[0].message_type, MessageType::System);
        assert!(compressed[0].content.text.contains("elided"));
        // The newest message always survives.
        assert_eq!(compressed.last().unwrap().id, messages.last().unwrap().id);
    }
}
