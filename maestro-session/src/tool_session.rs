use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// One recorded tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub args: Value,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

/// Per-turn scratchpad shared by every sub-agent participating in the turn
/// (including delegated ones). Concurrent tool executions write through a
/// per-session mutex.
pub struct ToolSessionData {
    pub session_id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub context_id: String,
    pub task_id: String,
    results: Mutex<HashMap<String, ToolCallRecord>>,
}

impl ToolSessionData {
    pub async fn record_result(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        args: Value,
        result: Value,
    ) {
        let record = ToolCallRecord {
            tool_name: tool_name.to_string(),
            args,
            result,
            timestamp: Utc::now(),
        };
        self.results.lock().await.insert(tool_call_id.to_string(), record);
    }

    pub async fn get_result(&self, tool_call_id: &str) -> Option<ToolCallRecord> {
        self.results.lock().await.get(tool_call_id).cloned()
    }

    pub async fn all_results(&self) -> Vec<(String, ToolCallRecord)> {
        self.results.lock().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.lock().await.is_empty()
    }
}

/// Process-wide registry of tool sessions keyed by stream-request id.
/// Sessions never span user turns.
pub struct ToolSessionManager {
    sessions: RwLock<HashMap<String, Arc<ToolSessionData>>>,
}

impl ToolSessionManager {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    /// Create the session if absent; returns the live handle either way.
    pub fn ensure(
        &self,
        session_id: &str,
        tenant_id: &str,
        project_id: &str,
        context_id: &str,
        task_id: &str,
    ) -> Arc<ToolSessionData> {
        let mut sessions = self.sessions.write().unwrap();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(ToolSessionData {
                    session_id: session_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    project_id: project_id.to_string(),
                    context_id: context_id.to_string(),
                    task_id: task_id.to_string(),
                    results: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ToolSessionData>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Drop the session and every recorded result for it.
    pub fn end(&self, session_id: &str) {
        if self.sessions.write().unwrap().remove(session_id).is_some() {
            tracing::debug!(session_id, "tool session ended");
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().unwrap().contains_key(session_id)
    }
}

impl Default for ToolSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let manager = ToolSessionManager::new();
        let a = manager.ensure("s1", "t", "p", "c1", "task1");
        let b = manager.ensure("s1", "t", "p", "c1", "task1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_record_and_get_result() {
        let manager = ToolSessionManager::new();
        let session = manager.ensure("s1", "t", "p", "c1", "task1");

        session
            .record_result("tc-1", "search", json!({"query": "k"}), json!({"items": []}))
            .await;

        let record = session.get_result("tc-1").await.unwrap();
        assert_eq!(record.tool_name, "search");
        assert_eq!(record.args, json!({"query": "k"}));
        assert!(session.get_result("tc-2").await.is_none());
    }

    #[tokio::test]
    async fn test_end_removes_all_keys() {
        let manager = ToolSessionManager::new();
        let session = manager.ensure("s1", "t", "p", "c1", "task1");
        session.record_result("tc-1", "search", json!({}), json!({})).await;

        manager.end("s1");
        assert!(!manager.contains("s1"));
        assert!(manager.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writes_serialized() {
        let manager = Arc::new(ToolSessionManager::new());
        let session = manager.ensure("s1", "t", "p", "c1", "task1");

        let mut handles = Vec::new();
        for i in 0..16 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                session
                    .record_result(&format!("tc-{i}"), "tool", json!({}), json!(i))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(session.len().await, 16);
    }
}
