use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::ChatMessage;

/// Durable per-conversation state: message history plus the opaque engine
/// session id used to resume server-side context on the next turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// One JSON file per conversation id under `<dir>/`.
///
/// Loads never fail: a missing file yields an empty state, and malformed
/// files or individual history records are dropped with a warning.
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, conversation_id: &str) -> PathBuf {
        let safe: String = conversation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    pub async fn load(&self, conversation_id: &str) -> ConversationState {
        let path = self.record_path(conversation_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ConversationState::default();
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "Failed to read conversation record");
                return ConversationState::default();
            }
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(conversation_id, error = %e, "Malformed conversation record, starting fresh");
                return ConversationState::default();
            }
        };

        let continuation = value
            .get("continuation")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut history = Vec::new();
        if let Some(entries) = value.get("history").and_then(|v| v.as_array()) {
            for entry in entries {
                match serde_json::from_value::<ChatMessage>(entry.clone()) {
                    Ok(message) => history.push(message),
                    Err(e) => {
                        warn!(conversation_id, error = %e, "Dropping malformed history entry");
                    }
                }
            }
        }

        ConversationState {
            continuation,
            history,
        }
    }

    pub async fn save(
        &self,
        conversation_id: &str,
        state: &ConversationState,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_string_pretty(state)?;
        super::write_atomic(&self.record_path(conversation_id), &raw).await?;
        debug!(
            conversation_id,
            messages = state.history.len(),
            has_continuation = state.continuation.is_some(),
            "Saved conversation"
        );
        Ok(())
    }

    /// Delete the record. Returns whether anything existed.
    pub async fn clear(&self, conversation_id: &str) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(self.record_path(conversation_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Role};

    #[tokio::test]
    async fn round_trip_preserves_history_order_and_continuation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(tmp.path());

        let mut state = ConversationState::default();
        state.continuation = Some("sess-123".to_string());
        state.history.push(ChatMessage::user("first"));
        state.history.push(ChatMessage::assistant("second"));
        state.history.push(ChatMessage::user("third"));
        store.save("42", &state).await.unwrap();

        let loaded = store.load("42").await;
        assert_eq!(loaded.continuation.as_deref(), Some("sess-123"));
        let contents: Vec<&str> = loaded.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(loaded.history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn missing_record_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(tmp.path());
        let state = store.load("nope").await;
        assert!(state.continuation.is_none());
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn malformed_history_entries_are_dropped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(tmp.path());
        tokio::fs::write(
            tmp.path().join("7.json"),
            r#"{
                "continuation": "sess-7",
                "history": [
                    {"role": "user", "content": "ok", "timestamp": "2026-01-01T00:00:00Z"},
                    {"bogus": true},
                    {"role": "assistant", "content": "also ok", "timestamp": "2026-01-01T00:00:01Z"}
                ]
            }"#,
        )
        .await
        .unwrap();

        let state = store.load("7").await;
        assert_eq!(state.continuation.as_deref(), Some("sess-7"));
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].content, "ok");
        assert_eq!(state.history[1].content, "also ok");
    }

    #[tokio::test]
    async fn garbage_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(tmp.path());
        tokio::fs::write(tmp.path().join("9.json"), "not json at all")
            .await
            .unwrap();
        let state = store.load("9").await;
        assert!(state.history.is_empty());
        assert!(state.continuation.is_none());
    }

    #[tokio::test]
    async fn clear_removes_the_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(tmp.path());
        store.save("5", &ConversationState::default()).await.unwrap();
        assert!(store.clear("5").await.unwrap());
        assert!(!store.clear("5").await.unwrap());
        assert!(store.load("5").await.history.is_empty());
    }
}
