//! Per-session conversation history
//!
//! The agent loop only sees the [`ConversationStore`] trait, so a durable
//! backend can replace [`InMemoryConversationStore`] without touching it.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::message::Turn;

/// Opaque session identifier
pub type SessionKey = String;

/// A conversation and its turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    /// Ordered, append-only turn history
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Arbitrary caller-supplied metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    pub fn new(key: impl Into<SessionKey>, metadata: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    /// Append a turn; `updated_at` never moves backwards
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now().max(self.updated_at);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Storage for sessions keyed by [`SessionKey`]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a session, or return the existing one unchanged
    async fn create(
        &self,
        key: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<Session, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Session>, StoreError>;

    /// Append a turn; fails with `SessionNotFound` for unknown keys
    async fn append_turn(&self, key: &str, turn: Turn) -> Result<(), StoreError>;

    /// Remove a session; no error if it does not exist
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Snapshot of every session
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// Number of stored sessions
    async fn session_count(&self) -> Result<usize, StoreError> {
        Ok(self.list_sessions().await?.len())
    }
}

/// Process-local session store
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(
        &self,
        key: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key.to_string()).or_insert_with(|| {
            debug!(session = %key, "Created session");
            Session::new(key, metadata)
        });
        Ok(session.clone())
    }

    async fn get(&self, key: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn append_turn(&self, key: &str, turn: Turn) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| StoreError::SessionNotFound(key.to_string()))?;
        session.push(turn);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        if self.sessions.write().await.remove(key).is_some() {
            debug!(session = %key, "Cleared session");
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn session_count(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentBlock, Role};

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryConversationStore::new();
        let first = store.create("s1", meta(&[("user", "alice")])).await.unwrap();
        store.append_turn("s1", Turn::user("hello")).await.unwrap();

        let second = store.create("s1", meta(&[("user", "bob")])).await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.metadata.get("user").map(String::as_str), Some("alice"));
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_append_updates_turns_and_timestamp() {
        let store = InMemoryConversationStore::new();
        let created = store.create("s1", BTreeMap::new()).await.unwrap();

        let turn = Turn::assistant(vec![ContentBlock::text("hi")]);
        store.append_turn("s1", turn.clone()).await.unwrap();

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.turns.last(), Some(&turn));
        assert_eq!(session.turns[0].role, Role::Assistant);
        assert!(session.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn test_append_to_unknown_session_fails() {
        let store = InMemoryConversationStore::new();
        let err = store.append_turn("missing", Turn::user("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(ref key) if key == "missing"));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = InMemoryConversationStore::new();
        store.create("s1", BTreeMap::new()).await.unwrap();

        store.clear("s1").await.unwrap();
        store.clear("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        assert_eq!(store.session_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_sessions_is_a_snapshot() {
        let store = InMemoryConversationStore::new();
        store.create("a", BTreeMap::new()).await.unwrap();
        store.create("b", BTreeMap::new()).await.unwrap();

        let listed = store.list_sessions().await.unwrap();
        store.append_turn("a", Turn::user("later")).await.unwrap();

        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.is_empty()));
    }
}
