//! Active connection registry.
//!
//! Process-wide index of currently open sessions, keyed by transport
//! connection id. Written only by the session lifecycle manager that owns
//! the connection (insert on open, remove on finalize); read by the REST
//! layer for "who is online" queries. Never persisted — a restart loses the
//! live index but not the audit history.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// One live connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub session_id: String,
    pub user_id: String,
    pub host: String,
    pub connected_at: DateTime<Utc>,
}

/// Cloneable — all clones share the same inner map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection when its session opens.
    pub async fn insert(&self, connection_id: &str, entry: ConnectionEntry) {
        self.inner
            .write()
            .await
            .insert(connection_id.to_string(), entry);
    }

    /// Remove a connection on finalize. The entry is only removed when it
    /// still belongs to the finalizing session, so a stale finalize cannot
    /// evict a successor session on the same connection. Returns the entry
    /// if it was removed.
    pub async fn remove(&self, connection_id: &str, session_id: &str) -> Option<ConnectionEntry> {
        let mut inner = self.inner.write().await;
        if inner
            .get(connection_id)
            .is_some_and(|entry| entry.session_id == session_id)
        {
            inner.remove(connection_id)
        } else {
            None
        }
    }

    /// Snapshot of all live connections, for operational introspection.
    pub async fn snapshot(&self) -> Vec<(String, ConnectionEntry)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session: &str) -> ConnectionEntry {
        ConnectionEntry {
            session_id: session.to_string(),
            user_id: "u1".to_string(),
            host: "10.0.0.1".to_string(),
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_then_remove_round_trips() {
        let registry = ConnectionRegistry::new();
        registry.insert("conn-1", entry("s1")).await;
        assert_eq!(registry.len().await, 1);

        let removed = registry.remove("conn-1", "s1").await.expect("entry present");
        assert_eq!(removed.session_id, "s1");
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.insert("conn-1", entry("s1")).await;
        assert!(registry.remove("conn-1", "s1").await.is_some());
        assert!(registry.remove("conn-1", "s1").await.is_none());
    }

    #[tokio::test]
    async fn stale_remove_leaves_successor_entry() {
        let registry = ConnectionRegistry::new();
        registry.insert("conn-1", entry("s2")).await;
        // Finalize of the earlier session on this connection must not evict
        // the entry the successor session just inserted.
        assert!(registry.remove("conn-1", "s1").await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_sees_concurrent_inserts() {
        let registry = ConnectionRegistry::new();
        registry.insert("conn-1", entry("s1")).await;
        registry.insert("conn-2", entry("s2")).await;

        let mut ids: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["conn-1", "conn-2"]);
    }
}
