//! Live-connection set: connection id -> event sender, used for the shutdown broadcast.

use crate::session::{ConnId, SessionEvent};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Connections currently being driven by the gateway. Shared across handlers.
pub struct ConnectionSet {
    inner: Arc<RwLock<HashMap<ConnId, mpsc::UnboundedSender<SessionEvent>>>>,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session. Returns false, leaving the set unchanged, when `id` is taken.
    pub async fn insert(&self, id: ConnId, events: mpsc::UnboundedSender<SessionEvent>) -> bool {
        match self.inner.write().await.entry(id) {
            Entry::Occupied(e) => {
                log::debug!("[{}] connection id already in use", e.key());
                false
            }
            Entry::Vacant(e) => {
                e.insert(events);
                true
            }
        }
    }

    pub async fn remove(&self, id: &str) {
        self.inner.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<ConnId> {
        let g = self.inner.read().await;
        g.keys().cloned().collect()
    }

    /// Queue `Shutdown` on every live session. Returns how many were notified.
    pub async fn broadcast_shutdown(&self) -> usize {
        let g = self.inner.read().await;
        g.values()
            .filter(|tx| tx.send(SessionEvent::Shutdown).is_ok())
            .count()
    }

    /// Wait until every session has left the set, or `limit` elapses. Returns true when drained.
    pub async fn wait_until_empty(&self, limit: Duration) -> bool {
        let drained = async {
            while !self.is_empty().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}
