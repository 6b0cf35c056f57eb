use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::session::SessionHandle;

/// Live sessions of one agent, keyed by call id.
///
/// A session inserts itself when spawned and removes itself when its loop
/// returns; nobody else mutates its entry.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(&self, handle: SessionHandle) {
        let call_id = handle.call_id().to_string();
        if self.sessions.lock().await.insert(call_id.clone(), handle).is_some() {
            tracing::warn!(%call_id, "replaced a live session with the same call id");
        }
    }

    pub(crate) async fn remove(&self, call_id: &str) {
        self.sessions.lock().await.remove(call_id);
    }

    pub async fn get(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.get(call_id).cloned()
    }

    /// Snapshot of every live session.
    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn call_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}
