//! Concurrent session registry.
//!
//! Single source of truth for "who is currently connected": a map from
//! [`ConnectionId`] to [`SessionHandle`]. The lock is held only for the
//! map operation itself; callers clone handles out and send after the
//! lock is released, so a slow peer's queue never blocks the registry.

use crate::session::SessionHandle;
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-lifetime-unique integer naming one active connection. Assigned
/// by the accept loop, never reused.
pub type ConnectionId = u64;

/// Thread-safe map of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a session under its ConnectionId.
    pub fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().expect("registry poisoned");
        sessions.insert(handle.id(), handle);
    }

    /// Remove a session. Returns the handle if it was still registered.
    pub fn unregister(&self, id: ConnectionId) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().expect("registry poisoned");
        sessions.remove(&id)
    }

    /// Look up a session, cloning the handle out of the lock. A miss is a
    /// normal race outcome during disconnect, not an error.
    pub fn get(&self, id: ConnectionId) -> Option<SessionHandle> {
        let sessions = self.sessions.read().expect("registry poisoned");
        sessions.get(&id).cloned()
    }

    /// Consistent snapshot of every registered session, for broadcast
    /// iteration outside the lock.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().expect("registry poisoned");
        sessions.values().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().expect("registry poisoned");
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
