//! Registry of live sessions

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conversation::{SessionHandle, SessionState};

/// Registry shared between the WebSocket handler and the HTTP endpoints
pub type SharedRegistry = Arc<RwLock<SessionRegistry>>;

/// Snapshot of one session for the API
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub completed_turns: u64,
    pub cancelled_turns: u64,
}

impl SessionInfo {
    fn from_handle(handle: &SessionHandle) -> Self {
        Self {
            id: handle.id(),
            state: handle.state(),
            connected_at: handle.connected_at(),
            completed_turns: handle.stats().completed_turns(),
            cancelled_turns: handle.stats().cancelled_turns(),
        }
    }
}

/// Sessions of connected terminals
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, SessionHandle>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry behind a shared lock
    #[must_use]
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Track a session
    pub fn register(&mut self, handle: SessionHandle) {
        tracing::debug!(session_id = %handle.id(), "session registered");
        self.sessions.insert(handle.id(), handle);
    }

    /// Stop tracking a session
    pub fn unregister(&mut self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&SessionHandle> {
        self.sessions.get(&id)
    }

    /// All sessions, oldest connection first
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> =
            self.sessions.values().map(SessionInfo::from_handle).collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    /// Ask every session to close
    pub fn close_all(&self) {
        for handle in self.sessions.values() {
            handle.close();
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::conversation::{Session, SessionConfig};
    use crate::engine::Engines;

    fn session() -> Session {
        let config = Arc::new(SessionConfig::from_config(&Config::default()).unwrap());
        let engines = Engines::from_config(&Config::default().engines).unwrap();
        Session::new(config, engines)
    }

    #[test]
    fn register_list_unregister() {
        let mut registry = SessionRegistry::new();
        let a = session();
        let b = session();
        registry.register(a.handle());
        registry.register(b.handle());

        assert_eq!(registry.len(), 2);
        let infos = registry.list();
        assert!(infos.iter().all(|i| i.state == SessionState::Idle));
        assert!(infos.iter().any(|i| i.id == a.id()));

        assert!(registry.unregister(a.id()).is_some());
        assert!(registry.get(a.id()).is_none());
        assert!(registry.get(b.id()).is_some());
        assert!(registry.unregister(a.id()).is_none());
    }

    #[tokio::test]
    async fn close_all_signals_sessions() {
        let registry = SessionRegistry::shared();
        let s = session();
        let handle = s.handle();
        registry.write().await.register(s.handle());

        registry.read().await.close_all();
        assert!(handle.shutdown_requested());
    }
}
