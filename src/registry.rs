use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::{SessionHandle, SessionId};

/// Live sessions, keyed by id.
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add(&self, session: SessionHandle) {
        self.sessions.insert(session.id(), session);
    }

    /// Removes a session. Returns `false` if it was already gone.
    pub fn remove(&self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of current members. Shard locks are released before returning.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sends `message` to every member of a snapshot taken now and returns
    /// how many accepted it.
    ///
    /// A failed send is skipped; the failing session's own loop notices its
    /// closed state and removes itself.
    pub fn broadcast(&self, message: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|session| session.send(message).is_ok())
            .count()
    }

    /// Removes every member and returns them.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();

        ids.into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, session)| session))
            .collect()
    }
}
