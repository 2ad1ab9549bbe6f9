use std::sync::Arc;

use dashmap::DashMap;

use super::Session;

/// The open sessions of one container.
///
/// A session is added when it opens and removed as soon as it starts closing, so the
/// registry only ever holds sessions in the open state. Membership changes from different
/// connections never contend on a single lock.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session: Session) {
        self.sessions.insert(session.inner.id.clone(), session);
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// The sessions open right now.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("open", &self.sessions.len())
            .finish()
    }
}
