//! Session Registry (C8): `SessionID -> Session` with safe broadcast.
//! One mutex around the session map; broadcast snapshots the session
//! list before iterating so a registration mid-broadcast can't deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fix::message::FixMessage;
use crate::session::fsm::{Session, SessionId};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.lock().insert(session.session_id.clone(), session);
    }

    pub fn unregister(&self, session_id: &SessionId) {
        self.sessions.lock().remove(session_id);
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Looks up the session and hands `msg` to the caller-supplied sender
    /// closure (the Connection's write path); absent sessions fail the
    /// send without raising.
    pub fn send_message(
        &self,
        session_id: &SessionId,
        msg: FixMessage,
        dispatch: impl FnOnce(Arc<Session>, FixMessage),
    ) -> bool {
        match self.get(session_id) {
            Some(session) => {
                dispatch(session, msg);
                true
            }
            None => false,
        }
    }

    /// Snapshots the map under lock, then invokes `f` for each session
    /// outside the lock so a callback may safely re-enter the registry.
    pub fn for_each_session(&self, mut f: impl FnMut(&Arc<Session>)) {
        let snapshot: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        for session in &snapshot {
            f(session);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_session_send_fails_quietly() {
        let registry = SessionRegistry::new();
        let sent = registry.send_message(
            &SessionId::new("GATEWAY", "GHOST"),
            FixMessage::new(),
            |_, _| panic!("should not dispatch"),
        );
        assert!(!sent);
    }

    #[test]
    fn for_each_session_allows_reentrant_unregister() {
        let registry = Arc::new(SessionRegistry::new());
        let id = SessionId::new("GATEWAY", "CLIENT1");
        registry.register(Arc::new(Session::new(id.clone(), 0)));
        assert_eq!(registry.len(), 1);

        let registry_clone = registry.clone();
        registry.for_each_session(|session| {
            registry_clone.unregister(&session.session_id);
        });
        assert!(registry.is_empty());
    }
}
