use std::sync::{Arc, PoisonError, RwLock};

use crate::session::{ConnectionState, DisconnectReason, Session};

/// Something which wants to know about session lifecycle changes, e.g. to clean up game state for a player.
///
/// Called on whichever thread caused the change.  Observers must not block.
pub trait SessionObserver: Send + Sync {
    fn state_changed(&self, _session: &Session, _old: ConnectionState, _new: ConnectionState) {}

    /// The session reached [ConnectionState::Disconnected].  Called after [SessionObserver::state_changed].
    fn disconnected(&self, _session: &Session, _reason: DisconnectReason) {}
}

/// Observers in registration order, shared by a host and all of its sessions.
#[derive(Default)]
pub struct ObserverList {
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl ObserverList {
    pub fn new() -> ObserverList {
        Default::default()
    }

    pub fn add(&self, observer: Arc<dyn SessionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observers are called on a copy of the list, so that one may register another without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn notify_state_changed(
        &self,
        session: &Session,
        old: ConnectionState,
        new: ConnectionState,
    ) {
        for o in self.snapshot() {
            o.state_changed(session, old, new);
        }
    }

    pub(crate) fn notify_disconnected(&self, session: &Session, reason: DisconnectReason) {
        for o in self.snapshot() {
            o.disconnected(session, reason);
        }
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.len())
            .finish()
    }
}
