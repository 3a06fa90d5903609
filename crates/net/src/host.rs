use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use log::*;

use crate::config::HostConfig;
use crate::dispatch::{DispatchOutcome, DispatchTable};
use crate::message_handling::MessageCodec;
use crate::observer::{ObserverList, SessionObserver};
use crate::outgoing_queue::QueueError;
use crate::session::*;
use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HostError {
    #[error("Refusing new session: {0} sessions are already open")]
    TooManySessions(usize),

    #[error("The host is shut down")]
    ShutDown,
}

/// Owns every live session and routes transport events to them.
///
/// The host does no I/O of its own.  Whatever owns the sockets calls [SessionHost::on_connection_state_changed] and
/// [SessionHost::on_bytes_received] as things happen, and something calls [SessionHost::flush_all] periodically, usually
/// [SessionHost::flush_loop].
pub struct SessionHost<C: MessageCodec> {
    pub(crate) config: HostConfig,
    dispatch: DispatchTable<C>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    ids: SessionIdFactory,
    observers: Arc<ObserverList>,
    shut_down: AtomicBool,
}

impl<C: MessageCodec> SessionHost<C> {
    pub fn new(config: HostConfig, dispatch: DispatchTable<C>) -> Result<Arc<SessionHost<C>>> {
        config.validate()?;
        Ok(Arc::new(SessionHost {
            config,
            dispatch,
            sessions: Default::default(),
            ids: SessionIdFactory::new(),
            observers: Arc::new(ObserverList::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn dispatch_table(&self) -> &DispatchTable<C> {
        &self.dispatch
    }

    /// Observers apply to every session, including ones opened before the observer was added.
    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.add(observer);
    }

    fn sessions_guard(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a new connection.  The session begins in [ConnectionState::Connecting].
    pub fn open_session(&self, transport: Arc<dyn Transport>) -> Result<Arc<Session>, HostError> {
        if self.is_shut_down() {
            return Err(HostError::ShutDown);
        }

        let mut sessions = self.sessions_guard();
        if sessions.len() >= self.config.max_sessions {
            warn!("Refusing session: {} already open", sessions.len());
            return Err(HostError::TooManySessions(sessions.len()));
        }

        let session = Arc::new(Session::new(
            self.ids.next_id(),
            self.config.session.clone(),
            transport,
            self.observers.clone(),
        ));
        sessions.insert(session.id(), session.clone());
        debug!("Opened {}", session.id());
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions_guard().get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions_guard().len()
    }

    /// A snapshot of every open session, so callers can work through them without holding the session map.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_guard().values().cloned().collect()
    }

    pub fn enqueue(&self, id: SessionId, payload: bytes::Bytes) -> bool {
        match self.session(id) {
            Some(s) => s.enqueue(payload),
            None => false,
        }
    }

    /// The transport says the connection moved to `state`.
    ///
    /// Once a session is disconnected the host forgets it.
    pub fn on_connection_state_changed(
        &self,
        id: SessionId,
        state: ConnectionState,
    ) -> Result<(), SessionError> {
        let session = match self.session(id) {
            Some(s) => s,
            None => {
                debug!("State change to {} for unknown {}", state, id);
                return Ok(());
            }
        };

        session.transition(state)?;

        if state == ConnectionState::Disconnected {
            self.sessions_guard().remove(&id);
        }

        Ok(())
    }

    /// The transport received some bytes.  Returns how many messages were handed to handlers.
    pub fn on_bytes_received(&self, id: SessionId, chunk: &[u8]) -> usize {
        let session = match self.session(id) {
            Some(s) => s,
            None => {
                debug!("Dropping {} bytes for unknown {}", chunk.len(), id);
                return 0;
            }
        };

        let payloads = match session.receive(chunk) {
            Ok(p) => p,
            Err(e) => {
                warn!("{} sent malformed data: {}", id, e);
                session.disconnect(DisconnectReason::MalformedData, false);
                return 0;
            }
        };

        let mut handled = 0;
        for p in payloads.iter() {
            // A handler may have ended the session partway through the chunk.
            if session.state() != ConnectionState::Connected {
                break;
            }

            if let DispatchOutcome::Handled { .. } = self.dispatch.dispatch(&session, p) {
                handled += 1;
            }
        }

        handled
    }

    /// Run one flush tick for one session.
    ///
    /// Failures end the session: a broken queue contract as a [DisconnectReason::ContractViolation], anything the
    /// transport reports as [DisconnectReason::TransportClosed].
    pub fn flush_tick(&self, id: SessionId) -> TickSummary {
        match self.session(id) {
            Some(s) => self.flush_session(&s),
            None => Default::default(),
        }
    }

    fn flush_session(&self, session: &Session) -> TickSummary {
        match session.flush_tick() {
            Ok(s) => s,
            Err(e) => {
                let reason = if e.downcast_ref::<QueueError>().is_some() {
                    error!("{}: outgoing queue contract broken: {:?}", session.id(), e);
                    DisconnectReason::ContractViolation
                } else {
                    warn!("{}: transmit failed: {:?}", session.id(), e);
                    DisconnectReason::TransportClosed
                };
                session.disconnect(reason, false);
                Default::default()
            }
        }
    }

    /// Run a flush tick for every session.
    pub fn flush_all(&self) -> TickSummary {
        let mut total = TickSummary::default();
        for s in self.sessions() {
            total.add(self.flush_session(&s));
        }
        total
    }

    pub fn disconnect(&self, id: SessionId, reason: DisconnectReason, flush_first: bool) {
        if let Some(s) = self.session(id) {
            s.disconnect(reason, flush_first);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Refuse new sessions and start gracefully disconnecting the ones we have.
    ///
    /// Sessions are forgotten as their transports report them disconnected.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let sessions = self.sessions();
        info!("Shutting down; disconnecting {} sessions", sessions.len());
        for s in sessions {
            s.disconnect(DisconnectReason::HostShutdown, true);
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for SessionHost<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHost")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
