//! Per-connection state: the connection state machine, authentication, and both halves of the framed stream.
use std::any::Any;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};

use anyhow::Result;
use bytes::Bytes;
use log::*;
use smallvec::SmallVec;

use strand_framer::{DecoderError, FrameDecoder};

use crate::config::SessionConfig;
use crate::observer::ObserverList;
use crate::outgoing_queue::OutgoingQueue;
use crate::transport::Transport;

#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, derive_more::Display)]
#[display(fmt = "session {}", _0)]
pub struct SessionId(NonZeroU64);

impl SessionId {
    pub fn new(raw: NonZeroU64) -> SessionId {
        SessionId(raw)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// Hands out session ids.  An id is never handed out twice by the same factory.
#[derive(Debug)]
pub struct SessionIdFactory {
    next: AtomicU64,
}

impl Default for SessionIdFactory {
    fn default() -> Self {
        SessionIdFactory {
            next: AtomicU64::new(1),
        }
    }
}

impl SessionIdFactory {
    pub fn new() -> SessionIdFactory {
        Default::default()
    }

    pub fn next_id(&self) -> SessionId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        SessionId(NonZeroU64::new(raw).expect("Should take centuries to wrap a u64 counter"))
    }
}

/// Where a session is in its life.
///
/// The transport drives most transitions.  `Disconnected` is terminal.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, derive_more::Display)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(val: u8) -> ConnectionState {
        match val {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connecting, Connected | Disconnecting | Disconnected)
                | (Connected, Disconnecting | Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnecting | ConnectionState::Disconnected
        )
    }
}

/// Why a session ended.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, derive_more::Display)]
pub enum DisconnectReason {
    /// Application code asked for it, e.g. a logout.
    Requested,

    /// The peer sent a message it wasn't allowed to send, e.g. a gameplay command before logging in.
    ExploitAttempt,

    /// The peer sent bytes which couldn't be decoded.
    MalformedData,

    /// Our own code broke a contract; the stream can't be trusted.
    ContractViolation,

    /// The transport went away on its own.
    TransportClosed,

    /// The host is shutting down.
    HostShutdown,
}

impl DisconnectReason {
    /// Whether the peer should be told why.
    ///
    /// When the stream itself is suspect there is no point trying to say anything more on it.
    pub fn notifies_peer(self) -> bool {
        !matches!(
            self,
            DisconnectReason::MalformedData | DisconnectReason::ContractViolation
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("{id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("{0} is already authenticated")]
    AlreadyAuthenticated(SessionId),

    #[error("{0} is closing")]
    Closing(SessionId),
}

/// Whatever the application's account layer says this session is.  Opaque to us.
pub type Identity = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
    bytes_transmitted: AtomicU64,
    messages_handled: AtomicU64,
}

impl SessionStats {
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted.load(Ordering::Relaxed)
    }

    /// Incoming messages which made it to at least the dispatch table's handler list.
    pub fn messages_handled(&self) -> u64 {
        self.messages_handled.load(Ordering::Relaxed)
    }

    pub(crate) fn record_handled(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }
}

/// What one flush tick sent.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TickSummary {
    pub bytes: usize,
    pub messages: usize,
    pub transmits: usize,
}

impl TickSummary {
    pub(crate) fn add(&mut self, other: TickSummary) {
        self.bytes += other.bytes;
        self.messages += other.messages;
        self.transmits += other.transmits;
    }
}

pub struct Session {
    id: SessionId,
    config: SessionConfig,
    state: AtomicU8,
    /// Set exactly once.  The inner option is the identity, if the account layer supplied one.
    authentication: OnceLock<Option<Identity>>,
    /// First reason wins.
    disconnect_reason: OnceLock<DisconnectReason>,
    outgoing: OutgoingQueue,
    decoder: Mutex<FrameDecoder>,
    /// Held for the whole of a flush.  A tick that finds it taken skips; a flush-first disconnect waits for it.
    transmit_buffer: Mutex<Vec<u8>>,
    transport: Arc<dyn Transport>,
    observers: Arc<ObserverList>,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        observers: Arc<ObserverList>,
    ) -> Session {
        Session {
            id,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            authentication: OnceLock::new(),
            disconnect_reason: OnceLock::new(),
            outgoing: OutgoingQueue::new(config.max_indexed_memory),
            decoder: Mutex::new(FrameDecoder::new(config.max_message_size)),
            transmit_buffer: Mutex::new(vec![0; config.transmit_buffer_size]),
            transport,
            observers,
            stats: Default::default(),
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn outgoing(&self) -> &OutgoingQueue {
        &self.outgoing
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason.get().copied()
    }

    /// Move to `next`.
    ///
    /// Returns false if the session was already there.  Entering a closing state discards everything queued for
    /// sending and any partially received frame.
    pub fn transition(&self, next: ConnectionState) -> Result<bool, SessionError> {
        let mut current = self.state();

        loop {
            if current == next {
                return Ok(false);
            }

            if !current.can_transition_to(next) {
                return Err(SessionError::InvalidTransition {
                    id: self.id,
                    from: current,
                    to: next,
                });
            }

            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = ConnectionState::from_u8(actual),
            }
        }

        debug!("{}: {} -> {}", self.id, current, next);

        if next.is_closing() {
            self.outgoing.close();
            self.decoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset();
        }

        self.observers.notify_state_changed(self, current, next);

        if next == ConnectionState::Disconnected {
            let reason = *self
                .disconnect_reason
                .get_or_init(|| DisconnectReason::TransportClosed);
            info!("{} disconnected: {}", self.id, reason);
            self.observers.notify_disconnected(self, reason);
        }

        Ok(true)
    }

    /// Mark this session as authenticated.  May only be done once.
    pub fn authenticate(&self, identity: Option<Identity>) -> Result<(), SessionError> {
        if self.state().is_closing() {
            return Err(SessionError::Closing(self.id));
        }

        self.authentication
            .set(identity)
            .map_err(|_| SessionError::AlreadyAuthenticated(self.id))?;
        info!("{} authenticated", self.id);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authentication.get().is_some()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.authentication.get().and_then(|i| i.as_ref())
    }

    /// The identity, if there is one and it is a `T`.
    pub fn identity_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.identity()
            .cloned()
            .and_then(|i| i.downcast::<T>().ok())
    }

    /// Queue a serialized message for the next flush tick.
    ///
    /// Fails if the session is closing, the payload is over the maximum message size, or the queue is full.
    pub fn enqueue(&self, payload: Bytes) -> bool {
        if self.state().is_closing() {
            return false;
        }

        if payload.len() > self.config.max_message_size as usize {
            warn!(
                "{}: refusing to enqueue a message of {} bytes; the limit is {}",
                self.id,
                payload.len(),
                self.config.max_message_size
            );
            return false;
        }

        self.outgoing.try_enqueue(payload)
    }

    /// Pack queued messages into the transmit buffer and hand them to the transport, sending at most
    /// `max_messages_per_tick` messages.
    ///
    /// Does nothing unless the session is connected, and sends nothing if another flush of this session is already
    /// running.  Errors are either a [crate::QueueError], meaning a contract was broken, or whatever the transport
    /// failed with.
    pub fn flush_tick(&self) -> Result<TickSummary> {
        let buffer = match self.transmit_buffer.try_lock() {
            Ok(b) => b,
            Err(TryLockError::WouldBlock) => {
                trace!("{}: flush already in progress; skipping tick", self.id);
                return Ok(Default::default());
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        self.flush_into(buffer, self.config.max_messages_per_tick)
    }

    fn flush_into(&self, mut buffer: MutexGuard<'_, Vec<u8>>, budget: usize) -> Result<TickSummary> {
        if self.state() != ConnectionState::Connected {
            return Ok(Default::default());
        }

        let mut summary = TickSummary::default();
        while summary.messages < budget {
            let res = self
                .outgoing
                .try_flush(&mut buffer[..], 0, budget - summary.messages)?;
            if !res.wrote() {
                break;
            }

            self.transport.transmit(&buffer[..res.written])?;
            self.stats
                .bytes_transmitted
                .fetch_add(res.written as u64, Ordering::Relaxed);
            summary.add(TickSummary {
                bytes: res.written,
                messages: res.completed,
                transmits: 1,
            });

            // A buffer that wasn't filled means there was nothing left to put in it.
            if res.written < buffer.len() {
                break;
            }
        }

        Ok(summary)
    }

    /// Decode a chunk of received bytes into complete payloads.
    ///
    /// The decoder lock is released before returning so that handlers run on the payloads are free to disconnect the
    /// session.  Bytes arriving while the session isn't connected are dropped.
    pub fn receive(&self, chunk: &[u8]) -> Result<SmallVec<[Bytes; 4]>, DecoderError> {
        let mut ready = SmallVec::new();

        if self.state() != ConnectionState::Connected {
            debug!(
                "{}: dropping {} bytes received while {}",
                self.id,
                chunk.len(),
                self.state()
            );
            return Ok(ready);
        }

        self.decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .parse_bytes(chunk, |p| ready.push(p))?;

        self.stats
            .bytes_received
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.stats
            .frames_received
            .fetch_add(ready.len() as u64, Ordering::Relaxed);
        Ok(ready)
    }

    /// Begin disconnecting.
    ///
    /// With `flush_first`, everything queued is sent before the queue is torn down; otherwise it is thrown away.  The
    /// transport is asked to close, and is expected to report [ConnectionState::Disconnected] once it has.  Does
    /// nothing if the session is already closing.
    pub fn disconnect(&self, reason: DisconnectReason, flush_first: bool) {
        let state = self.state();
        if state.is_closing() {
            return;
        }

        let _ = self.disconnect_reason.set(reason);

        if flush_first && state == ConnectionState::Connected {
            let buffer = self
                .transmit_buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = self.flush_into(buffer, usize::MAX) {
                warn!("{}: unable to flush before disconnecting: {:?}", self.id, e);
            }
        }

        match self.transition(ConnectionState::Disconnecting) {
            Ok(true) => {}
            // Someone else got there first, and closed the transport themselves.
            Ok(false) | Err(_) => return,
        }

        // Whoever recorded a reason first decides what the peer is told.
        let reason = self.disconnect_reason().unwrap_or(reason);
        info!("Disconnecting {}: {}", self.id, reason);
        self.transport.close(reason, reason.notifies_peer());
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("authenticated", &self.is_authenticated())
            .field("outgoing", &self.outgoing)
            .finish()
    }
}
