use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use log::*;
use smallvec::SmallVec;

use crate::message_handling::*;
use crate::session::{DisconnectReason, Session};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("Handlers for {kind} already require authentication={existing}, but a handler asked for {requested}")]
    ConflictingAuthentication {
        kind: String,
        existing: bool,
        requested: bool,
    },
}

/// What happened to one incoming payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// The message was decoded and passed to this many handlers, possibly zero.
    Handled { handlers: usize },

    /// Nothing is registered for the message's kind, so it was dropped.
    Unhandled,

    /// The session was disconnected instead of handling the message.
    Rejected(DisconnectReason),

    /// The session was already closing, so the message was dropped unread.
    SessionClosing,
}

struct DispatchEntry<M> {
    requires_authentication: bool,
    handlers: SmallVec<[Arc<dyn MessageHandler<M>>; 2]>,
}

/// Routes decoded messages to the handlers registered for their kind, refusing protected kinds from sessions which
/// haven't authenticated.
///
/// Built up front and then shared immutably by every session of a host.
pub struct DispatchTable<C: MessageCodec> {
    codec: C,
    entries: HashMap<C::Kind, DispatchEntry<C::Message>>,
}

impl<C: MessageCodec> DispatchTable<C> {
    pub fn new(codec: C) -> DispatchTable<C> {
        DispatchTable {
            codec,
            entries: HashMap::new(),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Declare a kind without giving it a handler yet.
    ///
    /// Useful to get the authentication check for a kind nobody handles: a declared kind is gated, an undeclared one
    /// is silently dropped.
    pub fn declare(
        &mut self,
        kind: C::Kind,
        requires_authentication: bool,
    ) -> Result<&mut Self, DispatchError> {
        self.entry(kind, requires_authentication)?;
        Ok(self)
    }

    /// Add a handler for `kind`.  Handlers for the same kind run in the order they were registered, and must all
    /// agree on whether the kind requires authentication.
    pub fn register_shared(
        &mut self,
        kind: C::Kind,
        requires_authentication: bool,
        handler: Arc<dyn MessageHandler<C::Message>>,
    ) -> Result<&mut Self, DispatchError> {
        self.entry(kind, requires_authentication)?
            .handlers
            .push(handler);
        Ok(self)
    }

    pub fn register_handler<H: MessageHandler<C::Message> + 'static>(
        &mut self,
        kind: C::Kind,
        requires_authentication: bool,
        handler: H,
    ) -> Result<&mut Self, DispatchError> {
        self.register_shared(kind, requires_authentication, Arc::new(handler))
    }

    /// Like [DispatchTable::register_handler], but pins down the closure signature so that callers don't have to.
    pub fn register_fn<F>(
        &mut self,
        kind: C::Kind,
        requires_authentication: bool,
        handler: F,
    ) -> Result<&mut Self, DispatchError>
    where
        F: Fn(&Arc<Session>, &C::Message) -> Result<MessageHandlerOutcome> + Send + Sync + 'static,
    {
        self.register_handler(kind, requires_authentication, handler)
    }

    fn entry(
        &mut self,
        kind: C::Kind,
        requires_authentication: bool,
    ) -> Result<&mut DispatchEntry<C::Message>, DispatchError> {
        let entry = self.entries.entry(kind).or_insert_with(|| DispatchEntry {
            requires_authentication,
            handlers: SmallVec::new(),
        });

        if entry.requires_authentication != requires_authentication {
            return Err(DispatchError::ConflictingAuthentication {
                kind: format!("{:?}", kind),
                existing: entry.requires_authentication,
                requested: requires_authentication,
            });
        }

        Ok(entry)
    }

    /// `None` if the kind was never registered.
    pub fn requires_authentication(&self, kind: C::Kind) -> Option<bool> {
        self.entries.get(&kind).map(|e| e.requires_authentication)
    }

    pub fn handler_count(&self, kind: C::Kind) -> usize {
        self.entries.get(&kind).map_or(0, |e| e.handlers.len())
    }

    /// Decode one payload and run the handlers for it.
    ///
    /// Payloads for a session which is already closing are dropped unread.  A payload which won't decode disconnects
    /// the session as malformed.  A protected kind from an unauthenticated session disconnects it as an exploit
    /// attempt, and no handler sees the message.  Handler errors are logged and the remaining handlers still run; a
    /// handler asking for shutdown disconnects the session and stops the rest.
    pub fn dispatch(&self, session: &Arc<Session>, payload: &Bytes) -> DispatchOutcome {
        if session.state().is_closing() {
            debug!(
                "{}: dropping {}-byte message received while {}",
                session.id(),
                payload.len(),
                session.state()
            );
            return DispatchOutcome::SessionClosing;
        }

        let message = match self.codec.decode(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "{}: unable to decode {}-byte message: {:?}",
                    session.id(),
                    payload.len(),
                    e
                );
                session.disconnect(DisconnectReason::MalformedData, false);
                return DispatchOutcome::Rejected(DisconnectReason::MalformedData);
            }
        };

        let kind = self.codec.kind(&message);
        let entry = match self.entries.get(&kind) {
            Some(e) => e,
            None => {
                debug!("{}: no handler for {:?}; dropping", session.id(), kind);
                return DispatchOutcome::Unhandled;
            }
        };

        if entry.requires_authentication && !session.is_authenticated() {
            warn!(
                "{} sent {:?} without authenticating; disconnecting",
                session.id(),
                kind
            );
            session.disconnect(DisconnectReason::ExploitAttempt, false);
            return DispatchOutcome::Rejected(DisconnectReason::ExploitAttempt);
        }

        session.stats().record_handled();

        let mut handlers = 0;
        for h in entry.handlers.iter() {
            handlers += 1;
            match h.handle_message(session, &message) {
                Ok(MessageHandlerOutcome::ContinueHandling) => {}
                Ok(MessageHandlerOutcome::GracefulShutdown) => {
                    session.disconnect(DisconnectReason::Requested, true);
                    break;
                }
                Ok(MessageHandlerOutcome::ImmediateShutdown) => {
                    session.disconnect(DisconnectReason::Requested, false);
                    break;
                }
                Err(e) => {
                    warn!(
                        "{}: handler for {:?} failed: {:?}",
                        session.id(),
                        kind,
                        e
                    );
                }
            }
        }

        DispatchOutcome::Handled { handlers }
    }
}

impl<C: MessageCodec> std::fmt::Debug for DispatchTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("kinds", &self.entries.len())
            .finish()
    }
}
