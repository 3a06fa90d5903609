use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::session::Session;

/// What to do after handling a message.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum MessageHandlerOutcome {
    /// Continue reading messages from the stream.
    ContinueHandling,

    /// Gracefully shut down by flushing any enqueued messages.
    GracefulShutdown,

    /// Immediately throw out the connection.
    ImmediateShutdown,
}

/// The serialization layer, which turns payloads into messages and says what kind of message each one is.
///
/// The kind is the key handlers are registered under, so it is usually a fieldless enum mirroring the message enum.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Send + Sync + 'static;
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn decode(&self, payload: &Bytes) -> Result<Self::Message>;

    fn kind(&self, message: &Self::Message) -> Self::Kind;
}

/// This trait represents the ability to handle one kind of incoming message.
///
/// Handlers are registered with a [crate::DispatchTable] and may enqueue replies, authenticate, or disconnect through
/// the session they are handed.  Errors are logged and otherwise ignored; return an outcome to end the session.
pub trait MessageHandler<M>: Send + Sync {
    fn handle_message(&self, session: &Arc<Session>, message: &M) -> Result<MessageHandlerOutcome>;
}

impl<M, F> MessageHandler<M> for F
where
    F: Fn(&Arc<Session>, &M) -> Result<MessageHandlerOutcome> + Send + Sync,
{
    fn handle_message(&self, session: &Arc<Session>, message: &M) -> Result<MessageHandlerOutcome> {
        self(session, message)
    }
}
