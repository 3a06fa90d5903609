use anyhow::Result;

use crate::session::DisconnectReason;

/// The byte stream under a session: TCP, TLS, a websocket, or a test double.
///
/// Implementations are expected to be cheap to call from the flushing thread; queue internally rather than block.
pub trait Transport: Send + Sync {
    /// Write bytes to the stream.
    ///
    /// Buffers are handed over in order and boundaries are arbitrary: a frame may be split across calls.
    fn transmit(&self, data: &[u8]) -> Result<()>;

    /// Close the stream.
    ///
    /// `notify_peer` is false when the peer is misbehaving and no goodbye should be sent.  The transport should report
    /// [crate::ConnectionState::Disconnected] to the host once the stream is actually gone.
    fn close(&self, reason: DisconnectReason, notify_peer: bool);
}
