//! Sessions over a framed byte stream.
//!
//! A [SessionHost] owns a set of [Session]s, each wrapping some [Transport].  Outgoing messages go through a
//! flow-controlled [OutgoingQueue] and are packed into transmit buffers by periodic flush ticks; incoming bytes are
//! decoded into payloads and routed through a [DispatchTable], which keeps unauthenticated sessions away from protected
//! message kinds.
mod config;
mod dispatch;
mod host;
mod message_handling;
mod observer;
mod outgoing_queue;
mod session;
mod spinlock;
mod ticker;
mod transport;

pub use config::*;
pub use dispatch::*;
pub use host::*;
pub use message_handling::*;
pub use observer::*;
pub use outgoing_queue::*;
pub use session::*;
pub use spinlock::*;
pub use transport::*;
