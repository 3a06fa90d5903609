//! This crate frames messages and parses framed messages.  To use, encode with a [FrameEncoder] and decode with a
//! [FrameDecoder].
//!
//! On the wire, every message is a little endian u32 length followed by exactly that many bytes of payload.  This crate
//! doesn't understand what the payloads mean; you hand it [bytes::Bytes] and get [bytes::Bytes] back, and are
//! responsible for serializing them, e.g. with protobuf.
//!
//! Both halves are built for fixed-size network buffers: the encoder fills caller-provided transmit buffers and carries
//! at most one partially written frame over to the next buffer, and the decoder accepts whatever chunks the transport
//! produces.
mod decoder;
mod encoder;
mod header;
pub use decoder::*;
pub use encoder::*;
pub use header::HEADER_SIZE;
