use bytes::{Bytes, BytesMut};

use crate::header::{Header, HEADER_SIZE};

/// A decoder reassembles frames from a stream of bytes delivered in arbitrary chunks.
///
/// To use, call [FrameDecoder::parse_bytes] with every chunk received, in order.  Each frame completed by the chunk is
/// handed to the callback as an owned payload.  A chunk may end anywhere, including in the middle of a length header;
/// the partial frame is kept until the next call.
///
/// Once a length above the configured maximum has been seen the decoder is poisoned: the stream is assumed to be
/// corrupt or hostile, and nothing more is ever decoded from it.
#[derive(Debug)]
pub struct FrameDecoder {
    max_message_size: u32,
    state: DecoderState,
    frames_decoded: u64,
}

#[derive(Debug)]
enum DecoderState {
    /// Accumulating the length header.
    Header {
        buf: [u8; HEADER_SIZE],
        read: usize,
    },

    /// Accumulating a payload of known length.
    Payload { payload: BytesMut, remaining: usize },

    Poisoned,
}

impl DecoderState {
    fn awaiting_header() -> DecoderState {
        DecoderState::Header {
            buf: [0; HEADER_SIZE],
            read: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecoderError {
    #[error("Frame claims a length of {length} bytes, but the maximum is {max}")]
    MessageTooLong { length: u32, max: u32 },

    #[error("The decoder previously saw malformed data and refuses to continue")]
    Poisoned,
}

impl FrameDecoder {
    pub fn new(max_message_size: u32) -> FrameDecoder {
        FrameDecoder {
            max_message_size,
            state: DecoderState::awaiting_header(),
            frames_decoded: 0,
        }
    }

    /// Feed a chunk of received bytes, calling `on_ready` once per completed payload in the order received.
    ///
    /// Returns how many frames this chunk completed.
    pub fn parse_bytes(
        &mut self,
        mut chunk: &[u8],
        mut on_ready: impl FnMut(Bytes),
    ) -> Result<usize, DecoderError> {
        if matches!(self.state, DecoderState::Poisoned) {
            return Err(DecoderError::Poisoned);
        }

        let mut ready = 0;

        while !chunk.is_empty() {
            match &mut self.state {
                DecoderState::Header { buf, read } => {
                    let amount = (HEADER_SIZE - *read).min(chunk.len());
                    buf[*read..*read + amount].copy_from_slice(&chunk[..amount]);
                    *read += amount;
                    chunk = &chunk[amount..];

                    if *read < HEADER_SIZE {
                        continue;
                    }

                    let header = Header::from_bytes(*buf);
                    if header.length > self.max_message_size {
                        log::debug!(
                            "Poisoning decoder: frame of {} bytes exceeds limit of {}",
                            header.length,
                            self.max_message_size
                        );
                        self.state = DecoderState::Poisoned;
                        return Err(DecoderError::MessageTooLong {
                            length: header.length,
                            max: self.max_message_size,
                        });
                    }

                    if header.length == 0 {
                        self.state = DecoderState::awaiting_header();
                        self.emit(Bytes::new(), &mut on_ready);
                        ready += 1;
                    } else {
                        let len = header.length as usize;
                        self.state = DecoderState::Payload {
                            payload: BytesMut::with_capacity(len),
                            remaining: len,
                        };
                    }
                }
                DecoderState::Payload { payload, remaining } => {
                    let amount = (*remaining).min(chunk.len());
                    payload.extend_from_slice(&chunk[..amount]);
                    *remaining -= amount;
                    chunk = &chunk[amount..];

                    if *remaining == 0 {
                        let done = std::mem::take(payload).freeze();
                        self.state = DecoderState::awaiting_header();
                        self.emit(done, &mut on_ready);
                        ready += 1;
                    }
                }
                DecoderState::Poisoned => unreachable!("Poisoning always returns immediately"),
            }
        }

        Ok(ready)
    }

    fn emit(&mut self, payload: Bytes, on_ready: &mut impl FnMut(Bytes)) {
        self.frames_decoded += 1;
        on_ready(payload);
    }

    /// Throw away any partially received frame and clear poisoning.
    pub fn reset(&mut self) {
        self.state = DecoderState::awaiting_header();
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(self.state, DecoderState::Poisoned)
    }

    /// Number of bytes of the current partial frame, header included, received so far.
    pub fn buffered_bytes(&self) -> usize {
        match &self.state {
            DecoderState::Header { read, .. } => *read,
            DecoderState::Payload { payload, .. } => HEADER_SIZE + payload.len(),
            DecoderState::Poisoned => 0,
        }
    }

    /// Total frames this decoder has completed over its lifetime.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }
}
