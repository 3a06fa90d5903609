use bytes::Bytes;

use crate::header::{Header, HEADER_SIZE};

/// A frame which didn't fit in the last buffer it was offered.
///
/// The header is kept as bytes so that a buffer boundary can fall anywhere inside it.
#[derive(Debug)]
struct PendingMessage {
    header: [u8; HEADER_SIZE],
    header_written: usize,
    payload: Bytes,
    payload_written: usize,
}

impl PendingMessage {
    fn header_done(&self) -> bool {
        self.header_written == HEADER_SIZE
    }

    fn remaining(&self) -> usize {
        (HEADER_SIZE - self.header_written) + (self.payload.len() - self.payload_written)
    }

    /// Write as much of this frame as fits into `dest`, returning how much was written.
    fn write_into(&mut self, dest: &mut [u8]) -> usize {
        let mut written = 0;

        if !self.header_done() {
            let amount = (HEADER_SIZE - self.header_written).min(dest.len());
            dest[..amount]
                .copy_from_slice(&self.header[self.header_written..self.header_written + amount]);
            self.header_written += amount;
            written += amount;
        }

        if self.header_done() {
            let dest = &mut dest[written..];
            let amount = (self.payload.len() - self.payload_written).min(dest.len());
            dest[..amount]
                .copy_from_slice(&self.payload[self.payload_written..self.payload_written + amount]);
            self.payload_written += amount;
            written += amount;
        }

        written
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncoderError {
    #[error("Attempted to start a new message while a partially written message is pending")]
    AlreadyHolding,

    #[error("Attempted to flush an encoder which has no partially written message")]
    NothingPending,

    #[error("Message of {0} bytes is too long to be described by a length header")]
    MessageTooLong(usize),

    #[error("Offset {offset} is beyond the end of a buffer of {len} bytes")]
    OffsetOutOfBounds { offset: usize, len: usize },
}

/// A frame encoder packs messages into caller-provided transmit buffers.
///
/// The encoder itself only carries the state which must survive between buffers: at most one partially written frame.
/// To use, [FrameEncoder::bind] a buffer, then call [BoundEncoder::flush] if the encoder is holding and
/// [BoundEncoder::process_message] until it returns false.  When it does, the buffer is full: send it, bind the next
/// one, and flush again.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    pending: Option<PendingMessage>,
}

impl FrameEncoder {
    pub fn new() -> FrameEncoder {
        FrameEncoder { pending: None }
    }

    /// Is there a partially written frame which must be flushed before new messages may be processed?
    pub fn is_holding(&self) -> bool {
        self.pending.is_some()
    }

    /// Length of the payload of the held frame, if any.
    pub fn held_payload_len(&self) -> Option<usize> {
        self.pending.as_ref().map(|p| p.payload.len())
    }

    /// Number of bytes of the held frame, header included, which have yet to be written.
    pub fn held_remaining(&self) -> usize {
        self.pending.as_ref().map(|p| p.remaining()).unwrap_or(0)
    }

    /// Throw away any held frame.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Bind a destination buffer, with writing starting at `offset`.
    pub fn bind<'e, 'b>(
        &'e mut self,
        buffer: &'b mut [u8],
        offset: usize,
    ) -> Result<BoundEncoder<'e, 'b>, EncoderError> {
        if offset > buffer.len() {
            return Err(EncoderError::OffsetOutOfBounds {
                offset,
                len: buffer.len(),
            });
        }

        Ok(BoundEncoder {
            encoder: self,
            buffer,
            offset,
            cursor: offset,
        })
    }
}

/// A [FrameEncoder] together with the buffer it is currently writing to.
pub struct BoundEncoder<'e, 'b> {
    encoder: &'e mut FrameEncoder,
    buffer: &'b mut [u8],
    offset: usize,
    cursor: usize,
}

impl<'e, 'b> BoundEncoder<'e, 'b> {
    /// Write a frame for `payload`.
    ///
    /// Returns false if the frame didn't fit.  In that case as much of it as fits has been written, and the rest is
    /// held until [BoundEncoder::flush] drains it.
    pub fn process_message(&mut self, payload: &Bytes) -> Result<bool, EncoderError> {
        if self.encoder.pending.is_some() {
            return Err(EncoderError::AlreadyHolding);
        }

        let length =
            u32::try_from(payload.len()).map_err(|_| EncoderError::MessageTooLong(payload.len()))?;
        let header = Header::new(length);
        let frame_len = HEADER_SIZE + payload.len();

        if frame_len <= self.remaining_capacity() {
            let dest = &mut self.buffer[self.cursor..self.cursor + frame_len];
            let mut head = &mut dest[..HEADER_SIZE];
            header.encode(&mut head);
            dest[HEADER_SIZE..].copy_from_slice(payload);
            self.cursor += frame_len;
            return Ok(true);
        }

        let mut pending = PendingMessage {
            header: header.to_bytes(),
            header_written: 0,
            payload: payload.clone(),
            payload_written: 0,
        };
        let written = pending.write_into(&mut self.buffer[self.cursor..]);
        self.cursor += written;
        self.encoder.pending = Some(pending);
        Ok(false)
    }

    /// Write as much of the held frame as fits.
    ///
    /// Returns true once the frame is completely written, at which point the encoder stops holding.
    pub fn flush(&mut self) -> Result<bool, EncoderError> {
        let pending = self
            .encoder
            .pending
            .as_mut()
            .ok_or(EncoderError::NothingPending)?;
        let written = pending.write_into(&mut self.buffer[self.cursor..]);
        self.cursor += written;

        let done = pending.remaining() == 0;
        if done {
            self.encoder.pending = None;
        }
        Ok(done)
    }

    pub fn is_holding(&self) -> bool {
        self.encoder.is_holding()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Bytes written since the buffer was bound.
    pub fn written(&self) -> usize {
        self.cursor - self.offset
    }

    /// Get the buffer, the offset writing started at, and the number of bytes written.
    pub fn get_buffer(&self) -> (&[u8], usize, usize) {
        (&*self.buffer, self.offset, self.written())
    }

    /// The bytes written since the buffer was bound.
    pub fn written_bytes(&self) -> &[u8] {
        &self.buffer[self.offset..self.cursor]
    }
}
