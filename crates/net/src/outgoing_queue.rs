//! The outgoing half of a session: a byte-capped queue of serialized messages drained into transmit buffers.
//!
//! Any number of threads may enqueue.  Exactly one may flush at a time; a second concurrent flush is refused rather
//! than waited for, because the encoder's held frame only makes sense to one writer.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use log::*;

use strand_framer::{EncoderError, FrameEncoder};

use crate::spinlock::{SpinMutex, Spinlock};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QueueError {
    #[error("Another flush of this queue is already in progress")]
    FlushInProgress,

    #[error("Encoder failed: {0}")]
    Encoder(#[from] EncoderError),
}

/// What a call to [OutgoingQueue::try_flush] accomplished.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushResult {
    /// Bytes written to the buffer.
    pub written: usize,

    /// Frames whose last byte was written by this call.
    pub completed: usize,
}

impl FlushResult {
    pub fn wrote(&self) -> bool {
        self.written > 0
    }
}

/// State only the flushing thread touches.
#[derive(Debug, Default)]
struct FlushState {
    encoder: FrameEncoder,

    /// Payload length of the held frame, which stays charged to indexed memory until it is completely written.
    held_len: usize,
}

pub struct OutgoingQueue {
    max_indexed_memory: usize,
    entries: SegQueue<Bytes>,
    indexed_memory: AtomicUsize,
    dispatched: AtomicU64,

    /// Orders admission against closing, so that nothing can be pushed after close drains the queue.
    gate: Spinlock,
    closed: AtomicBool,

    /// Mirrors `flush_state.encoder.is_holding()` so that [OutgoingQueue::is_empty] never waits on a flush.
    holding: AtomicBool,
    flush_state: SpinMutex<FlushState>,
}

impl OutgoingQueue {
    pub fn new(max_indexed_memory: usize) -> OutgoingQueue {
        OutgoingQueue {
            max_indexed_memory,
            entries: SegQueue::new(),
            indexed_memory: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            gate: Spinlock::new(),
            closed: AtomicBool::new(false),
            holding: AtomicBool::new(false),
            flush_state: SpinMutex::new(Default::default()),
        }
    }

    /// Queue a payload if doing so keeps indexed memory within the cap.
    ///
    /// Never blocks.  On failure nothing about the queue has changed, and it is up to the caller whether to retry,
    /// drop the message, or give up on the session.
    pub fn try_enqueue(&self, payload: Bytes) -> bool {
        let len = payload.len();

        self.gate.take();
        let admitted = !self.closed.load(Ordering::Acquire) && self.reserve(len);
        if admitted {
            self.entries.push(payload);
        }
        self.gate.release();

        admitted
    }

    fn reserve(&self, len: usize) -> bool {
        let max = self.max_indexed_memory;
        self.indexed_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(len).filter(|n| *n <= max)
            })
            .is_ok()
    }

    fn release(&self, len: usize) {
        self.indexed_memory.fetch_sub(len, Ordering::AcqRel);
    }

    /// Write queued frames into `buffer` starting at `offset`.
    ///
    /// Finishes any frame held over from the last call first, then encodes queued payloads until the buffer is full or
    /// `max_messages` frames have been completed.  A frame which doesn't fit is partially written and held for the next
    /// call.
    pub fn try_flush(
        &self,
        buffer: &mut [u8],
        offset: usize,
        max_messages: usize,
    ) -> Result<FlushResult, QueueError> {
        let mut guard = self
            .flush_state
            .try_lock()
            .ok_or(QueueError::FlushInProgress)?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(Default::default());
        }

        let state = &mut *guard;
        let mut bound = state.encoder.bind(buffer, offset)?;
        let mut completed = 0;
        let mut full = false;

        if bound.is_holding() {
            if bound.flush()? {
                self.release(state.held_len);
                state.held_len = 0;
                completed += 1;
            } else {
                full = true;
            }
        }

        while !full && completed < max_messages {
            let Some(payload) = self.entries.pop() else {
                break;
            };

            if bound.process_message(&payload)? {
                self.release(payload.len());
                completed += 1;
            } else {
                state.held_len = payload.len();
                full = true;
            }
        }

        let written = bound.written();
        self.holding
            .store(state.encoder.is_holding(), Ordering::Release);
        self.dispatched
            .fetch_add(completed as u64, Ordering::Relaxed);

        Ok(FlushResult { written, completed })
    }

    /// Stop admitting payloads and throw away everything queued or held.
    ///
    /// If a flush is running, waits for it to finish first.
    pub fn close(&self) {
        self.gate.take();
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        self.gate.release();

        if was_closed {
            return;
        }

        let mut state = self.flush_state.lock();
        state.encoder.reset();
        let mut discarded_bytes = std::mem::take(&mut state.held_len);
        let mut discarded_messages = 0;
        while let Some(p) = self.entries.pop() {
            discarded_bytes += p.len();
            discarded_messages += 1;
        }
        self.release(discarded_bytes);
        self.holding.store(false, Ordering::Release);

        if discarded_messages > 0 || discarded_bytes > 0 {
            debug!(
                "Closed outgoing queue, discarding {} queued messages and {} bytes",
                discarded_messages, discarded_bytes
            );
        }
    }

    /// True when there is nothing queued and no partially written frame.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.holding.load(Ordering::Acquire)
    }

    /// Number of queued payloads, not counting a held frame.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bytes of payload queued or held but not yet completely written.
    pub fn indexed_memory(&self) -> usize {
        self.indexed_memory.load(Ordering::Acquire)
    }

    pub fn max_indexed_memory(&self) -> usize {
        self.max_indexed_memory
    }

    /// Total frames completely written over the lifetime of this queue.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OutgoingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingQueue")
            .field("len", &self.len())
            .field("indexed_memory", &self.indexed_memory())
            .field("max_indexed_memory", &self.max_indexed_memory)
            .field("dispatched", &self.dispatched())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use strand_framer::FrameDecoder;

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![len as u8; len])
    }

    #[test]
    fn test_cap_and_release() {
        let queue = OutgoingQueue::new(100);
        assert!(queue.try_enqueue(payload(60)));
        assert!(!queue.try_enqueue(payload(50)));
        assert_eq!(queue.indexed_memory(), 60);
        assert_eq!(queue.len(), 1);

        let mut buf = vec![0u8; 128];
        let res = queue.try_flush(&mut buf, 0, usize::MAX).unwrap();
        assert_eq!(
            res,
            FlushResult {
                written: 64,
                completed: 1
            }
        );
        assert!(queue.is_empty());
        assert_eq!(queue.indexed_memory(), 0);
        assert_eq!(queue.dispatched(), 1);

        assert!(queue.try_enqueue(payload(50)));
    }

    #[test]
    fn test_held_frame_stays_charged() {
        let queue = OutgoingQueue::new(100);
        assert!(queue.try_enqueue(payload(30)));

        let mut buf = vec![0u8; 10];
        let res = queue.try_flush(&mut buf, 0, usize::MAX).unwrap();
        assert_eq!(res.written, 10);
        assert_eq!(res.completed, 0);
        assert!(!queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.indexed_memory(), 30);

        let mut wire = buf.clone();
        let mut buf = vec![0u8; 64];
        let res = queue.try_flush(&mut buf, 0, usize::MAX).unwrap();
        assert_eq!(res.written, 24);
        assert_eq!(res.completed, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.indexed_memory(), 0);

        wire.extend_from_slice(&buf[..24]);
        let mut out = vec![];
        FrameDecoder::new(1024)
            .parse_bytes(&wire, |m| out.push(m))
            .unwrap();
        assert_eq!(out, vec![payload(30)]);
    }

    #[test]
    fn test_message_limit() {
        let queue = OutgoingQueue::new(1000);
        for _ in 0..5 {
            assert!(queue.try_enqueue(payload(1)));
        }

        let mut buf = vec![0u8; 1000];
        let res = queue.try_flush(&mut buf, 0, 2).unwrap();
        assert_eq!(res.completed, 2);
        assert_eq!(res.written, 10);
        assert_eq!(queue.len(), 3);

        let res = queue.try_flush(&mut buf, 0, 0).unwrap();
        assert!(!res.wrote());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_offset() {
        let queue = OutgoingQueue::new(1000);
        assert!(queue.try_enqueue(Bytes::from_static(b"hi")));
        let mut buf = vec![0xaau8; 8];
        let res = queue.try_flush(&mut buf, 2, usize::MAX).unwrap();
        assert_eq!(res.written, 6);
        assert_eq!(buf, vec![0xaa, 0xaa, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_concurrent_flush_refused() {
        let queue = OutgoingQueue::new(1000);
        assert!(queue.try_enqueue(payload(3)));
        let _guard = queue.flush_state.lock();
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            queue.try_flush(&mut buf, 0, usize::MAX),
            Err(QueueError::FlushInProgress)
        ));
    }

    #[test]
    fn test_close_discards() {
        let queue = OutgoingQueue::new(1000);
        assert!(queue.try_enqueue(payload(20)));
        assert!(queue.try_enqueue(payload(20)));
        let mut buf = vec![0u8; 10];
        queue.try_flush(&mut buf, 0, usize::MAX).unwrap();

        queue.close();
        assert!(queue.is_closed());
        assert!(queue.is_empty());
        assert_eq!(queue.indexed_memory(), 0);
        assert!(!queue.try_enqueue(payload(1)));

        let res = queue.try_flush(&mut buf, 0, usize::MAX).unwrap();
        assert!(!res.wrote());
        assert_eq!(queue.dispatched(), 0);
    }

    #[test]
    fn test_concurrent_producers_respect_cap() {
        const CAP: usize = 10_000;
        let queue = Arc::new(OutgoingQueue::new(CAP));

        let handles = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0;
                    for i in 0..2000 {
                        let len = 1 + (i + t) % 13;
                        if queue.try_enqueue(payload(len)) {
                            admitted += len;
                        }
                        assert!(queue.indexed_memory() <= CAP);
                    }
                    admitted
                })
            })
            .collect::<Vec<_>>();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(admitted <= CAP);
        assert_eq!(queue.indexed_memory(), admitted);
    }

    /// Producers retry until admitted while one thread drains through small buffers.  Every payload must come out
    /// exactly once, in its producer's order.
    #[test]
    fn test_producers_with_concurrent_flusher() {
        const CAP: usize = 200;
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: u32 = 2000;

        let queue = Arc::new(OutgoingQueue::new(CAP));

        let producers = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let mut body = vec![p as u8];
                        body.extend_from_slice(&seq.to_le_bytes());
                        body.resize(5 + (seq as usize % 20), 0xaa);
                        let body = Bytes::from(body);
                        while !queue.try_enqueue(body.clone()) {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let total = PRODUCERS * PER_PRODUCER as usize;
        let mut decoder = FrameDecoder::new(64);
        let mut next_seq = vec![0u32; PRODUCERS];
        let mut received = 0;
        let mut buf = [0u8; 17];

        while received < total {
            assert!(queue.indexed_memory() <= CAP);

            let res = queue.try_flush(&mut buf, 0, 3).unwrap();
            let mut frames = vec![];
            decoder
                .parse_bytes(&buf[..res.written], |f| frames.push(f))
                .unwrap();

            for f in frames {
                let producer = f[0] as usize;
                let seq = u32::from_le_bytes(f[1..5].try_into().unwrap());
                assert_eq!(seq, next_seq[producer], "producer {}", producer);
                next_seq[producer] += 1;
                received += 1;
            }

            if !res.wrote() {
                std::thread::yield_now();
            }
        }

        for h in producers {
            h.join().expect("Producer should not panic");
        }

        assert_eq!(next_seq, vec![PER_PRODUCER; PRODUCERS]);
        assert!(queue.is_empty());
        assert_eq!(queue.indexed_memory(), 0);
        assert_eq!(queue.dispatched(), total as u64);
        assert_eq!(decoder.buffered_bytes(), 0);
    }

    #[derive(Clone, Debug, proptest_derive::Arbitrary)]
    enum QueueOp {
        Enqueue(#[proptest(strategy = "0usize..80")] usize),
        Flush(#[proptest(strategy = "1usize..50")] usize),
    }

    proptest! {
        #[test]
        fn test_indexed_memory_never_exceeds_cap(ops: Vec<QueueOp>) {
            let queue = OutgoingQueue::new(100);
            let mut admitted_total = 0u64;

            for op in ops {
                match op {
                    QueueOp::Enqueue(len) => {
                        let before = (queue.indexed_memory(), queue.len());
                        let admitted = queue.try_enqueue(payload(len));
                        prop_assert_eq!(admitted, before.0 + len <= 100);
                        if admitted {
                            admitted_total += 1;
                        } else {
                            prop_assert_eq!(before, (queue.indexed_memory(), queue.len()));
                        }
                    }
                    QueueOp::Flush(size) => {
                        let mut buf = vec![0u8; size];
                        queue.try_flush(&mut buf, 0, usize::MAX).unwrap();
                    }
                }
                prop_assert!(queue.indexed_memory() <= 100);
            }

            // Everything admitted eventually goes out, and gives its memory back.
            let mut buf = vec![0u8; 4096];
            queue.try_flush(&mut buf, 0, usize::MAX).unwrap();
            prop_assert!(queue.is_empty());
            prop_assert_eq!(queue.indexed_memory(), 0);
            prop_assert_eq!(queue.dispatched(), admitted_total);
        }
    }
}
