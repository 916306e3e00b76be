//! Bounded, non-blocking persistence queue

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tokio_util::sync::CancellationToken;

use crate::capture::Frame;
use crate::error::QueueFull;

/// How long a blocked dequeue waits before re-checking the shutdown signal
const DEQUEUE_POLL: Duration = Duration::from_millis(20);

/// A frame waiting to be written, tagged with its position in the queue's
/// enqueue order.
#[derive(Debug)]
pub struct SaveJob {
    pub seq: u64,
    pub frame: Frame,
}

#[derive(Default)]
struct Stats {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded FIFO between one capture loop and its save workers.
///
/// Full means drop-newest: the capture thread never waits on disk.
pub struct PersistenceQueue {
    source: String,
    capacity: usize,
    tx: Sender<SaveJob>,
    rx: Receiver<SaveJob>,
    next_seq: Mutex<u64>,
    stats: CachePadded<Stats>,
}

impl PersistenceQueue {
    pub fn new(source: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self {
            source: source.into(),
            capacity,
            tx,
            rx,
            next_seq: Mutex::new(0),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Enqueue without blocking; returns the frame's sequence number.
    pub fn enqueue(&self, frame: Frame) -> Result<u64, QueueFull> {
        // Held across try_send so sequence numbers follow queue order
        let mut next_seq = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = *next_seq;

        match self.tx.try_send(SaveJob { seq, frame }) {
            Ok(()) => {
                *next_seq += 1;
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(seq)
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("multicap_queue_drops", "source" => self.source.clone())
                    .increment(1);
                Err(QueueFull {
                    capacity: self.capacity,
                    block_id: job.frame.block_id,
                })
            }
        }
    }

    /// Block until a job is available.
    ///
    /// Once `shutdown` is cancelled this keeps returning queued jobs until the
    /// queue is empty, then `None`.
    pub fn dequeue(&self, shutdown: &CancellationToken) -> Option<SaveJob> {
        loop {
            if shutdown.is_cancelled() {
                return self.rx.try_recv().ok();
            }
            match self.rx.recv_timeout(DEQUEUE_POLL) {
                Ok(job) => return Some(job),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::capture::PixelFormat;

    fn frame(block_id: u64) -> Frame {
        Frame {
            source_id: "Source0".into(),
            block_id,
            timestamp: 0,
            width: 1,
            height: 1,
            pixel_format: PixelFormat::Mono8,
            payload: Bytes::from_static(&[0]),
        }
    }

    #[test]
    fn overflow_drops_newest_once_per_frame() {
        let queue = PersistenceQueue::new("Source0", 3);
        let mut rejected = Vec::new();
        for block_id in 0..10 {
            if let Err(full) = queue.enqueue(frame(block_id)) {
                rejected.push(full.block_id);
            }
            assert!(queue.len() <= 3);
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.accepted(), 3);
        assert_eq!(queue.dropped(), 7);
        assert_eq!(rejected, (3..10).collect::<Vec<_>>());
    }

    #[test]
    fn sequence_numbers_skip_dropped_frames() {
        let queue = PersistenceQueue::new("Source0", 2);
        assert_eq!(queue.enqueue(frame(0)).unwrap(), 0);
        assert_eq!(queue.enqueue(frame(1)).unwrap(), 1);
        assert!(queue.enqueue(frame(2)).is_err());

        let token = CancellationToken::new();
        assert_eq!(queue.dequeue(&token).unwrap().frame.block_id, 0);
        assert_eq!(queue.enqueue(frame(3)).unwrap(), 2);
    }

    #[test]
    fn cancelled_dequeue_drains_then_stops() {
        let queue = PersistenceQueue::new("Source0", 4);
        queue.enqueue(frame(7)).unwrap();
        queue.enqueue(frame(8)).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(queue.dequeue(&token).unwrap().frame.block_id, 7);
        assert_eq!(queue.dequeue(&token).unwrap().frame.block_id, 8);
        assert!(queue.dequeue(&token).is_none());
    }
}
