//! Decimated live preview with a drop-oldest ring buffer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use image::DynamicImage;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::{Counter, SourceCounters};
use crate::capture::decode::decode_frame;
use crate::capture::Frame;
use crate::display::PreviewSink;
use crate::error::DecodeError;

/// How long the preview task waits for an image before re-checking shutdown
pub const PREVIEW_POLL: Duration = Duration::from_millis(100);

/// A frame converted for display
#[derive(Debug, Clone)]
pub struct PreviewImage {
    pub source_id: String,
    pub block_id: u64,
    pub image: DynamicImage,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
    evicted: AtomicU64,
}

/// Small ring where a push into a full queue evicts the oldest image
pub struct PreviewQueue {
    ring: Mutex<HeapRb<PreviewImage>>,
    ready: Notify,
    stats: CachePadded<Stats>,
}

impl PreviewQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            ready: Notify::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Never blocks; returns true when an older image was evicted.
    pub fn push(&self, image: PreviewImage) -> bool {
        let evicted = {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            ring.push_overwrite(image).is_some()
        };

        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<PreviewImage> {
        let image = self
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_pop()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(image)
    }

    /// Wait at most `timeout` for an image.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<PreviewImage> {
        if let Some(image) = self.try_pop() {
            return Some(image);
        }
        let _ = tokio::time::timeout(timeout, self.ready.notified()).await;
        self.try_pop()
    }

    pub fn len(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.stats.evicted.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.pushed.load(Ordering::Relaxed),
            self.stats.popped.load(Ordering::Relaxed),
            self.stats.evicted.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
pub enum PreviewOutcome {
    /// Not a Kth frame
    Passed,
    Published { evicted: bool },
    /// Sampled but could not be converted
    Skipped(DecodeError),
}

/// Samples every Kth frame of one source into its preview queue
pub struct PreviewDecimator {
    interval: u32,
    seen: u64,
    queue: Arc<PreviewQueue>,
    counters: Arc<SourceCounters>,
}

impl PreviewDecimator {
    pub fn new(interval: u32, queue: Arc<PreviewQueue>, counters: Arc<SourceCounters>) -> Self {
        Self {
            interval,
            seen: 0,
            queue,
            counters,
        }
    }

    pub fn submit(&mut self, frame: &Frame) -> PreviewOutcome {
        self.seen += 1;
        if self.interval == 0 || self.seen % self.interval as u64 != 0 {
            return PreviewOutcome::Passed;
        }
        self.counters.incr(Counter::PreviewSampled);

        match decode_frame(&frame.payload, frame.width, frame.height, frame.pixel_format) {
            Ok(image) => {
                let evicted = self.queue.push(PreviewImage {
                    source_id: frame.source_id.clone(),
                    block_id: frame.block_id,
                    image,
                });
                PreviewOutcome::Published { evicted }
            }
            Err(e) => {
                warn!(
                    "{}: preview skipped for block {}: {}",
                    frame.source_id, frame.block_id, e
                );
                self.counters.incr(Counter::PreviewSkipped);
                PreviewOutcome::Skipped(e)
            }
        }
    }
}

/// Pop preview images and hand them to `sink` until `stop` is cancelled.
pub async fn run_preview<S>(
    source: String,
    queue: Arc<PreviewQueue>,
    sink: Arc<S>,
    counters: Arc<SourceCounters>,
    stop: CancellationToken,
) where
    S: PreviewSink + ?Sized,
{
    debug!("{}: preview task running", source);
    while !stop.is_cancelled() {
        if let Some(image) = queue.pop_timeout(PREVIEW_POLL).await {
            sink.render(image);
            counters.incr(Counter::PreviewRendered);
        }
    }
    debug!("{}: preview task exiting", source);
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use image::GrayImage;

    use super::*;
    use crate::capture::PixelFormat;
    use crate::display::LatestFrame;

    fn frame(block_id: u64, pixel_format: PixelFormat) -> Frame {
        Frame {
            source_id: "Source0".into(),
            block_id,
            timestamp: 0,
            width: 4,
            height: 4,
            pixel_format,
            payload: Bytes::from(vec![block_id as u8; 16]),
        }
    }

    fn image(block_id: u64) -> PreviewImage {
        PreviewImage {
            source_id: "Source0".into(),
            block_id,
            image: DynamicImage::ImageLuma8(GrayImage::new(1, 1)),
        }
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let queue = PreviewQueue::new(2);
        assert!(!queue.push(image(0)));
        assert!(!queue.push(image(1)));
        assert!(queue.push(image(2)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.evicted(), 1);

        assert_eq!(queue.try_pop().unwrap().block_id, 1);
        assert_eq!(queue.try_pop().unwrap().block_id, 2);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn decimator_samples_floor_n_over_k() {
        for (n, k) in [(100u64, 5u32), (99, 5), (7, 3), (4, 1), (2, 5)] {
            let counters = Arc::new(SourceCounters::new("Source0"));
            let queue = Arc::new(PreviewQueue::new(5));
            let mut decimator = PreviewDecimator::new(k, queue.clone(), counters.clone());

            let published = (0..n)
                .filter(|&i| {
                    matches!(
                        decimator.submit(&frame(i, PixelFormat::Mono8)),
                        PreviewOutcome::Published { .. }
                    )
                })
                .count() as u64;

            assert_eq!(published, n / k as u64, "n={n} k={k}");
            assert_eq!(counters.get(Counter::PreviewSampled), n / k as u64);
            assert_eq!(queue.stats().0, n / k as u64);
        }
    }

    #[test]
    fn every_kth_frame_is_the_one_sampled() {
        let counters = Arc::new(SourceCounters::new("Source0"));
        let queue = Arc::new(PreviewQueue::new(5));
        let mut decimator = PreviewDecimator::new(3, queue.clone(), counters);
        for i in 0..9 {
            decimator.submit(&frame(i, PixelFormat::Mono8));
        }
        let ids: Vec<_> = std::iter::from_fn(|| queue.try_pop()).map(|p| p.block_id).collect();
        assert_eq!(ids, vec![2, 5, 8]);
    }

    #[test]
    fn zero_interval_disables_preview() {
        let counters = Arc::new(SourceCounters::new("Source0"));
        let queue = Arc::new(PreviewQueue::new(2));
        let mut decimator = PreviewDecimator::new(0, queue.clone(), counters);
        for i in 0..10 {
            assert!(matches!(
                decimator.submit(&frame(i, PixelFormat::Mono8)),
                PreviewOutcome::Passed
            ));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn unsupported_format_is_skipped_not_fatal() {
        let counters = Arc::new(SourceCounters::new("Source0"));
        let queue = Arc::new(PreviewQueue::new(2));
        let mut decimator = PreviewDecimator::new(1, queue.clone(), counters.clone());

        let outcome = decimator.submit(&frame(0, PixelFormat::Unsupported(0x0110_0003)));
        assert!(matches!(
            outcome,
            PreviewOutcome::Skipped(DecodeError::UnsupportedPixelFormat(0x0110_0003))
        ));
        assert_eq!(counters.get(Counter::PreviewSkipped), 1);
        assert!(queue.is_empty());

        decimator.submit(&frame(1, PixelFormat::BayerRg8));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn preview_task_renders_and_stops() {
        let counters = Arc::new(SourceCounters::new("Source0"));
        let queue = Arc::new(PreviewQueue::new(2));
        let sink = Arc::new(LatestFrame::default());
        let stop = CancellationToken::new();

        let task = tokio::spawn(run_preview(
            "Source0".into(),
            queue.clone(),
            sink.clone(),
            counters.clone(),
            stop.clone(),
        ));

        queue.push(image(9));
        for _ in 0..50 {
            if counters.get(Counter::PreviewRendered) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.cancel();
        task.await.unwrap();

        assert_eq!(counters.get(Counter::PreviewRendered), 1);
        assert_eq!(sink.latest().unwrap().block_id, 9);
    }
}
