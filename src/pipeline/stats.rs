//! Per-source counters, mirrored to the `metrics` facade

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::Serialize;

use super::PipelineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Retrieved,
    Copied,
    CopyFailures,
    Timeouts,
    Saved,
    DiskErrors,
    PreviewSampled,
    PreviewSkipped,
    PreviewRendered,
}

const COUNTERS: usize = 9;

impl Counter {
    fn metric_name(self) -> &'static str {
        match self {
            Counter::Retrieved => "multicap_frames_retrieved",
            Counter::Copied => "multicap_frames_copied",
            Counter::CopyFailures => "multicap_copy_failures",
            Counter::Timeouts => "multicap_retrieve_timeouts",
            Counter::Saved => "multicap_frames_saved",
            Counter::DiskErrors => "multicap_disk_errors",
            Counter::PreviewSampled => "multicap_preview_sampled",
            Counter::PreviewSkipped => "multicap_preview_skipped",
            Counter::PreviewRendered => "multicap_preview_rendered",
        }
    }
}

/// Counters shared by one source's capture loop, save workers and preview task
#[derive(Debug)]
pub struct SourceCounters {
    source: String,
    values: CachePadded<[AtomicU64; COUNTERS]>,
}

impl SourceCounters {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            values: CachePadded::new(Default::default()),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
        metrics::counter!(counter.metric_name(), "source" => self.source.clone()).increment(n);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one source.
///
/// `queue_drops` growing steadily means the disk cannot keep up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub state: PipelineState,
    pub retrieved: u64,
    pub copied: u64,
    pub copy_failures: u64,
    pub timeouts: u64,
    pub queue_depth: usize,
    pub queue_drops: u64,
    pub saved: u64,
    pub disk_errors: u64,
    pub preview_sampled: u64,
    pub preview_skipped: u64,
    pub preview_evicted: u64,
    pub preview_rendered: u64,
}

impl SourceStats {
    /// Frames that were retrieved but never made it to disk.
    pub fn lost(&self) -> u64 {
        self.copy_failures + self.queue_drops + self.disk_errors
    }
}
