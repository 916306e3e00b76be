//! Lifecycle of one frame source: open, acquire, stop, close

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::metadata::MetadataLog;
use super::preview::{run_preview, PreviewDecimator, PreviewQueue};
use super::queue::PersistenceQueue;
use super::stats::{Counter, SourceCounters, SourceStats};
use super::writer::{FrameStore, SaveWorkerPool};
use crate::capture::{FrameCopier, FrameSource, StreamInfo};
use crate::display::LatestFrame;
use crate::error::{OpenError, PipelineError, RetrieveError};
use crate::{Config, PreviewConfig, SourceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Closed,
    Opened,
    Acquiring,
    /// The capture loop hit a fatal error or is being stopped
    Stopping,
}

/// State readable from the capture thread and the owner
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: PipelineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> PipelineState {
        match self.0.load(Ordering::Acquire) {
            0 => PipelineState::Closed,
            1 => PipelineState::Opened,
            2 => PipelineState::Acquiring,
            _ => PipelineState::Stopping,
        }
    }

    fn set(&self, state: PipelineState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Pipeline-wide settings every source shares
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub save_root: PathBuf,
    pub queue_capacity: usize,
    pub workers: usize,
    pub retrieve_timeout: Duration,
    pub preview: PreviewConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            save_root: config.persistence.save_root.clone(),
            queue_capacity: config.persistence.queue_capacity,
            workers: config.persistence.workers,
            retrieve_timeout: config.retrieve_timeout(),
            preview: config.preview.clone(),
        }
    }
}

/// What the capture thread hands back when it exits
struct CaptureExit {
    source: Box<dyn FrameSource>,
    decimator: PreviewDecimator,
    result: Result<(), RetrieveError>,
}

struct CaptureLoop {
    name: String,
    source: Box<dyn FrameSource>,
    decimator: PreviewDecimator,
    copier: FrameCopier,
    queue: Arc<PersistenceQueue>,
    counters: Arc<SourceCounters>,
    state: Arc<StateCell>,
    stop: CancellationToken,
    timeout: Duration,
}

impl CaptureLoop {
    fn run(mut self) -> CaptureExit {
        info!("{}: acquisition started", self.name);
        let result = self.acquire();
        info!("{}: acquisition stopped", self.name);
        CaptureExit {
            source: self.source,
            decimator: self.decimator,
            result,
        }
    }

    fn acquire(&mut self) -> Result<(), RetrieveError> {
        while !self.stop.is_cancelled() {
            let lease = match self.source.retrieve(self.timeout) {
                Ok(lease) => lease,
                Err(RetrieveError::Timeout) => {
                    self.counters.incr(Counter::Timeouts);
                    debug!("{}: retrieve timed out", self.name);
                    continue;
                }
                Err(e) => {
                    error!("{}: {}", self.name, e);
                    self.state.set(PipelineState::Stopping);
                    self.stop.cancel();
                    return Err(e);
                }
            };
            self.counters.incr(Counter::Retrieved);

            // The copy must finish before the buffer goes back to the pool
            let copied = self.copier.copy(self.source.as_ref(), &lease);
            self.source.release(lease);

            let frame = match copied {
                Ok(frame) => frame,
                Err(e) => {
                    self.counters.incr(Counter::CopyFailures);
                    error!("{}: {}", self.name, e);
                    continue;
                }
            };
            self.counters.incr(Counter::Copied);

            self.decimator.submit(&frame);
            if let Err(full) = self.queue.enqueue(frame) {
                warn!("{}: {}", self.name, full);
            }
        }
        Ok(())
    }
}

/// One source with its copier, queues and worker handles.
pub struct SourcePipeline {
    config: SourceConfig,
    settings: PipelineSettings,
    store: Arc<dyn FrameStore>,
    state: Arc<StateCell>,
    source: Option<Box<dyn FrameSource>>,
    decimator: Option<PreviewDecimator>,
    stream: Option<StreamInfo>,
    counters: Arc<SourceCounters>,
    queue: Option<Arc<PersistenceQueue>>,
    workers: Option<SaveWorkerPool>,
    preview_queue: Arc<PreviewQueue>,
    latest: Arc<LatestFrame>,
    shutdown: CancellationToken,
    stop: Option<CancellationToken>,
    capture: Option<JoinHandle<CaptureExit>>,
    preview_task: Option<JoinHandle<()>>,
}

impl SourcePipeline {
    /// `shutdown` is the global signal; cancelling it stops this pipeline's
    /// capture loop and preview task.
    pub fn new(
        config: SourceConfig,
        source: Box<dyn FrameSource>,
        settings: PipelineSettings,
        store: Arc<dyn FrameStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let counters = Arc::new(SourceCounters::new(config.name.clone()));
        let preview_queue = Arc::new(PreviewQueue::new(settings.preview.capacity()));
        let decimator = PreviewDecimator::new(
            settings.preview.interval,
            preview_queue.clone(),
            counters.clone(),
        );

        Self {
            config,
            settings,
            store,
            state: Arc::new(StateCell::new(PipelineState::Closed)),
            source: Some(source),
            decimator: Some(decimator),
            stream: None,
            counters,
            queue: None,
            workers: None,
            preview_queue,
            latest: Arc::new(LatestFrame::default()),
            shutdown,
            stop: None,
            capture: None,
            preview_task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn stream(&self) -> Option<&StreamInfo> {
        self.stream.as_ref()
    }

    /// Most recent preview image, for a UI to poll.
    pub fn latest_preview(&self) -> Arc<LatestFrame> {
        self.latest.clone()
    }

    pub fn save_dir(&self) -> PathBuf {
        self.config.save_dir(&self.settings.save_root)
    }

    fn invalid(&self, operation: &'static str) -> PipelineError {
        PipelineError::InvalidState {
            source_id: self.config.name.clone(),
            operation,
            state: self.state(),
        }
    }

    fn open_error(&self, error: OpenError) -> PipelineError {
        PipelineError::Open {
            source_id: self.config.name.clone(),
            error,
        }
    }

    /// Negotiate the stream and bring up the save path.
    #[instrument(skip(self), fields(source = %self.config.name))]
    pub fn open(&mut self) -> Result<StreamInfo, PipelineError> {
        if self.state() != PipelineState::Closed || self.source.is_none() {
            return Err(self.invalid("open"));
        }

        let stream = self
            .source
            .as_mut()
            .ok_or_else(|| PipelineError::InvalidState {
                source_id: self.config.name.clone(),
                operation: "open",
                state: PipelineState::Closed,
            })?
            .open(&self.config)
            .map_err(|error| PipelineError::Open {
                source_id: self.config.name.clone(),
                error,
            })?;

        if self.workers.is_none() {
            if let Err(error) = self.start_persistence() {
                if let Some(source) = self.source.as_mut() {
                    source.close();
                }
                return Err(self.open_error(error));
            }
        }

        info!(
            "{}: opened on channel {} ({} byte payload, {} buffers)",
            self.config.name, stream.channel, stream.payload_size, stream.buffer_count
        );
        self.state.set(PipelineState::Opened);
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    fn start_persistence(&mut self) -> Result<(), OpenError> {
        let dir = self.save_dir();
        let dir_error = |source: std::io::Error| OpenError::SaveDirectory {
            path: dir.clone(),
            source,
        };
        fs::create_dir_all(&dir).map_err(dir_error)?;
        let log = MetadataLog::open(&dir).map_err(dir_error)?;

        let queue = Arc::new(PersistenceQueue::new(
            self.config.name.clone(),
            self.settings.queue_capacity,
        ));
        self.workers = Some(SaveWorkerPool::spawn(
            dir.clone(),
            queue.clone(),
            Arc::new(log),
            self.store.clone(),
            self.counters.clone(),
            self.settings.workers,
        ));
        self.queue = Some(queue);
        Ok(())
    }

    /// Spawn the capture loop (and preview task when enabled).
    #[instrument(skip(self), fields(source = %self.config.name))]
    pub fn start_acquisition(&mut self) -> Result<(), PipelineError> {
        if self.state() != PipelineState::Opened {
            return Err(self.invalid("start acquisition"));
        }
        let Some(queue) = self.queue.clone() else {
            return Err(self.invalid("start acquisition"));
        };
        let (Some(source), Some(decimator)) = (self.source.take(), self.decimator.take()) else {
            return Err(self.invalid("start acquisition"));
        };

        let stop = self.shutdown.child_token();
        let capture = CaptureLoop {
            name: self.config.name.clone(),
            source,
            decimator,
            copier: FrameCopier::new(self.config.name.clone()),
            queue,
            counters: self.counters.clone(),
            state: self.state.clone(),
            stop: stop.clone(),
            timeout: self.settings.retrieve_timeout,
        };

        self.state.set(PipelineState::Acquiring);
        self.capture = Some(tokio::task::spawn_blocking(move || capture.run()));

        if self.settings.preview.enabled() {
            self.preview_task = Some(tokio::spawn(run_preview(
                self.config.name.clone(),
                self.preview_queue.clone(),
                self.latest.clone(),
                self.counters.clone(),
                stop.clone(),
            )));
        }
        self.stop = Some(stop);
        Ok(())
    }

    /// Ask the capture loop to exit after its current iteration without
    /// waiting for it.
    pub fn signal_stop(&self) {
        if let Some(stop) = &self.stop {
            stop.cancel();
        }
    }

    /// Signal the capture loop, wait for it, and return to `Opened`.
    ///
    /// Returns the loop's error if it had already ended on a fatal retrieve
    /// failure.
    #[instrument(skip(self), fields(source = %self.config.name))]
    pub async fn stop_acquisition(&mut self) -> Result<(), PipelineError> {
        match self.state() {
            PipelineState::Acquiring | PipelineState::Stopping => {}
            PipelineState::Opened => return Ok(()),
            PipelineState::Closed => return Err(self.invalid("stop acquisition")),
        }

        self.state.set(PipelineState::Stopping);
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }

        if let Some(preview) = self.preview_task.take() {
            if let Err(e) = preview.await {
                warn!("{}: preview task failed: {}", self.config.name, e);
            }
        }

        let Some(capture) = self.capture.take() else {
            self.state.set(PipelineState::Opened);
            return Ok(());
        };

        match capture.await {
            Ok(exit) => {
                self.source = Some(exit.source);
                self.decimator = Some(exit.decimator);
                self.state.set(PipelineState::Opened);
                exit.result.map_err(|error| PipelineError::Retrieve {
                    source_id: self.config.name.clone(),
                    error,
                })
            }
            Err(e) => {
                // The source went down with the capture thread
                self.state.set(PipelineState::Closed);
                Err(PipelineError::Join {
                    source_id: self.config.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Release stream resources. Save workers keep running until `finish`.
    #[instrument(skip(self), fields(source = %self.config.name))]
    pub async fn close(&mut self) -> Result<(), PipelineError> {
        let stopped = match self.state() {
            PipelineState::Closed => return Ok(()),
            PipelineState::Opened => Ok(()),
            PipelineState::Acquiring | PipelineState::Stopping => self.stop_acquisition().await,
        };

        if let Some(source) = self.source.as_mut() {
            source.close();
        }
        self.stream = None;
        self.state.set(PipelineState::Closed);
        info!("{}: closed", self.config.name);
        stopped
    }

    /// Close, drain every queued frame to disk, and report final counters.
    pub async fn finish(mut self) -> (SourceStats, Result<(), PipelineError>) {
        let closed = self.close().await;
        let drained = match self.workers.take() {
            Some(workers) => workers.drain().await,
            None => Ok(()),
        };
        (self.stats(), closed.and(drained))
    }

    pub fn queue(&self) -> Option<Arc<PersistenceQueue>> {
        self.queue.clone()
    }

    pub fn stats(&self) -> SourceStats {
        let (queue_depth, queue_drops) = self
            .queue
            .as_ref()
            .map_or((0, 0), |q| (q.len(), q.dropped()));

        SourceStats {
            source: self.config.name.clone(),
            state: self.state(),
            retrieved: self.counters.get(Counter::Retrieved),
            copied: self.counters.get(Counter::Copied),
            copy_failures: self.counters.get(Counter::CopyFailures),
            timeouts: self.counters.get(Counter::Timeouts),
            queue_depth,
            queue_drops,
            saved: self.counters.get(Counter::Saved),
            disk_errors: self.counters.get(Counter::DiskErrors),
            preview_sampled: self.counters.get(Counter::PreviewSampled),
            preview_skipped: self.counters.get(Counter::PreviewSkipped),
            preview_evicted: self.preview_queue.evicted(),
            preview_rendered: self.counters.get(Counter::PreviewRendered),
        }
    }
}

impl Drop for SourcePipeline {
    /// A pipeline dropped without `finish` still winds its threads down:
    /// the capture loop stops and the save workers exit once the queue is
    /// empty.
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.cancel();
        }
        if let Some(workers) = &self.workers {
            warn!("{}: dropped without finish, stopping save workers", self.config.name);
            workers.stop();
        }
    }
}
