//! Save workers: drain a persistence queue to disk

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::metadata::{Flushed, MetadataLog, MetadataRecord};
use super::queue::{PersistenceQueue, SaveJob};
use super::stats::{Counter, SourceCounters};
use crate::capture::Frame;
use crate::error::PipelineError;

/// Where payload bytes end up.
pub trait FrameStore: Send + Sync + 'static {
    /// Persist `frame`'s payload under `dir` and return the file name used.
    fn write_payload(&self, dir: &Path, frame: &Frame) -> io::Result<String>;
}

/// Raw `.bin` files, written to a temporary name and renamed into place so a
/// reader never sees a partial payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinFileStore;

impl FrameStore for BinFileStore {
    fn write_payload(&self, dir: &Path, frame: &Frame) -> io::Result<String> {
        let name = frame.file_name();
        let partial = dir.join(format!("{name}.part"));
        fs::write(&partial, &frame.payload)?;
        fs::rename(&partial, dir.join(&name))?;
        Ok(name)
    }
}

/// Shared by every worker of one pool
struct WorkerContext {
    source: String,
    dir: PathBuf,
    queue: Arc<PersistenceQueue>,
    log: Arc<MetadataLog>,
    store: Arc<dyn FrameStore>,
    counters: Arc<SourceCounters>,
    drain: CancellationToken,
}

pub struct SaveWorkerPool {
    source: String,
    log: Arc<MetadataLog>,
    counters: Arc<SourceCounters>,
    drain: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SaveWorkerPool {
    /// Start `workers` blocking tasks draining `queue` into `dir`.
    pub fn spawn(
        dir: PathBuf,
        queue: Arc<PersistenceQueue>,
        log: Arc<MetadataLog>,
        store: Arc<dyn FrameStore>,
        counters: Arc<SourceCounters>,
        workers: usize,
    ) -> Self {
        let source = queue.source().to_owned();
        let drain = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            source: source.clone(),
            dir,
            queue,
            log: log.clone(),
            store,
            counters: counters.clone(),
            drain: drain.clone(),
        });

        let handles = (0..workers.max(1))
            .map(|id| {
                let ctx = ctx.clone();
                tokio::task::spawn_blocking(move || worker_loop(id, &ctx))
            })
            .collect();

        info!("{}: {} save workers started", source, workers.max(1));
        Self {
            source,
            log,
            counters,
            drain,
            handles,
        }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Tell the workers to exit once the queue is empty, without waiting.
    pub fn stop(&self) {
        self.drain.cancel();
    }

    /// Let the workers empty the queue, then wait for all of them to exit.
    ///
    /// Producers must be stopped first; frames enqueued after this returns
    /// are not written.
    pub async fn drain(self) -> Result<(), PipelineError> {
        self.drain.cancel();

        let mut failure = None;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("{}: save worker died: {}", self.source, e);
                if failure.is_none() {
                    failure = Some(PipelineError::Join {
                        source_id: self.source.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let flushed = self.log.flush_pending();
        let first_error = count_rows(&self.source, &self.counters, flushed);
        if let Some(source) = first_error {
            return Err(PipelineError::MetadataLog {
                path: self.log.path().to_path_buf(),
                source,
            });
        }

        info!("{}: save workers drained", self.source);
        failure.map_or(Ok(()), Err)
    }
}

fn worker_loop(id: usize, ctx: &WorkerContext) {
    debug!("{}: save worker {} running", ctx.source, id);
    while let Some(job) = ctx.queue.dequeue(&ctx.drain) {
        save_one(ctx, job);
    }
    debug!("{}: save worker {} exiting", ctx.source, id);
}

fn save_one(ctx: &WorkerContext, job: SaveJob) {
    let SaveJob { seq, frame } = job;

    let record = match ctx.store.write_payload(&ctx.dir, &frame) {
        Ok(filename) => Some(MetadataRecord::for_frame(&frame, filename)),
        Err(e) => {
            error!(
                "{}: failed to write block {}: {}",
                ctx.source, frame.block_id, e
            );
            ctx.counters.incr(Counter::DiskErrors);
            None
        }
    };
    count_rows(&ctx.source, &ctx.counters, ctx.log.commit(seq, record));
}

/// Count rows that reached the log as saved and rows it rejected as disk
/// errors. Returns the first rejection.
fn count_rows(source: &str, counters: &SourceCounters, flushed: Flushed) -> Option<io::Error> {
    counters.add(Counter::Saved, flushed.written);
    let mut first = None;
    for (block_id, e) in flushed.failed {
        error!(
            "{}: failed to append metadata for block {}: {}",
            source, block_id, e
        );
        counters.incr(Counter::DiskErrors);
        if first.is_none() {
            first = Some(e);
        }
    }
    first
}
