//! Starts, monitors and stops every source pipeline together

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::queue::PersistenceQueue;
use super::source::{PipelineSettings, SourcePipeline};
use super::stats::SourceStats;
use super::writer::{BinFileStore, FrameStore};
use crate::capture::FrameSource;
use crate::display::LatestFrame;
use crate::{Config, SourceConfig};

/// Final per-source counters plus every error hit while stopping
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionReport {
    pub sources: Vec<SourceStats>,
    pub errors: Vec<String>,
}

impl AcquisitionReport {
    pub fn source(&self, name: &str) -> Option<&SourceStats> {
        self.sources.iter().find(|s| s.source == name)
    }

    pub fn total_saved(&self) -> u64 {
        self.sources.iter().map(|s| s.saved).sum()
    }

    pub fn total_lost(&self) -> u64 {
        self.sources.iter().map(SourceStats::lost).sum()
    }
}

/// Queue monitor task and the sources it watches
struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
    sources: usize,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    monitor_interval: Duration,
    store: Arc<dyn FrameStore>,
    shutdown: CancellationToken,
    pending: Vec<SourcePipeline>,
    running: Vec<SourcePipeline>,
    monitor: Option<Monitor>,
}

impl Orchestrator {
    pub fn new(config: &Config) -> Self {
        Self::with_store(config, Arc::new(BinFileStore))
    }

    pub fn with_store(config: &Config, store: Arc<dyn FrameStore>) -> Self {
        Self {
            settings: PipelineSettings::from_config(config),
            monitor_interval: Duration::from_millis(config.monitor.interval_ms),
            store,
            shutdown: CancellationToken::new(),
            pending: Vec::new(),
            running: Vec::new(),
            monitor: None,
        }
    }

    /// Cancelling this token stops every capture loop and preview task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn add_source(&mut self, config: SourceConfig, source: Box<dyn FrameSource>) {
        self.pending.push(SourcePipeline::new(
            config,
            source,
            self.settings.clone(),
            self.store.clone(),
            self.shutdown.clone(),
        ));
    }

    /// Open and start every added source.
    ///
    /// A source that fails is logged and left out; the others carry on.
    /// Returns the names of the sources now acquiring.
    #[instrument(skip(self))]
    pub async fn start_all(&mut self) -> Vec<String> {
        for mut pipeline in std::mem::take(&mut self.pending) {
            if let Err(e) = pipeline.open() {
                error!("Excluding {}: {}", pipeline.name(), e);
                continue;
            }
            if let Err(e) = pipeline.start_acquisition() {
                error!("Excluding {}: {}", pipeline.name(), e);
                let (_, result) = pipeline.finish().await;
                if let Err(e) = result {
                    error!("{}", e);
                }
                continue;
            }
            self.running.push(pipeline);
        }

        // Restart the monitor so it covers sources added since the last call
        if !self.monitor_interval.is_zero() && self.monitored_sources() != self.running.len() {
            self.stop_monitor().await;
            self.spawn_monitor();
        }

        let names: Vec<String> = self.running.iter().map(|p| p.name().to_owned()).collect();
        info!("Acquiring from {} sources: {:?}", names.len(), names);
        names
    }

    fn spawn_monitor(&mut self) {
        let queues: Vec<Arc<PersistenceQueue>> =
            self.running.iter().filter_map(SourcePipeline::queue).collect();
        let token = self.shutdown.child_token();
        let sources = queues.len();
        let handle = tokio::spawn(monitor_queues(queues, self.monitor_interval, token.clone()));
        self.monitor = Some(Monitor {
            token,
            handle,
            sources,
        });
    }

    async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.token.cancel();
            if let Err(e) = monitor.handle.await {
                warn!("Queue monitor failed: {}", e);
            }
        }
    }

    /// Number of save queues the monitor is watching.
    pub fn monitored_sources(&self) -> usize {
        self.monitor.as_ref().map_or(0, |m| m.sources)
    }

    /// Stop every capture loop, close every source, then drain every save
    /// queue to disk before returning.
    #[instrument(skip(self))]
    pub async fn stop_all(&mut self) -> AcquisitionReport {
        let mut report = AcquisitionReport::default();

        self.stop_monitor().await;

        // Signal everyone first so the loops wind down in parallel
        for pipeline in &self.running {
            pipeline.signal_stop();
        }
        for pipeline in &mut self.running {
            if let Err(e) = pipeline.close().await {
                error!("{}", e);
                report.errors.push(e.to_string());
            }
        }

        for pipeline in self.running.drain(..) {
            let (stats, result) = pipeline.finish().await;
            if let Err(e) = result {
                error!("{}", e);
                report.errors.push(e.to_string());
            }
            info!(
                "{}: retrieved {}, saved {}, lost {} (queue drops {}, disk errors {})",
                stats.source,
                stats.retrieved,
                stats.saved,
                stats.lost(),
                stats.queue_drops,
                stats.disk_errors
            );
            report.sources.push(stats);
        }

        report
    }

    /// Wait for Ctrl-C or the shutdown token, then `stop_all`.
    pub async fn run_until_shutdown(&mut self) -> AcquisitionReport {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupt received, stopping acquisition"),
                    Err(e) => error!("Cannot listen for interrupt: {}", e),
                }
                self.shutdown.cancel();
            }
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }
        self.stop_all().await
    }

    pub fn stats(&self) -> Vec<SourceStats> {
        self.running.iter().map(SourcePipeline::stats).collect()
    }

    pub fn preview(&self, source: &str) -> Option<Arc<LatestFrame>> {
        self.running
            .iter()
            .find(|p| p.name() == source)
            .map(SourcePipeline::latest_preview)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(monitor) = &self.monitor {
            monitor.token.cancel();
        }
    }
}

/// Periodically log queue depth and warn when a queue started dropping.
async fn monitor_queues(
    queues: Vec<Arc<PersistenceQueue>>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut last_dropped: HashMap<String, u64> = HashMap::new();
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for queue in &queues {
            let depth = queue.len();
            let dropped = queue.dropped();
            metrics::gauge!("multicap_queue_depth", "source" => queue.source().to_owned())
                .set(depth as f64);

            let previous = last_dropped.insert(queue.source().to_owned(), dropped).unwrap_or(0);
            if dropped > previous {
                warn!(
                    "{}: save queue {}/{}, {} frames dropped since last check; disk is not keeping up",
                    queue.source(),
                    depth,
                    queue.capacity(),
                    dropped - previous
                );
            } else {
                info!("{}: save queue {}/{}", queue.source(), depth, queue.capacity());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SimulatedConfig, SimulatedSource};

    fn source(frames: u64) -> Box<dyn FrameSource> {
        Box::new(SimulatedSource::new(SimulatedConfig {
            width: 2,
            height: 2,
            fps: 0,
            frame_count: Some(frames),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn monitor_follows_late_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.persistence.save_root = dir.path().to_path_buf();
        config.capture.retrieve_timeout_ms = 10;
        config.monitor.interval_ms = 50;

        let mut orchestrator = Orchestrator::new(&config);
        orchestrator.add_source(SourceConfig::named("Source0"), source(3));
        orchestrator.start_all().await;
        assert_eq!(orchestrator.monitored_sources(), 1);

        orchestrator.add_source(SourceConfig::named("Source1"), source(3));
        let started = orchestrator.start_all().await;
        assert_eq!(started, vec!["Source0", "Source1"]);
        assert_eq!(orchestrator.monitored_sources(), 2);

        let report = orchestrator.stop_all().await;
        assert_eq!(orchestrator.monitored_sources(), 0);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }

    #[tokio::test]
    async fn disabled_monitor_is_never_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.persistence.save_root = dir.path().to_path_buf();
        config.capture.retrieve_timeout_ms = 10;
        config.monitor.interval_ms = 0;

        let mut orchestrator = Orchestrator::new(&config);
        orchestrator.add_source(SourceConfig::named("Source0"), source(3));
        orchestrator.start_all().await;
        assert_eq!(orchestrator.monitored_sources(), 0);
        orchestrator.stop_all().await;
    }
}
