//! multicap: record several frame sources to disk with a decimated live preview

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use multicap::{utils, Config, Orchestrator, SimulatedSource, SourceConfig};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    duration: Option<u64>,

    /// Override persistence.save_root
    #[arg(short, long)]
    save_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    utils::init_tracing("multicap=info");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(root) = args.save_root {
        config.persistence.save_root = root;
    }
    if config.sources.is_empty() {
        warn!("No sources configured, using three simulated sources");
        config.sources = (0..3)
            .map(|i| SourceConfig::named(format!("Source{i}")))
            .collect();
    }

    info!(
        "multicap launching: {} sources, queue {}, {} workers each, preview every {} frames",
        config.sources.len(),
        config.persistence.queue_capacity,
        config.persistence.workers,
        config.preview.interval
    );

    let mut orchestrator = Orchestrator::new(&config);
    for source in &config.sources {
        orchestrator.add_source(
            source.clone(),
            Box::new(SimulatedSource::new(source.simulated.clone())),
        );
    }

    let started = orchestrator.start_all().await;
    if started.is_empty() {
        return Err(eyre!("No source could be started"));
    }

    if let Some(secs) = args.duration {
        let shutdown = orchestrator.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            shutdown.cancel();
        });
    }

    let report = orchestrator.run_until_shutdown().await;
    for stats in &report.sources {
        info!(
            "{}: {} saved, {} dropped, {} disk errors, {} previews",
            stats.source, stats.saved, stats.queue_drops, stats.disk_errors, stats.preview_rendered
        );
    }
    for error in &report.errors {
        warn!("{}", error);
    }

    info!(
        "multicap shutting down: {} frames saved, {} lost",
        report.total_saved(),
        report.total_lost()
    );
    Ok(())
}
