//! Convert a recorded source directory into BMP images

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};

use multicap::{convert, utils};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Directory holding metadata.csv and the .bin payloads
    input: PathBuf,

    /// Where the .bmp files go
    output: PathBuf,

    /// Conversion threads (defaults to available parallelism)
    #[arg(short, long)]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    utils::init_tracing("multicap=info");

    let args = Args::parse();
    let threads = args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    let report = convert::convert_directory(&args.input, &args.output, threads)?;
    info!(
        "{} frames converted, {} errors, {} malformed metadata rows",
        report.converted,
        report.errors.len(),
        report.malformed_rows
    );
    for error in report.errors.iter().take(5) {
        warn!("{}", error);
    }
    Ok(())
}
