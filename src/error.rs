//! Error kinds for acquisition, persistence and conversion

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capture::PixelFormat;
use crate::pipeline::PipelineState;

/// Failure to bring a source up. Fatal to that source only.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("stream channel negotiation failed: {0}")]
    ChannelNegotiation(String),
    #[error("receive buffer allocation failed: {0}")]
    BufferAllocation(String),
    #[error("cannot prepare save directory {path}: {source}")]
    SaveDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of a failed `FrameSource::retrieve`.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// Transient, the capture loop retries
    #[error("retrieve timed out")]
    Timeout,
    /// Fatal to the source
    #[error("retrieve failed: {0}")]
    Failed(String),
}

impl RetrieveError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RetrieveError::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("out of memory copying {bytes} byte payload")]
    OutOfMemory { bytes: usize },
}

/// Non-blocking enqueue found the queue at capacity; the frame was dropped.
#[derive(Debug, Error)]
#[error("persistence queue full (capacity {capacity}), dropped block {block_id}")]
pub struct QueueFull {
    pub capacity: usize,
    pub block_id: u64,
}

/// A payload could not be turned into a displayable image.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported pixel type: {0}")]
    UnsupportedPixelFormat(u32),
    #[error("payload of {actual} bytes does not match {width}x{height} {format} ({expected} expected)")]
    SizeMismatch {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source {source_id}: {error}")]
    Open {
        source_id: String,
        #[source]
        error: OpenError,
    },
    #[error("source {source_id}: {error}")]
    Retrieve {
        source_id: String,
        #[source]
        error: RetrieveError,
    },
    #[error("source {source_id}: cannot {operation} while {state:?}")]
    InvalidState {
        source_id: String,
        operation: &'static str,
        state: PipelineState,
    },
    #[error("metadata log {path}: {source}")]
    MetadataLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("source {source_id}: task failed: {message}")]
    Join { source_id: String, message: String },
}

/// Per-frame failures of the batch converter.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Error processing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Error encoding {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("metadata {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
