use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::capture::frame::Frame;
use crate::capture::source::{BufferLease, FrameSource};
use crate::error::CopyError;

/// Deep-copies leased buffers into owned frames for one source.
#[derive(Debug, Clone)]
pub struct FrameCopier {
    source_id: String,
}

impl FrameCopier {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }

    /// Copy payload and metadata out of `lease`.
    ///
    /// The returned frame holds no reference into the source pool, so the
    /// caller may release the lease as soon as this returns.
    pub fn copy<S>(&self, source: &S, lease: &BufferLease) -> Result<Frame, CopyError>
    where
        S: FrameSource + ?Sized,
    {
        let borrowed = source.payload(lease);

        let mut data = Vec::new();
        data.try_reserve_exact(borrowed.len())
            .map_err(|_| CopyError::OutOfMemory {
                bytes: borrowed.len(),
            })?;
        data.extend_from_slice(borrowed);

        let info = lease.info();
        Ok(Frame {
            source_id: self.source_id.clone(),
            block_id: info.block_id,
            timestamp: unix_millis(),
            width: info.width,
            height: info.height,
            pixel_format: info.pixel_format,
            payload: Bytes::from(data),
        })
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
