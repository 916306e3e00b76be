//! The frame source capability consumed by the pipeline

use std::time::Duration;

use crate::capture::frame::FrameInfo;
use crate::error::{OpenError, RetrieveError};
use crate::SourceConfig;

/// Stream parameters agreed with the device when the source opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub channel: u32,
    pub payload_size: usize,
    pub buffer_count: u32,
}

/// A retrieved buffer still owned by the source's pool.
///
/// Not `Clone`: the only way to give it back is `FrameSource::release`, which
/// consumes it, so a buffer is released exactly once and cannot be read after.
#[derive(Debug)]
pub struct BufferLease {
    slot: usize,
    info: FrameInfo,
}

impl BufferLease {
    /// Called by source implementations when handing out pool slot `slot`.
    pub fn new(slot: usize, info: FrameInfo) -> Self {
        Self { slot, info }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }
}

/// One logical camera source with a recycled buffer pool.
///
/// `retrieve` blocks for at most `timeout`. Every lease it returns must come
/// back through `release` before the pool can reuse the slot.
pub trait FrameSource: Send {
    fn open(&mut self, config: &SourceConfig) -> Result<StreamInfo, OpenError>;

    fn retrieve(&mut self, timeout: Duration) -> Result<BufferLease, RetrieveError>;

    /// Payload bytes behind a lease that has not been released yet.
    fn payload(&self, lease: &BufferLease) -> &[u8];

    fn release(&mut self, lease: BufferLease);

    fn close(&mut self);
}
