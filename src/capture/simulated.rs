//! In-process frame source with a recycled buffer pool
//!
//! Behaves like a vendor stream: a fixed number of receive buffers, frames
//! paced at a soft frame rate, and retrieve calls that time out when nothing is
//! due or every buffer is still leased out.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::frame::{FrameInfo, PixelFormat};
use crate::capture::source::{BufferLease, FrameSource, StreamInfo};
use crate::error::{OpenError, RetrieveError};
use crate::SourceConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
    /// Soft pacing; 0 produces frames as fast as they are retrieved
    pub fps: u32,
    /// Stop producing after this many frames
    pub frame_count: Option<u64>,
    /// Overwrite released buffers with this byte
    pub fill_on_release: Option<u8>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Mono8,
            buffer_count: 64,
            fps: 30,
            frame_count: None,
            fill_on_release: None,
        }
    }
}

pub struct SimulatedSource {
    config: SimulatedConfig,
    buffers: Vec<Vec<u8>>,
    leased: Vec<bool>,
    frame_len: usize,
    next_block: u64,
    next_due: Instant,
    open: bool,
}

impl SimulatedSource {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            buffers: Vec::new(),
            leased: Vec::new(),
            frame_len: 0,
            next_block: 0,
            next_due: Instant::now(),
            open: false,
        }
    }

    /// Number of buffers currently leased out.
    pub fn outstanding(&self) -> usize {
        self.leased.iter().filter(|&&l| l).count()
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.config.fps > 0).then(|| Duration::from_secs_f64(1.0 / self.config.fps as f64))
    }

    fn exhausted(&self) -> bool {
        self.config
            .frame_count
            .is_some_and(|count| self.next_block >= count)
    }

    fn fill(&mut self, slot: usize, block_id: u64) {
        let width = self.config.width as usize;
        let buffer = &mut self.buffers[slot];
        match self.config.pixel_format {
            // Row gradient offset by block id so Bayer previews show structure
            PixelFormat::BayerRg8 => {
                for (i, byte) in buffer.iter_mut().enumerate() {
                    let row = i / width.max(1);
                    *byte = (block_id as u8).wrapping_add(row as u8);
                }
            }
            _ => buffer.fill(block_id as u8),
        }
    }
}

impl FrameSource for SimulatedSource {
    fn open(&mut self, config: &SourceConfig) -> Result<StreamInfo, OpenError> {
        if self.config.buffer_count == 0 {
            return Err(OpenError::BufferAllocation("buffer count is zero".into()));
        }

        let frame_len = self
            .config
            .pixel_format
            .frame_len(self.config.width, self.config.height)
            .unwrap_or(self.config.width as usize * self.config.height as usize);

        let mut buffers = Vec::with_capacity(self.config.buffer_count as usize);
        for _ in 0..self.config.buffer_count {
            let mut buf = Vec::new();
            buf.try_reserve_exact(frame_len).map_err(|e| {
                OpenError::BufferAllocation(format!("{} bytes: {e}", frame_len))
            })?;
            buf.resize(frame_len, 0);
            buffers.push(buf);
        }

        self.leased = vec![false; buffers.len()];
        self.buffers = buffers;
        self.frame_len = frame_len;
        self.next_due = Instant::now();
        self.open = true;

        info!(
            "Simulated source {} open: {}x{} {} with {} buffers",
            config.name,
            self.config.width,
            self.config.height,
            self.config.pixel_format,
            self.config.buffer_count
        );

        Ok(StreamInfo {
            channel: config.channel.unwrap_or(0),
            payload_size: frame_len,
            buffer_count: self.config.buffer_count,
        })
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<BufferLease, RetrieveError> {
        if !self.open {
            return Err(RetrieveError::Failed("stream not open".into()));
        }

        if self.exhausted() {
            thread::sleep(timeout);
            return Err(RetrieveError::Timeout);
        }

        let Some(slot) = self.leased.iter().position(|&l| !l) else {
            debug!("All {} buffers leased, pool starved", self.leased.len());
            thread::sleep(timeout);
            return Err(RetrieveError::Timeout);
        };

        if let Some(interval) = self.frame_interval() {
            let now = Instant::now();
            if self.next_due > now {
                let wait = self.next_due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Err(RetrieveError::Timeout);
                }
                thread::sleep(wait);
            }
            self.next_due = self.next_due.max(now) + interval;
        }

        let block_id = self.next_block;
        self.next_block += 1;
        self.fill(slot, block_id);
        self.leased[slot] = true;

        Ok(BufferLease::new(
            slot,
            FrameInfo {
                block_id,
                width: self.config.width,
                height: self.config.height,
                pixel_format: self.config.pixel_format,
            },
        ))
    }

    fn payload(&self, lease: &BufferLease) -> &[u8] {
        &self.buffers[lease.slot()][..self.frame_len]
    }

    fn release(&mut self, lease: BufferLease) {
        let slot = lease.slot();
        self.leased[slot] = false;
        if let Some(sentinel) = self.config.fill_on_release {
            self.buffers[slot].fill(sentinel);
        }
    }

    fn close(&mut self) {
        self.open = false;
        self.buffers.clear();
        self.leased.clear();
    }
}
