use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// PFNC code for 8-bit monochrome.
pub const PFNC_MONO8: u32 = 0x0108_0001;
/// PFNC code for 8-bit Bayer RGGB.
pub const PFNC_BAYER_RG8: u32 = 0x0108_0009;
/// PFNC code for packed 8-bit RGB.
pub const PFNC_RGB8: u32 = 0x0218_0014;

/// Owned frame, detached from the source's buffer pool.
///
/// The payload is reference counted so the preview path can look at the same
/// bytes the persistence path writes without a second copy.
#[derive(Debug, Clone)]
pub struct Frame {
    pub source_id: String,
    pub block_id: u64,
    /// Wall-clock milliseconds since the UNIX epoch, taken at copy time
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub payload: Bytes,
}

impl Frame {
    /// File name the payload is persisted under.
    pub fn file_name(&self) -> String {
        format!("frame_{}_{}.bin", self.block_id, self.timestamp)
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// Metadata the source reports for a retrieved buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub block_id: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// Pixel formats the pipeline knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum PixelFormat {
    Mono8,
    BayerRg8,
    Rgb8,
    /// Anything else; the raw code is kept so metadata stays faithful
    Unsupported(u32),
}

impl PixelFormat {
    pub fn from_code(code: u32) -> Self {
        match code {
            PFNC_MONO8 => PixelFormat::Mono8,
            PFNC_BAYER_RG8 => PixelFormat::BayerRg8,
            PFNC_RGB8 => PixelFormat::Rgb8,
            other => PixelFormat::Unsupported(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            PixelFormat::Mono8 => PFNC_MONO8,
            PixelFormat::BayerRg8 => PFNC_BAYER_RG8,
            PixelFormat::Rgb8 => PFNC_RGB8,
            PixelFormat::Unsupported(code) => code,
        }
    }

    /// Bytes per pixel, `None` for formats we cannot size.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerRg8 => Some(1),
            PixelFormat::Rgb8 => Some(3),
            PixelFormat::Unsupported(_) => None,
        }
    }

    /// Expected payload length for a `width` x `height` image.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        self.bytes_per_pixel()
            .map(|bpp| width as usize * height as usize * bpp)
    }
}

impl From<u32> for PixelFormat {
    fn from(code: u32) -> Self {
        PixelFormat::from_code(code)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.code()
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Mono8 => write!(f, "Mono8"),
            PixelFormat::BayerRg8 => write!(f, "BayerRG8"),
            PixelFormat::Rgb8 => write!(f, "RGB8"),
            PixelFormat::Unsupported(code) => write!(f, "0x{code:08x}"),
        }
    }
}
