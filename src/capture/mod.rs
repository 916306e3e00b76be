pub mod copier;
pub mod decode;
pub mod frame;
pub mod simulated;
pub mod source;

pub use copier::FrameCopier;
pub use frame::{Frame, FrameInfo, PixelFormat};
pub use simulated::{SimulatedConfig, SimulatedSource};
pub use source::{BufferLease, FrameSource, StreamInfo};
