//! Preview rendering seam
//!
//! Rendering itself belongs to the host UI. Sinks receive decimated, already
//! converted images from each source's preview task.

pub mod latest;

pub use latest::LatestFrame;

use crate::pipeline::preview::PreviewImage;

pub trait PreviewSink: Send + Sync {
    fn render(&self, image: PreviewImage);
}
