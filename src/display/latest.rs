use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::trace;

use super::PreviewSink;
use crate::pipeline::preview::PreviewImage;

/// Keeps the most recent preview image of one source; read with `latest()`.
#[derive(Default)]
pub struct LatestFrame {
    latest: ArcSwapOption<PreviewImage>,
}

impl LatestFrame {
    pub fn latest(&self) -> Option<Arc<PreviewImage>> {
        self.latest.load_full()
    }
}

impl PreviewSink for LatestFrame {
    fn render(&self, image: PreviewImage) {
        trace!("{}: preview block {}", image.source_id, image.block_id);
        self.latest.store(Some(Arc::new(image)));
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GrayImage};

    use super::*;

    #[test]
    fn keeps_only_the_newest() {
        let sink = LatestFrame::default();
        assert!(sink.latest().is_none());
        for block_id in 0..3 {
            sink.render(PreviewImage {
                source_id: "Source0".into(),
                block_id,
                image: DynamicImage::ImageLuma8(GrayImage::new(2, 2)),
            });
        }
        assert_eq!(sink.latest().unwrap().block_id, 2);
    }
}
