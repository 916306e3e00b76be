//! Pixel format conversion for preview and archival export

use image::{DynamicImage, GrayImage, RgbImage};

use super::frame::PixelFormat;
use crate::error::DecodeError;

/// Turn a raw payload into an image the preview and export paths can use.
///
/// Mono8 becomes 8-bit grayscale, BayerRG8 is demosaiced to RGB and RGB8 is
/// passed through. Payloads longer than the image are truncated, shorter ones
/// are rejected.
pub fn decode_frame(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<DynamicImage, DecodeError> {
    let expected = format
        .frame_len(width, height)
        .ok_or(DecodeError::UnsupportedPixelFormat(format.code()))?;
    if data.len() < expected {
        return Err(DecodeError::SizeMismatch {
            width,
            height,
            format,
            expected,
            actual: data.len(),
        });
    }
    let data = &data[..expected];

    let image = match format {
        PixelFormat::Mono8 => {
            GrayImage::from_raw(width, height, data.to_vec()).map(DynamicImage::ImageLuma8)
        }
        PixelFormat::BayerRg8 => {
            RgbImage::from_raw(width, height, demosaic_rggb(data, width, height))
                .map(DynamicImage::ImageRgb8)
        }
        PixelFormat::Rgb8 => {
            RgbImage::from_raw(width, height, data.to_vec()).map(DynamicImage::ImageRgb8)
        }
        PixelFormat::Unsupported(code) => return Err(DecodeError::UnsupportedPixelFormat(code)),
    };

    // from_raw only fails on a short buffer, which was checked above
    image.ok_or(DecodeError::SizeMismatch {
        width,
        height,
        format,
        expected,
        actual: data.len(),
    })
}

/// RGGB 2x2 block demosaic.
///
/// Every pixel takes red and blue from its block and the mean of the block's
/// two greens. Odd edges reuse the last row/column.
fn demosaic_rggb(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let at = |x: usize, y: usize| raw[y.min(h - 1) * w + x.min(w - 1)];

    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        let by = y & !1;
        for x in 0..w {
            let bx = x & !1;
            let r = at(bx, by);
            let g = ((at(bx + 1, by) as u16 + at(bx, by + 1) as u16) / 2) as u8;
            let b = at(bx + 1, by + 1);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono8_passes_through() {
        let data: Vec<u8> = (0..12).collect();
        let image = decode_frame(&data, 4, 3, PixelFormat::Mono8).unwrap();
        let gray = image.as_luma8().unwrap();
        assert_eq!(gray.dimensions(), (4, 3));
        assert_eq!(gray.as_raw(), &data);
    }

    #[test]
    fn bayer_block_is_demosaiced() {
        // R G
        // G B
        let data = [200, 100, 50, 10];
        let image = decode_frame(&data, 2, 2, PixelFormat::BayerRg8).unwrap();
        let rgb = image.as_rgb8().unwrap();
        for pixel in rgb.pixels() {
            assert_eq!(pixel.0, [200, 75, 10]);
        }
    }

    #[test]
    fn odd_bayer_dimensions_do_not_panic() {
        let data = vec![7u8; 3 * 3];
        let image = decode_frame(&data, 3, 3, PixelFormat::BayerRg8).unwrap();
        assert_eq!(image.as_rgb8().unwrap().dimensions(), (3, 3));
    }

    #[test]
    fn short_payload_is_rejected() {
        let err = decode_frame(&[0; 5], 4, 4, PixelFormat::Mono8).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::SizeMismatch {
                expected: 16,
                actual: 5,
                ..
            }
        ));
    }

    #[test]
    fn unsupported_format_reports_code() {
        let err = decode_frame(&[0; 16], 4, 4, PixelFormat::Unsupported(0x0110_0003)).unwrap_err();
        assert_eq!(err.to_string(), format!("Unsupported pixel type: {}", 0x0110_0003));
    }
}
