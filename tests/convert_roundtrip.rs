//! Recorded frames come back out of the converter pixel-for-pixel

use std::path::Path;

use bytes::Bytes;
use multicap::capture::{Frame, PixelFormat};
use multicap::convert::convert_directory;
use multicap::pipeline::{BinFileStore, FrameStore, MetadataLog, MetadataRecord};

fn record(dir: &Path, log: &MetadataLog, seq: u64, frame: &Frame) {
    let filename = BinFileStore.write_payload(dir, frame).unwrap();
    let flushed = log.commit(seq, Some(MetadataRecord::for_frame(frame, filename)));
    assert_eq!(flushed.written, 1);
}

fn frame(block_id: u64, width: u32, height: u32, format: PixelFormat, payload: Vec<u8>) -> Frame {
    Frame {
        source_id: "Source0".into(),
        block_id,
        timestamp: 1_700_000_000_000 + block_id,
        width,
        height,
        pixel_format: format,
        payload: Bytes::from(payload),
    }
}

#[test]
fn mono8_survives_record_and_convert() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let log = MetadataLog::open(input.path()).unwrap();

    // Odd width exercises BMP row padding
    let (width, height) = (5u32, 3u32);
    let payload: Vec<u8> = (0..width * height).map(|i| (i * 17) as u8).collect();
    let mono = frame(0, width, height, PixelFormat::Mono8, payload.clone());
    record(input.path(), &log, 0, &mono);

    let report = convert_directory(input.path(), output.path(), 1).unwrap();
    assert_eq!(report.converted, 1);
    assert!(report.errors.is_empty());

    let bmp = output.path().join(Path::new(&mono.file_name()).with_extension("bmp"));
    let image = image::open(&bmp).unwrap().to_rgb8();
    assert_eq!(image.dimensions(), (width, height));
    for (i, pixel) in image.pixels().enumerate() {
        assert_eq!(pixel.0, [payload[i]; 3], "pixel {i}");
    }
}

#[test]
fn rgb8_and_bayer_convert_alongside_failures() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let log = MetadataLog::open(input.path()).unwrap();

    let rgb: Vec<u8> = (0..2 * 2 * 3).map(|i| i as u8 * 20).collect();
    record(input.path(), &log, 0, &frame(0, 2, 2, PixelFormat::Rgb8, rgb.clone()));
    record(
        input.path(),
        &log,
        1,
        &frame(1, 2, 2, PixelFormat::BayerRg8, vec![200, 100, 50, 10]),
    );
    // Payload shorter than the metadata claims
    record(input.path(), &log, 2, &frame(2, 4, 4, PixelFormat::Mono8, vec![0; 4]));

    let report = convert_directory(input.path(), output.path(), 3).unwrap();
    assert_eq!(report.converted, 2);
    assert_eq!(report.errors.len(), 1);

    let rgb_image = image::open(output.path().join("frame_0_1700000000000.bmp"))
        .unwrap()
        .to_rgb8();
    assert_eq!(rgb_image.into_raw(), rgb);

    let bayer_image = image::open(output.path().join("frame_1_1700000000001.bmp"))
        .unwrap()
        .to_rgb8();
    assert!(bayer_image.pixels().all(|p| p.0 == [200, 75, 10]));
}
