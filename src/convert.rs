//! Batch conversion of recorded `.bin` payloads into BMP images
//!
//! Reads a source directory's `metadata.csv`, decodes every listed payload by
//! its pixel type and writes `<output>/<frame name>.bmp`. Failures are
//! reported per frame and never stop the batch.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::ImageFormat;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::decode::decode_frame;
use crate::capture::PixelFormat;
use crate::error::ConvertError;
use crate::pipeline::metadata::{MetadataRecord, METADATA_FILE};

/// One frame to convert
#[derive(Debug, Clone)]
pub struct ConversionTask {
    pub bin_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub output_path: PathBuf,
}

impl ConversionTask {
    fn from_record(record: &MetadataRecord, input: &Path, output: &Path) -> Self {
        let image_name = Path::new(&record.filename).with_extension("bmp");
        Self {
            bin_path: input.join(&record.filename),
            width: record.width,
            height: record.height,
            pixel_format: PixelFormat::from_code(record.pixel_type),
            output_path: output.join(image_name),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionReport {
    pub converted: usize,
    /// Metadata rows that could not be parsed
    pub malformed_rows: usize,
    pub errors: Vec<String>,
}

/// Parse `metadata.csv` under `input` into conversion tasks.
pub fn load_tasks(
    input: &Path,
    output: &Path,
) -> Result<(Vec<ConversionTask>, usize), ConvertError> {
    let path = input.join(METADATA_FILE);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(&path)
        .map_err(|source| ConvertError::Metadata {
            path: path.clone(),
            source,
        })?;

    let mut tasks = Vec::new();
    let mut malformed = 0;
    for row in reader.deserialize::<MetadataRecord>() {
        match row {
            Ok(record) => tasks.push(ConversionTask::from_record(&record, input, output)),
            Err(e) => {
                debug!("Skipping metadata row: {}", e);
                malformed += 1;
            }
        }
    }
    Ok((tasks, malformed))
}

pub fn convert_one(task: &ConversionTask) -> Result<(), ConvertError> {
    let raw = fs::read(&task.bin_path).map_err(|source| ConvertError::Io {
        path: task.bin_path.clone(),
        source,
    })?;

    let image = decode_frame(&raw, task.width, task.height, task.pixel_format)?;
    image
        .save_with_format(&task.output_path, ImageFormat::Bmp)
        .map_err(|source| ConvertError::Image {
            path: task.output_path.clone(),
            source,
        })
}

/// Convert every frame listed in `input/metadata.csv`, spread over `threads`.
pub fn convert_directory(
    input: &Path,
    output: &Path,
    threads: usize,
) -> Result<ConversionReport, ConvertError> {
    fs::create_dir_all(output).map_err(|source| ConvertError::Io {
        path: output.to_path_buf(),
        source,
    })?;

    let (tasks, malformed_rows) = load_tasks(input, output)?;
    info!("Found {} frames in {}", tasks.len(), input.display());

    let mut report = ConversionReport {
        malformed_rows,
        ..Default::default()
    };
    if tasks.is_empty() {
        return Ok(report);
    }

    let started = Instant::now();
    let chunk_size = tasks.len().div_ceil(threads.max(1));
    let outcomes = crossbeam::scope(|scope| {
        let handles: Vec<_> = tasks
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move |_| convert_chunk(chunk)))
            .collect();
        handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
    });

    match outcomes {
        Ok(chunks) => {
            for chunk in chunks {
                match chunk {
                    Ok((converted, errors)) => {
                        report.converted += converted;
                        report.errors.extend(errors);
                    }
                    Err(_) => report.errors.push("conversion worker panicked".into()),
                }
            }
        }
        Err(_) => report.errors.push("conversion workers panicked".into()),
    }

    info!(
        "Conversion finished in {:.2}s: {} converted, {} errors",
        started.elapsed().as_secs_f64(),
        report.converted,
        report.errors.len()
    );
    Ok(report)
}

fn convert_chunk(chunk: &[ConversionTask]) -> (usize, Vec<String>) {
    let mut converted = 0;
    let mut errors = Vec::new();
    for task in chunk {
        match convert_one(task) {
            Ok(()) => converted += 1,
            Err(e) => {
                warn!("{}", e);
                errors.push(e.to_string());
            }
        }
    }
    (converted, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{PFNC_BAYER_RG8, PFNC_MONO8};

    fn write_metadata(dir: &Path, rows: &[&str]) {
        let mut text = String::from("block_id,timestamp,width,height,pixel_type,payload_size,filename\n");
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        fs::write(dir.join(METADATA_FILE), text).unwrap();
    }

    #[test]
    fn malformed_rows_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(
            dir.path(),
            &[
                &format!("0,10,2,2,{PFNC_MONO8},4,frame_0_10.bin"),
                "garbage",
                "1,11,two,2,1,4,frame_1_11.bin",
            ],
        );
        let (tasks, malformed) = load_tasks(dir.path(), Path::new("out")).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(malformed, 2);
        assert_eq!(tasks[0].output_path, Path::new("out/frame_0_10.bmp"));
    }

    #[test]
    fn mixed_batch_reports_per_frame_errors() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();

        fs::write(input.path().join("frame_0_1.bin"), [1u8; 16]).unwrap();
        fs::write(input.path().join("frame_1_2.bin"), [2u8; 16]).unwrap();
        fs::write(input.path().join("frame_2_3.bin"), [3u8; 16]).unwrap();
        write_metadata(
            input.path(),
            &[
                &format!("0,1,4,4,{PFNC_MONO8},16,frame_0_1.bin"),
                &format!("1,2,4,4,{PFNC_BAYER_RG8},16,frame_1_2.bin"),
                "2,3,4,4,17825797,16,frame_2_3.bin",
                &format!("3,4,4,4,{PFNC_MONO8},16,frame_3_4.bin"),
            ],
        );

        let report = convert_directory(input.path(), output.path(), 2).unwrap();
        assert_eq!(report.converted, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .contains(&"Unsupported pixel type: 17825797".to_string()));
        assert!(output.path().join("frame_0_1.bmp").exists());
        assert!(output.path().join("frame_1_2.bmp").exists());
        assert!(!output.path().join("frame_2_3.bmp").exists());
    }

    #[test]
    fn missing_metadata_is_an_error() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        assert!(matches!(
            convert_directory(input.path(), output.path(), 1),
            Err(ConvertError::Metadata { .. })
        ));
    }
}
