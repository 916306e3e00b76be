//! Append-only per-source metadata log

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capture::Frame;

pub const METADATA_FILE: &str = "metadata.csv";

pub const METADATA_HEADER: [&str; 7] = [
    "block_id",
    "timestamp",
    "width",
    "height",
    "pixel_type",
    "payload_size",
    "filename",
];

/// One row of `metadata.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub block_id: u64,
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    /// PFNC pixel format code
    pub pixel_type: u32,
    pub payload_size: usize,
    pub filename: String,
}

impl MetadataRecord {
    pub fn for_frame(frame: &Frame, filename: impl Into<String>) -> Self {
        Self {
            block_id: frame.block_id,
            timestamp: frame.timestamp,
            width: frame.width,
            height: frame.height,
            pixel_type: frame.pixel_format.code(),
            payload_size: frame.payload_size(),
            filename: filename.into(),
        }
    }
}

/// What one commit or flush put on disk
#[derive(Debug, Default)]
pub struct Flushed {
    /// Rows appended to the log
    pub written: u64,
    /// Block ids whose rows could not be appended
    pub failed: Vec<(u64, io::Error)>,
}

struct LogState {
    out: Box<dyn Write + Send>,
    next_seq: u64,
    /// Out-of-order commits; `None` marks a frame that failed to save
    pending: BTreeMap<u64, Option<MetadataRecord>>,
    rows: u64,
}

/// One CSV line, fully encoded before it touches the sink
fn encode_row<T: Serialize>(row: &T) -> io::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.serialize(row)?;
    writer.into_inner().map_err(|e| e.into_error())
}

impl LogState {
    fn append(&mut self, record: &MetadataRecord) -> io::Result<()> {
        let line = encode_row(record)?;
        self.out.write_all(&line)?;
        // One flush per row keeps every line whole on disk
        self.out.flush()?;
        self.rows += 1;
        Ok(())
    }

    fn append_into(&mut self, record: &MetadataRecord, flushed: &mut Flushed) {
        match self.append(record) {
            Ok(()) => flushed.written += 1,
            Err(e) => flushed.failed.push((record.block_id, e)),
        }
    }

    fn write_ready(&mut self) -> Flushed {
        let mut flushed = Flushed::default();
        while let Some(entry) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            if let Some(record) = entry {
                self.append_into(&record, &mut flushed);
            }
        }
        flushed
    }
}

/// Writes rows in queue sequence order no matter which worker finishes first.
pub struct MetadataLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl MetadataLog {
    /// Open `<dir>/metadata.csv` for appending, writing the header if the
    /// file is new or empty.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let path = dir.join(METADATA_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let write_header = file.metadata()?.len() == 0;
        Self::with_writer(path, file, write_header)
    }

    /// Log into any sink; `path` is only used for reporting.
    pub fn with_writer(
        path: impl Into<PathBuf>,
        out: impl Write + Send + 'static,
        write_header: bool,
    ) -> io::Result<Self> {
        let mut out: Box<dyn Write + Send> = Box::new(out);
        if write_header {
            out.write_all(&encode_row(&METADATA_HEADER)?)?;
            out.flush()?;
        }

        Ok(Self {
            path: path.into(),
            state: Mutex::new(LogState {
                out,
                next_seq: 0,
                pending: BTreeMap::new(),
                rows: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the outcome for queue sequence `seq` and write every row that
    /// is now in order.
    ///
    /// `None` means the frame was lost; it leaves no row but unblocks the
    /// frames queued after it. The returned rows may belong to earlier
    /// sequence numbers.
    pub fn commit(&self, seq: u64, record: Option<MetadataRecord>) -> Flushed {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.insert(seq, record);
        state.write_ready()
    }

    /// Rows written by this log instance.
    pub fn rows(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).rows
    }

    /// Write whatever is still waiting on a missing sequence number.
    pub fn flush_pending(&self) -> Flushed {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(&first) = state.pending.keys().next() else {
            return Flushed::default();
        };
        warn!(
            "{}: {} rows waiting on sequence {}, writing them out of band",
            self.path.display(),
            state.pending.len(),
            state.next_seq
        );
        state.next_seq = first;
        let mut flushed = state.write_ready();
        // Anything left is past another gap
        let rest: Vec<_> = std::mem::take(&mut state.pending).into_values().flatten().collect();
        for record in &rest {
            state.append_into(record, &mut flushed);
        }
        flushed
    }
}

/// Read every row of a metadata log.
pub fn read_metadata(path: &Path) -> Result<Vec<MetadataRecord>, csv::Error> {
    csv::Reader::from_path(path)?.deserialize().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn record(block_id: u64) -> MetadataRecord {
        MetadataRecord {
            block_id,
            timestamp: 1000 + block_id,
            width: 4,
            height: 4,
            pixel_type: 0x0108_0001,
            payload_size: 16,
            filename: format!("frame_{}_{}.bin", block_id, 1000 + block_id),
        }
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = MetadataLog::open(dir.path()).unwrap();
            assert_eq!(log.commit(0, Some(record(0))).written, 1);
        }
        {
            let log = MetadataLog::open(dir.path()).unwrap();
            log.commit(0, Some(record(1)));
        }

        let text = std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[0],
            "block_id,timestamp,width,height,pixel_type,payload_size,filename"
        );
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "0,1000,4,4,17301505,16,frame_0_1000.bin");
    }

    #[test]
    fn out_of_order_commits_are_reordered() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetadataLog::open(dir.path()).unwrap();

        assert_eq!(log.commit(2, Some(record(2))).written, 0);
        assert_eq!(log.commit(1, None).written, 0);
        assert_eq!(log.rows(), 0);
        // Releases the run 0..=2
        assert_eq!(log.commit(0, Some(record(0))).written, 2);
        assert_eq!(log.commit(3, Some(record(3))).written, 1);
        assert_eq!(log.rows(), 3);

        let rows = read_metadata(log.path()).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.block_id).collect();
        assert_eq!(ids, vec![0, 2, 3]);
    }

    #[test]
    fn flush_pending_writes_rows_behind_a_gap() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetadataLog::open(dir.path()).unwrap();
        log.commit(1, Some(record(1)));
        log.commit(4, Some(record(4)));
        assert_eq!(log.rows(), 0);
        let flushed = log.flush_pending();
        assert_eq!(flushed.written, 2);
        assert!(flushed.failed.is_empty());

        let ids: Vec<_> = read_metadata(log.path())
            .unwrap()
            .iter()
            .map(|r| r.block_id)
            .collect();
        assert_eq!(ids, vec![1, 4]);
    }

    /// Fails any write that carries the given block's row.
    struct RejectBlock {
        marker: String,
        inner: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for RejectBlock {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if String::from_utf8_lossy(buf).contains(&self.marker) {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            self.inner.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_row_is_reported_against_its_own_block() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let log = MetadataLog::with_writer(
            "metadata.csv",
            RejectBlock {
                marker: "frame_1_".into(),
                inner: sink.clone(),
            },
            true,
        )
        .unwrap();

        log.commit(1, Some(record(1)));
        log.commit(2, Some(record(2)));
        let flushed = log.commit(0, Some(record(0)));
        assert_eq!(flushed.written, 2);
        let failed: Vec<u64> = flushed.failed.iter().map(|(id, _)| *id).collect();
        assert_eq!(failed, vec![1]);

        // The rejected row does not poison the rows after it
        assert_eq!(log.commit(3, Some(record(3))).written, 1);

        let text = sink.lock().unwrap().clone();
        let ids: Vec<u64> = csv::Reader::from_reader(text.as_slice())
            .deserialize::<MetadataRecord>()
            .map(|r| r.unwrap().block_id)
            .collect();
        assert_eq!(ids, vec![0, 2, 3]);
    }
}
