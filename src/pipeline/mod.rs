//! Acquisition and persistence pipeline
//!
//! ```text
//! FrameSource ──retrieve──► FrameCopier ──► release
//!                               │
//!                 ┌─────────────┴──────────────┐
//!                 ▼                            ▼
//!        PersistenceQueue (drop newest)   PreviewDecimator (every Kth)
//!                 │                            │
//!                 ▼                            ▼
//!          SaveWorkerPool ──► .bin       PreviewQueue (drop oldest)
//!                 │                            │
//!                 ▼                            ▼
//!          MetadataLog ──► metadata.csv   PreviewSink
//! ```

pub mod metadata;
pub mod orchestrator;
pub mod preview;
pub mod queue;
pub mod source;
pub mod stats;
pub mod writer;

pub use metadata::{Flushed, MetadataLog, MetadataRecord};
pub use orchestrator::{AcquisitionReport, Orchestrator};
pub use preview::{PreviewDecimator, PreviewImage, PreviewQueue};
pub use queue::PersistenceQueue;
pub use source::{PipelineSettings, PipelineState, SourcePipeline};
pub use stats::SourceStats;
pub use writer::{BinFileStore, FrameStore, SaveWorkerPool};
