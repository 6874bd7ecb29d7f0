//! Chunked transfer engines.
//!
//! Upload: split the source into fixed-size chunks, send them in parallel
//! through the credential pool, and record every completion in the catalog
//! so the transfer survives a process restart. Download is the mirror, with
//! an ordered reassembly phase once every chunk is on disk.
//!
//! Control is cooperative: workers sample the pause/cancel flags in
//! [`control::ControlRegistry`] at chunk boundaries, and each engine folds
//! its workers' results into one outcome at a single decision point.

pub mod control;
pub mod download;
pub mod mime;
pub mod progress;
pub mod retry;
pub mod upload;

pub use control::{ControlRegistry, ControlState};
pub use download::{DownloadEngine, DownloadPlan};
pub use progress::{NullSink, ProgressSink, TracingSink};
pub use upload::{UploadEngine, UploadOptions};

/// How a supervised transfer run ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Paused,
}
