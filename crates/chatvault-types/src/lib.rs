//! Shared data model for the chatvault core.
//!
//! Everything the catalog persists and the engines move around lives here:
//! file and chunk records, transfer state rows, the domain error, and the
//! tunable transfer settings.

pub mod error;
pub mod models;
pub mod settings;

pub use error::{ErrorKind, VaultError};
pub use models::{
    Chunk, ChunkState, DownloadState, FileCategory, FileRecord, TransferState, UploadState,
    new_download_id, new_file_id,
};
pub use settings::TransferSettings;
