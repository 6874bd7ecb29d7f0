use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mint a new locally-unique file identifier. Never the transport's id.
pub fn new_file_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mint a new download operation identifier.
pub fn new_download_id() -> String {
    Uuid::new_v4().to_string()
}

/// How a file was shipped to the remote channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    /// Single document, no chunk rows.
    Direct,
    /// Split into fixed-size chunks, one document each.
    Chunked,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Chunked => "chunked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "chunked" => Some(Self::Chunked),
            _ => None,
        }
    }
}

/// A stored file as the catalog sees it.
///
/// `file_id` is local and opaque; the transport's identifier (when the file
/// went up in one piece) lives in `direct_transport_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub category: FileCategory,
    pub uploaded_at: DateTime<Utc>,
    /// Whether the remote bytes are envelope-encrypted.
    pub is_encrypted: bool,
    /// Credential that uploaded the file (direct) or registered it (chunked).
    pub owner_credential: String,
    /// Present iff `category == Direct`.
    pub direct_transport_id: Option<String>,
    /// Message id of the direct send, for later remote deletion.
    pub direct_message_id: Option<i64>,
}

/// Lifecycle of a single chunk. Transitions only move forward, except
/// `Failed -> Pending` when a resume re-queues the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One fixed-size piece of a chunked file. Strictly a child of its file;
/// deleting the file cascades here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub file_id: String,
    /// 0-based position within the file.
    pub index: u64,
    /// Chunk count for the whole file.
    pub total: u64,
    pub size_bytes: u64,
    /// SHA-256 of the plaintext bytes handed to the transport.
    pub content_hash: String,
    /// Identifier the transport returned for the sent document.
    pub transport_id: Option<String>,
    /// Per-send message record, used for later remote deletion.
    pub message_id: Option<i64>,
    pub owner_credential: Option<String>,
    pub state: ChunkState,
}

/// Lifecycle shared by upload and download recovery records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Active,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Recovery record for an in-flight upload. Created when the upload begins,
/// deleted once the upload completes or is canceled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadState {
    pub file_id: String,
    pub source_path: String,
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub state: TransferState,
    /// SHA-256 of the whole source, streamed at registration. Resume
    /// refuses a source that no longer hashes to this.
    pub file_content_hash: String,
}

/// Mirror record for an in-flight download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadState {
    pub download_id: String,
    pub file_id: String,
    pub destination_path: String,
    pub scratch_directory: String,
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub state: TransferState,
    pub is_encrypted: bool,
    /// True when the stored bytes need an envelope password to decrypt.
    pub envelope_password_needed: bool,
}
