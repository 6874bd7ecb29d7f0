//! Portable share descriptors.
//!
//! A `.link` file carries everything needed to rebuild a file on a machine
//! that has never seen the catalog: the chunk manifest with transport ids
//! and owning credentials, wrapped in the password-protected raw envelope.
//! One serialization layer speaks the schema; anything else is `Corrupt`.

use std::fs;
use std::path::Path;

use chatvault_crypto::envelope;
use chatvault_types::{Chunk, ChunkState, FileCategory, FileRecord, VaultError};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const SCHEMA_VERSION: &str = "1.0";

/// File extension for on-disk share descriptors.
pub const LINK_EXTENSION: &str = "link";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareKind {
    Single,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShareChunk {
    pub index: u64,
    pub total: u64,
    pub size_bytes: u64,
    pub content_hash: String,
    pub transport_id: String,
    pub owner_credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShareFile {
    pub file_name: String,
    pub size: u64,
    pub mime: String,
    pub category: FileCategory,
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_transport_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ShareChunk>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShareDescriptor {
    pub schema_version: String,
    pub kind: ShareKind,
    pub files: Vec<ShareFile>,
}

impl ShareFile {
    /// Build the manifest entry for one catalog file.
    pub fn from_record(record: &FileRecord, chunks: &[Chunk]) -> Result<Self, VaultError> {
        match record.category {
            FileCategory::Direct => {
                let transport_id = record.direct_transport_id.clone().ok_or_else(|| {
                    VaultError::Corrupt(format!(
                        "direct file {} has no transport id",
                        record.file_id
                    ))
                })?;
                Ok(Self {
                    file_name: record.name.clone(),
                    size: record.size,
                    mime: record.mime.clone(),
                    category: FileCategory::Direct,
                    is_encrypted: record.is_encrypted,
                    direct_transport_id: Some(transport_id),
                    chunks: None,
                })
            }
            FileCategory::Chunked => {
                let mut share_chunks = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    if chunk.state != ChunkState::Completed {
                        return Err(VaultError::Corrupt(format!(
                            "file {} is not fully uploaded (chunk {} is {})",
                            record.file_id,
                            chunk.index,
                            chunk.state.as_str()
                        )));
                    }
                    share_chunks.push(ShareChunk {
                        index: chunk.index,
                        total: chunk.total,
                        size_bytes: chunk.size_bytes,
                        content_hash: chunk.content_hash.clone(),
                        transport_id: chunk.transport_id.clone().ok_or_else(|| {
                            VaultError::Corrupt(format!(
                                "completed chunk {} has no transport id",
                                chunk.index
                            ))
                        })?,
                        owner_credential: chunk
                            .owner_credential
                            .clone()
                            .unwrap_or_default(),
                    });
                }
                let file = Self {
                    file_name: record.name.clone(),
                    size: record.size,
                    mime: record.mime.clone(),
                    category: FileCategory::Chunked,
                    is_encrypted: record.is_encrypted,
                    direct_transport_id: None,
                    chunks: Some(share_chunks),
                };
                file.validate()?;
                Ok(file)
            }
        }
    }

    fn validate(&self) -> Result<(), VaultError> {
        match self.category {
            FileCategory::Direct => {
                if self.direct_transport_id.is_none() {
                    return Err(VaultError::Corrupt(format!(
                        "direct entry {} lacks a transport id",
                        self.file_name
                    )));
                }
            }
            FileCategory::Chunked => {
                let chunks = self.chunks.as_deref().unwrap_or_default();
                if chunks.is_empty() {
                    return Err(VaultError::Corrupt(format!(
                        "chunked entry {} has no chunks",
                        self.file_name
                    )));
                }
                let total = chunks.len() as u64;
                for (i, chunk) in chunks.iter().enumerate() {
                    if chunk.index != i as u64 || chunk.total != total {
                        return Err(VaultError::Corrupt(format!(
                            "chunk manifest of {} is not contiguous",
                            self.file_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Materialize engine-facing chunk rows for the portable download path.
    pub fn chunk_manifest(&self, file_id: &str) -> Vec<Chunk> {
        self.chunks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| Chunk {
                file_id: file_id.to_string(),
                index: c.index,
                total: c.total,
                size_bytes: c.size_bytes,
                content_hash: c.content_hash.clone(),
                transport_id: Some(c.transport_id.clone()),
                message_id: None,
                owner_credential: if c.owner_credential.is_empty() {
                    None
                } else {
                    Some(c.owner_credential.clone())
                },
                state: ChunkState::Completed,
            })
            .collect()
    }
}

impl ShareDescriptor {
    pub fn single(record: &FileRecord, chunks: &[Chunk]) -> Result<Self, VaultError> {
        Ok(Self {
            schema_version: SCHEMA_VERSION.to_string(),
            kind: ShareKind::Single,
            files: vec![ShareFile::from_record(record, chunks)?],
        })
    }

    pub fn batch(items: &[(FileRecord, Vec<Chunk>)]) -> Result<Self, VaultError> {
        if items.is_empty() {
            return Err(VaultError::NotFound("no files to share".into()));
        }
        let files = items
            .iter()
            .map(|(record, chunks)| ShareFile::from_record(record, chunks))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema_version: SCHEMA_VERSION.to_string(),
            kind: if files.len() == 1 {
                ShareKind::Single
            } else {
                ShareKind::Batch
            },
            files,
        })
    }

    /// Strict parse of the logical schema; anything off is `Corrupt`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        let descriptor: Self = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::Corrupt(format!("share descriptor: {e}")))?;
        if descriptor.schema_version != SCHEMA_VERSION {
            return Err(VaultError::Corrupt(format!(
                "unsupported share schema version {}",
                descriptor.schema_version
            )));
        }
        if descriptor.files.is_empty() {
            return Err(VaultError::Corrupt("share descriptor has no files".into()));
        }
        if descriptor.kind == ShareKind::Single && descriptor.files.len() != 1 {
            return Err(VaultError::Corrupt(
                "single share descriptor carries more than one file".into(),
            ));
        }
        for file in &descriptor.files {
            file.validate()?;
        }
        Ok(descriptor)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VaultError> {
        serde_json::to_vec(self).map_err(|e| VaultError::Internal(format!("serialize share: {e}")))
    }

    /// Write the descriptor as a `.link` file: the raw envelope bytes,
    /// nothing else.
    pub fn write_link(&self, path: &Path, password: &str) -> Result<(), VaultError> {
        let sealed = envelope::seal_raw(&self.to_bytes()?, password)?;
        fs::write(path, sealed)?;
        info!(path = %path.display(), files = self.files.len(), "share link written");
        Ok(())
    }

    /// Read and decrypt a `.link` file.
    pub fn read_link(path: &Path, password: &str) -> Result<Self, VaultError> {
        let sealed = fs::read(path)?;
        let bytes = envelope::open_raw(&sealed, password)?;
        let descriptor = Self::from_bytes(&bytes)?;
        info!(path = %path.display(), files = descriptor.files.len(), "share link imported");
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_types::ErrorKind;
    use chrono::Utc;

    fn record(category: FileCategory) -> FileRecord {
        FileRecord {
            file_id: "f-1".into(),
            name: "album.flac".into(),
            size: 12 << 20,
            mime: "audio/flac".into(),
            category,
            uploaded_at: Utc::now(),
            is_encrypted: true,
            owner_credential: "cred-a".into(),
            direct_transport_id: (category == FileCategory::Direct).then(|| "t-direct".into()),
            direct_message_id: None,
        }
    }

    fn chunks(n: u64) -> Vec<Chunk> {
        (0..n)
            .map(|index| Chunk {
                file_id: "f-1".into(),
                index,
                total: n,
                size_bytes: 4 << 20,
                content_hash: format!("hash-{index}"),
                transport_id: Some(format!("t-{index}")),
                message_id: Some(index as i64),
                owner_credential: Some("cred-a".into()),
                state: ChunkState::Completed,
            })
            .collect()
    }

    #[test]
    fn single_descriptor_round_trips_through_json() {
        let descriptor = ShareDescriptor::single(&record(FileCategory::Chunked), &chunks(3)).unwrap();
        let bytes = descriptor.to_bytes().unwrap();
        let parsed = ShareDescriptor::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, descriptor);
        assert_eq!(parsed.kind, ShareKind::Single);
        assert_eq!(parsed.files[0].chunks.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn batch_descriptor_carries_multiple_files() {
        let items = vec![
            (record(FileCategory::Chunked), chunks(2)),
            (record(FileCategory::Direct), vec![]),
        ];
        let descriptor = ShareDescriptor::batch(&items).unwrap();
        assert_eq!(descriptor.kind, ShareKind::Batch);
        assert_eq!(descriptor.files.len(), 2);
        assert!(descriptor.files[1].direct_transport_id.is_some());
    }

    #[test]
    fn incomplete_uploads_cannot_be_shared() {
        let mut partial = chunks(2);
        partial[1].state = ChunkState::Pending;
        partial[1].transport_id = None;
        let err = ShareDescriptor::single(&record(FileCategory::Chunked), &partial).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn garbage_and_wrong_versions_are_corrupt() {
        assert_eq!(
            ShareDescriptor::from_bytes(b"not json").unwrap_err().kind(),
            ErrorKind::Corrupt
        );

        let mut descriptor =
            ShareDescriptor::single(&record(FileCategory::Chunked), &chunks(1)).unwrap();
        descriptor.schema_version = "9.9".into();
        let bytes = descriptor.to_bytes().unwrap();
        assert_eq!(
            ShareDescriptor::from_bytes(&bytes).unwrap_err().kind(),
            ErrorKind::Corrupt
        );

        // unknown fields are rejected, not ignored
        let sneaky = br#"{"schema_version":"1.0","kind":"single","files":[],"extra":1}"#;
        assert_eq!(
            ShareDescriptor::from_bytes(sneaky).unwrap_err().kind(),
            ErrorKind::Corrupt
        );
    }

    #[test]
    fn non_contiguous_manifests_are_corrupt() {
        let mut gapped = chunks(3);
        gapped.remove(1);
        let descriptor = ShareDescriptor {
            schema_version: SCHEMA_VERSION.into(),
            kind: ShareKind::Single,
            files: vec![ShareFile {
                file_name: "x".into(),
                size: 1,
                mime: "application/octet-stream".into(),
                category: FileCategory::Chunked,
                is_encrypted: false,
                direct_transport_id: None,
                chunks: Some(
                    gapped
                        .iter()
                        .map(|c| ShareChunk {
                            index: c.index,
                            total: c.total,
                            size_bytes: c.size_bytes,
                            content_hash: c.content_hash.clone(),
                            transport_id: c.transport_id.clone().unwrap(),
                            owner_credential: "cred".into(),
                        })
                        .collect(),
                ),
            }],
        };
        let bytes = descriptor.to_bytes().unwrap();
        assert_eq!(
            ShareDescriptor::from_bytes(&bytes).unwrap_err().kind(),
            ErrorKind::Corrupt
        );
    }

    #[test]
    fn link_file_round_trips_and_rejects_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.link");

        let descriptor = ShareDescriptor::single(&record(FileCategory::Chunked), &chunks(3)).unwrap();
        descriptor.write_link(&path, "xyz").unwrap();

        // raw envelope: no magic, no JSON in the clear
        let raw = std::fs::read(&path).unwrap();
        assert_ne!(&raw[..4], b"BKP1");
        assert!(!raw.windows(4).any(|w| w == b"1.0\""));

        let imported = ShareDescriptor::read_link(&path, "xyz").unwrap();
        assert_eq!(imported, descriptor);

        // a wrong password is BadPassword, or Corrupt in the rare case the
        // unauthenticated unpad lets garbage through to the JSON layer
        let err = ShareDescriptor::read_link(&path, "nope").unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::BadPassword | ErrorKind::Corrupt
        ));
    }

    #[test]
    fn chunk_manifest_restores_engine_rows() {
        let descriptor = ShareDescriptor::single(&record(FileCategory::Chunked), &chunks(2)).unwrap();
        let manifest = descriptor.files[0].chunk_manifest("dl-1");
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].file_id, "dl-1");
        assert_eq!(manifest[1].transport_id.as_deref(), Some("t-1"));
        assert_eq!(manifest[1].state, ChunkState::Completed);
    }
}
