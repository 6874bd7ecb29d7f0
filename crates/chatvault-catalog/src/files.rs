use crate::{Catalog, db_err};
use chatvault_types::{Chunk, ChunkState, FileCategory, FileRecord, VaultError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

/// Consistent snapshot of catalog-wide totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogStats {
    pub total_files: u64,
    pub total_bytes: u64,
}

/// Pair identifying a remote message for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub owner_credential: String,
    pub message_id: i64,
}

fn file_from_row(row: &Row<'_>) -> Result<FileRecord, rusqlite::Error> {
    let category: String = row.get(4)?;
    let uploaded_at: String = row.get(5)?;
    Ok(FileRecord {
        file_id: row.get(0)?,
        name: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mime: row.get(3)?,
        category: FileCategory::parse(&category).unwrap_or(FileCategory::Direct),
        uploaded_at: DateTime::parse_from_rfc3339(&uploaded_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        is_encrypted: row.get(6)?,
        owner_credential: row.get(7)?,
        direct_transport_id: row.get(8)?,
        direct_message_id: row.get(9)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> Result<Chunk, rusqlite::Error> {
    let state: String = row.get(8)?;
    Ok(Chunk {
        file_id: row.get(0)?,
        index: row.get::<_, i64>(1)? as u64,
        total: row.get::<_, i64>(2)? as u64,
        size_bytes: row.get::<_, i64>(3)? as u64,
        content_hash: row.get(4)?,
        transport_id: row.get(5)?,
        message_id: row.get(6)?,
        owner_credential: row.get(7)?,
        state: ChunkState::parse(&state).unwrap_or(ChunkState::Pending),
    })
}

const FILE_COLS: &str = "file_id, name, size, mime, category, uploaded_at, is_encrypted, \
                         owner_credential, direct_transport_id, direct_message_id";

const CHUNK_COLS: &str = "file_id, chunk_index, total, size_bytes, content_hash, transport_id, \
                          message_id, owner_credential, state";

pub(crate) fn insert_file(conn: &Connection, file: &FileRecord) -> Result<(), VaultError> {
    conn.execute(
        "INSERT INTO files (file_id, name, size, mime, category, uploaded_at, is_encrypted,
                            owner_credential, direct_transport_id, direct_message_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            file.file_id,
            file.name,
            file.size as i64,
            file.mime,
            file.category.as_str(),
            file.uploaded_at.to_rfc3339(),
            file.is_encrypted,
            file.owner_credential,
            file.direct_transport_id,
            file.direct_message_id,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

pub(crate) fn insert_chunk(conn: &Connection, chunk: &Chunk) -> Result<(), VaultError> {
    conn.execute(
        "INSERT OR REPLACE INTO chunks (file_id, chunk_index, total, size_bytes, content_hash,
                                        transport_id, message_id, owner_credential, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            chunk.file_id,
            chunk.index as i64,
            chunk.total as i64,
            chunk.size_bytes as i64,
            chunk.content_hash,
            chunk.transport_id,
            chunk.message_id,
            chunk.owner_credential,
            chunk.state.as_str(),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

impl Catalog {
    pub fn put_file(&self, file: &FileRecord) -> Result<(), VaultError> {
        self.with_tx(|tx| insert_file(tx, file))
    }

    pub fn get_file(&self, file_id: &str) -> Result<FileRecord, VaultError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {FILE_COLS} FROM files WHERE file_id = ?1"),
                [file_id],
                file_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| VaultError::NotFound(format!("file {file_id}")))
        })
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>, VaultError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {FILE_COLS} FROM files ORDER BY uploaded_at DESC, file_id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], file_from_row)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    /// Delete a file and everything that references it — chunks, upload
    /// state, download states — in one transaction.
    pub fn delete_file(&self, file_id: &str) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM download_states WHERE file_id = ?1", [file_id])
                .map_err(db_err)?;
            tx.execute("DELETE FROM upload_states WHERE file_id = ?1", [file_id])
                .map_err(db_err)?;
            tx.execute("DELETE FROM chunks WHERE file_id = ?1", [file_id])
                .map_err(db_err)?;
            let n = tx
                .execute("DELETE FROM files WHERE file_id = ?1", [file_id])
                .map_err(db_err)?;
            if n == 0 {
                return Err(VaultError::NotFound(format!("file {file_id}")));
            }
            debug!(file_id, "file deleted from catalog");
            Ok(())
        })
    }

    /// Every remote message that stores bytes of this file, with the
    /// credential that sent it. Used to direct remote deletion.
    pub fn messages_to_delete(&self, file_id: &str) -> Result<Vec<RemoteMessage>, VaultError> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            let direct: Option<(String, Option<i64>)> = conn
                .query_row(
                    "SELECT owner_credential, direct_message_id FROM files WHERE file_id = ?1",
                    [file_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            if let Some((cred, Some(message_id))) = direct {
                out.push(RemoteMessage {
                    owner_credential: cred,
                    message_id,
                });
            }

            let mut stmt = conn
                .prepare(
                    "SELECT owner_credential, message_id FROM chunks
                     WHERE file_id = ?1 AND message_id IS NOT NULL
                     ORDER BY chunk_index",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([file_id], |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(db_err)?;
            for row in rows {
                let (cred, message_id) = row.map_err(db_err)?;
                if let Some(cred) = cred {
                    out.push(RemoteMessage {
                        owner_credential: cred,
                        message_id,
                    });
                }
            }
            Ok(out)
        })
    }

    pub fn put_chunk(&self, chunk: &Chunk) -> Result<(), VaultError> {
        self.with_tx(|tx| insert_chunk(tx, chunk))
    }

    /// All chunks of a file, ordered by index.
    pub fn get_chunks(&self, file_id: &str) -> Result<Vec<Chunk>, VaultError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CHUNK_COLS} FROM chunks WHERE file_id = ?1 ORDER BY chunk_index"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([file_id], chunk_from_row)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    pub fn set_chunk_state(
        &self,
        file_id: &str,
        index: u64,
        state: ChunkState,
    ) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE chunks SET state = ?1 WHERE file_id = ?2 AND chunk_index = ?3",
                    params![state.as_str(), file_id, index as i64],
                )
                .map_err(db_err)?;
            if n == 0 {
                return Err(VaultError::NotFound(format!("chunk {file_id}/{index}")));
            }
            Ok(())
        })
    }

    /// Re-queue failed chunks for a resume: `failed -> pending` is the one
    /// backward transition a chunk may take.
    pub fn reset_failed_chunks(&self, file_id: &str) -> Result<u64, VaultError> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE chunks SET state = 'pending'
                     WHERE file_id = ?1 AND state IN ('failed', 'uploading')",
                    [file_id],
                )
                .map_err(db_err)?;
            Ok(n as u64)
        })
    }

    /// Record a successful chunk send: mark the chunk completed with its
    /// transport coordinates and bump the upload counter, atomically.
    /// Returns the new completed count.
    pub fn complete_chunk(
        &self,
        file_id: &str,
        index: u64,
        transport_id: &str,
        message_id: i64,
        owner_credential: &str,
    ) -> Result<u64, VaultError> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE chunks
                     SET state = 'completed', transport_id = ?1, message_id = ?2,
                         owner_credential = ?3
                     WHERE file_id = ?4 AND chunk_index = ?5",
                    params![transport_id, message_id, owner_credential, file_id, index as i64],
                )
                .map_err(db_err)?;
            if n == 0 {
                return Err(VaultError::NotFound(format!("chunk {file_id}/{index}")));
            }
            tx.execute(
                "UPDATE upload_states SET completed_chunks = completed_chunks + 1
                 WHERE file_id = ?1",
                [file_id],
            )
            .map_err(db_err)?;
            let completed: i64 = tx
                .query_row(
                    "SELECT completed_chunks FROM upload_states WHERE file_id = ?1",
                    [file_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(completed as u64)
        })
    }

    /// Register a chunked upload in one transaction: the file row, one
    /// pending chunk row per index, and the active recovery record. A kill
    /// anywhere in between leaves no trace of the upload.
    pub fn register_chunked_upload(
        &self,
        file: &FileRecord,
        chunks: &[Chunk],
        upload: &chatvault_types::UploadState,
    ) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            insert_file(tx, file)?;
            for chunk in chunks {
                insert_chunk(tx, chunk)?;
            }
            tx.execute(
                "INSERT INTO upload_states
                 (file_id, source_path, total_bytes, total_chunks, completed_chunks, state,
                  file_content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    upload.file_id,
                    upload.source_path,
                    upload.total_bytes as i64,
                    upload.total_chunks as i64,
                    upload.completed_chunks as i64,
                    upload.state.as_str(),
                    upload.file_content_hash,
                ],
            )
            .map_err(db_err)?;
            debug!(
                file_id = %file.file_id,
                chunks = chunks.len(),
                "chunked upload registered"
            );
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<CatalogStats, VaultError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT count(*), COALESCE(SUM(size), 0) FROM files",
                [],
                |row| {
                    Ok(CatalogStats {
                        total_files: row.get::<_, i64>(0)? as u64,
                        total_bytes: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .map_err(db_err)
        })
    }
}
