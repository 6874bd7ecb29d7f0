use crate::{Catalog, db_err};
use chatvault_types::{DownloadState, TransferState, UploadState, VaultError};
use rusqlite::{OptionalExtension, Row, params};
use tracing::{debug, info};

fn upload_from_row(row: &Row<'_>) -> Result<UploadState, rusqlite::Error> {
    let state: String = row.get(5)?;
    Ok(UploadState {
        file_id: row.get(0)?,
        source_path: row.get(1)?,
        total_bytes: row.get::<_, i64>(2)? as u64,
        total_chunks: row.get::<_, i64>(3)? as u64,
        completed_chunks: row.get::<_, i64>(4)? as u64,
        state: TransferState::parse(&state).unwrap_or(TransferState::Failed),
        file_content_hash: row.get(6)?,
    })
}

fn download_from_row(row: &Row<'_>) -> Result<DownloadState, rusqlite::Error> {
    let state: String = row.get(6)?;
    Ok(DownloadState {
        download_id: row.get(0)?,
        file_id: row.get(1)?,
        destination_path: row.get(2)?,
        scratch_directory: row.get(3)?,
        total_chunks: row.get::<_, i64>(4)? as u64,
        completed_chunks: row.get::<_, i64>(5)? as u64,
        state: TransferState::parse(&state).unwrap_or(TransferState::Failed),
        is_encrypted: row.get(7)?,
        envelope_password_needed: row.get(8)?,
    })
}

const UPLOAD_COLS: &str = "file_id, source_path, total_bytes, total_chunks, completed_chunks, \
                           state, file_content_hash";

const DOWNLOAD_COLS: &str = "download_id, file_id, destination_path, scratch_directory, \
                             total_chunks, completed_chunks, state, is_encrypted, \
                             envelope_password_needed";

impl Catalog {
    // -- Upload recovery records --

    pub fn put_upload_state(&self, state: &UploadState) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO upload_states
                 (file_id, source_path, total_bytes, total_chunks, completed_chunks, state,
                  file_content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    state.file_id,
                    state.source_path,
                    state.total_bytes as i64,
                    state.total_chunks as i64,
                    state.completed_chunks as i64,
                    state.state.as_str(),
                    state.file_content_hash,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get_upload_state(&self, file_id: &str) -> Result<UploadState, VaultError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {UPLOAD_COLS} FROM upload_states WHERE file_id = ?1"),
                [file_id],
                upload_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| VaultError::NotFound(format!("upload state for {file_id}")))
        })
    }

    pub fn update_upload_progress(
        &self,
        file_id: &str,
        completed_chunks: u64,
    ) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE upload_states SET completed_chunks = ?1 WHERE file_id = ?2",
                params![completed_chunks as i64, file_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn set_upload_state(
        &self,
        file_id: &str,
        state: TransferState,
    ) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE upload_states SET state = ?1 WHERE file_id = ?2",
                    params![state.as_str(), file_id],
                )
                .map_err(db_err)?;
            if n == 0 {
                return Err(VaultError::NotFound(format!("upload state for {file_id}")));
            }
            debug!(file_id, state = state.as_str(), "upload state changed");
            Ok(())
        })
    }

    pub fn delete_upload_state(&self, file_id: &str) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM upload_states WHERE file_id = ?1", [file_id])
                .map_err(db_err)?;
            Ok(())
        })
    }

    /// Uploads that still need work: anything not yet completed or canceled.
    pub fn list_incomplete_uploads(&self) -> Result<Vec<UploadState>, VaultError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {UPLOAD_COLS} FROM upload_states
                     WHERE state IN ('active', 'paused', 'failed')
                     ORDER BY file_id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], upload_from_row)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    /// Flip stale `active` uploads to `paused`. Run at startup and shutdown
    /// so transfers interrupted by a crash come back resumable.
    pub fn mark_all_active_uploads_paused(&self) -> Result<u64, VaultError> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE upload_states SET state = 'paused' WHERE state = 'active'",
                    [],
                )
                .map_err(db_err)?;
            if n > 0 {
                info!("{n} in-flight upload(s) marked paused");
            }
            Ok(n as u64)
        })
    }

    // -- Download recovery records --

    pub fn put_download_state(&self, state: &DownloadState) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO download_states
                 (download_id, file_id, destination_path, scratch_directory, total_chunks,
                  completed_chunks, state, is_encrypted, envelope_password_needed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    state.download_id,
                    state.file_id,
                    state.destination_path,
                    state.scratch_directory,
                    state.total_chunks as i64,
                    state.completed_chunks as i64,
                    state.state.as_str(),
                    state.is_encrypted,
                    state.envelope_password_needed,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get_download_state(&self, download_id: &str) -> Result<DownloadState, VaultError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DOWNLOAD_COLS} FROM download_states WHERE download_id = ?1"),
                [download_id],
                download_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| VaultError::NotFound(format!("download state for {download_id}")))
        })
    }

    pub fn update_download_progress(
        &self,
        download_id: &str,
        completed_chunks: u64,
    ) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE download_states SET completed_chunks = ?1 WHERE download_id = ?2",
                params![completed_chunks as i64, download_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Bump the completed counter by one, atomically. Returns the new count.
    pub fn bump_download_progress(&self, download_id: &str) -> Result<u64, VaultError> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE download_states SET completed_chunks = completed_chunks + 1
                 WHERE download_id = ?1",
                [download_id],
            )
            .map_err(db_err)?;
            let completed: i64 = tx
                .query_row(
                    "SELECT completed_chunks FROM download_states WHERE download_id = ?1",
                    [download_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(completed as u64)
        })
    }

    pub fn set_download_state(
        &self,
        download_id: &str,
        state: TransferState,
    ) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE download_states SET state = ?1 WHERE download_id = ?2",
                    params![state.as_str(), download_id],
                )
                .map_err(db_err)?;
            if n == 0 {
                return Err(VaultError::NotFound(format!(
                    "download state for {download_id}"
                )));
            }
            debug!(download_id, state = state.as_str(), "download state changed");
            Ok(())
        })
    }

    pub fn delete_download_state(&self, download_id: &str) -> Result<(), VaultError> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM download_states WHERE download_id = ?1",
                [download_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn list_incomplete_downloads(&self) -> Result<Vec<DownloadState>, VaultError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {DOWNLOAD_COLS} FROM download_states
                     WHERE state IN ('active', 'paused', 'failed')
                     ORDER BY download_id"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], download_from_row)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    pub fn mark_all_active_downloads_paused(&self) -> Result<u64, VaultError> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "UPDATE download_states SET state = 'paused' WHERE state = 'active'",
                    [],
                )
                .map_err(db_err)?;
            if n > 0 {
                info!("{n} in-flight download(s) marked paused");
            }
            Ok(n as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_types::{FileCategory, FileRecord, new_download_id, new_file_id};
    use chrono::Utc;

    fn open_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let cat = Catalog::create(&dir.path().join("catalog.db"), "pw").unwrap();
        (dir, cat)
    }

    fn register_file(cat: &Catalog) -> String {
        let id = new_file_id();
        cat.put_file(&FileRecord {
            file_id: id.clone(),
            name: "video.mkv".into(),
            size: 40 << 20,
            mime: "video/x-matroska".into(),
            category: FileCategory::Chunked,
            uploaded_at: Utc::now(),
            is_encrypted: false,
            owner_credential: "cred-1".into(),
            direct_transport_id: None,
            direct_message_id: None,
        })
        .unwrap();
        id
    }

    fn upload_state(file_id: &str) -> UploadState {
        UploadState {
            file_id: file_id.into(),
            source_path: "/data/video.mkv".into(),
            total_bytes: 40 << 20,
            total_chunks: 10,
            completed_chunks: 0,
            state: TransferState::Active,
            file_content_hash: "abc123".into(),
        }
    }

    #[test]
    fn upload_state_lifecycle() {
        let (_dir, cat) = open_catalog();
        let id = register_file(&cat);
        cat.put_upload_state(&upload_state(&id)).unwrap();

        cat.update_upload_progress(&id, 4).unwrap();
        cat.set_upload_state(&id, TransferState::Paused).unwrap();

        let got = cat.get_upload_state(&id).unwrap();
        assert_eq!(got.completed_chunks, 4);
        assert_eq!(got.state, TransferState::Paused);

        cat.delete_upload_state(&id).unwrap();
        assert!(cat.get_upload_state(&id).is_err());
    }

    #[test]
    fn incomplete_uploads_exclude_terminal_success() {
        let (_dir, cat) = open_catalog();
        let a = register_file(&cat);
        let b = register_file(&cat);
        cat.put_upload_state(&upload_state(&a)).unwrap();
        let mut done = upload_state(&b);
        done.state = TransferState::Completed;
        cat.put_upload_state(&done).unwrap();

        let incomplete = cat.list_incomplete_uploads().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].file_id, a);
    }

    #[test]
    fn startup_sweep_pauses_active_transfers() {
        let (_dir, cat) = open_catalog();
        let id = register_file(&cat);
        cat.put_upload_state(&upload_state(&id)).unwrap();

        assert_eq!(cat.mark_all_active_uploads_paused().unwrap(), 1);
        assert_eq!(
            cat.get_upload_state(&id).unwrap().state,
            TransferState::Paused
        );
        // idempotent
        assert_eq!(cat.mark_all_active_uploads_paused().unwrap(), 0);
    }

    #[test]
    fn download_state_lifecycle() {
        let (_dir, cat) = open_catalog();
        let file_id = register_file(&cat);
        let download_id = new_download_id();
        cat.put_download_state(&DownloadState {
            download_id: download_id.clone(),
            file_id: file_id.clone(),
            destination_path: "/out/video.mkv".into(),
            scratch_directory: "/tmp/scratch".into(),
            total_chunks: 10,
            completed_chunks: 0,
            state: TransferState::Active,
            is_encrypted: true,
            envelope_password_needed: true,
        })
        .unwrap();

        assert_eq!(cat.bump_download_progress(&download_id).unwrap(), 1);
        assert_eq!(cat.bump_download_progress(&download_id).unwrap(), 2);

        cat.mark_all_active_downloads_paused().unwrap();
        let got = cat.get_download_state(&download_id).unwrap();
        assert_eq!(got.state, TransferState::Paused);
        assert!(got.envelope_password_needed);

        assert_eq!(cat.list_incomplete_downloads().unwrap().len(), 1);
        cat.delete_download_state(&download_id).unwrap();
        assert!(cat.list_incomplete_downloads().unwrap().is_empty());
    }
}
