//! Chunked download engine: parallel fetch into a scratch directory,
//! integrity checks, ordered reassembly, pause/stop/cancel, resume.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chatvault_catalog::Catalog;
use chatvault_crypto::{self as crypto, sha256_file};
use chatvault_transport::{CredentialPool, Transport, TransportError};
use chatvault_types::{
    Chunk, ChunkState, DownloadState, FileCategory, FileRecord, TransferSettings, TransferState,
    VaultError, new_download_id,
};
use tracing::{debug, info, warn};

use crate::TransferOutcome;
use crate::control::ControlRegistry;
use crate::progress::ProgressSink;
use crate::retry::with_retries;

/// Everything a download run needs. Catalog downloads persist a recovery
/// record; portable (share-descriptor) downloads run from this plan alone.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub download_id: String,
    pub file_name: String,
    /// Ordered chunk manifest; every entry carries its transport id.
    pub chunks: Vec<Chunk>,
    pub destination: PathBuf,
    pub scratch_directory: PathBuf,
    pub is_encrypted: bool,
    pub envelope_password: Option<String>,
    /// Whether a DownloadState row tracks this run.
    pub persisted: bool,
}

enum WorkerExit {
    Drained,
    Paused,
    Canceled,
    Failed(VaultError),
}

pub struct DownloadEngine {
    catalog: Arc<Catalog>,
    transport: Arc<dyn Transport>,
    pool: Arc<CredentialPool>,
    controls: Arc<ControlRegistry>,
    sink: Arc<dyn ProgressSink>,
    settings: TransferSettings,
    scratch_root: PathBuf,
    running: Mutex<HashSet<String>>,
}

impl DownloadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        transport: Arc<dyn Transport>,
        pool: Arc<CredentialPool>,
        controls: Arc<ControlRegistry>,
        sink: Arc<dyn ProgressSink>,
        settings: TransferSettings,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            transport,
            pool,
            controls,
            sink,
            settings,
            scratch_root: scratch_root.into(),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Fetch a direct file in one call. Blocking; no recovery record.
    pub fn direct_download(
        &self,
        file: &FileRecord,
        destination: &Path,
        password: Option<&str>,
    ) -> Result<(), VaultError> {
        let transport_id = file.direct_transport_id.as_deref().ok_or_else(|| {
            VaultError::Corrupt(format!("direct file {} has no transport id", file.file_id))
        })?;
        let credential = self.pool.by_id_or_first(&file.owner_credential);

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let fetch_target = if file.is_encrypted && password.is_some() {
            encrypted_sibling(destination)
        } else {
            destination.to_path_buf()
        };

        with_retries("direct download", &self.settings, || {
            let remote_path = self.transport.get_file_path(credential, transport_id)?;
            let mut out = File::create(&fetch_target)
                .map_err(|e| TransportError::Network(format!("open destination: {e}")))?;
            self.transport
                .fetch_bytes(credential, &remote_path, &mut out)
        })?;

        if file.is_encrypted {
            if let Some(password) = password {
                crypto::decrypt_file(&fetch_target, destination, password)?;
                fs::remove_file(&fetch_target)?;
            }
        }
        info!(file_id = %file.file_id, destination = %destination.display(), "direct download completed");
        Ok(())
    }

    /// Begin a chunked download from the catalog. Synchronous up to the
    /// recovery-record insert; chunk fetching happens on a supervisor thread.
    pub fn start(
        self: &Arc<Self>,
        file_id: &str,
        destination: &Path,
        password: Option<String>,
    ) -> Result<(String, JoinHandle<Result<TransferOutcome, VaultError>>), VaultError> {
        let file = self.catalog.get_file(file_id)?;
        if file.category != FileCategory::Chunked {
            return Err(VaultError::Internal(format!(
                "file {file_id} is not chunked; use the direct path"
            )));
        }
        let chunks = self.catalog.get_chunks(file_id)?;
        validate_manifest(&chunks)?;

        let download_id = new_download_id();
        let scratch = self.scratch_root.join(&download_id);
        fs::create_dir_all(&scratch)?;

        self.catalog.put_download_state(&DownloadState {
            download_id: download_id.clone(),
            file_id: file_id.to_string(),
            destination_path: destination.display().to_string(),
            scratch_directory: scratch.display().to_string(),
            total_chunks: chunks.len() as u64,
            completed_chunks: 0,
            state: TransferState::Active,
            is_encrypted: file.is_encrypted,
            envelope_password_needed: file.is_encrypted,
        })?;
        info!(%download_id, file_id, chunks = chunks.len(), "download registered");

        let plan = DownloadPlan {
            download_id: download_id.clone(),
            file_name: file.name,
            chunks,
            destination: destination.to_path_buf(),
            scratch_directory: scratch,
            is_encrypted: file.is_encrypted,
            envelope_password: password,
            persisted: true,
        };
        let handle = self.spawn_run(plan)?;
        Ok((download_id, handle))
    }

    /// Begin a download from an in-memory manifest (share-descriptor path).
    /// Never touches the catalog.
    pub fn start_portable(
        self: &Arc<Self>,
        file_name: &str,
        chunks: Vec<Chunk>,
        destination: &Path,
        is_encrypted: bool,
        password: Option<String>,
    ) -> Result<(String, JoinHandle<Result<TransferOutcome, VaultError>>), VaultError> {
        validate_manifest(&chunks)?;
        let download_id = new_download_id();
        let scratch = self.scratch_root.join(&download_id);
        fs::create_dir_all(&scratch)?;
        info!(%download_id, file_name, chunks = chunks.len(), "portable download starting");

        let plan = DownloadPlan {
            download_id: download_id.clone(),
            file_name: file_name.to_string(),
            chunks,
            destination: destination.to_path_buf(),
            scratch_directory: scratch,
            is_encrypted,
            envelope_password: password,
            persisted: false,
        };
        let handle = self.spawn_run(plan)?;
        Ok((download_id, handle))
    }

    /// Resume an interrupted catalog download. Valid scratch chunks are kept;
    /// everything else is refetched.
    pub fn resume(
        self: &Arc<Self>,
        download_id: &str,
        password: Option<String>,
    ) -> Result<(String, JoinHandle<Result<TransferOutcome, VaultError>>), VaultError> {
        let state = self.catalog.get_download_state(download_id)?;
        if state.state == TransferState::Active && self.is_running(download_id) {
            return Err(VaultError::Internal(format!(
                "download {download_id} is already running"
            )));
        }
        let file = self.catalog.get_file(&state.file_id)?;
        let chunks = self.catalog.get_chunks(&state.file_id)?;
        validate_manifest(&chunks)?;

        let scratch = PathBuf::from(&state.scratch_directory);
        fs::create_dir_all(&scratch)?;
        self.catalog
            .set_download_state(download_id, TransferState::Active)?;
        info!(download_id, file_id = %state.file_id, "download resumed");

        let plan = DownloadPlan {
            download_id: download_id.to_string(),
            file_name: file.name,
            chunks,
            destination: PathBuf::from(&state.destination_path),
            scratch_directory: scratch,
            is_encrypted: state.is_encrypted,
            envelope_password: password,
            persisted: true,
        };
        let handle = self.spawn_run(plan)?;
        Ok((download_id.to_string(), handle))
    }

    pub fn pause(&self, download_id: &str) -> Result<(), VaultError> {
        if self.controls.pause(download_id) {
            return Ok(());
        }
        self.catalog
            .set_download_state(download_id, TransferState::Paused)
    }

    pub fn stop(&self, download_id: &str) -> Result<(), VaultError> {
        self.pause(download_id)?;
        info!(download_id, "download stopped, progress saved");
        Ok(())
    }

    /// Abandon the download: recovery record and scratch directory both go.
    pub fn cancel(&self, download_id: &str) -> Result<(), VaultError> {
        if self.controls.cancel(download_id) {
            return Ok(());
        }
        if let Ok(state) = self.catalog.get_download_state(download_id) {
            remove_scratch(Path::new(&state.scratch_directory));
            self.catalog.delete_download_state(download_id)?;
        }
        info!(download_id, "download canceled");
        Ok(())
    }

    pub fn list_incomplete(&self) -> Result<Vec<DownloadState>, VaultError> {
        self.catalog.list_incomplete_downloads()
    }

    fn is_running(&self, download_id: &str) -> bool {
        self.running.lock().unwrap().contains(download_id)
    }

    fn try_begin(&self, download_id: &str) -> Result<(), VaultError> {
        let mut running = self.running.lock().unwrap();
        if !running.insert(download_id.to_string()) {
            return Err(VaultError::Internal(format!(
                "download {download_id} is already running"
            )));
        }
        Ok(())
    }

    fn end_run(&self, download_id: &str) {
        self.running.lock().unwrap().remove(download_id);
    }

    fn spawn_run(
        self: &Arc<Self>,
        plan: DownloadPlan,
    ) -> Result<JoinHandle<Result<TransferOutcome, VaultError>>, VaultError> {
        let engine = self.clone();
        std::thread::Builder::new()
            .name(format!("download-{}", &plan.download_id[..8]))
            .spawn(move || {
                engine.try_begin(&plan.download_id)?;
                let result = engine.run(&plan);
                engine.end_run(&plan.download_id);
                result
            })
            .map_err(|e| VaultError::Internal(format!("spawn download supervisor: {e}")))
    }

    /// The download loop, then the reassembly phase once every chunk is on
    /// disk.
    fn run(&self, plan: &DownloadPlan) -> Result<TransferOutcome, VaultError> {
        let total = plan.chunks.len() as u64;
        self.controls.track(&plan.download_id);

        // Recount scratch state so the counter always matches the disk:
        // chunks already fetched by a previous run are skipped.
        let mut pending = Vec::new();
        let mut already = 0u64;
        for chunk in &plan.chunks {
            if scratch_chunk_valid(&plan.scratch_directory, chunk) {
                already += 1;
            } else {
                pending.push(chunk.clone());
            }
        }
        if plan.persisted {
            self.catalog
                .update_download_progress(&plan.download_id, already)?;
        }
        debug!(
            download_id = %plan.download_id,
            already,
            pending = pending.len(),
            "download loop starting"
        );

        let workers = self.settings.worker_count(self.pool.len(), pending.len());
        let (queue_tx, queue) = crossbeam_channel::unbounded::<Chunk>();
        for chunk in pending {
            let _ = queue_tx.send(chunk);
        }
        drop(queue_tx);
        let abort = AtomicBool::new(false);
        let local_done = AtomicU64::new(already);

        let exits: Vec<WorkerExit> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| self.worker(plan, total, &queue, &abort, &local_done)));
            }
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        WorkerExit::Failed(VaultError::Internal("download worker panicked".into()))
                    })
                })
                .collect()
        });

        self.conclude(plan, total, exits)
    }

    fn worker(
        &self,
        plan: &DownloadPlan,
        total: u64,
        queue: &crossbeam_channel::Receiver<Chunk>,
        abort: &AtomicBool,
        local_done: &AtomicU64,
    ) -> WorkerExit {
        loop {
            let flags = self.controls.snapshot(&plan.download_id);
            if flags.canceled {
                return WorkerExit::Canceled;
            }
            if flags.paused {
                return WorkerExit::Paused;
            }
            if abort.load(Ordering::Relaxed) {
                return WorkerExit::Drained;
            }

            let chunk = match queue.try_recv() {
                Ok(chunk) => chunk,
                Err(_) => return WorkerExit::Drained,
            };

            match self.fetch_chunk(plan, &chunk) {
                Ok(()) => {
                    let completed = if plan.persisted {
                        match self.catalog.bump_download_progress(&plan.download_id) {
                            Ok(n) => {
                                local_done.store(n, Ordering::Relaxed);
                                n
                            }
                            Err(err) => {
                                abort.store(true, Ordering::Relaxed);
                                return WorkerExit::Failed(err);
                            }
                        }
                    } else {
                        local_done.fetch_add(1, Ordering::Relaxed) + 1
                    };
                    let percent = completed as f64 / total as f64 * 100.0;
                    self.sink
                        .progress(&plan.download_id, completed, total, percent);
                }
                Err(err) => {
                    abort.store(true, Ordering::Relaxed);
                    return WorkerExit::Failed(err);
                }
            }
        }
    }

    /// Fetch one chunk into the scratch directory. A hash mismatch counts as
    /// a failed attempt and the chunk is refetched, up to the retry cap;
    /// after that the whole download fails with `IntegrityFailure`.
    fn fetch_chunk(&self, plan: &DownloadPlan, chunk: &Chunk) -> Result<(), VaultError> {
        let transport_id = chunk.transport_id.as_deref().ok_or_else(|| {
            VaultError::Corrupt(format!("chunk {} has no transport id", chunk.index))
        })?;
        let credential = match &chunk.owner_credential {
            Some(id) => self.pool.by_id_or_first(id),
            None => self.pool.primary(),
        };

        let final_path = scratch_chunk_path(&plan.scratch_directory, chunk.index);
        let part_path = final_path.with_extension("part");
        let label = format!("fetch chunk {}/{}", chunk.index + 1, chunk.total);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = with_retries(&label, &self.settings, || {
                let remote_path = self.transport.get_file_path(credential, transport_id)?;
                let mut out = File::create(&part_path)
                    .map_err(|e| TransportError::Network(format!("open scratch file: {e}")))?;
                self.transport.fetch_bytes(credential, &remote_path, &mut out)
            });

            match result {
                Ok(written) => {
                    if written == chunk.size_bytes
                        && sha256_file(&part_path)? == chunk.content_hash
                    {
                        fs::rename(&part_path, &final_path)?;
                        debug!(
                            download_id = %plan.download_id,
                            index = chunk.index,
                            "chunk fetched"
                        );
                        return Ok(());
                    }
                    warn!(
                        download_id = %plan.download_id,
                        index = chunk.index,
                        attempt,
                        "fetched chunk failed integrity check"
                    );
                    if attempt >= self.settings.max_retries_per_chunk {
                        return Err(VaultError::IntegrityFailure(format!(
                            "chunk {} hash mismatch after {attempt} attempts",
                            chunk.index
                        )));
                    }
                    std::thread::sleep(self.settings.retry_backoff * attempt);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn conclude(
        &self,
        plan: &DownloadPlan,
        total: u64,
        exits: Vec<WorkerExit>,
    ) -> Result<TransferOutcome, VaultError> {
        let download_id = plan.download_id.as_str();
        let canceled = exits.iter().any(|e| matches!(e, WorkerExit::Canceled))
            || self.controls.snapshot(download_id).canceled;
        let paused = exits.iter().any(|e| matches!(e, WorkerExit::Paused));
        let failure = exits.into_iter().find_map(|e| match e {
            WorkerExit::Failed(err) => Some(err),
            _ => None,
        });

        if canceled {
            remove_scratch(&plan.scratch_directory);
            if plan.persisted {
                self.catalog.delete_download_state(download_id)?;
            }
            self.controls.untrack(download_id);
            self.sink.failed(download_id, &VaultError::Canceled);
            info!(download_id, "download canceled, scratch removed");
            return Err(VaultError::Canceled);
        }

        if let Some(err) = failure {
            if plan.persisted {
                self.catalog
                    .set_download_state(download_id, TransferState::Failed)?;
            }
            self.controls.untrack(download_id);
            self.sink.failed(download_id, &err);
            warn!(download_id, %err, "download failed");
            return Err(err);
        }

        let all_present = plan
            .chunks
            .iter()
            .all(|c| scratch_chunk_valid(&plan.scratch_directory, c));

        if !all_present {
            if plan.persisted {
                self.catalog
                    .set_download_state(download_id, TransferState::Paused)?;
            }
            self.controls.untrack(download_id);
            if !paused {
                warn!(download_id, "download drained with chunks missing");
            }
            info!(download_id, "download paused");
            return Ok(TransferOutcome::Paused);
        }

        self.reassemble(plan, total)?;

        if plan.persisted {
            self.catalog.delete_download_state(download_id)?;
        }
        self.controls.untrack(download_id);
        self.sink.completed(download_id, Some(&plan.destination));
        info!(download_id, destination = %plan.destination.display(), "download completed");
        Ok(TransferOutcome::Completed)
    }

    /// Stream scratch chunks into the destination in strict ascending order,
    /// then run the optional decryption post-phase.
    fn reassemble(&self, plan: &DownloadPlan, total: u64) -> Result<(), VaultError> {
        if let Some(parent) = plan.destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let assemble_target = if plan.is_encrypted && plan.envelope_password.is_some() {
            encrypted_sibling(&plan.destination)
        } else {
            plan.destination.clone()
        };

        let mut out = File::create(&assemble_target)?;
        for chunk in &plan.chunks {
            let path = scratch_chunk_path(&plan.scratch_directory, chunk.index);
            let mut part = File::open(&path).map_err(|e| {
                VaultError::NotFound(format!("scratch chunk {}: {e}", chunk.index))
            })?;
            io::copy(&mut part, &mut out)?;
            self.sink
                .reassembly_progress(&plan.download_id, chunk.index + 1, total);
        }
        out.sync_all()?;
        drop(out);

        remove_scratch(&plan.scratch_directory);

        if plan.is_encrypted {
            if let Some(password) = &plan.envelope_password {
                crypto::decrypt_file(&assemble_target, &plan.destination, password)?;
                fs::remove_file(&assemble_target)?;
            }
        }
        debug!(download_id = %plan.download_id, "reassembly finished");
        Ok(())
    }
}

/// Reject manifests that break the contiguous-index invariant or lack
/// transport coordinates.
fn validate_manifest(chunks: &[Chunk]) -> Result<(), VaultError> {
    if chunks.is_empty() {
        return Err(VaultError::NotFound("file has no chunks".into()));
    }
    let total = chunks.len() as u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i as u64 {
            return Err(VaultError::Corrupt(format!(
                "chunk indices not contiguous: expected {i}, found {}",
                chunk.index
            )));
        }
        if chunk.total != total {
            return Err(VaultError::Corrupt(format!(
                "chunk {} claims total {}, manifest has {total}",
                chunk.index, chunk.total
            )));
        }
        if chunk.state == ChunkState::Completed || chunk.transport_id.is_some() {
            continue;
        }
        return Err(VaultError::NotFound(format!(
            "chunk {} was never uploaded",
            chunk.index
        )));
    }
    Ok(())
}

/// `<dest>.encrypted`, appended so the original extension survives.
fn encrypted_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".encrypted");
    PathBuf::from(os)
}

fn scratch_chunk_path(scratch: &Path, index: u64) -> PathBuf {
    scratch.join(format!("chunk_{index}"))
}

/// The resume shortcut: a scratch file whose length matches the recorded
/// chunk size is considered fetched.
fn scratch_chunk_valid(scratch: &Path, chunk: &Chunk) -> bool {
    fs::metadata(scratch_chunk_path(scratch, chunk.index))
        .map(|m| m.len() == chunk.size_bytes)
        .unwrap_or(false)
}

fn remove_scratch(scratch: &Path) {
    if let Err(e) = fs::remove_dir_all(scratch) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(scratch = %scratch.display(), %e, "could not remove scratch directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u64, total: u64) -> Chunk {
        Chunk {
            file_id: "f".into(),
            index,
            total,
            size_bytes: 4,
            content_hash: "h".into(),
            transport_id: Some(format!("t-{index}")),
            message_id: Some(index as i64),
            owner_credential: Some("cred".into()),
            state: ChunkState::Completed,
        }
    }

    #[test]
    fn manifest_validation_accepts_contiguous() {
        let chunks: Vec<Chunk> = (0..3).map(|i| chunk(i, 3)).collect();
        assert!(validate_manifest(&chunks).is_ok());
    }

    #[test]
    fn manifest_validation_rejects_gaps_and_empties() {
        assert!(validate_manifest(&[]).is_err());

        let gapped = vec![chunk(0, 2), chunk(2, 2)];
        assert!(validate_manifest(&gapped).is_err());

        let mut unuploaded = vec![chunk(0, 1)];
        unuploaded[0].transport_id = None;
        unuploaded[0].state = ChunkState::Pending;
        assert!(validate_manifest(&unuploaded).is_err());
    }

    #[test]
    fn scratch_validity_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let c = chunk(0, 1);
        assert!(!scratch_chunk_valid(dir.path(), &c));

        fs::write(scratch_chunk_path(dir.path(), 0), b"1234").unwrap();
        assert!(scratch_chunk_valid(dir.path(), &c));

        fs::write(scratch_chunk_path(dir.path(), 0), b"12").unwrap();
        assert!(!scratch_chunk_valid(dir.path(), &c));
    }
}
