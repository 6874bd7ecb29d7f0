//! Chunked upload engine: split, hash, parallel send, state persistence,
//! pause/stop/cancel, resume.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chatvault_catalog::Catalog;
use chatvault_crypto::{sha256_file, sha256_hex};
use chatvault_transport::{CredentialPool, Transport};
use chatvault_types::{
    Chunk, ChunkState, FileCategory, FileRecord, TransferSettings, TransferState, UploadState,
    VaultError, new_file_id,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::TransferOutcome;
use crate::control::ControlRegistry;
use crate::mime::detect_mime;
use crate::progress::ProgressSink;
use crate::retry::with_retries;

/// Per-upload options supplied by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Name recorded for the file. Defaults to the source's file name; the
    /// orchestrator sets it when the source is a pre-encrypted temp file.
    pub display_name: Option<String>,
    /// Whether the bytes going to the remote side are envelope-encrypted.
    pub is_encrypted: bool,
}

/// How one worker left the upload loop.
enum WorkerExit {
    Drained,
    Paused,
    Canceled,
    Failed(VaultError),
}

pub struct UploadEngine {
    catalog: Arc<Catalog>,
    transport: Arc<dyn Transport>,
    pool: Arc<CredentialPool>,
    controls: Arc<ControlRegistry>,
    sink: Arc<dyn ProgressSink>,
    settings: TransferSettings,
    chat_id: String,
    /// File ids with a live supervisor; rejects concurrent double-resume.
    running: Mutex<HashSet<String>>,
}

impl UploadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        transport: Arc<dyn Transport>,
        pool: Arc<CredentialPool>,
        controls: Arc<ControlRegistry>,
        sink: Arc<dyn ProgressSink>,
        settings: TransferSettings,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            transport,
            pool,
            controls,
            sink,
            settings,
            chat_id: chat_id.into(),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Ship a small file as one document. Blocking; no recovery record.
    pub fn direct_upload(
        &self,
        source: &Path,
        opts: &UploadOptions,
    ) -> Result<FileRecord, VaultError> {
        let payload = std::fs::read(source)?;
        let name = display_name(source, opts);
        let credential = self.pool.acquire();

        let receipt = with_retries("direct upload", &self.settings, || {
            self.transport
                .send_document(credential, &self.chat_id, &payload, &name, None)
        })?;

        let record = FileRecord {
            file_id: new_file_id(),
            name: name.clone(),
            size: payload.len() as u64,
            mime: detect_mime(Path::new(&name)).to_string(),
            category: FileCategory::Direct,
            uploaded_at: Utc::now(),
            is_encrypted: opts.is_encrypted,
            owner_credential: credential.id().to_string(),
            direct_transport_id: Some(receipt.transport_id),
            direct_message_id: Some(receipt.message_id),
        };
        self.catalog.put_file(&record)?;
        info!(file_id = %record.file_id, %name, size = record.size, "direct upload completed");
        Ok(record)
    }

    /// Begin a chunked upload: register the file, its pending chunks, and
    /// the recovery record in one transaction, then hand the chunk work to
    /// a supervisor thread. Returns once the registration is durable.
    pub fn start(
        self: &Arc<Self>,
        source: &Path,
        opts: &UploadOptions,
    ) -> Result<(String, JoinHandle<Result<TransferOutcome, VaultError>>), VaultError> {
        let (record, chunks, upload) = self.prepare(source, opts)?;
        self.catalog
            .register_chunked_upload(&record, &chunks, &upload)?;
        info!(
            file_id = %record.file_id,
            name = %record.name,
            chunks = chunks.len(),
            "chunked upload registered"
        );

        let handle = self.spawn_run(record.file_id.clone(), source.to_path_buf())?;
        Ok((record.file_id, handle))
    }

    /// Resume an interrupted upload. The source path may have moved, but its
    /// content must still hash to what was registered.
    pub fn resume(
        self: &Arc<Self>,
        file_id: &str,
        source: &Path,
    ) -> Result<(String, JoinHandle<Result<TransferOutcome, VaultError>>), VaultError> {
        let upload = self.catalog.get_upload_state(file_id)?;
        if upload.state == TransferState::Active && self.is_running(file_id) {
            return Err(VaultError::Internal(format!(
                "upload {file_id} is already running"
            )));
        }

        let size = std::fs::metadata(source)?.len();
        if size != upload.total_bytes {
            return Err(VaultError::SourceMismatch(format!(
                "source is {size} bytes, recorded upload was {}",
                upload.total_bytes
            )));
        }
        let hash = sha256_file(source)?;
        if hash != upload.file_content_hash {
            return Err(VaultError::SourceMismatch(
                "source content hash changed since the upload was registered".into(),
            ));
        }

        let requeued = self.catalog.reset_failed_chunks(file_id)?;
        if requeued > 0 {
            debug!(file_id, requeued, "failed chunks re-queued for resume");
        }
        self.catalog
            .set_upload_state(file_id, TransferState::Active)?;
        info!(file_id, "upload resumed");

        let handle = self.spawn_run(file_id.to_string(), source.to_path_buf())?;
        Ok((file_id.to_string(), handle))
    }

    /// Stop scheduling new chunks, keep all state. In-flight sends finish
    /// and their completions still commit.
    pub fn pause(&self, file_id: &str) -> Result<(), VaultError> {
        if self.controls.pause(file_id) {
            return Ok(());
        }
        // No live run: flip the persisted state directly.
        self.catalog.set_upload_state(file_id, TransferState::Paused)
    }

    /// Same data-layer effect as pause; logged as an explicit stop.
    pub fn stop(&self, file_id: &str) -> Result<(), VaultError> {
        self.pause(file_id)?;
        info!(file_id, "upload stopped, progress saved");
        Ok(())
    }

    /// Drop the upload entirely: every File/Chunk/UploadState row goes in
    /// one transaction. Already-sent chunks stay on the remote side.
    pub fn cancel(&self, file_id: &str) -> Result<(), VaultError> {
        if self.controls.cancel(file_id) {
            // The supervisor performs the purge once workers wind down.
            return Ok(());
        }
        self.catalog.delete_file(file_id)?;
        info!(file_id, "upload canceled and purged");
        Ok(())
    }

    pub fn list_incomplete(&self) -> Result<Vec<UploadState>, VaultError> {
        self.catalog.list_incomplete_uploads()
    }

    fn is_running(&self, file_id: &str) -> bool {
        self.running.lock().unwrap().contains(file_id)
    }

    fn try_begin(&self, file_id: &str) -> Result<(), VaultError> {
        let mut running = self.running.lock().unwrap();
        if !running.insert(file_id.to_string()) {
            return Err(VaultError::Internal(format!(
                "upload {file_id} is already running"
            )));
        }
        Ok(())
    }

    fn end_run(&self, file_id: &str) {
        self.running.lock().unwrap().remove(file_id);
    }

    /// One streamed pass over the source: per-chunk hashes and the whole-file
    /// hash, no second read.
    fn prepare(
        &self,
        source: &Path,
        opts: &UploadOptions,
    ) -> Result<(FileRecord, Vec<Chunk>, UploadState), VaultError> {
        let size = std::fs::metadata(source)?.len();
        let total_chunks = self.settings.chunk_count(size);
        let name = display_name(source, opts);
        let file_id = new_file_id();

        let mut file = File::open(source)?;
        let mut file_hasher = Sha256::new();
        let mut chunks = Vec::with_capacity(total_chunks as usize);
        let mut buf = vec![0u8; self.settings.chunk_size as usize];

        for index in 0..total_chunks {
            let remaining = size - index * self.settings.chunk_size;
            let this_size = remaining.min(self.settings.chunk_size) as usize;
            file.read_exact(&mut buf[..this_size])?;
            file_hasher.update(&buf[..this_size]);
            chunks.push(Chunk {
                file_id: file_id.clone(),
                index,
                total: total_chunks,
                size_bytes: this_size as u64,
                content_hash: sha256_hex(&buf[..this_size]),
                transport_id: None,
                message_id: None,
                owner_credential: None,
                state: ChunkState::Pending,
            });
        }

        let record = FileRecord {
            file_id: file_id.clone(),
            name: name.clone(),
            size,
            mime: detect_mime(Path::new(&name)).to_string(),
            category: FileCategory::Chunked,
            uploaded_at: Utc::now(),
            is_encrypted: opts.is_encrypted,
            owner_credential: self.pool.primary().id().to_string(),
            direct_transport_id: None,
            direct_message_id: None,
        };
        let upload = UploadState {
            file_id,
            source_path: source.display().to_string(),
            total_bytes: size,
            total_chunks,
            completed_chunks: 0,
            state: TransferState::Active,
            file_content_hash: hex::encode(file_hasher.finalize()),
        };
        Ok((record, chunks, upload))
    }

    fn spawn_run(
        self: &Arc<Self>,
        file_id: String,
        source: PathBuf,
    ) -> Result<JoinHandle<Result<TransferOutcome, VaultError>>, VaultError> {
        let engine = self.clone();
        std::thread::Builder::new()
            .name(format!("upload-{}", &file_id[..8]))
            .spawn(move || {
                engine.try_begin(&file_id)?;
                let result = engine.run(&file_id, &source);
                engine.end_run(&file_id);
                result
            })
            .map_err(|e| VaultError::Internal(format!("spawn upload supervisor: {e}")))
    }

    /// The upload loop: a bounded worker set drains the pending-chunk queue,
    /// then the supervisor decides the operation's outcome at one point.
    fn run(&self, file_id: &str, source: &Path) -> Result<TransferOutcome, VaultError> {
        let record = self.catalog.get_file(file_id)?;
        let chunks = self.catalog.get_chunks(file_id)?;
        let total = chunks.len() as u64;
        let pending: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| c.state != ChunkState::Completed)
            .collect();

        self.controls.track(file_id);
        let workers = self
            .settings
            .worker_count(self.pool.len(), pending.len());
        debug!(file_id, workers, pending = pending.len(), "upload loop starting");

        // Shared FIFO of pending chunks; workers drain it until empty or a
        // control flag stops them.
        let (queue_tx, queue) = crossbeam_channel::unbounded::<Chunk>();
        for chunk in pending {
            let _ = queue_tx.send(chunk);
        }
        drop(queue_tx);
        let abort = AtomicBool::new(false);

        let exits: Vec<WorkerExit> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| {
                    self.worker(file_id, source, &record.name, total, &queue, &abort)
                }));
            }
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        WorkerExit::Failed(VaultError::Internal("upload worker panicked".into()))
                    })
                })
                .collect()
        });

        self.conclude(file_id, exits)
    }

    fn worker(
        &self,
        file_id: &str,
        source: &Path,
        name: &str,
        total: u64,
        queue: &crossbeam_channel::Receiver<Chunk>,
        abort: &AtomicBool,
    ) -> WorkerExit {
        loop {
            let flags = self.controls.snapshot(file_id);
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

            match self.send_chunk(file_id, source, name, total, &chunk) {
                Ok(completed) => {
                    let percent = completed as f64 / total as f64 * 100.0;
                    self.sink.progress(file_id, completed, total, percent);
                }
                Err(err) => {
                    abort.store(true, Ordering::Relaxed);
                    if let Err(e) =
                        self.catalog
                            .set_chunk_state(file_id, chunk.index, ChunkState::Failed)
                    {
                        warn!(file_id, index = chunk.index, %e, "could not mark chunk failed");
                    }
                    return WorkerExit::Failed(err);
                }
            }
        }
    }

    /// Read one chunk at its offset, verify it still matches the registered
    /// hash, send it, and commit the completion in one transaction.
    fn send_chunk(
        &self,
        file_id: &str,
        source: &Path,
        name: &str,
        total: u64,
        chunk: &Chunk,
    ) -> Result<u64, VaultError> {
        let mut file = File::open(source)?;
        file.seek(SeekFrom::Start(chunk.index * self.settings.chunk_size))?;
        let mut buf = vec![0u8; chunk.size_bytes as usize];
        file.read_exact(&mut buf)?;

        if sha256_hex(&buf) != chunk.content_hash {
            return Err(VaultError::SourceMismatch(format!(
                "chunk {} no longer matches the registered content",
                chunk.index
            )));
        }

        let credential = self.pool.acquire();
        let filename = format!("{}.chunk{:05}", file_id, chunk.index);
        let caption = format!("{} chunk {}/{}", name, chunk.index + 1, total);
        let label = format!("chunk {}/{}", chunk.index + 1, total);

        let receipt = with_retries(&label, &self.settings, || {
            self.transport
                .send_document(credential, &self.chat_id, &buf, &filename, Some(&caption))
        })?;

        let completed = self.catalog.complete_chunk(
            file_id,
            chunk.index,
            &receipt.transport_id,
            receipt.message_id,
            credential.id(),
        )?;
        debug!(file_id, index = chunk.index, completed, "chunk uploaded");
        Ok(completed)
    }

    /// Single decision point: fold the worker exits into the operation's
    /// terminal (or paused) state.
    fn conclude(
        &self,
        file_id: &str,
        exits: Vec<WorkerExit>,
    ) -> Result<TransferOutcome, VaultError> {
        let canceled = exits.iter().any(|e| matches!(e, WorkerExit::Canceled))
            || self.controls.snapshot(file_id).canceled;
        let paused = exits.iter().any(|e| matches!(e, WorkerExit::Paused));
        let failure = exits.into_iter().find_map(|e| match e {
            WorkerExit::Failed(err) => Some(err),
            _ => None,
        });

        if canceled {
            self.catalog
                .set_upload_state(file_id, TransferState::Canceled)
                .ok();
            self.catalog.delete_file(file_id)?;
            self.controls.untrack(file_id);
            self.sink.failed(file_id, &VaultError::Canceled);
            info!(file_id, "upload canceled, all records purged");
            return Err(VaultError::Canceled);
        }

        if let Some(err) = failure {
            self.catalog
                .set_upload_state(file_id, TransferState::Failed)?;
            self.controls.untrack(file_id);
            self.sink.failed(file_id, &err);
            warn!(file_id, %err, "upload failed");
            return Err(err);
        }

        let upload = self.catalog.get_upload_state(file_id)?;
        if upload.completed_chunks == upload.total_chunks {
            // Terminal success: the recovery record has served its purpose.
            self.catalog.delete_upload_state(file_id)?;
            self.controls.untrack(file_id);
            self.sink.completed(file_id, None);
            info!(
                file_id,
                chunks = upload.total_chunks,
                "chunked upload completed"
            );
            return Ok(TransferOutcome::Completed);
        }

        if paused {
            self.catalog
                .set_upload_state(file_id, TransferState::Paused)?;
        } else {
            // Workers drained without finishing every chunk; treat as paused
            // so the upload stays resumable.
            self.catalog
                .set_upload_state(file_id, TransferState::Paused)?;
            warn!(file_id, "upload loop drained with work remaining");
        }
        self.controls.untrack(file_id);
        info!(
            file_id,
            completed = upload.completed_chunks,
            total = upload.total_chunks,
            "upload paused"
        );
        Ok(TransferOutcome::Paused)
    }
}

fn display_name(source: &Path, opts: &UploadOptions) -> String {
    opts.display_name.clone().unwrap_or_else(|| {
        source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string())
    })
}
