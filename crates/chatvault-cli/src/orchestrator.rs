use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chatvault_catalog::Catalog;
use chatvault_catalog::files::CatalogStats;
use chatvault_crypto as crypto;
use chatvault_engine::{
    ControlRegistry, DownloadEngine, ProgressSink, TracingSink, TransferOutcome, UploadEngine,
    UploadOptions,
};
use chatvault_notify::{Notifier, OperationKind};
use chatvault_share::ShareDescriptor;
use chatvault_transport::{CredentialPool, DeleteOutcome, Messenger, Transport};
use chatvault_types::{DownloadState, FileCategory, FileRecord, UploadState, VaultError};
use tracing::{info, warn};

use crate::config::Config;

/// Options for one upload request.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Encrypt the payload before upload with this password.
    pub encrypt_password: Option<String>,
}

/// How a download request was routed.
#[derive(Debug)]
pub enum DownloadStart {
    /// Direct file, fetched synchronously to this path.
    Direct(PathBuf),
    /// Chunked file; track and wait on `download_id`.
    Chunked { download_id: String },
}

type SupervisedRun = JoinHandle<Result<TransferOutcome, VaultError>>;

/// Directs requests to the right engine, registers operations with the
/// notifier, and owns shutdown. The single entry point for every caller.
pub struct Orchestrator {
    catalog: Arc<Catalog>,
    catalog_path: PathBuf,
    transport: Arc<dyn Transport>,
    pool: Arc<CredentialPool>,
    controls: Arc<ControlRegistry>,
    notifier: Option<Arc<Notifier>>,
    upload_engine: Arc<UploadEngine>,
    download_engine: Arc<DownloadEngine>,
    chat_id: String,
    scratch_root: PathBuf,
    /// Live supervisor handles by operation id.
    runs: Mutex<HashMap<String, SupervisedRun>>,
}

impl Orchestrator {
    /// Open (or create) the catalog, sweep stale `active` transfers to
    /// `paused`, and wire the engines. The transport and the optional
    /// messenger are injected so tests and offline runs can substitute the
    /// in-memory implementations.
    pub fn init(
        config: &Config,
        transport: Arc<dyn Transport>,
        messenger: Option<Arc<dyn Messenger>>,
    ) -> Result<Self, VaultError> {
        let catalog = Arc::new(Catalog::open_or_create(
            &config.catalog_path,
            &config.catalog_password,
        )?);
        // Crash recovery: anything still `active` was interrupted.
        catalog.mark_all_active_uploads_paused()?;
        catalog.mark_all_active_downloads_paused()?;

        let pool = Arc::new(CredentialPool::from_tokens(config.credentials.clone())?);
        let controls = Arc::new(ControlRegistry::new());

        let notifier = messenger.map(|messenger| {
            let notifier = Arc::new(Notifier::new(messenger));
            notifier.start();
            notifier
        });
        let sink: Arc<dyn ProgressSink> = match &notifier {
            Some(notifier) => notifier.sink(),
            None => Arc::new(TracingSink),
        };

        let upload_engine = Arc::new(UploadEngine::new(
            catalog.clone(),
            transport.clone(),
            pool.clone(),
            controls.clone(),
            sink.clone(),
            config.settings.clone(),
            config.chat_id.clone(),
        ));
        let download_engine = Arc::new(DownloadEngine::new(
            catalog.clone(),
            transport.clone(),
            pool.clone(),
            controls.clone(),
            sink,
            config.settings.clone(),
            config.scratch_root.clone(),
        ));

        fs::create_dir_all(&config.scratch_root)?;
        info!(
            catalog = %config.catalog_path.display(),
            credentials = pool.len(),
            "orchestrator initialized"
        );
        Ok(Self {
            catalog,
            catalog_path: config.catalog_path.clone(),
            transport,
            pool,
            controls,
            notifier,
            upload_engine,
            download_engine,
            chat_id: config.chat_id.clone(),
            scratch_root: config.scratch_root.clone(),
            runs: Mutex::new(HashMap::new()),
        })
    }

    // -- Uploads --

    /// Route an upload by size: at or below the threshold it ships as one
    /// document, above it the chunked engine takes over. Returns the file id
    /// once the upload is registered (direct uploads complete inline).
    pub fn upload(&self, source: &Path, request: &UploadRequest) -> Result<String, VaultError> {
        let original_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| VaultError::NotFound(format!("no such file: {}", source.display())))?;

        // The engines are oblivious to plaintext vs ciphertext: encryption
        // happens here, on a temp copy the supervisor cleans up.
        let (payload_path, temp, opts) = match &request.encrypt_password {
            Some(password) => {
                let temp = self
                    .scratch_root
                    .join(format!("{}.enc", uuid::Uuid::new_v4()));
                crypto::encrypt_file(source, &temp, password)?;
                let opts = UploadOptions {
                    display_name: Some(original_name.clone()),
                    is_encrypted: true,
                };
                (temp.clone(), Some(temp), opts)
            }
            None => (source.to_path_buf(), None, UploadOptions::default()),
        };

        let size = fs::metadata(&payload_path)?.len();
        let settings = self.upload_engine.settings();

        if !settings.is_chunked(size) {
            let result = self.upload_engine.direct_upload(&payload_path, &opts);
            if let Some(temp) = temp {
                remove_quietly(&temp);
            }
            return result.map(|record| record.file_id);
        }

        let total_chunks = settings.chunk_count(size);
        let started = self.upload_engine.start(&payload_path, &opts);
        let (file_id, handle) = match started {
            Ok(pair) => pair,
            Err(e) => {
                if let Some(temp) = temp {
                    remove_quietly(&temp);
                }
                return Err(e);
            }
        };

        if let Some(notifier) = &self.notifier {
            notifier.register(
                &file_id,
                OperationKind::Upload,
                &original_name,
                size,
                total_chunks,
            );
        }
        self.track_run(&file_id, handle, temp);
        Ok(file_id)
    }

    pub fn resume_upload(&self, file_id: &str, source: &Path) -> Result<String, VaultError> {
        let (file_id, handle) = self.upload_engine.resume(file_id, source)?;
        if let Some(notifier) = &self.notifier {
            let upload = self.catalog.get_upload_state(&file_id)?;
            let record = self.catalog.get_file(&file_id)?;
            notifier.register(
                &file_id,
                OperationKind::Upload,
                &record.name,
                upload.total_bytes,
                upload.total_chunks,
            );
        }
        self.track_run(&file_id, handle, None);
        Ok(file_id)
    }

    // -- Downloads --

    /// Route a download. Direct files land synchronously; chunked files get
    /// a download id to wait on.
    pub fn download(
        &self,
        file_id: &str,
        dest_dir: &Path,
        password: Option<String>,
    ) -> Result<DownloadStart, VaultError> {
        let record = self.catalog.get_file(file_id)?;
        let destination = dest_dir.join(&record.name);

        match record.category {
            FileCategory::Direct => {
                self.download_engine
                    .direct_download(&record, &destination, password.as_deref())?;
                Ok(DownloadStart::Direct(destination))
            }
            FileCategory::Chunked => {
                let (download_id, handle) =
                    self.download_engine.start(file_id, &destination, password)?;
                if let Some(notifier) = &self.notifier {
                    let chunks = self.catalog.get_chunks(file_id)?;
                    notifier.register(
                        &download_id,
                        OperationKind::Download,
                        &record.name,
                        record.size,
                        chunks.len() as u64,
                    );
                }
                self.track_run(&download_id, handle, None);
                Ok(DownloadStart::Chunked { download_id })
            }
        }
    }

    /// Download every file of an imported share descriptor. The catalog is
    /// never touched: chunk routing comes from the manifest itself.
    pub fn download_share(
        &self,
        descriptor: &ShareDescriptor,
        dest_dir: &Path,
        password: Option<String>,
    ) -> Result<Vec<DownloadStart>, VaultError> {
        let mut starts = Vec::with_capacity(descriptor.files.len());
        for share_file in &descriptor.files {
            let destination = dest_dir.join(&share_file.file_name);
            match share_file.category {
                FileCategory::Direct => {
                    let record = FileRecord {
                        file_id: format!("shared-{}", uuid::Uuid::new_v4()),
                        name: share_file.file_name.clone(),
                        size: share_file.size,
                        mime: share_file.mime.clone(),
                        category: FileCategory::Direct,
                        uploaded_at: chrono::Utc::now(),
                        is_encrypted: share_file.is_encrypted,
                        owner_credential: String::new(),
                        direct_transport_id: share_file.direct_transport_id.clone(),
                        direct_message_id: None,
                    };
                    self.download_engine.direct_download(
                        &record,
                        &destination,
                        password.as_deref(),
                    )?;
                    starts.push(DownloadStart::Direct(destination));
                }
                FileCategory::Chunked => {
                    let manifest = share_file.chunk_manifest(&share_file.file_name);
                    let (download_id, handle) = self.download_engine.start_portable(
                        &share_file.file_name,
                        manifest,
                        &destination,
                        share_file.is_encrypted,
                        password.clone(),
                    )?;
                    if let Some(notifier) = &self.notifier {
                        notifier.register(
                            &download_id,
                            OperationKind::Download,
                            &share_file.file_name,
                            share_file.size,
                            share_file.chunks.as_deref().map(|c| c.len()).unwrap_or(0) as u64,
                        );
                    }
                    self.track_run(&download_id, handle, None);
                    starts.push(DownloadStart::Chunked { download_id });
                }
            }
        }
        Ok(starts)
    }

    pub fn resume_download(
        &self,
        download_id: &str,
        password: Option<String>,
    ) -> Result<String, VaultError> {
        let (download_id, handle) = self.download_engine.resume(download_id, password)?;
        if let Some(notifier) = &self.notifier {
            let state = self.catalog.get_download_state(&download_id)?;
            let record = self.catalog.get_file(&state.file_id)?;
            notifier.register(
                &download_id,
                OperationKind::Download,
                &record.name,
                record.size,
                state.total_chunks,
            );
        }
        self.track_run(&download_id, handle, None);
        Ok(download_id)
    }

    // -- Transfer control --

    /// An operation id names either an upload (by file id) or a download.
    pub fn pause(&self, operation_id: &str) -> Result<(), VaultError> {
        self.route_control(operation_id, |up, id| up.pause(id), |down, id| down.pause(id))
    }

    pub fn stop(&self, operation_id: &str) -> Result<(), VaultError> {
        self.route_control(operation_id, |up, id| up.stop(id), |down, id| down.stop(id))
    }

    pub fn cancel(&self, operation_id: &str) -> Result<(), VaultError> {
        self.route_control(
            operation_id,
            |up, id| up.cancel(id),
            |down, id| down.cancel(id),
        )
    }

    fn route_control(
        &self,
        operation_id: &str,
        on_upload: impl Fn(&UploadEngine, &str) -> Result<(), VaultError>,
        on_download: impl Fn(&DownloadEngine, &str) -> Result<(), VaultError>,
    ) -> Result<(), VaultError> {
        if self.catalog.get_upload_state(operation_id).is_ok() {
            return on_upload(&self.upload_engine, operation_id);
        }
        if self.catalog.get_download_state(operation_id).is_ok() {
            return on_download(&self.download_engine, operation_id);
        }
        Err(VaultError::NotFound(format!(
            "no active transfer named {operation_id}"
        )))
    }

    /// Block until a supervised operation finishes and return its outcome.
    pub fn wait(&self, operation_id: &str) -> Result<TransferOutcome, VaultError> {
        let handle = self
            .runs
            .lock()
            .unwrap()
            .remove(operation_id)
            .ok_or_else(|| {
                VaultError::NotFound(format!("no supervised run named {operation_id}"))
            })?;
        handle
            .join()
            .unwrap_or_else(|_| Err(VaultError::Internal("transfer supervisor panicked".into())))
    }

    // -- Catalog queries --

    pub fn list_files(&self) -> Result<Vec<FileRecord>, VaultError> {
        self.catalog.list_files()
    }

    pub fn list_incomplete_uploads(&self) -> Result<Vec<UploadState>, VaultError> {
        self.upload_engine.list_incomplete()
    }

    pub fn list_incomplete_downloads(&self) -> Result<Vec<DownloadState>, VaultError> {
        self.download_engine.list_incomplete()
    }

    pub fn stats(&self) -> Result<CatalogStats, VaultError> {
        self.catalog.stats()
    }

    // -- Deletion --

    /// Delete a file. With `delete_remote`, every stored message is first
    /// deleted through the credential that sent it; remote refusals are
    /// logged and do not block the local delete.
    pub fn delete_file(&self, file_id: &str, delete_remote: bool) -> Result<(), VaultError> {
        if delete_remote {
            for message in self.catalog.messages_to_delete(file_id)? {
                let Some(credential) = self.pool.by_id(&message.owner_credential) else {
                    warn!(
                        file_id,
                        credential = %message.owner_credential,
                        "owning credential no longer configured; leaving remote message"
                    );
                    continue;
                };
                match self
                    .transport
                    .delete_message(credential, &self.chat_id, message.message_id)
                {
                    Ok(DeleteOutcome::Deleted) => {}
                    Ok(outcome) => warn!(
                        file_id,
                        message_id = message.message_id,
                        ?outcome,
                        "remote message not deleted"
                    ),
                    Err(e) => warn!(
                        file_id,
                        message_id = message.message_id,
                        %e,
                        "remote delete failed"
                    ),
                }
            }
        }
        self.catalog.delete_file(file_id)?;
        info!(file_id, delete_remote, "file deleted");
        Ok(())
    }

    // -- Sharing --

    /// Write a password-protected `.link` descriptor for the given files.
    pub fn share(
        &self,
        file_ids: &[String],
        password: &str,
        out_path: &Path,
    ) -> Result<PathBuf, VaultError> {
        let mut items = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let record = self.catalog.get_file(file_id)?;
            let chunks = self.catalog.get_chunks(file_id)?;
            items.push((record, chunks));
        }
        let descriptor = ShareDescriptor::batch(&items)?;

        let path = if out_path
            .extension()
            .is_some_and(|e| e == chatvault_share::LINK_EXTENSION)
        {
            out_path.to_path_buf()
        } else {
            out_path.with_extension(chatvault_share::LINK_EXTENSION)
        };
        descriptor.write_link(&path, password)?;
        Ok(path)
    }

    pub fn import_share(
        &self,
        link_path: &Path,
        password: &str,
    ) -> Result<ShareDescriptor, VaultError> {
        ShareDescriptor::read_link(link_path, password)
    }

    // -- Backup --

    /// Copy the catalog file through the magic-framed backup envelope.
    pub fn backup_catalog(&self, out_path: &Path, password: &str) -> Result<(), VaultError> {
        crypto::encrypt_backup_file(&self.catalog_path, out_path, password)?;
        info!(backup = %out_path.display(), "catalog backup written");
        Ok(())
    }

    /// Restore a catalog backup to `dest`. Run before `init` opens the
    /// catalog; refuses to overwrite an existing file.
    pub fn restore_catalog(
        backup_path: &Path,
        dest: &Path,
        password: &str,
    ) -> Result<(), VaultError> {
        if dest.exists() {
            return Err(VaultError::Internal(format!(
                "refusing to overwrite existing catalog at {}",
                dest.display()
            )));
        }
        crypto::decrypt_backup_file(backup_path, dest, password)?;
        info!(catalog = %dest.display(), "catalog restored from backup");
        Ok(())
    }

    // -- Shutdown --

    /// Pause every live run, join the supervisors, force any remaining
    /// `active` rows to `paused`, and stop the notifier.
    pub fn shutdown(&self) {
        let handles: Vec<(String, SupervisedRun)> =
            self.runs.lock().unwrap().drain().collect();
        for (operation_id, _) in &handles {
            self.controls.pause(operation_id);
        }
        for (operation_id, handle) in handles {
            match handle.join() {
                Ok(Ok(outcome)) => info!(%operation_id, ?outcome, "transfer wound down"),
                Ok(Err(e)) => warn!(%operation_id, %e, "transfer ended with error at shutdown"),
                Err(_) => warn!(%operation_id, "transfer supervisor panicked"),
            }
        }

        if let Err(e) = self.catalog.mark_all_active_uploads_paused() {
            warn!(%e, "could not pause active uploads at shutdown");
        }
        if let Err(e) = self.catalog.mark_all_active_downloads_paused() {
            warn!(%e, "could not pause active downloads at shutdown");
        }
        if let Some(notifier) = &self.notifier {
            notifier.stop();
        }
        info!("orchestrator shut down");
    }

    fn track_run(&self, operation_id: &str, handle: SupervisedRun, temp: Option<PathBuf>) {
        // Wrap the engine handle so temp payloads are cleaned up no matter
        // how the run ends.
        let supervised: SupervisedRun = match temp {
            None => handle,
            Some(temp) => {
                let op = operation_id.to_string();
                std::thread::Builder::new()
                    .name(format!("cleanup-{}", &op[..8.min(op.len())]))
                    .spawn(move || {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(VaultError::Internal("transfer supervisor panicked".into()))
                        });
                        remove_quietly(&temp);
                        result
                    })
                    .unwrap_or_else(|e| {
                        // Could not spawn the cleanup wrapper; fall back to a
                        // finished run carrying the error.
                        warn!(%e, "could not spawn cleanup wrapper");
                        std::thread::spawn(move || {
                            Err(VaultError::Internal("cleanup wrapper unavailable".into()))
                        })
                    })
            }
        };
        self.runs
            .lock()
            .unwrap()
            .insert(operation_id.to_string(), supervised);
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %e, "could not remove temp file");
        }
    }
}
