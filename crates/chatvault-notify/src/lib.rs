//! Out-of-band progress surface for long-running transfers.
//!
//! Keeps an in-memory map of active operations, pushes completion and
//! failure notices through the [`Messenger`], and answers the literal `%`
//! command with a snapshot of everything in flight. The polling loop runs
//! on its own thread with a bounded round time, so shutdown lands within
//! one interval.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chatvault_engine::ProgressSink;
use chatvault_transport::Messenger;
use chatvault_types::VaultError;
use tracing::{debug, info, warn};

/// Long-poll round cap; also the upper bound on shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Breather between rounds that returned nothing (keeps non-blocking
/// messengers from spinning).
const IDLE_PAUSE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Upload,
    Download,
}

impl OperationKind {
    fn arrow(&self) -> &'static str {
        match self {
            Self::Upload => "⬆️",
            Self::Download => "⬇️",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Upload => "uploading",
            Self::Download => "downloading",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActiveOperation {
    pub kind: OperationKind,
    pub name: String,
    pub total_bytes: u64,
    pub chunks_done: u64,
    pub chunks_total: u64,
    pub percent: f64,
    pub status: String,
}

struct Inner {
    messenger: Arc<dyn Messenger>,
    operations: Mutex<HashMap<String, ActiveOperation>>,
    stop: AtomicBool,
}

pub struct Notifier {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            inner: Arc::new(Inner {
                messenger,
                operations: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the polling thread. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!("notifier already running");
            return;
        }
        self.inner.stop.store(false, Ordering::Relaxed);
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("notifier-poll".into())
            .spawn(move || {
                while !inner.stop.load(Ordering::Relaxed) {
                    if !inner.poll_once() {
                        std::thread::sleep(IDLE_PAUSE);
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!("notifier started");
            }
            Err(e) => warn!(%e, "could not start notifier poll thread"),
        }
    }

    /// Stop the polling thread; returns once it has joined.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
            info!("notifier stopped");
        }
    }

    pub fn register(
        &self,
        operation_id: &str,
        kind: OperationKind,
        name: &str,
        total_bytes: u64,
        chunks_total: u64,
    ) {
        let mut ops = self.inner.operations.lock().unwrap();
        ops.insert(
            operation_id.to_string(),
            ActiveOperation {
                kind,
                name: name.to_string(),
                total_bytes,
                chunks_done: 0,
                chunks_total,
                percent: 0.0,
                status: kind.verb().to_string(),
            },
        );
        debug!(operation_id, name, "operation registered");
    }

    pub fn update(
        &self,
        operation_id: &str,
        chunks_done: u64,
        percent: f64,
        status: Option<&str>,
    ) {
        let mut ops = self.inner.operations.lock().unwrap();
        if let Some(op) = ops.get_mut(operation_id) {
            op.chunks_done = chunks_done;
            op.percent = percent;
            if let Some(status) = status {
                op.status = status.to_string();
            }
        }
    }

    /// Emit the completion notice and drop the operation from the map.
    pub fn completed(&self, operation_id: &str, destination: Option<&Path>) {
        let removed = self.inner.operations.lock().unwrap().remove(operation_id);
        let Some(op) = removed else {
            warn!(operation_id, "completion for unknown operation");
            return;
        };

        let mut text = match op.kind {
            OperationKind::Upload => String::from("⬆️ Upload Completed\n\n"),
            OperationKind::Download => String::from("⬇️ Download Completed\n\n"),
        };
        text.push_str(&format!("📁 File: {}\n\n", op.name));
        text.push_str(&format!("📊 Size: {}\n\n", format_size(op.total_bytes)));
        text.push_str(&format!("📦 Chunks: {}\n\n", op.chunks_total));
        if let Some(dest) = destination {
            text.push_str(&format!("📥 Location: {}\n\n", dest.display()));
        }
        text.push_str(&format!("🆔 ID: {operation_id}"));

        if let Err(e) = self.inner.messenger.send_message(&text) {
            warn!(operation_id, %e, "could not send completion notice");
        }
    }

    /// Emit the failure notice and drop the operation from the map.
    pub fn failed(&self, operation_id: &str, error: &VaultError) {
        let removed = self.inner.operations.lock().unwrap().remove(operation_id);
        let Some(op) = removed else {
            warn!(operation_id, "failure for unknown operation");
            return;
        };

        let text = format!(
            "❌ Operation Failed\n\n📁 File: {}\n\n⚠️ Error: {}\n\n🆔 ID: {}",
            op.name, error, operation_id
        );
        if let Err(e) = self.inner.messenger.send_message(&text) {
            warn!(operation_id, %e, "could not send failure notice");
        }
    }

    /// Drop an operation without any notice.
    pub fn remove(&self, operation_id: &str) {
        self.inner.operations.lock().unwrap().remove(operation_id);
    }

    pub fn active_count(&self) -> usize {
        self.inner.operations.lock().unwrap().len()
    }

    /// One poll round, exposed for tests. Returns whether any command came in.
    pub fn poll_once(&self) -> bool {
        self.inner.poll_once()
    }

    /// Adapter that lets the engines report through this notifier.
    pub fn sink(self: &Arc<Self>) -> Arc<dyn ProgressSink> {
        Arc::new(NotifierSink {
            notifier: self.clone(),
        })
    }
}

impl Inner {
    fn poll_once(&self) -> bool {
        let commands = match self.messenger.poll_commands(POLL_TIMEOUT) {
            Ok(commands) => commands,
            Err(e) => {
                warn!(%e, "notifier poll failed");
                return false;
            }
        };
        let got_any = !commands.is_empty();
        for command in commands {
            if command.trim() == "%" {
                let report = self.progress_report();
                if let Err(e) = self.messenger.send_message(&report) {
                    warn!(%e, "could not send progress report");
                }
            }
        }
        got_any
    }

    fn progress_report(&self) -> String {
        let ops = self.operations.lock().unwrap();
        if ops.is_empty() {
            return "📊 No active operations".to_string();
        }
        let mut lines = vec![format!("📊 Active Operations ({})", ops.len())];
        let mut entries: Vec<_> = ops.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (id, op) in entries {
            lines.push(format!(
                "{} {}: {:.0}% ({}/{} chunks) — {} [{}]",
                op.kind.arrow(),
                op.name,
                op.percent,
                op.chunks_done,
                op.chunks_total,
                op.status,
                id,
            ));
        }
        lines.join("\n")
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}

struct NotifierSink {
    notifier: Arc<Notifier>,
}

impl ProgressSink for NotifierSink {
    fn progress(&self, operation_id: &str, completed: u64, _total: u64, percent: f64) {
        self.notifier.update(operation_id, completed, percent, None);
    }

    fn reassembly_progress(&self, operation_id: &str, appended: u64, total: u64) {
        let percent = if total == 0 {
            100.0
        } else {
            appended as f64 / total as f64 * 100.0
        };
        self.notifier
            .update(operation_id, appended, percent, Some("reassembling"));
    }

    fn completed(&self, operation_id: &str, destination: Option<&Path>) {
        self.notifier.completed(operation_id, destination);
    }

    fn failed(&self, operation_id: &str, error: &VaultError) {
        self.notifier.failed(operation_id, error);
    }
}

/// Human-readable size, MB/GB style.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}
