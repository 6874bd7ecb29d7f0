use std::path::Path;

use chatvault_types::VaultError;

/// Typed progress capability the engines report through. The UI or the
/// notifier supplies an implementation; the engines never know which.
pub trait ProgressSink: Send + Sync {
    /// A chunk finished transferring.
    fn progress(&self, operation_id: &str, completed: u64, total: u64, percent: f64);

    /// A chunk was appended to the destination during reassembly. Reported
    /// separately so UIs can show the two phases distinctly.
    fn reassembly_progress(&self, operation_id: &str, appended: u64, total: u64);

    /// The operation reached its terminal success state.
    fn completed(&self, operation_id: &str, destination: Option<&Path>);

    /// The operation failed or was canceled.
    fn failed(&self, operation_id: &str, error: &VaultError);
}

/// Sink that discards all events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _operation_id: &str, _completed: u64, _total: u64, _percent: f64) {}
    fn reassembly_progress(&self, _operation_id: &str, _appended: u64, _total: u64) {}
    fn completed(&self, _operation_id: &str, _destination: Option<&Path>) {}
    fn failed(&self, _operation_id: &str, _error: &VaultError) {}
}

/// Sink that logs through `tracing`, used by the CLI.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn progress(&self, operation_id: &str, completed: u64, total: u64, percent: f64) {
        tracing::debug!(operation_id, completed, total, percent, "chunk transferred");
    }

    fn reassembly_progress(&self, operation_id: &str, appended: u64, total: u64) {
        tracing::debug!(operation_id, appended, total, "chunk reassembled");
    }

    fn completed(&self, operation_id: &str, destination: Option<&Path>) {
        match destination {
            Some(dest) => {
                tracing::info!(operation_id, destination = %dest.display(), "operation completed")
            }
            None => tracing::info!(operation_id, "operation completed"),
        }
    }

    fn failed(&self, operation_id: &str, error: &VaultError) {
        tracing::warn!(operation_id, %error, "operation failed");
    }
}
