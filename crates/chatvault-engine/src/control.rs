use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Control flags for one active transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub paused: bool,
    pub canceled: bool,
}

/// Pause/stop/cancel flags for every active transfer, keyed by operation id.
///
/// Owned by the orchestrator and passed to the engines by shared reference.
/// Workers snapshot the flags at chunk boundaries; entries are removed when
/// a transfer leaves the engine, so the map never outgrows the set of live
/// operations.
#[derive(Default)]
pub struct ControlRegistry {
    flags: Mutex<HashMap<String, ControlState>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking an operation with clear flags.
    pub fn track(&self, operation_id: &str) {
        self.flags
            .lock()
            .unwrap()
            .insert(operation_id.to_string(), ControlState::default());
    }

    /// Stop tracking; subsequent snapshots read as clear.
    pub fn untrack(&self, operation_id: &str) {
        self.flags.lock().unwrap().remove(operation_id);
    }

    pub fn is_tracked(&self, operation_id: &str) -> bool {
        self.flags.lock().unwrap().contains_key(operation_id)
    }

    /// Request a pause. Returns false if the operation is not tracked.
    pub fn pause(&self, operation_id: &str) -> bool {
        let mut flags = self.flags.lock().unwrap();
        match flags.get_mut(operation_id) {
            Some(state) => {
                state.paused = true;
                debug!(operation_id, "pause requested");
                true
            }
            None => false,
        }
    }

    /// Request cancellation. Returns false if the operation is not tracked.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let mut flags = self.flags.lock().unwrap();
        match flags.get_mut(operation_id) {
            Some(state) => {
                state.canceled = true;
                debug!(operation_id, "cancel requested");
                true
            }
            None => false,
        }
    }

    /// Snapshot the flags for a worker's boundary check.
    pub fn snapshot(&self, operation_id: &str) -> ControlState {
        self.flags
            .lock()
            .unwrap()
            .get(operation_id)
            .copied()
            .unwrap_or_default()
    }
}
