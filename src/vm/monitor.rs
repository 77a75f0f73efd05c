//! Lifecycle observers.

use crate::config::VmRecord;
use crate::vm::VmState;
use std::path::PathBuf;

/// Receives lifecycle notifications from a VM.
///
/// Hooks are called while the VM's transition lock is held, so they must not
/// call back into the VM.
pub trait VmStatusMonitor: Send + Sync {
    /// Persist the new lifecycle state of `name`.
    fn persist_state_for(&self, name: &str, state: VmState);

    /// The VM came up (or resumed).
    fn on_resume(&self) {}

    /// The VM was shut down.
    fn on_shutdown(&self) {}

    /// The VM was paused.
    fn on_suspend(&self) {}
}

/// Monitor that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl VmStatusMonitor for NoopMonitor {
    fn persist_state_for(&self, _name: &str, _state: VmState) {}
}

/// Monitor that keeps the `state` field of a [`VmRecord`] file current.
#[derive(Debug, Clone)]
pub struct RecordMonitor {
    path: PathBuf,
}

impl RecordMonitor {
    /// Monitor updating the record at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VmStatusMonitor for RecordMonitor {
    fn persist_state_for(&self, name: &str, state: VmState) {
        let result = VmRecord::load(&self.path).and_then(|mut record| {
            record.state = state;
            record.save(&self.path)
        });
        if let Err(e) = result {
            tracing::warn!(vm = %name, state = %state, error = %e, "failed to persist vm state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmSpecs;
    use tempfile::TempDir;

    #[test]
    fn test_record_monitor_updates_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vm.json");
        VmRecord::new("primary", VmSpecs::default(), "/images/a.img")
            .save(&path)
            .unwrap();

        let monitor = RecordMonitor::new(&path);
        monitor.persist_state_for("primary", VmState::Suspended);

        assert_eq!(VmRecord::load(&path).unwrap().state, VmState::Suspended);
    }

    #[test]
    fn test_record_monitor_tolerates_missing_record() {
        let tmp = TempDir::new().unwrap();
        let monitor = RecordMonitor::new(tmp.path().join("gone.json"));
        monitor.persist_state_for("gone", VmState::Running);
        assert!(!tmp.path().join("gone.json").exists());
    }
}
