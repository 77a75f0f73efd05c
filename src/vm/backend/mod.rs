//! VM backend abstraction.
//!
//! A backend is the hypervisor-specific half of a VM: it boots, stops and
//! pauses the guest, reports what state the guest is really in, and owns the
//! artifacts behind each snapshot. The generic half (state machine, snapshot
//! chain, persistence) lives in [`VirtualMachine`](crate::vm::VirtualMachine).

mod process;

#[cfg(test)]
pub(crate) mod mock;

pub use process::ProcessBackend;

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::vm::{ShutdownPolicy, VmState};

/// Trait for VM backends.
///
/// Primitives are called while the owning VM holds its transition or
/// snapshot locks; they must not call back into the VM.
pub trait VmBackend: Send + Sync {
    /// Backend name, used in logs and `Unsupported` errors.
    fn backend_name(&self) -> &'static str;

    /// Boot the guest, or resume it from `suspended`.
    ///
    /// Blocks until the backend has either launched the guest or failed.
    fn start(&self) -> Result<()>;

    /// Ask the guest to stop. Does not wait for it to be down.
    fn stop(&self, policy: ShutdownPolicy) -> Result<()>;

    /// Pause the guest.
    fn suspend(&self) -> Result<()>;

    /// The guest's state as the backend sees it right now.
    fn current_state(&self) -> VmState;

    /// Drop any management session (SSH and similar) held for the guest.
    fn drop_session(&self) {}

    /// Whether capture/apply/erase are implemented.
    fn supports_snapshots(&self) -> bool {
        false
    }

    /// Freeze the guest's current disk and state for `snapshot`.
    ///
    /// Returns a descriptor of the captured artifacts, stored in the
    /// snapshot file.
    fn capture(&self, snapshot: &Snapshot) -> Result<serde_json::Value> {
        let _ = snapshot;
        Err(self.snapshots_unsupported())
    }

    /// Revert the guest's disk and state to `snapshot`.
    fn apply(&self, snapshot: &Snapshot) -> Result<()> {
        let _ = snapshot;
        Err(self.snapshots_unsupported())
    }

    /// Delete the artifacts of `snapshot`.
    ///
    /// Must tolerate snapshots whose capture never completed.
    fn erase(&self, snapshot: &Snapshot) -> Result<()> {
        let _ = snapshot;
        Err(self.snapshots_unsupported())
    }

    /// The `Unsupported` error for this backend's snapshot primitives.
    fn snapshots_unsupported(&self) -> Error {
        Error::Unsupported {
            backend: self.backend_name().to_string(),
            feature: "snapshots".to_string(),
        }
    }
}
