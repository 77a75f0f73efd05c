//! CLI command implementations.

pub mod snapshot;
pub mod vm;

use fleetvm::{
    DirSnapshotStore, FleetConfig, ProcessBackend, RecordMonitor, VirtualMachine, VmRecord,
};
use std::sync::Arc;

// ============================================================================
// Display Constants
// ============================================================================

/// Display width for snapshot comments.
pub const COMMENT_WIDTH: usize = 40;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

// ============================================================================
// Display Helpers
// ============================================================================

/// Truncate a string to max characters, adding "..." if needed.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else if max <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max - 3).collect();
        format!("{}...", kept)
    }
}

/// Format a byte count as MiB or GiB.
pub fn format_size(bytes: u64) -> String {
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{} GiB", bytes / GIB)
    } else {
        format!("{} MiB", bytes / MIB)
    }
}

/// Convert a size flag to bytes, rejecting values that overflow.
pub fn to_bytes(value: u64, unit: u64, flag: &str) -> fleetvm::Result<u64> {
    value.checked_mul(unit).ok_or_else(|| {
        fleetvm::Error::InvalidSpecs(format!("--{} is too large: {}", flag, value))
    })
}

// ============================================================================
// VM Access
// ============================================================================

/// A VM rebuilt from its record, with snapshots loaded.
pub struct OpenVm {
    pub config: FleetConfig,
    pub record: VmRecord,
    pub vm: VirtualMachine,
}

impl OpenVm {
    /// Load the record of `name` and rebuild the VM around it.
    pub fn open(name: &str) -> fleetvm::Result<Self> {
        let config = FleetConfig::from_env();
        let record_path = config.record_path(name);
        let record = VmRecord::load(&record_path)?;

        let backend = ProcessBackend::new(
            record.command.clone(),
            &record.disk_image,
            config.artifacts_dir(name),
        );
        let store = DirSnapshotStore::new(config.snapshots_dir(name));

        let vm = VirtualMachine::builder(name, Arc::new(backend), Arc::new(store))
            .settings(config.vm_settings())
            .specs(record.specs.clone())
            .monitor(Arc::new(RecordMonitor::new(record_path)))
            .initial_state(record.state)
            .build()?;
        let loaded = vm.load_snapshots()?;
        tracing::debug!(vm = %name, snapshots = loaded, "opened vm");

        Ok(Self { config, record, vm })
    }

    /// Write the VM's current specs and state back to its record.
    pub fn save(&mut self) -> fleetvm::Result<()> {
        self.record.specs = self.vm.specs();
        self.record.state = self.vm.current_state();
        self.record.save(&self.config.record_path(self.vm.name()))
    }
}
