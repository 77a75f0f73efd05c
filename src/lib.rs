//! fleetvm - VM lifecycle and snapshot management
//!
//! fleetvm is the per-VM core of a fleet manager: a lifecycle state machine
//! arbitrating start, shutdown and suspend, and a persistent tree of
//! snapshots that can be taken, restored and deleted while the VM is down.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  fleetvm CLI / Fleet registry                   │
//! ├─────────────────────────────────────────────────┤
//! │  VirtualMachine (lifecycle + snapshot chain)    │
//! ├──────────────────────────┬──────────────────────┤
//! │  VmBackend               │  SnapshotStore       │
//! │  (process, ...)          │  (directory)         │
//! └──────────────────────────┴──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleetvm::{DirSnapshotStore, FleetConfig, ProcessBackend, VirtualMachine};
//!
//! let config = FleetConfig::from_env();
//! let backend = ProcessBackend::new(
//!     vec!["qemu-system-x86_64".into(), "-nographic".into()],
//!     "/images/primary.img",
//!     config.artifacts_dir("primary"),
//! );
//! let store = DirSnapshotStore::new(config.snapshots_dir("primary"));
//!
//! let vm = VirtualMachine::builder("primary", Arc::new(backend), Arc::new(store))
//!     .settings(config.vm_settings())
//!     .build()
//!     .unwrap();
//! vm.load_snapshots().unwrap();
//!
//! let snapshot = vm.take_snapshot("", "before upgrade").unwrap();
//! vm.restore_snapshot(&snapshot.name).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod fleet;
pub mod snapshot;
pub mod util;
pub mod vm;

// Re-export main types for convenience
pub use config::{FleetConfig, VmRecord, VmSettings};
pub use error::{Error, ErrorKind, Result};
pub use fleet::{Fleet, Reservation};
pub use snapshot::{DirSnapshotStore, Recovery, Snapshot, SnapshotChain, SnapshotStore};
pub use vm::{
    NoopMonitor, ProcessBackend, RecordMonitor, ShutdownPolicy, VirtualMachine, VmBackend,
    VmSpecs, VmState, VmStatusMonitor,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
