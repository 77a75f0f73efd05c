//! Error types for fleetvm.
//!
//! # Error Message Style Guide
//!
//! All error messages follow a consistent format for clarity and actionability:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: All lowercase (Rust convention for error messages)
//! - **Context**: Include the VM and snapshot names when available
//!
//! ## Preferred Patterns
//!
//! ```text
//! "snapshot capture failed: disk image missing"
//! "snapshot not found: vm=primary, snapshot=snapshot3"
//! "invalid vm state for primary: expected off or stopped, got running"
//! ```
//!
//! # Classification
//!
//! Every error maps to an [`ErrorKind`]. Callers (an RPC layer, the CLI)
//! translate kinds into protocol responses without matching on message text.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using fleetvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of errors, used to decide whether a call is retryable and
/// how it maps onto a protocol-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected input (name taken, cap reached, size mismatch). Nothing was mutated.
    Validation,
    /// Unknown VM or snapshot. Nothing was mutated.
    NotFound,
    /// Wrong lifecycle state for the requested operation. Nothing was mutated.
    Precondition,
    /// The backend does not implement the requested feature.
    Unsupported,
    /// A backend primitive failed; rollback (if any) has already run.
    Backend,
    /// Reading or writing persisted state failed.
    Persistence,
    /// A bounded wait expired.
    Timeout,
}

/// Errors that can occur in fleetvm operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// A snapshot with this name already exists.
    #[error("snapshot name taken: vm={vm}, snapshot={name}")]
    SnapshotNameTaken {
        /// Owning VM.
        vm: String,
        /// Requested snapshot name.
        name: String,
    },

    /// The snapshot cap has been reached.
    #[error("snapshot limit reached for {vm}: maximum is {max}")]
    SnapshotLimitReached {
        /// Owning VM.
        vm: String,
        /// Configured cap.
        max: u32,
    },

    /// Snapshot name does not satisfy naming rules.
    #[error("invalid snapshot name '{name}': {reason}")]
    InvalidSnapshotName {
        /// Rejected name.
        name: String,
        /// Which rule was violated.
        reason: String,
    },

    /// The snapshot was captured with a different disk size than the VM has now.
    #[error(
        "disk size mismatch restoring {snapshot} on {vm}: snapshot has {expected} bytes, vm has {actual} bytes"
    )]
    DiskSizeMismatch {
        /// Owning VM.
        vm: String,
        /// Snapshot being restored.
        snapshot: String,
        /// Disk size recorded in the snapshot.
        expected: u64,
        /// Current disk size of the VM.
        actual: u64,
    },

    /// Resizing the disk of a VM that has snapshots is not supported.
    #[error("cannot resize disk of {vm}: vm has snapshots")]
    ResizeWithSnapshots {
        /// Owning VM.
        vm: String,
    },

    /// VM specs are not usable (zero cores, zero memory, ...).
    #[error("invalid vm specs: {0}")]
    InvalidSpecs(String),

    /// Deleting this root snapshot would split the chain into several roots.
    #[error("cannot delete root snapshot {name} of {vm}: it has more than one child")]
    RootWithMultipleChildren {
        /// Owning VM.
        vm: String,
        /// Root snapshot name.
        name: String,
    },

    /// A VM with this name is already registered.
    #[error("vm already exists: {name}")]
    VmExists {
        /// VM name.
        name: String,
    },

    // ========================================================================
    // Not Found Errors
    // ========================================================================
    /// Snapshot not found by name.
    #[error("snapshot not found: vm={vm}, snapshot={name}")]
    SnapshotNotFound {
        /// Owning VM.
        vm: String,
        /// Requested snapshot name.
        name: String,
    },

    /// VM not found by name.
    #[error("vm not found: {name}")]
    VmNotFound {
        /// Name of the VM that was not found.
        name: String,
    },

    // ========================================================================
    // Precondition Errors
    // ========================================================================
    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state for {vm}: expected {expected}, got {actual}")]
    InvalidState {
        /// VM name.
        vm: String,
        /// Expected state(s).
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The backend cannot tell what state the VM is in.
    #[error("vm state unknown for {vm}: operation unsupported until the state is known")]
    StateUnknown {
        /// VM name.
        vm: String,
    },

    // ========================================================================
    // Backend Errors
    // ========================================================================
    /// The backend does not implement a feature.
    #[error("{feature} not implemented on the {backend} backend")]
    Unsupported {
        /// Backend name.
        backend: String,
        /// Feature name (e.g. "snapshots").
        feature: String,
    },

    /// Starting the VM failed.
    #[error("vm start failed for {vm}: {reason}")]
    StartFailed {
        /// VM name.
        vm: String,
        /// Backend reason.
        reason: String,
    },

    /// A concurrent shutdown pre-empted the start.
    #[error("vm start failed for {vm}: shut down while starting")]
    StartAborted {
        /// VM name.
        vm: String,
    },

    /// A backend primitive failed.
    #[error("{operation} failed: {reason}")]
    Backend {
        /// The primitive that failed (e.g., "snapshot capture", "vm stop").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A bounded wait expired.
    #[error("{operation} timed out after {seconds} seconds")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// Configured bound.
        seconds: u64,
    },

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    /// Storage operation failed.
    #[error("storage operation failed: {operation}: {reason}")]
    Storage {
        /// The operation that failed (e.g., "write head file").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Persisted snapshot state is inconsistent.
    #[error("corrupt snapshot state in {}: {reason}", path.display())]
    CorruptSnapshots {
        /// Snapshot directory or file.
        path: PathBuf,
        /// What is inconsistent.
        reason: String,
    },

    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error wrapper.
    #[error("json operation failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    // ========================================================================
    // Constructors
    // ========================================================================

    /// Create a backend operation error.
    pub fn backend(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage operation error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt snapshot state error.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptSnapshots {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(
        vm: impl Into<String>,
        expected: impl Into<String>,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidState {
            vm: vm.into(),
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Create a snapshot not found error.
    pub fn snapshot_not_found(vm: impl Into<String>, name: impl Into<String>) -> Self {
        Self::SnapshotNotFound {
            vm: vm.into(),
            name: name.into(),
        }
    }

    /// Create a VM not found error.
    pub fn vm_not_found(name: impl Into<String>) -> Self {
        Self::VmNotFound { name: name.into() }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, bound: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds: bound.as_secs(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SnapshotNameTaken { .. }
            | Error::SnapshotLimitReached { .. }
            | Error::InvalidSnapshotName { .. }
            | Error::DiskSizeMismatch { .. }
            | Error::ResizeWithSnapshots { .. }
            | Error::InvalidSpecs(_)
            | Error::RootWithMultipleChildren { .. }
            | Error::VmExists { .. } => ErrorKind::Validation,
            Error::SnapshotNotFound { .. } | Error::VmNotFound { .. } => ErrorKind::NotFound,
            Error::InvalidState { .. } | Error::StateUnknown { .. } => ErrorKind::Precondition,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::StartFailed { .. } | Error::StartAborted { .. } | Error::Backend { .. } => {
                ErrorKind::Backend
            }
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Storage { .. }
            | Error::CorruptSnapshots { .. }
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::Persistence,
        }
    }

    /// Whether the call was rejected before any mutation took place.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Precondition
        )
    }
}
