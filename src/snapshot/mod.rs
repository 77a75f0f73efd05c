//! Snapshots: captures of a stopped VM.
//!
//! A [`Snapshot`] records the VM's specs and lifecycle state at capture time,
//! the name of its parent (the head when it was taken), and an opaque
//! backend artifact descriptor. Snapshots form a tree whose current position
//! is the *head*; [`SnapshotChain`] holds the tree and [`SnapshotStore`]
//! persists it.
//!
//! On disk each snapshot is a self-contained JSON file named
//! `<index:04>-<name>.snapshot.json`, next to two pointer files:
//!
//! ```text
//! snapshots/
//! ├── 0001-snapshot1.snapshot.json
//! ├── 0002-pre-upgrade.snapshot.json
//! ├── snapshot-head     # name of the head, empty when there is none
//! └── snapshot-count    # number of snapshots ever created
//! ```

mod chain;
mod store;

pub use chain::{Recovery, SnapshotChain};
pub use store::{DirSnapshotStore, PersistedChain, SnapshotStore};
pub use store::{COUNT_FILE, HEAD_FILE, SNAPSHOT_FILE_SUFFIX};

#[cfg(test)]
pub(crate) use store::testing;

use crate::error::{Error, Result};
use crate::util;
use crate::vm::{VmSpecs, VmState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A captured VM configuration plus backend artifacts.
///
/// The captured state never changes once persisted. Only the name, the
/// comment and the parent link (on deletion of the parent) can be rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Creation index; 1-based and monotonic per VM.
    pub index: u32,
    /// Unique (per VM) snapshot name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub comment: String,
    /// Name of the parent snapshot, `None` for the root.
    #[serde(default)]
    pub parent: Option<String>,
    /// Lifecycle state at capture time.
    pub state: VmState,
    /// Specs at capture time.
    pub specs: VmSpecs,
    /// Backend-specific description of the captured artifacts.
    #[serde(default)]
    pub artifact: serde_json::Value,
    /// Capture time.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot record, validating its inputs.
    ///
    /// The artifact is left empty; the backend fills it in during capture.
    pub fn new(
        index: u32,
        name: impl Into<String>,
        comment: impl Into<String>,
        parent: Option<String>,
        state: VmState,
        specs: VmSpecs,
    ) -> Result<Self> {
        let name = name.into();
        util::validate_snapshot_name(&name)?;

        if index == 0 {
            return Err(Error::InvalidSpecs(format!(
                "snapshot {} has invalid index 0",
                name
            )));
        }
        if !state.is_capturable() {
            return Err(Error::InvalidSpecs(format!(
                "unsupported vm state in snapshot {}: {}",
                name, state
            )));
        }
        specs.validate()?;

        Ok(Self {
            index,
            name,
            comment: comment.into(),
            parent,
            state,
            specs,
            artifact: serde_json::Value::Null,
            created_at: util::now(),
        })
    }

    /// File name of this snapshot inside the snapshot directory.
    pub fn file_name(&self) -> String {
        format!("{:04}-{}{}", self.index, self.name, SNAPSHOT_FILE_SUFFIX)
    }

    /// Whether this snapshot is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Check a loaded record against the invariants `new` enforces.
    pub(crate) fn check(&self, max_snapshots: u32) -> std::result::Result<(), String> {
        if let Err(reason) = util::check_name(&self.name) {
            return Err(format!("invalid snapshot name {:?}: {}", self.name, reason));
        }
        if self.index == 0 || self.index > max_snapshots {
            return Err(format!(
                "snapshot {} has index {} outside 1..={}",
                self.name, self.index, max_snapshots
            ));
        }
        if !self.state.is_capturable() {
            return Err(format!(
                "snapshot {} has unsupported vm state: {}",
                self.name, self.state
            ));
        }
        if let Err(e) = self.specs.validate() {
            return Err(format!("snapshot {}: {}", self.name, e));
        }
        if self.parent.as_deref() == Some(self.name.as_str()) {
            return Err(format!("snapshot {} is its own parent", self.name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_snapshot() {
        let snapshot = Snapshot::new(
            3,
            "pre-upgrade",
            "before apt upgrade",
            Some("snapshot2".into()),
            VmState::Stopped,
            VmSpecs::default(),
        )
        .unwrap();

        assert_eq!(snapshot.file_name(), "0003-pre-upgrade.snapshot.json");
        assert!(!snapshot.is_root());
        assert!(snapshot.artifact.is_null());
    }

    #[test]
    fn test_new_snapshot_rejects_active_states() {
        for state in [VmState::Running, VmState::Suspended, VmState::Unknown] {
            let err = Snapshot::new(1, "s", "", None, state, VmSpecs::default()).unwrap_err();
            assert!(err.to_string().contains("unsupported vm state"), "{}", err);
        }
    }

    #[test]
    fn test_new_snapshot_rejects_bad_input() {
        let err = Snapshot::new(1, "bad name", "", None, VmState::Off, VmSpecs::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshotName { .. }));

        let err = Snapshot::new(0, "s", "", None, VmState::Off, VmSpecs::default()).unwrap_err();
        assert!(err.to_string().contains("index 0"));

        let specs = VmSpecs {
            num_cores: 0,
            ..VmSpecs::default()
        };
        let err = Snapshot::new(1, "s", "", None, VmState::Off, specs).unwrap_err();
        assert!(err.to_string().contains("cores"));
    }

    #[test]
    fn test_check_loaded_record() {
        let mut snapshot =
            Snapshot::new(5, "s5", "", None, VmState::Off, VmSpecs::default()).unwrap();
        assert!(snapshot.check(1000).is_ok());
        assert!(snapshot.check(4).unwrap_err().contains("outside"));

        snapshot.parent = Some("s5".into());
        assert!(snapshot.check(1000).unwrap_err().contains("own parent"));
    }

    #[test]
    fn test_snapshot_file_format() {
        let mut snapshot =
            Snapshot::new(1, "snapshot1", "first", None, VmState::Off, VmSpecs::default())
                .unwrap();
        snapshot.artifact = serde_json::json!({ "image": "/vms/a/artifacts/0001-snapshot1.img" });

        let json: serde_json::Value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["name"], "snapshot1");
        assert_eq!(json["comment"], "first");
        assert_eq!(json["parent"], serde_json::Value::Null);
        assert_eq!(json["state"], "off");
        assert_eq!(json["specs"]["num_cores"], 1);

        let parsed: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
