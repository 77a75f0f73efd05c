//! VM sizing, mount table and backend metadata.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default vCPU count for new VMs.
pub const DEFAULT_NUM_CORES: u32 = 1;
/// Default memory in bytes for new VMs (1 GiB).
pub const DEFAULT_MEM_SIZE: u64 = 1024 * 1024 * 1024;
/// Default disk size in bytes for new VMs (5 GiB).
pub const DEFAULT_DISK_SPACE: u64 = 5 * 1024 * 1024 * 1024;

/// How a host directory is shared with the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    /// Served from the host over a userspace protocol.
    #[default]
    Classic,
    /// Served by the hypervisor's native sharing device.
    Native,
}

/// A host directory mounted into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMount {
    /// Host path.
    pub source_path: PathBuf,
    /// Sharing mechanism.
    #[serde(default)]
    pub mount_type: MountType,
    /// (host uid, guest uid) pairs.
    #[serde(default)]
    pub uid_mappings: Vec<(i64, i64)>,
    /// (host gid, guest gid) pairs.
    #[serde(default)]
    pub gid_mappings: Vec<(i64, i64)>,
}

impl VmMount {
    /// Mount `source_path` with default mappings.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            mount_type: MountType::Classic,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
        }
    }
}

/// Live, mutable description of a VM's resources.
///
/// Snapshots copy this by value at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpecs {
    /// Number of vCPUs.
    pub num_cores: u32,
    /// Memory in bytes.
    pub mem_size: u64,
    /// Disk size in bytes.
    pub disk_space: u64,
    /// Mounts keyed by guest target path.
    #[serde(default)]
    pub mounts: BTreeMap<String, VmMount>,
    /// Opaque backend-specific metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for VmSpecs {
    fn default() -> Self {
        Self {
            num_cores: DEFAULT_NUM_CORES,
            mem_size: DEFAULT_MEM_SIZE,
            disk_space: DEFAULT_DISK_SPACE,
            mounts: BTreeMap::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

impl VmSpecs {
    /// Reject specs no backend can run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_cores == 0 {
            return Err(Error::InvalidSpecs(format!(
                "invalid number of cores: {}",
                self.num_cores
            )));
        }
        if self.mem_size == 0 {
            return Err(Error::InvalidSpecs("invalid memory size: 0".into()));
        }
        if self.disk_space == 0 {
            return Err(Error::InvalidSpecs("invalid disk size: 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_specs_are_valid() {
        assert!(VmSpecs::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let specs = VmSpecs {
            num_cores: 0,
            ..VmSpecs::default()
        };
        assert!(specs.validate().unwrap_err().to_string().contains("cores"));

        let specs = VmSpecs {
            mem_size: 0,
            ..VmSpecs::default()
        };
        assert!(specs.validate().unwrap_err().to_string().contains("memory"));

        let specs = VmSpecs {
            disk_space: 0,
            ..VmSpecs::default()
        };
        assert!(specs.validate().unwrap_err().to_string().contains("disk"));
    }

    #[test]
    fn test_specs_serialization_keeps_mounts_and_metadata() {
        let mut specs = VmSpecs::default();
        let mut mount = VmMount::new("/home/user/src");
        mount.uid_mappings.push((1000, 1000));
        mount.mount_type = MountType::Native;
        specs.mounts.insert("/src".into(), mount);
        specs
            .metadata
            .insert("arguments".into(), serde_json::json!(["-nographic"]));

        let json = serde_json::to_string(&specs).unwrap();
        let parsed: VmSpecs = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, specs);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let parsed: VmSpecs =
            serde_json::from_str(r#"{"num_cores":2,"mem_size":1,"disk_space":1}"#).unwrap();
        assert!(parsed.mounts.is_empty());
        assert!(parsed.metadata.is_empty());
    }
}
