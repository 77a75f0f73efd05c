//! fleetvm configuration.
//!
//! `FleetConfig` holds process-level settings (data directory, snapshot cap,
//! timeouts) with defaults and environment overrides. Core objects never read
//! it directly: callers derive a [`VmSettings`] from it and hand that to each
//! [`VirtualMachine`](crate::vm::VirtualMachine) they build.
//!
//! `VmRecord` is the persisted description of one VM (`<vm_dir>/vm.json`),
//! used by the CLI to rebuild a VM between invocations.

use crate::error::{Error, Result};
use crate::util;
use crate::vm::{VmSpecs, VmState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default snapshot cap per VM.
pub const DEFAULT_MAX_SNAPSHOTS: u32 = 1000;
/// Default bound on waiting for the backend to confirm a shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(180);
/// Default interval between backend state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "FLEETVM_DATA_DIR";
/// Environment variable overriding the snapshot cap.
pub const ENV_MAX_SNAPSHOTS: &str = "FLEETVM_MAX_SNAPSHOTS";
/// Environment variable overriding the shutdown timeout (e.g. "3m").
pub const ENV_SHUTDOWN_TIMEOUT: &str = "FLEETVM_SHUTDOWN_TIMEOUT";

/// Per-VM limits and timeouts, injected into each VM at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmSettings {
    /// Hard cap on `snapshot_count`.
    pub max_snapshots: u32,
    /// Bound on waiting for a shutdown to be confirmed.
    pub shutdown_timeout: Duration,
    /// Interval between backend state polls.
    pub poll_interval: Duration,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Root of all per-VM directories.
    pub data_dir: PathBuf,
    /// Hard cap on snapshots per VM.
    pub max_snapshots: u32,
    /// Bound on waiting for a shutdown to be confirmed.
    pub shutdown_timeout: Duration,
    /// Interval between backend state polls.
    pub poll_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("fleetvm"))
        .unwrap_or_else(|| PathBuf::from("./fleetvm-data"))
}

impl FleetConfig {
    /// Defaults overridden by `FLEETVM_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup(ENV_MAX_SNAPSHOTS) {
            match raw.parse() {
                Ok(max) => config.max_snapshots = max,
                Err(e) => tracing::warn!(value = %raw, error = %e, "ignoring {}", ENV_MAX_SNAPSHOTS),
            }
        }

        if let Some(raw) = lookup(ENV_SHUTDOWN_TIMEOUT) {
            match humantime::parse_duration(&raw) {
                Ok(timeout) => config.shutdown_timeout = timeout,
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "ignoring {}", ENV_SHUTDOWN_TIMEOUT)
                }
            }
        }

        config
    }

    /// Settings handed to each VM.
    pub fn vm_settings(&self) -> VmSettings {
        VmSettings {
            max_snapshots: self.max_snapshots,
            shutdown_timeout: self.shutdown_timeout,
            poll_interval: self.poll_interval,
        }
    }

    /// Directory holding all VMs.
    pub fn vms_dir(&self) -> PathBuf {
        self.data_dir.join("vms")
    }

    /// Directory owned by one VM.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.vms_dir().join(name)
    }

    /// Snapshot directory of one VM, exclusively owned by its chain registry.
    pub fn snapshots_dir(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("snapshots")
    }

    /// Backend artifact directory of one VM.
    pub fn artifacts_dir(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("artifacts")
    }

    /// Path of a VM's persisted record.
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.json")
    }
}

/// Persisted description of a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// VM name.
    pub name: String,

    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Last known lifecycle state.
    #[serde(default)]
    pub state: VmState,

    /// Live specs.
    pub specs: VmSpecs,

    /// Disk image the backend boots from and snapshots.
    pub disk_image: PathBuf,

    /// Command launching the VM process (empty = cannot be started).
    #[serde(default)]
    pub command: Vec<String>,
}

impl VmRecord {
    /// Create a new record for a powered-off VM.
    pub fn new(name: impl Into<String>, specs: VmSpecs, disk_image: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            created_at: util::now(),
            state: VmState::Off,
            specs,
            disk_image: disk_image.into(),
            command: Vec::new(),
        }
    }

    /// Load a record.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                let name = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Error::vm_not_found(name)
            } else {
                Error::storage(format!("read {}", path.display()), e.to_string())
            }
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save a record atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        util::write_atomic(path, &json)
    }
}
