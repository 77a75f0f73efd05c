//! VM lifecycle states and shutdown policies.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a VM.
///
/// Concrete backends map their native states onto these seven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Never started, or powered off.
    #[default]
    Off,
    /// Boot requested; not yet confirmed by the backend.
    Starting,
    /// Running and confirmed by the backend.
    Running,
    /// Pause requested; not yet confirmed by the backend.
    Suspending,
    /// Paused.
    Suspended,
    /// Shut down after having run.
    Stopped,
    /// The backend could not report a state we understand.
    Unknown,
}

impl VmState {
    /// Whether the VM is not running (`off` or `stopped`).
    pub fn is_stopped(self) -> bool {
        matches!(self, VmState::Off | VmState::Stopped)
    }

    /// Whether `start()` is allowed from this state.
    pub fn can_start(self) -> bool {
        matches!(self, VmState::Off | VmState::Stopped | VmState::Suspended)
    }

    /// Whether a snapshot may capture this state.
    pub fn is_capturable(self) -> bool {
        self.is_stopped()
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Off => write!(f, "off"),
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Suspending => write!(f, "suspending"),
            VmState::Suspended => write!(f, "suspended"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(VmState::Off),
            "starting" => Ok(VmState::Starting),
            "running" => Ok(VmState::Running),
            "suspending" => Ok(VmState::Suspending),
            "suspended" => Ok(VmState::Suspended),
            "stopped" => Ok(VmState::Stopped),
            "unknown" => Ok(VmState::Unknown),
            _ => Err(format!("invalid vm state: {}", s)),
        }
    }
}

/// How `shutdown()` asks the backend to stop a running VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Ask the guest to power down.
    #[default]
    Graceful,
    /// Pull the plug.
    Force,
}

impl std::fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPolicy::Graceful => write!(f, "graceful"),
            ShutdownPolicy::Force => write!(f, "force"),
        }
    }
}
