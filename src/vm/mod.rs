//! Virtual machines: state, specs, lifecycle and backends.

pub mod backend;
mod lifecycle;
mod machine;
mod monitor;
mod specs;
mod state;

pub use backend::{ProcessBackend, VmBackend};
pub use lifecycle::{Lifecycle, StoppedGuard};
pub use machine::{VirtualMachine, VirtualMachineBuilder};
pub use monitor::{NoopMonitor, RecordMonitor, VmStatusMonitor};
pub use specs::{MountType, VmMount, VmSpecs};
pub use specs::{DEFAULT_DISK_SPACE, DEFAULT_MEM_SIZE, DEFAULT_NUM_CORES};
pub use state::{ShutdownPolicy, VmState};
