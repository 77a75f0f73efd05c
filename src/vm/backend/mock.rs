//! Scriptable backend and monitor for tests.

use super::VmBackend;
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::vm::{ShutdownPolicy, VmState, VmStatusMonitor};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

/// Backend primitive that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Start,
    Stop,
    Suspend,
    Capture,
    Apply,
    Erase,
}

/// Parks a primitive until the test releases it.
pub(crate) struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Test-side end of a [`Gate`].
pub(crate) struct GateHandle {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl GateHandle {
    /// Block until the gated primitive is running.
    pub(crate) fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(10))
            .expect("gated primitive never entered");
    }

    /// Let the gated primitive return.
    pub(crate) fn release(&self) {
        let _ = self.release.send(());
    }
}

fn gate() -> (Gate, GateHandle) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    (
        Gate {
            entered: entered_tx,
            release: release_rx,
        },
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

fn pass(slot: &Mutex<Option<Gate>>) {
    let taken = slot.lock().take();
    if let Some(gate) = taken {
        let _ = gate.entered.send(());
        let _ = gate.release.recv();
    }
}

/// In-memory backend with switchable failures and a call log.
pub(crate) struct MockBackend {
    state: Mutex<VmState>,
    snapshots: bool,
    failing: Mutex<HashSet<Op>>,
    stop_confirms: AtomicBool,
    calls: Mutex<Vec<String>>,
    start_gate: Mutex<Option<Gate>>,
    capture_gate: Mutex<Option<Gate>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(VmState::Off),
            snapshots: true,
            failing: Mutex::new(HashSet::new()),
            stop_confirms: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            start_gate: Mutex::new(None),
            capture_gate: Mutex::new(None),
        }
    }

    pub(crate) fn without_snapshots() -> Self {
        Self {
            snapshots: false,
            ..Self::new()
        }
    }

    /// Make `op` fail until [`succeed`](Self::succeed) is called.
    pub(crate) fn fail(&self, op: Op) {
        self.failing.lock().insert(op);
    }

    pub(crate) fn succeed(&self, op: Op) {
        self.failing.lock().remove(&op);
    }

    /// Set the state the backend reports.
    pub(crate) fn set_state(&self, state: VmState) {
        *self.state.lock() = state;
    }

    /// Whether `stop()` takes the guest down (false = it never confirms).
    pub(crate) fn set_stop_confirms(&self, confirms: bool) {
        self.stop_confirms.store(confirms, Ordering::SeqCst);
    }

    pub(crate) fn gate_start(&self) -> GateHandle {
        let (gate, handle) = gate();
        *self.start_gate.lock() = Some(gate);
        handle
    }

    pub(crate) fn gate_capture(&self) -> GateHandle {
        let (gate, handle) = gate();
        *self.capture_gate.lock() = Some(gate);
        handle
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of logged calls starting with `prefix`.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn check(&self, op: Op, operation: &str) -> Result<()> {
        if self.failing.lock().contains(&op) {
            return Err(Error::backend(operation, "injected failure"));
        }
        Ok(())
    }
}

impl VmBackend for MockBackend {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn start(&self) -> Result<()> {
        self.record("start".into());
        pass(&self.start_gate);
        self.check(Op::Start, "vm start")?;
        self.set_state(VmState::Running);
        Ok(())
    }

    fn stop(&self, policy: ShutdownPolicy) -> Result<()> {
        self.record(format!("stop:{}", policy));
        self.check(Op::Stop, "vm stop")?;
        if self.stop_confirms.load(Ordering::SeqCst) {
            self.set_state(VmState::Stopped);
        }
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        self.record("suspend".into());
        self.check(Op::Suspend, "vm suspend")?;
        self.set_state(VmState::Suspended);
        Ok(())
    }

    fn current_state(&self) -> VmState {
        *self.state.lock()
    }

    fn drop_session(&self) {
        self.record("drop_session".into());
    }

    fn supports_snapshots(&self) -> bool {
        self.snapshots
    }

    fn capture(&self, snapshot: &Snapshot) -> Result<serde_json::Value> {
        if !self.snapshots {
            return Err(self.snapshots_unsupported());
        }
        self.record(format!("capture:{}", snapshot.name));
        pass(&self.capture_gate);
        self.check(Op::Capture, "snapshot capture")?;
        Ok(serde_json::json!({ "mock": snapshot.name }))
    }

    fn apply(&self, snapshot: &Snapshot) -> Result<()> {
        self.record(format!("apply:{}", snapshot.name));
        self.check(Op::Apply, "snapshot apply")
    }

    fn erase(&self, snapshot: &Snapshot) -> Result<()> {
        self.record(format!("erase:{}", snapshot.name));
        self.check(Op::Erase, "snapshot erase")
    }
}

/// Monitor logging every notification.
#[derive(Default)]
pub(crate) struct RecordingMonitor {
    events: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl VmStatusMonitor for RecordingMonitor {
    fn persist_state_for(&self, _name: &str, state: VmState) {
        self.events.lock().push(format!("state:{}", state));
    }

    fn on_resume(&self) {
        self.events.lock().push("resume".into());
    }

    fn on_shutdown(&self) {
        self.events.lock().push("shutdown".into());
    }

    fn on_suspend(&self) {
        self.events.lock().push("suspend".into());
    }
}
