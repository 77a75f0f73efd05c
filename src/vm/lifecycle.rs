//! VM lifecycle state machine.
//!
//! All transitions are serialized by one transition lock. The lock is *not*
//! held while the backend boots the guest: a start can take minutes, and a
//! shutdown issued meanwhile must be able to get in, flag the start as
//! pre-empted, and return without waiting for the boot to finish. The start
//! path re-takes the lock afterwards and yields to the flag.
//!
//! ```text
//!            start()                 backend ok
//!   off ────────────────► starting ─────────────► running
//!   stopped                  │                      │  │
//!   suspended                │ shutdown()           │  │ suspend()
//!                            ▼                      │  ▼
//!                      off (StartAborted)           │ suspending ──► suspended
//!                                                   │
//!                                      shutdown()   ▼
//!                                                stopped
//! ```

use crate::config::VmSettings;
use crate::error::{Error, Result};
use crate::vm::{ShutdownPolicy, VmBackend, VmState, VmStatusMonitor};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of one VM plus the machinery to change it.
pub struct Lifecycle {
    vm: String,
    backend: Arc<dyn VmBackend>,
    monitor: Arc<dyn VmStatusMonitor>,
    /// Serializes transitions. Snapshot writers take it before the snapshot lock.
    transition: Mutex<()>,
    state: RwLock<VmState>,
    /// Set by a shutdown that pre-empted an in-flight start.
    shutdown_while_starting: AtomicBool,
    shutdown_timeout: Duration,
    poll_interval: Duration,
}

/// Proof that the VM is off or stopped.
///
/// Holds the transition lock, so no start can begin while it lives.
pub struct StoppedGuard<'a> {
    lifecycle: &'a Lifecycle,
    _transition: MutexGuard<'a, ()>,
    state: VmState,
}

impl StoppedGuard<'_> {
    /// State observed when the guard was taken (or last set through it).
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Change the state without releasing the guard.
    pub fn set_state(&mut self, state: VmState) {
        self.lifecycle.set_state(state);
        self.state = state;
    }
}

impl Lifecycle {
    /// Lifecycle starting in `initial`.
    pub fn new(
        vm: impl Into<String>,
        initial: VmState,
        backend: Arc<dyn VmBackend>,
        monitor: Arc<dyn VmStatusMonitor>,
        settings: &VmSettings,
    ) -> Self {
        Self {
            vm: vm.into(),
            backend,
            monitor,
            transition: Mutex::new(()),
            state: RwLock::new(initial),
            shutdown_while_starting: AtomicBool::new(false),
            shutdown_timeout: settings.shutdown_timeout,
            poll_interval: settings.poll_interval,
        }
    }

    /// Current state. Never blocks on an in-flight transition.
    pub fn state(&self) -> VmState {
        *self.state.read()
    }

    fn set_state(&self, state: VmState) {
        *self.state.write() = state;
        self.monitor.persist_state_for(&self.vm, state);
    }

    /// Backend-reported state, with transitional states we did not initiate
    /// treated as unknown.
    fn confirmed_backend_state(&self) -> VmState {
        match self.backend.current_state() {
            VmState::Starting | VmState::Suspending => VmState::Unknown,
            state => state,
        }
    }

    /// Boot the VM, or resume it from `suspended`.
    pub fn start(&self) -> Result<()> {
        {
            let _transition = self.transition.lock();
            let current = self.state();
            if current == VmState::Unknown {
                return Err(Error::StateUnknown {
                    vm: self.vm.clone(),
                });
            }
            if !current.can_start() {
                return Err(Error::invalid_state(
                    &self.vm,
                    "off, stopped or suspended",
                    current,
                ));
            }
            self.shutdown_while_starting.store(false, Ordering::SeqCst);
            self.set_state(VmState::Starting);
        }

        tracing::info!(vm = %self.vm, "starting vm");
        let result = self.backend.start();

        let _transition = self.transition.lock();
        if self.shutdown_while_starting.swap(false, Ordering::SeqCst) {
            if result.is_ok() {
                if let Err(e) = self.backend.stop(ShutdownPolicy::Force) {
                    tracing::warn!(vm = %self.vm, error = %e, "failed to stop pre-empted vm");
                }
            }
            self.set_state(VmState::Off);
            self.monitor.on_shutdown();
            tracing::info!(vm = %self.vm, "vm shut down while starting");
            return Err(Error::StartAborted {
                vm: self.vm.clone(),
            });
        }

        match result {
            Ok(()) => {
                self.set_state(VmState::Running);
                self.monitor.on_resume();
                tracing::info!(vm = %self.vm, "vm started");
                Ok(())
            }
            Err(e) => {
                let reported = self.confirmed_backend_state();
                self.set_state(reported);
                tracing::warn!(vm = %self.vm, state = %reported, error = %e, "vm start failed");
                Err(Error::StartFailed {
                    vm: self.vm.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop the VM. Idempotent on a VM that is already down.
    ///
    /// A VM still starting is flagged and force-stopped; the in-flight start
    /// fails with `StartAborted` and leaves the VM `off`. Otherwise this
    /// waits, up to the shutdown timeout, for the backend to confirm.
    pub fn shutdown(&self, policy: ShutdownPolicy) -> Result<()> {
        let _transition = self.transition.lock();

        match self.state() {
            VmState::Off | VmState::Stopped => {
                tracing::debug!(vm = %self.vm, "vm already stopped");
                return Ok(());
            }
            VmState::Starting => {
                self.shutdown_while_starting.store(true, Ordering::SeqCst);
                tracing::info!(vm = %self.vm, "shutdown requested while vm is starting");
                if let Err(e) = self.backend.stop(ShutdownPolicy::Force) {
                    tracing::warn!(vm = %self.vm, error = %e, "failed to interrupt vm boot");
                }
                return Ok(());
            }
            _ => {}
        }

        tracing::info!(vm = %self.vm, policy = %policy, "shutting down vm");
        self.backend.stop(policy)?;
        self.wait_for_backend_stop()?;

        self.backend.drop_session();
        self.set_state(VmState::Stopped);
        self.monitor.on_shutdown();
        tracing::info!(vm = %self.vm, "vm stopped");
        Ok(())
    }

    fn wait_for_backend_stop(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.backend.current_state().is_stopped() {
                return Ok(());
            }
            if start.elapsed() >= self.shutdown_timeout {
                tracing::warn!(vm = %self.vm, "backend did not confirm shutdown");
                return Err(Error::timeout("vm shutdown", self.shutdown_timeout));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Pause a running VM.
    pub fn suspend(&self) -> Result<()> {
        let _transition = self.transition.lock();

        match self.state() {
            VmState::Running => {}
            VmState::Unknown => {
                return Err(Error::StateUnknown {
                    vm: self.vm.clone(),
                })
            }
            other => return Err(Error::invalid_state(&self.vm, "running", other)),
        }

        self.set_state(VmState::Suspending);
        let result = self.backend.suspend();
        self.backend.drop_session();

        match result {
            Ok(()) => {
                self.set_state(VmState::Suspended);
                self.monitor.on_suspend();
                tracing::info!(vm = %self.vm, "vm suspended");
                Ok(())
            }
            Err(e) => {
                let reported = self.confirmed_backend_state();
                self.set_state(reported);
                tracing::warn!(vm = %self.vm, state = %reported, error = %e, "vm suspend failed");
                Err(e)
            }
        }
    }

    /// Fail unless the VM is starting or running and no shutdown has
    /// pre-empted it.
    pub fn ensure_running_for(&self, operation: &str) -> Result<()> {
        if self.shutdown_while_starting.load(Ordering::SeqCst) {
            return Err(Error::StartAborted {
                vm: self.vm.clone(),
            });
        }
        match self.state() {
            VmState::Starting | VmState::Running => Ok(()),
            VmState::Unknown => Err(Error::StateUnknown {
                vm: self.vm.clone(),
            }),
            other => Err(Error::invalid_state(
                &self.vm,
                format!("starting or running for {}", operation),
                other,
            )),
        }
    }

    /// Poll `is_ready` until it reports ready, the VM stops being up, or
    /// `timeout` expires.
    pub fn wait_until_ready(&self, timeout: Duration, mut is_ready: impl FnMut() -> bool) -> Result<()> {
        let start = Instant::now();
        tracing::debug!(vm = %self.vm, "waiting for vm to be ready");

        loop {
            self.ensure_running_for("readiness wait")?;
            if is_ready() {
                tracing::debug!(vm = %self.vm, "vm is ready");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(Error::timeout("vm readiness", timeout));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Fail unless the VM is off or stopped, without waiting on a
    /// transition in progress.
    ///
    /// A shutdown keeps the state at `running` until the backend confirms,
    /// so callers are turned away instead of queueing behind it.
    pub fn check_stopped(&self) -> Result<VmState> {
        let state = self.state();
        if state == VmState::Unknown {
            return Err(Error::StateUnknown {
                vm: self.vm.clone(),
            });
        }
        if !state.is_stopped() {
            return Err(Error::invalid_state(&self.vm, "off or stopped", state));
        }
        Ok(state)
    }

    /// Hold the VM off or stopped for the lifetime of the guard.
    pub fn hold_stopped(&self) -> Result<StoppedGuard<'_>> {
        let transition = self.transition.lock();
        let state = self.check_stopped()?;
        Ok(StoppedGuard {
            lifecycle: self,
            _transition: transition,
            state,
        })
    }
}
