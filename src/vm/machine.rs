//! The `VirtualMachine` façade.
//!
//! Ties a [`Lifecycle`] to a [`SnapshotChain`] and enforces the rules between
//! them: snapshots are only taken, restored or deleted while the VM is off or
//! stopped, and the VM cannot start while one of those is in progress.
//! Renaming a snapshot or editing its comment works in any state.
//!
//! # Locking
//!
//! | Lock            | Kind    | Taken by                                   |
//! |-----------------|---------|--------------------------------------------|
//! | transition      | Mutex   | start/shutdown/suspend, and take/restore/delete via [`StoppedGuard`] |
//! | snapshot chain  | RwLock  | readers: shared; take/restore/delete/rename/load: exclusive for the whole operation |
//! | specs           | RwLock  | short critical sections only               |
//!
//! Order is always transition, then chain, then specs. Snapshot writers
//! check the state before queueing on the transition lock and fail fast
//! while a shutdown is being confirmed.

use crate::config::VmSettings;
use crate::error::{Error, Result};
use crate::snapshot::{Recovery, Snapshot, SnapshotChain, SnapshotStore};
use crate::util;
use crate::vm::{
    Lifecycle, NoopMonitor, ShutdownPolicy, StoppedGuard, VmBackend, VmSpecs, VmState,
    VmStatusMonitor,
};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`VirtualMachine`].
pub struct VirtualMachineBuilder {
    name: String,
    backend: Arc<dyn VmBackend>,
    store: Arc<dyn SnapshotStore>,
    monitor: Arc<dyn VmStatusMonitor>,
    specs: VmSpecs,
    settings: VmSettings,
    initial_state: Option<VmState>,
}

impl VirtualMachineBuilder {
    /// Initial specs (defaults otherwise).
    pub fn specs(mut self, specs: VmSpecs) -> Self {
        self.specs = specs;
        self
    }

    /// Limits and timeouts (defaults otherwise).
    pub fn settings(mut self, settings: VmSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Lifecycle observer (none otherwise).
    pub fn monitor(mut self, monitor: Arc<dyn VmStatusMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Initial lifecycle state (the backend's report otherwise).
    pub fn initial_state(mut self, state: VmState) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Build the VM. Snapshots are not loaded; call
    /// [`VirtualMachine::load_snapshots`] for that.
    pub fn build(self) -> Result<VirtualMachine> {
        util::check_name(&self.name).map_err(|reason| {
            Error::InvalidSpecs(format!("invalid vm name {:?}: {}", self.name, reason))
        })?;
        self.specs.validate()?;

        let initial = self
            .initial_state
            .unwrap_or_else(|| self.backend.current_state());
        let lifecycle = Lifecycle::new(
            self.name.clone(),
            initial,
            self.backend.clone(),
            self.monitor,
            &self.settings,
        );

        Ok(VirtualMachine {
            name: self.name,
            lifecycle,
            specs: RwLock::new(self.specs),
            snapshots: RwLock::new(SnapshotChain::new()),
            backend: self.backend,
            store: self.store,
            max_snapshots: self.settings.max_snapshots,
        })
    }
}

/// A named VM: lifecycle, live specs and snapshot chain.
pub struct VirtualMachine {
    name: String,
    lifecycle: Lifecycle,
    specs: RwLock<VmSpecs>,
    snapshots: RwLock<SnapshotChain>,
    backend: Arc<dyn VmBackend>,
    store: Arc<dyn SnapshotStore>,
    max_snapshots: u32,
}

impl VirtualMachine {
    /// Start building a VM named `name`.
    pub fn builder(
        name: impl Into<String>,
        backend: Arc<dyn VmBackend>,
        store: Arc<dyn SnapshotStore>,
    ) -> VirtualMachineBuilder {
        VirtualMachineBuilder {
            name: name.into(),
            backend,
            store,
            monitor: Arc::new(NoopMonitor),
            specs: VmSpecs::default(),
            settings: VmSettings::default(),
            initial_state: None,
        }
    }

    /// VM name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the backend driving this VM.
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Current lifecycle state.
    pub fn current_state(&self) -> VmState {
        self.lifecycle.state()
    }

    /// Boot the VM, or resume it from `suspended`.
    pub fn start(&self) -> Result<()> {
        self.lifecycle.start()
    }

    /// Stop the VM. See [`Lifecycle::shutdown`].
    pub fn shutdown(&self, policy: ShutdownPolicy) -> Result<()> {
        self.lifecycle.shutdown(policy)
    }

    /// Pause a running VM.
    pub fn suspend(&self) -> Result<()> {
        self.lifecycle.suspend()
    }

    /// Fail unless the VM is up and not being shut down.
    pub fn ensure_vm_is_running_for(&self, operation: &str) -> Result<()> {
        self.lifecycle.ensure_running_for(operation)
    }

    /// Poll `is_ready` until the guest is ready. See [`Lifecycle::wait_until_ready`].
    pub fn wait_until_ready(&self, timeout: Duration, is_ready: impl FnMut() -> bool) -> Result<()> {
        self.lifecycle.wait_until_ready(timeout, is_ready)
    }

    // ========================================================================
    // Specs
    // ========================================================================

    /// Copy of the live specs.
    pub fn specs(&self) -> VmSpecs {
        self.specs.read().clone()
    }

    /// Modify the live specs.
    ///
    /// The disk cannot be resized while snapshots exist.
    pub fn update_specs(&self, update: impl FnOnce(&mut VmSpecs)) -> Result<()> {
        let chain = self.snapshots.read();
        let mut specs = self.specs.write();

        let mut updated = specs.clone();
        update(&mut updated);
        updated.validate()?;

        if updated.disk_space != specs.disk_space && !chain.is_empty() {
            return Err(Error::ResizeWithSnapshots {
                vm: self.name.clone(),
            });
        }

        *specs = updated;
        Ok(())
    }

    // ========================================================================
    // Snapshot Queries
    // ========================================================================

    /// All snapshots, in creation order.
    pub fn view_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.read().ordered().into_iter().cloned().collect()
    }

    /// One snapshot by name.
    pub fn get_snapshot(&self, name: &str) -> Result<Snapshot> {
        self.snapshots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::snapshot_not_found(&self.name, name))
    }

    /// The head snapshot, if any.
    pub fn head_snapshot(&self) -> Option<Snapshot> {
        self.snapshots.read().head().cloned()
    }

    /// Number of snapshots ever created.
    pub fn snapshot_count(&self) -> u32 {
        self.snapshots.read().count()
    }

    /// Number of snapshots currently held.
    pub fn num_snapshots(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Names of the direct children of `name`.
    pub fn children_of(&self, name: &str) -> Result<Vec<String>> {
        let chain = self.snapshots.read();
        if !chain.contains(name) {
            return Err(Error::snapshot_not_found(&self.name, name));
        }
        Ok(chain
            .children_of(name)
            .into_iter()
            .map(|s| s.name.clone())
            .collect())
    }

    // ========================================================================
    // Snapshot Mutations
    // ========================================================================

    fn require_snapshot_support(&self) -> Result<()> {
        if self.backend.supports_snapshots() {
            Ok(())
        } else {
            Err(self.backend.snapshots_unsupported())
        }
    }

    /// Hold the VM stopped, then take the chain for writing.
    ///
    /// The state is checked before queueing on the transition lock, so a
    /// writer never waits out a slow shutdown, and the chain is only locked
    /// once the transition lock is held, so readers never wait on one either.
    fn lock_for_snapshot_write(
        &self,
    ) -> Result<(StoppedGuard<'_>, RwLockWriteGuard<'_, SnapshotChain>)> {
        self.require_snapshot_support()?;
        self.lifecycle.check_stopped()?;
        let stopped = self.lifecycle.hold_stopped()?;
        let chain = self.snapshots.write();
        Ok((stopped, chain))
    }

    /// Capture the stopped VM as a new snapshot and make it the head.
    ///
    /// An empty `name` gets `snapshot<count+1>`. Either the snapshot is fully
    /// created and persisted, or the chain, the snapshot directory and the
    /// backend artifacts are left as they were.
    pub fn take_snapshot(&self, name: &str, comment: &str) -> Result<Snapshot> {
        let (stopped, mut chain) = self.lock_for_snapshot_write()?;
        self.take_locked(&mut chain, &stopped, name, comment)
    }

    fn take_locked(
        &self,
        chain: &mut SnapshotChain,
        stopped: &StoppedGuard<'_>,
        name: &str,
        comment: &str,
    ) -> Result<Snapshot> {
        if chain.count() >= self.max_snapshots {
            return Err(Error::SnapshotLimitReached {
                vm: self.name.clone(),
                max: self.max_snapshots,
            });
        }

        let name = if name.is_empty() {
            chain.default_name()
        } else {
            name.to_string()
        };
        util::validate_snapshot_name(&name)?;
        if chain.contains(&name) {
            return Err(Error::SnapshotNameTaken {
                vm: self.name.clone(),
                name,
            });
        }

        let mut snapshot = Snapshot::new(
            chain.count() + 1,
            name,
            comment,
            chain.head_name().map(str::to_string),
            stopped.state(),
            self.specs(),
        )?;

        tracing::debug!(vm = %self.name, snapshot = %snapshot.name, "capturing snapshot");
        match self.backend.capture(&snapshot) {
            Ok(artifact) => snapshot.artifact = artifact,
            Err(e) => {
                self.erase_quietly(&snapshot);
                return Err(e);
            }
        }

        let staged = chain.staged_create(snapshot.clone());
        if let Err(e) = self.persist_created(chain, &staged, &snapshot) {
            self.erase_quietly(&snapshot);
            return Err(e);
        }
        *chain = staged;

        tracing::info!(
            vm = %self.name,
            snapshot = %snapshot.name,
            parent = snapshot.parent.as_deref().unwrap_or("-"),
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// Write the count, then the new snapshot file, then the head.
    ///
    /// A crash after any step leaves a directory that loads: the count is
    /// never behind an index on disk, and the head only ever names a
    /// snapshot whose file exists.
    fn persist_created(
        &self,
        previous: &SnapshotChain,
        staged: &SnapshotChain,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let result = self
            .store
            .write_count(staged.count())
            .and_then(|()| self.store.write_snapshot(snapshot))
            .and_then(|()| self.store.write_head(staged.head_name()));
        if let Err(e) = result {
            self.remove_quietly(snapshot);
            self.restore_pointers_quietly(previous);
            return Err(e);
        }
        Ok(())
    }

    fn restore_pointers_quietly(&self, chain: &SnapshotChain) {
        let result = if chain.count() == 0 {
            self.store.remove_pointers()
        } else {
            self.store
                .write_head(chain.head_name())
                .and_then(|()| self.store.write_count(chain.count()))
        };
        if let Err(e) = result {
            tracing::warn!(vm = %self.name, error = %e, "failed to restore snapshot pointers");
        }
    }

    fn remove_quietly(&self, snapshot: &Snapshot) {
        if let Err(e) = self.store.remove_snapshot(snapshot) {
            tracing::warn!(
                vm = %self.name,
                snapshot = %snapshot.name,
                error = %e,
                "failed to remove snapshot file"
            );
        }
    }

    fn write_quietly(&self, snapshot: &Snapshot) {
        if let Err(e) = self.store.write_snapshot(snapshot) {
            tracing::warn!(
                vm = %self.name,
                snapshot = %snapshot.name,
                error = %e,
                "failed to restore snapshot file"
            );
        }
    }

    fn erase_quietly(&self, snapshot: &Snapshot) {
        if let Err(e) = self.backend.erase(snapshot) {
            tracing::warn!(
                vm = %self.name,
                snapshot = %snapshot.name,
                error = %e,
                "failed to erase snapshot artifacts"
            );
        }
    }

    /// Revert the stopped VM to snapshot `name` and make it the head.
    ///
    /// The VM's specs and lifecycle state become those recorded in the
    /// snapshot, and whatever was not captured is lost. On failure the
    /// previous head is re-applied (best-effort) and nothing in memory
    /// changes.
    pub fn restore_snapshot(&self, name: &str) -> Result<()> {
        let (mut stopped, mut chain) = self.lock_for_snapshot_write()?;
        let target = self.restore_target(&chain, name)?;
        self.restore_locked(&mut chain, &mut stopped, target)
    }

    /// Snapshot the current state, then restore `name`.
    ///
    /// Both happen under one hold of the VM. Returns the snapshot that
    /// preserves the state being left; it stays in the chain even if the
    /// restore itself then fails.
    pub fn restore_snapshot_keeping_current(&self, name: &str) -> Result<Snapshot> {
        let (mut stopped, mut chain) = self.lock_for_snapshot_write()?;
        let target = self.restore_target(&chain, name)?;

        let comment = format!("Before restoring {}", name);
        let kept = self.take_locked(&mut chain, &stopped, "", &comment)?;
        self.restore_locked(&mut chain, &mut stopped, target)?;
        Ok(kept)
    }

    /// Look up a restore target and check that the disk was not resized.
    fn restore_target(&self, chain: &SnapshotChain, name: &str) -> Result<Snapshot> {
        let snapshot = chain
            .get(name)
            .cloned()
            .ok_or_else(|| Error::snapshot_not_found(&self.name, name))?;

        let disk_space = self.specs.read().disk_space;
        if snapshot.specs.disk_space != disk_space {
            return Err(Error::DiskSizeMismatch {
                vm: self.name.clone(),
                snapshot: snapshot.name,
                expected: snapshot.specs.disk_space,
                actual: disk_space,
            });
        }
        Ok(snapshot)
    }

    fn restore_locked(
        &self,
        chain: &mut SnapshotChain,
        stopped: &mut StoppedGuard<'_>,
        snapshot: Snapshot,
    ) -> Result<()> {
        let name = snapshot.name.as_str();
        let previous_head = chain.head().cloned();
        let head_changes = chain.head_name() != Some(name);

        tracing::debug!(vm = %self.name, snapshot = %name, "applying snapshot");
        if let Err(e) = self.backend.apply(&snapshot) {
            self.rollback_restore(previous_head.as_ref(), &snapshot, false);
            return Err(e);
        }
        if head_changes {
            if let Err(e) = self.store.write_head(Some(name)) {
                self.rollback_restore(previous_head.as_ref(), &snapshot, true);
                return Err(e);
            }
        }

        *self.specs.write() = snapshot.specs.clone();
        stopped.set_state(snapshot.state);
        if head_changes {
            *chain = chain.staged_head(name);
        }

        tracing::info!(vm = %self.name, snapshot = %name, "snapshot restored");
        Ok(())
    }

    fn rollback_restore(&self, previous_head: Option<&Snapshot>, target: &Snapshot, head_written: bool) {
        if let Some(previous) = previous_head.filter(|p| p.name != target.name) {
            if let Err(e) = self.backend.apply(previous) {
                tracing::warn!(
                    vm = %self.name,
                    snapshot = %previous.name,
                    error = %e,
                    "failed to re-apply previous head"
                );
            }
        }
        if head_written {
            if let Err(e) = self.store.write_head(previous_head.map(|p| p.name.as_str())) {
                tracing::warn!(vm = %self.name, error = %e, "failed to restore snapshot head");
            }
        }
    }

    /// Delete snapshot `name`, reparenting its children onto its parent.
    ///
    /// `snapshot_count` is unchanged, so indices are never reused.
    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        let (_stopped, mut chain) = self.lock_for_snapshot_write()?;

        let Some(target) = chain.get(name).cloned() else {
            return Err(Error::snapshot_not_found(&self.name, name));
        };
        let (staged, reparented) = chain.staged_delete(&self.name, name)?;

        if let Err(e) = self.persist_deleted(&chain, &staged, &target, &reparented) {
            self.rollback_delete(&chain, &target, &reparented);
            return Err(e);
        }
        *chain = staged;

        tracing::info!(
            vm = %self.name,
            snapshot = %name,
            reparented = reparented.len(),
            "snapshot deleted"
        );
        Ok(())
    }

    /// Relink the children, move the head, then drop the file and the
    /// artifacts. Every intermediate directory loads.
    fn persist_deleted(
        &self,
        current: &SnapshotChain,
        staged: &SnapshotChain,
        target: &Snapshot,
        reparented: &[Snapshot],
    ) -> Result<()> {
        for child in reparented {
            self.store.write_snapshot(child)?;
        }
        if staged.head_name() != current.head_name() {
            self.store.write_head(staged.head_name())?;
        }
        self.store.remove_snapshot(target)?;
        self.backend.erase(target)
    }

    fn rollback_delete(&self, current: &SnapshotChain, target: &Snapshot, reparented: &[Snapshot]) {
        let originals = reparented.iter().filter_map(|c| current.get(&c.name));
        for snapshot in originals.chain(std::iter::once(target)) {
            self.write_quietly(snapshot);
        }
        self.restore_pointers_quietly(current);
    }

    /// Give snapshot `name` a new name.
    ///
    /// The index, and with it the creation order, is kept. Children follow
    /// the new name, as does the head. Allowed in any lifecycle state.
    pub fn rename_snapshot(&self, name: &str, new_name: &str) -> Result<()> {
        util::validate_snapshot_name(new_name)?;
        let mut chain = self.snapshots.write();
        let Some(original) = chain.get(name).cloned() else {
            return Err(Error::snapshot_not_found(&self.name, name));
        };
        if name == new_name {
            return Ok(());
        }
        let (staged, renamed, relinked) = chain.staged_rename(&self.name, name, new_name)?;

        if let Err(e) = self.persist_renamed(&chain, &staged, &original, &renamed, &relinked) {
            for child in relinked.iter().filter_map(|c| chain.get(&c.name)) {
                self.write_quietly(child);
            }
            self.restore_pointers_quietly(&chain);
            self.remove_quietly(&renamed);
            return Err(e);
        }
        *chain = staged;

        tracing::info!(vm = %self.name, snapshot = %name, new_name = %new_name, "snapshot renamed");
        Ok(())
    }

    /// Write the renamed file, relink the children, move the head, then drop
    /// the old file. Until then both files share an index, which loading
    /// resolves by following the links.
    fn persist_renamed(
        &self,
        current: &SnapshotChain,
        staged: &SnapshotChain,
        original: &Snapshot,
        renamed: &Snapshot,
        relinked: &[Snapshot],
    ) -> Result<()> {
        self.store.write_snapshot(renamed)?;
        for child in relinked {
            self.store.write_snapshot(child)?;
        }
        if staged.head_name() != current.head_name() {
            self.store.write_head(staged.head_name())?;
        }
        self.store.remove_snapshot(original)
    }

    /// Replace the comment of snapshot `name`. Allowed in any lifecycle state.
    pub fn set_snapshot_comment(&self, name: &str, comment: &str) -> Result<()> {
        let mut chain = self.snapshots.write();
        let (staged, updated) = chain.staged_comment(&self.name, name, comment)?;
        self.store.write_snapshot(&updated)?;
        *chain = staged;

        tracing::debug!(vm = %self.name, snapshot = %name, "snapshot comment updated");
        Ok(())
    }

    /// Replace the in-memory chain with what the store holds.
    ///
    /// Leftovers of an operation interrupted by a crash are settled in
    /// memory and then, best-effort, on disk. Returns the number of
    /// snapshots loaded. On error the in-memory chain is left as it was.
    pub fn load_snapshots(&self) -> Result<usize> {
        let mut chain = self.snapshots.write();

        let persisted = self.store.read_all()?;
        let (loaded, recoveries) = SnapshotChain::from_persisted(
            &self.name,
            persisted,
            self.max_snapshots,
            self.store.location(),
        )?;

        if !recoveries.is_empty() {
            if let Err(e) = self.settle_recoveries(&loaded, &recoveries) {
                tracing::warn!(
                    vm = %self.name,
                    error = %e,
                    "failed to settle interrupted snapshot operation on disk"
                );
            }
        }

        let loaded_len = loaded.len();
        *chain = loaded;
        tracing::debug!(vm = %self.name, snapshots = loaded_len, "snapshots loaded");
        Ok(loaded_len)
    }

    /// Write the count, relinked files and the head, then drop stale files.
    /// A failure part way leaves a directory that settles again next load.
    fn settle_recoveries(&self, loaded: &SnapshotChain, recoveries: &[Recovery]) -> Result<()> {
        self.store.write_count(loaded.count())?;
        for recovery in recoveries {
            tracing::warn!(vm = %self.name, recovery = ?recovery, "settling interrupted snapshot operation");
            if let Recovery::DroppedRename { rewritten, .. } = recovery {
                for snapshot in rewritten {
                    self.store.write_snapshot(snapshot)?;
                }
            }
        }

        self.store.write_head(loaded.head_name())?;

        for recovery in recoveries {
            match recovery {
                Recovery::RaisedCount { .. } | Recovery::AdoptedHead(_) => {}
                Recovery::DroppedRoot(stale) => {
                    self.store.remove_snapshot(stale)?;
                    self.erase_quietly(stale);
                }
                // The survivor still uses the artifacts.
                Recovery::DroppedRename { stale, .. } => self.store.remove_snapshot(stale)?,
            }
        }
        Ok(())
    }
}
