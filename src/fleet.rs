//! Registry of the VMs a process manages, by name.

use crate::error::{Error, Result};
use crate::vm::VirtualMachine;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// VMs by name.
///
/// Building a VM (and loading its snapshots) happens outside the registry
/// lock; [`Fleet::reserve`] holds the name meanwhile so two callers cannot
/// race to create the same VM.
#[derive(Default)]
pub struct Fleet {
    vms: RwLock<HashMap<String, Arc<VirtualMachine>>>,
    reserved: RwLock<HashSet<String>>,
}

/// RAII guard for a reserved VM name.
///
/// Dropped without [`complete`](Reservation::complete), the name is released.
pub struct Reservation<'a> {
    fleet: &'a Fleet,
    name: String,
    completed: bool,
}

impl Reservation<'_> {
    /// The reserved name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `vm` under the reserved name.
    pub fn complete(mut self, vm: VirtualMachine) -> Result<Arc<VirtualMachine>> {
        if vm.name() != self.name {
            return Err(Error::InvalidSpecs(format!(
                "vm {} registered under reservation {}",
                vm.name(),
                self.name
            )));
        }

        let vm = Arc::new(vm);
        let mut vms = self.fleet.vms.write();
        self.fleet.reserved.write().remove(&self.name);
        vms.insert(self.name.clone(), vm.clone());
        self.completed = true;
        tracing::debug!(vm = %self.name, "vm registered");
        Ok(vm)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.fleet.reserved.write().remove(&self.name);
            tracing::debug!(vm = %self.name, "vm name reservation released");
        }
    }
}

impl Fleet {
    /// An empty fleet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name` for a VM about to be built.
    pub fn reserve(&self, name: &str) -> Result<Reservation<'_>> {
        let vms = self.vms.read();
        let mut reserved = self.reserved.write();
        if vms.contains_key(name) || reserved.contains(name) {
            return Err(Error::VmExists {
                name: name.to_string(),
            });
        }
        reserved.insert(name.to_string());
        Ok(Reservation {
            fleet: self,
            name: name.to_string(),
            completed: false,
        })
    }

    /// Register an already-built VM.
    pub fn register(&self, vm: VirtualMachine) -> Result<Arc<VirtualMachine>> {
        let name = vm.name().to_string();
        self.reserve(&name)?.complete(vm)
    }

    /// Look up a VM.
    pub fn get(&self, name: &str) -> Result<Arc<VirtualMachine>> {
        self.vms
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::vm_not_found(name))
    }

    /// Remove a VM from the registry. Does not stop it.
    pub fn remove(&self, name: &str) -> Result<Arc<VirtualMachine>> {
        let removed = self
            .vms
            .write()
            .remove(name)
            .ok_or_else(|| Error::vm_not_found(name))?;
        tracing::debug!(vm = %name, "vm unregistered");
        Ok(removed)
    }

    /// Whether a VM is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.vms.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.vms.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered VMs.
    pub fn len(&self) -> usize {
        self.vms.read().len()
    }

    /// Whether no VM is registered.
    pub fn is_empty(&self) -> bool {
        self.vms.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DirSnapshotStore;
    use crate::vm::backend::mock::MockBackend;
    use tempfile::TempDir;

    fn vm(tmp: &TempDir, name: &str) -> VirtualMachine {
        VirtualMachine::builder(
            name,
            Arc::new(MockBackend::new()),
            Arc::new(DirSnapshotStore::new(tmp.path().join(name))),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let tmp = TempDir::new().unwrap();
        let fleet = Fleet::new();

        fleet.register(vm(&tmp, "beta")).unwrap();
        fleet.register(vm(&tmp, "alpha")).unwrap();

        assert_eq!(fleet.get("alpha").unwrap().name(), "alpha");
        assert_eq!(fleet.names(), ["alpha", "beta"]);
        assert_eq!(fleet.len(), 2);
    }

    #[test]
    fn test_unknown_vm_is_not_found() {
        let fleet = Fleet::new();
        let err = fleet.get("ghost").err().unwrap();
        assert!(matches!(err, Error::VmNotFound { ref name } if name == "ghost"));
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(fleet.remove("ghost").is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let tmp = TempDir::new().unwrap();
        let fleet = Fleet::new();
        fleet.register(vm(&tmp, "primary")).unwrap();

        let err = fleet.register(vm(&tmp, "primary")).err().unwrap();
        assert!(matches!(err, Error::VmExists { .. }));
    }

    #[test]
    fn test_reservation_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let fleet = Fleet::new();

        {
            let reservation = fleet.reserve("primary").unwrap();
            assert_eq!(reservation.name(), "primary");
            assert!(fleet.reserve("primary").is_err());
            assert!(!fleet.contains("primary"));
        }
        // Dropped without completing: the name is free again.
        let reservation = fleet.reserve("primary").unwrap();
        reservation.complete(vm(&tmp, "primary")).unwrap();
        assert!(fleet.contains("primary"));

        let removed = fleet.remove("primary").unwrap();
        assert_eq!(removed.name(), "primary");
        assert!(fleet.is_empty());
    }

    #[test]
    fn test_reservation_rejects_other_name() {
        let tmp = TempDir::new().unwrap();
        let fleet = Fleet::new();
        let reservation = fleet.reserve("primary").unwrap();
        assert!(reservation.complete(vm(&tmp, "secondary")).is_err());
        assert!(fleet.reserve("primary").is_ok());
    }
}
