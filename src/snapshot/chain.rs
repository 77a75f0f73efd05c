//! In-memory snapshot registry.
//!
//! Mutations never happen in place. Each operation builds a *staged* copy
//! (`staged_create`, `staged_delete`, `staged_rename`, ...), persists what the copy
//! implies, and only then swaps it in. A failure anywhere before the swap
//! leaves the live chain untouched.

use super::{PersistedChain, Snapshot};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// A VM's snapshots, keyed by name, plus the head pointer and the
/// ever-created counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotChain {
    snapshots: HashMap<String, Snapshot>,
    head: Option<String>,
    count: u32,
}

/// Leftover of a snapshot operation cut short by a crash.
///
/// Each persisted step of create, delete and rename leaves a directory that
/// [`SnapshotChain::from_persisted`] can still load; these are the states it
/// had to settle in memory. The caller brings the directory in line.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// A snapshot file is newer than the count file: the count catches up.
    RaisedCount {
        /// Count found on disk.
        from: u32,
        /// Highest index found on disk.
        to: u32,
    },
    /// The only snapshot file exists but the head is empty: a first
    /// snapshot whose head was never written, or a last snapshot whose
    /// file was never removed. It becomes the head.
    AdoptedHead(String),
    /// A root was being deleted after its only child had become the new
    /// root. Its file is stale and its artifacts are no longer needed.
    DroppedRoot(Snapshot),
    /// Two files share an index: a rename was interrupted. `stale` lost;
    /// `rewritten` are its children, now linked to the survivor.
    DroppedRename {
        /// The record that lost.
        stale: Snapshot,
        /// Children whose parent link moved to the survivor.
        rewritten: Vec<Snapshot>,
    },
}

impl SnapshotChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a chain from persisted records, rejecting anything inconsistent.
    ///
    /// Records must arrive in creation order so that every parent is seen
    /// before its children. Intermediate states of an interrupted create,
    /// delete or rename are settled and reported as [`Recovery`] entries.
    pub fn from_persisted(
        vm: &str,
        persisted: PersistedChain,
        max_snapshots: u32,
        location: &Path,
    ) -> Result<(Self, Vec<Recovery>)> {
        let PersistedChain {
            snapshots,
            head,
            count,
        } = persisted;
        let mut head = head.flatten();
        let mut recoveries = Vec::new();

        let snapshots = settle_renames(snapshots, &mut head, &mut recoveries, location)?;

        let mut chain = Self::new();
        let mut highest_index = 0;

        for snapshot in snapshots {
            let path = location.join(snapshot.file_name());
            snapshot
                .check(max_snapshots)
                .map_err(|reason| Error::corrupt(&path, reason))?;

            if chain.contains(&snapshot.name) {
                return Err(Error::SnapshotNameTaken {
                    vm: vm.to_string(),
                    name: snapshot.name,
                });
            }
            if let Some(parent) = &snapshot.parent {
                if !chain.contains(parent) {
                    return Err(Error::corrupt(
                        &path,
                        format!("missing snapshot parent: {}", parent),
                    ));
                }
            }

            highest_index = highest_index.max(snapshot.index);
            chain.snapshots.insert(snapshot.name.clone(), snapshot);
        }

        // The count is always written first, so a missing count means the
        // directory never held a snapshot.
        let Some(count) = count else {
            if chain.is_empty() && head.is_none() {
                return Ok((chain, recoveries));
            }
            return Err(Error::corrupt(location, "missing snapshot count file"));
        };
        chain.head = head;
        chain.count = count;

        if chain.count < highest_index {
            recoveries.push(Recovery::RaisedCount {
                from: chain.count,
                to: highest_index,
            });
            chain.count = highest_index;
        }
        if chain.count > max_snapshots {
            return Err(Error::corrupt(
                location,
                format!(
                    "snapshot count {} exceeds maximum {}",
                    chain.count, max_snapshots
                ),
            ));
        }

        if let Some(stale) = chain.half_deleted_root() {
            chain.snapshots.remove(&stale.name);
            if chain.head.as_deref() == Some(stale.name.as_str()) {
                chain.head = chain
                    .snapshots
                    .values()
                    .find(|s| s.is_root())
                    .map(|s| s.name.clone());
            }
            recoveries.push(Recovery::DroppedRoot(stale));
        }

        if chain.head.is_none() && chain.len() == 1 {
            if let Some(only) = chain.snapshots.keys().next().cloned() {
                chain.head = Some(only.clone());
                recoveries.push(Recovery::AdoptedHead(only));
            }
        }

        chain
            .check_integrity()
            .map_err(|reason| Error::corrupt(location, reason))?;

        Ok((chain, recoveries))
    }

    /// With exactly two roots, the older one is left over from a root
    /// deletion if it no longer has children.
    fn half_deleted_root(&self) -> Option<Snapshot> {
        let mut roots: Vec<_> = self.snapshots.values().filter(|s| s.is_root()).collect();
        if roots.len() != 2 {
            return None;
        }
        roots.sort_by_key(|s| s.index);
        let older = roots[0];
        if self.children_of(&older.name).is_empty() {
            Some(older.clone())
        } else {
            None
        }
    }

    /// Number of snapshots currently in the chain.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the chain holds no snapshots.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Number of snapshots ever created.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Name of the head snapshot.
    pub fn head_name(&self) -> Option<&str> {
        self.head.as_deref()
    }

    /// The head snapshot.
    pub fn head(&self) -> Option<&Snapshot> {
        self.head.as_ref().and_then(|name| self.snapshots.get(name))
    }

    /// Look up a snapshot by name.
    pub fn get(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.get(name)
    }

    /// Whether a snapshot named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.snapshots.contains_key(name)
    }

    /// All snapshots in creation order.
    pub fn ordered(&self) -> Vec<&Snapshot> {
        let mut all: Vec<_> = self.snapshots.values().collect();
        all.sort_by_key(|s| s.index);
        all
    }

    /// Direct children of `name`, in creation order.
    pub fn children_of(&self, name: &str) -> Vec<&Snapshot> {
        let mut children: Vec<_> = self
            .snapshots
            .values()
            .filter(|s| s.parent.as_deref() == Some(name))
            .collect();
        children.sort_by_key(|s| s.index);
        children
    }

    /// Name given to a snapshot taken without one.
    pub fn default_name(&self) -> String {
        format!("snapshot{}", self.count + 1)
    }

    /// Copy of this chain with `snapshot` added as the new head.
    pub fn staged_create(&self, snapshot: Snapshot) -> Self {
        let mut next = self.clone();
        next.head = Some(snapshot.name.clone());
        next.count = self.count + 1;
        next.snapshots.insert(snapshot.name.clone(), snapshot);
        next
    }

    /// Copy of this chain with the head moved to `name`.
    pub fn staged_head(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.head = Some(name.to_string());
        next
    }

    /// Copy of this chain without `name`, plus the children whose records
    /// changed because they were reparented.
    pub fn staged_delete(&self, vm: &str, name: &str) -> Result<(Self, Vec<Snapshot>)> {
        let target = self
            .get(name)
            .ok_or_else(|| Error::snapshot_not_found(vm, name))?;

        let children: Vec<Snapshot> = self.children_of(name).into_iter().cloned().collect();
        if target.is_root() && children.len() > 1 {
            return Err(Error::RootWithMultipleChildren {
                vm: vm.to_string(),
                name: name.to_string(),
            });
        }

        let mut next = self.clone();
        next.snapshots.remove(name);

        let mut reparented = Vec::with_capacity(children.len());
        for mut child in children {
            child.parent = target.parent.clone();
            next.snapshots.insert(child.name.clone(), child.clone());
            reparented.push(child);
        }

        if next.head.as_deref() == Some(name) {
            // A deleted root hands the head to its only child, the new root.
            next.head = target
                .parent
                .clone()
                .or_else(|| reparented.first().map(|c| c.name.clone()));
        }

        Ok((next, reparented))
    }

    /// Copy of this chain with `name` renamed to `new_name`, plus the renamed
    /// record and the children whose parent link followed it.
    pub fn staged_rename(
        &self,
        vm: &str,
        name: &str,
        new_name: &str,
    ) -> Result<(Self, Snapshot, Vec<Snapshot>)> {
        let target = self
            .get(name)
            .ok_or_else(|| Error::snapshot_not_found(vm, name))?;
        if self.contains(new_name) {
            return Err(Error::SnapshotNameTaken {
                vm: vm.to_string(),
                name: new_name.to_string(),
            });
        }

        let mut next = self.clone();
        next.snapshots.remove(name);

        let mut renamed = target.clone();
        renamed.name = new_name.to_string();
        next.snapshots.insert(renamed.name.clone(), renamed.clone());

        let mut relinked = Vec::new();
        for child in next.snapshots.values_mut() {
            if child.parent.as_deref() == Some(name) {
                child.parent = Some(new_name.to_string());
                relinked.push(child.clone());
            }
        }
        relinked.sort_by_key(|s| s.index);

        if next.head.as_deref() == Some(name) {
            next.head = Some(new_name.to_string());
        }
        Ok((next, renamed, relinked))
    }

    /// Copy of this chain with the comment of `name` replaced, plus the
    /// updated record.
    pub fn staged_comment(&self, vm: &str, name: &str, comment: &str) -> Result<(Self, Snapshot)> {
        let mut updated = self
            .get(name)
            .cloned()
            .ok_or_else(|| Error::snapshot_not_found(vm, name))?;
        updated.comment = comment.to_string();

        let mut next = self.clone();
        next.snapshots.insert(updated.name.clone(), updated.clone());
        Ok((next, updated))
    }

    /// Verify the structural invariants of the chain.
    ///
    /// Non-empty chains have a head that is a member, exactly one root, and
    /// parent links that all resolve and never loop.
    pub fn check_integrity(&self) -> std::result::Result<(), String> {
        for (key, snapshot) in &self.snapshots {
            if *key != snapshot.name {
                return Err(format!("snapshot {} stored under key {}", snapshot.name, key));
            }
        }

        if self.is_empty() {
            return Ok(());
        }

        match self.head.as_deref() {
            None => return Err("snapshots exist but there is no head".into()),
            Some(head) if !self.contains(head) => {
                return Err(format!("head points to missing snapshot: {}", head))
            }
            Some(_) => {}
        }

        let roots = self.snapshots.values().filter(|s| s.is_root()).count();
        if roots != 1 {
            return Err(format!("expected exactly one root snapshot, found {}", roots));
        }

        for snapshot in self.snapshots.values() {
            let mut current = snapshot;
            let mut steps = 0;
            while let Some(parent) = &current.parent {
                current = self
                    .snapshots
                    .get(parent)
                    .ok_or_else(|| format!("missing snapshot parent: {}", parent))?;
                steps += 1;
                if steps > self.snapshots.len() {
                    return Err(format!("parent cycle through snapshot {}", snapshot.name));
                }
            }
        }

        Ok(())
    }
}

/// Resolve pairs of records sharing an index, left by an interrupted rename.
///
/// The record that the head or a child still points to survives; with both
/// or neither referenced, the head's choice wins, then the first name.
fn settle_renames(
    mut snapshots: Vec<Snapshot>,
    head: &mut Option<String>,
    recoveries: &mut Vec<Recovery>,
    location: &Path,
) -> Result<Vec<Snapshot>> {
    let mut losers = Vec::new();

    let mut i = 1;
    while i < snapshots.len() {
        if snapshots[i].index != snapshots[i - 1].index {
            i += 1;
            continue;
        }
        if snapshots.get(i + 1).map(|s| s.index) == Some(snapshots[i].index) {
            return Err(Error::corrupt(
                location.join(snapshots[i].file_name()),
                format!("more than two records with index {}", snapshots[i].index),
            ));
        }

        let (keep_later, survivor) = {
            let (a, b) = (&snapshots[i - 1], &snapshots[i]);
            let a_head = is_head(head.as_deref(), a);
            let b_head = is_head(head.as_deref(), b);
            let a_linked = a_head || has_children(&snapshots, &a.name);
            let b_linked = b_head || has_children(&snapshots, &b.name);
            let keep_later = match (a_linked, b_linked) {
                (false, true) => true,
                (true, false) => false,
                _ if b_head => true,
                _ if a_head => false,
                _ => b.name < a.name,
            };
            let survivor = if keep_later { &b.name } else { &a.name };
            (keep_later, survivor.clone())
        };
        let loser = snapshots.remove(if keep_later { i - 1 } else { i });
        losers.push((loser, survivor));
    }

    for (loser, survivor) in losers {
        let mut rewritten = Vec::new();
        for snapshot in snapshots.iter_mut() {
            if snapshot.parent.as_deref() == Some(loser.name.as_str()) {
                snapshot.parent = Some(survivor.clone());
                rewritten.push(snapshot.clone());
            }
        }
        if head.as_deref() == Some(loser.name.as_str()) {
            *head = Some(survivor);
        }
        recoveries.push(Recovery::DroppedRename {
            stale: loser,
            rewritten,
        });
    }

    Ok(snapshots)
}

fn is_head(head: Option<&str>, snapshot: &Snapshot) -> bool {
    head == Some(snapshot.name.as_str())
}

fn has_children(snapshots: &[Snapshot], name: &str) -> bool {
    snapshots.iter().any(|s| s.parent.as_deref() == Some(name))
}
