//! Persistence of a snapshot chain.

use super::Snapshot;
use crate::error::{Error, Result};
use crate::util;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Pointer file holding the head snapshot's name.
pub const HEAD_FILE: &str = "snapshot-head";
/// Pointer file holding the number of snapshots ever created.
pub const COUNT_FILE: &str = "snapshot-count";
/// Suffix of per-snapshot files.
pub const SNAPSHOT_FILE_SUFFIX: &str = ".snapshot.json";

/// Raw persisted state, before any integrity check.
#[derive(Debug, Clone, Default)]
pub struct PersistedChain {
    /// Snapshot records in index order.
    pub snapshots: Vec<Snapshot>,
    /// Head pointer: `None` if the file is missing, `Some(None)` if empty.
    pub head: Option<Option<String>>,
    /// Count pointer: `None` if the file is missing.
    pub count: Option<u32>,
}

/// Where a VM's snapshot chain lives.
///
/// Each write must be atomic on its own: a reader sees the old or the new
/// file, never a partial one. Sequencing several writes into one logical
/// change is the caller's job.
pub trait SnapshotStore: Send + Sync {
    /// Location reported in corruption errors.
    fn location(&self) -> &Path;

    /// Read every persisted record.
    fn read_all(&self) -> Result<PersistedChain>;

    /// Create or replace a snapshot file.
    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Remove a snapshot file. Removing a missing file succeeds.
    fn remove_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Replace the head pointer (`None` writes an empty head).
    fn write_head(&self, head: Option<&str>) -> Result<()>;

    /// Replace the count pointer.
    fn write_count(&self, count: u32) -> Result<()>;

    /// Remove both pointer files, returning to the never-snapshotted layout.
    fn remove_pointers(&self) -> Result<()>;
}

/// Snapshot store backed by a directory.
#[derive(Debug, Clone)]
pub struct DirSnapshotStore {
    dir: PathBuf,
}

impl DirSnapshotStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_pointer(&self, file: &str) -> Result<Option<String>> {
        let path = self.dir.join(file);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(
                format!("read {}", path.display()),
                e.to_string(),
            )),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(
                format!("remove {}", path.display()),
                e.to_string(),
            )),
        }
    }
}

impl SnapshotStore for DirSnapshotStore {
    fn location(&self) -> &Path {
        &self.dir
    }

    fn read_all(&self) -> Result<PersistedChain> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PersistedChain::default()),
            Err(e) => {
                return Err(Error::storage(
                    format!("read directory {}", self.dir.display()),
                    e.to_string(),
                ))
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SNAPSHOT_FILE_SUFFIX));
            if is_snapshot && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut snapshots = Vec::with_capacity(paths.len());
        for path in paths {
            let data = fs::read_to_string(&path).map_err(|e| {
                Error::storage(format!("read {}", path.display()), e.to_string())
            })?;
            let snapshot: Snapshot = serde_json::from_str(&data)
                .map_err(|e| Error::corrupt(&path, format!("unreadable snapshot file: {}", e)))?;

            // Deletion and rename address the file by index and name.
            let expected = snapshot.file_name();
            if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
                return Err(Error::corrupt(
                    &path,
                    format!("record belongs in {}", expected),
                ));
            }
            snapshots.push(snapshot);
        }
        // The index prefix outgrows its padding past 9999, so sort on the
        // parsed index rather than the file name.
        snapshots.sort_by_key(|s| s.index);

        let head = self
            .read_pointer(HEAD_FILE)?
            .map(|name| if name.is_empty() { None } else { Some(name) });

        let count = match self.read_pointer(COUNT_FILE)? {
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                Error::corrupt(self.dir.join(COUNT_FILE), format!("invalid count: {:?}", raw))
            })?),
            None => None,
        };

        Ok(PersistedChain {
            snapshots,
            head,
            count,
        })
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        util::write_atomic(&self.dir.join(snapshot.file_name()), &json)
    }

    fn remove_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.remove_file(&self.dir.join(snapshot.file_name()))
    }

    fn write_head(&self, head: Option<&str>) -> Result<()> {
        util::write_atomic(&self.dir.join(HEAD_FILE), head.unwrap_or("").as_bytes())
    }

    fn write_count(&self, count: u32) -> Result<()> {
        util::write_atomic(&self.dir.join(COUNT_FILE), count.to_string().as_bytes())
    }

    fn remove_pointers(&self) -> Result<()> {
        self.remove_file(&self.dir.join(HEAD_FILE))?;
        self.remove_file(&self.dir.join(COUNT_FILE))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store wrapper with injectable write failures.

    use super::*;
    use parking_lot::Mutex;

    /// Which store write fails next.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum FailPoint {
        WriteSnapshot,
        WriteHead,
        WriteCount,
        RemoveSnapshot,
    }

    /// Delegates to a [`DirSnapshotStore`] except at armed fail points.
    pub(crate) struct FailingStore {
        inner: DirSnapshotStore,
        armed: Mutex<Vec<FailPoint>>,
    }

    impl FailingStore {
        pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
            Self {
                inner: DirSnapshotStore::new(dir),
                armed: Mutex::new(Vec::new()),
            }
        }

        /// Fail the next call at `point` (once).
        pub(crate) fn fail_next(&self, point: FailPoint) {
            self.armed.lock().push(point);
        }

        fn trip(&self, point: FailPoint) -> Result<()> {
            let mut armed = self.armed.lock();
            if let Some(pos) = armed.iter().position(|p| *p == point) {
                armed.remove(pos);
                return Err(Error::storage(format!("{:?}", point), "injected failure"));
            }
            Ok(())
        }
    }

    impl SnapshotStore for FailingStore {
        fn location(&self) -> &Path {
            self.inner.location()
        }

        fn read_all(&self) -> Result<PersistedChain> {
            self.inner.read_all()
        }

        fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
            self.trip(FailPoint::WriteSnapshot)?;
            self.inner.write_snapshot(snapshot)
        }

        fn remove_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
            self.trip(FailPoint::RemoveSnapshot)?;
            self.inner.remove_snapshot(snapshot)
        }

        fn write_head(&self, head: Option<&str>) -> Result<()> {
            self.trip(FailPoint::WriteHead)?;
            self.inner.write_head(head)
        }

        fn write_count(&self, count: u32) -> Result<()> {
            self.trip(FailPoint::WriteCount)?;
            self.inner.write_count(count)
        }

        fn remove_pointers(&self) -> Result<()> {
            self.inner.remove_pointers()
        }
    }
}
