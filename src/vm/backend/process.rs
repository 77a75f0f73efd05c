//! Process backend.
//!
//! Runs the VM as a child process launched from a configured command line
//! (typically a hypervisor invocation). Lifecycle maps onto signals:
//!
//! | Operation         | Signal            |
//! |-------------------|-------------------|
//! | graceful stop     | `SIGTERM`         |
//! | forced stop       | `SIGKILL`         |
//! | suspend           | `SIGSTOP`         |
//! | start (suspended) | `SIGCONT`         |
//!
//! Snapshots are full copies of the disk image kept in the artifacts
//! directory.

use super::VmBackend;
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::vm::{ShutdownPolicy, VmState};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

/// Send `sig` to `pid`. Returns true if the signal was delivered.
fn signal(pid: libc::pid_t, sig: libc::c_int) -> bool {
    unsafe { libc::kill(pid, sig) == 0 }
}

/// Backend running the VM as a local child process.
pub struct ProcessBackend {
    command: Vec<String>,
    disk_image: PathBuf,
    artifacts_dir: PathBuf,
    child: Mutex<Option<Child>>,
    paused: AtomicBool,
}

impl ProcessBackend {
    /// Backend launching `command`, snapshotting `disk_image` into `artifacts_dir`.
    pub fn new(
        command: Vec<String>,
        disk_image: impl Into<PathBuf>,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command,
            disk_image: disk_image.into(),
            artifacts_dir: artifacts_dir.into(),
            child: Mutex::new(None),
            paused: AtomicBool::new(false),
        }
    }

    /// Where the disk copy for `snapshot` is kept.
    pub fn artifact_path(&self, snapshot: &Snapshot) -> PathBuf {
        self.artifacts_dir
            .join(format!("{:04}-{}.img", snapshot.index, snapshot.name))
    }

    /// Artifact recorded in the snapshot, falling back to the computed path.
    fn recorded_artifact(&self, snapshot: &Snapshot) -> PathBuf {
        snapshot
            .artifact
            .get("image")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.artifact_path(snapshot))
    }

    fn spawn(&self) -> Result<Child> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::backend("vm start", "no launch command configured"))?;

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::backend("vm start", format!("spawn {}: {}", program, e)))
    }
}

fn copy_image(from: &Path, to: &Path, operation: &str) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::backend(operation, format!("create {}: {}", parent.display(), e))
        })?;
    }

    // Copy next to the target, then rename over it.
    let mut staging = to.as_os_str().to_os_string();
    staging.push(".partial");
    let staging = PathBuf::from(staging);

    let result = fs::copy(from, &staging)
        .and_then(|_| fs::rename(&staging, to))
        .map_err(|e| {
            Error::backend(
                operation,
                format!("copy {} to {}: {}", from.display(), to.display(), e),
            )
        });
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

impl VmBackend for ProcessBackend {
    fn backend_name(&self) -> &'static str {
        "process"
    }

    fn start(&self) -> Result<()> {
        let mut child = self.child.lock();

        if let Some(running) = child.as_mut() {
            if let Ok(None) = running.try_wait() {
                let pid = running.id() as libc::pid_t;
                if self.paused.load(Ordering::SeqCst) {
                    if !signal(pid, libc::SIGCONT) {
                        return Err(Error::backend(
                            "vm resume",
                            std::io::Error::last_os_error().to_string(),
                        ));
                    }
                    self.paused.store(false, Ordering::SeqCst);
                    tracing::debug!(pid, "resumed vm process");
                }
                return Ok(());
            }
        }

        let spawned = self.spawn()?;
        tracing::debug!(pid = spawned.id(), "launched vm process");
        *child = Some(spawned);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, policy: ShutdownPolicy) -> Result<()> {
        let mut child = self.child.lock();
        let Some(running) = child.as_mut() else {
            return Ok(());
        };
        if !matches!(running.try_wait(), Ok(None)) {
            return Ok(());
        }

        let pid = running.id() as libc::pid_t;
        match policy {
            ShutdownPolicy::Graceful => {
                if !signal(pid, libc::SIGTERM) {
                    return Err(Error::backend(
                        "vm stop",
                        std::io::Error::last_os_error().to_string(),
                    ));
                }
                // A stopped process only acts on SIGTERM once continued.
                if self.paused.swap(false, Ordering::SeqCst) {
                    signal(pid, libc::SIGCONT);
                }
            }
            ShutdownPolicy::Force => {
                running
                    .kill()
                    .map_err(|e| Error::backend("vm stop", e.to_string()))?;
                self.paused.store(false, Ordering::SeqCst);
            }
        }

        tracing::debug!(pid, policy = %policy, "signalled vm process");
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        let mut child = self.child.lock();
        let Some(running) = child.as_mut() else {
            return Err(Error::backend("vm suspend", "vm process is not running"));
        };
        if !matches!(running.try_wait(), Ok(None)) {
            return Err(Error::backend("vm suspend", "vm process is not running"));
        }

        let pid = running.id() as libc::pid_t;
        if !signal(pid, libc::SIGSTOP) {
            return Err(Error::backend(
                "vm suspend",
                std::io::Error::last_os_error().to_string(),
            ));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn current_state(&self) -> VmState {
        let mut child = self.child.lock();
        match child.as_mut() {
            None => VmState::Off,
            Some(c) => match c.try_wait() {
                Ok(Some(_)) => VmState::Stopped,
                Ok(None) if self.paused.load(Ordering::SeqCst) => VmState::Suspended,
                Ok(None) => VmState::Running,
                Err(_) => VmState::Unknown,
            },
        }
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    fn capture(&self, snapshot: &Snapshot) -> Result<serde_json::Value> {
        let target = self.artifact_path(snapshot);
        copy_image(&self.disk_image, &target, "snapshot capture")?;
        Ok(serde_json::json!({ "image": target }))
    }

    fn apply(&self, snapshot: &Snapshot) -> Result<()> {
        let source = self.recorded_artifact(snapshot);
        copy_image(&source, &self.disk_image, "snapshot apply")
    }

    fn erase(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.recorded_artifact(snapshot);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::backend(
                "snapshot erase",
                format!("remove {}: {}", path.display(), e),
            )),
        }
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        // Do not leave a SIGSTOPped child behind.
        if let Some(child) = self.child.get_mut().as_mut() {
            if self.paused.load(Ordering::SeqCst) {
                signal(child.id() as libc::pid_t, libc::SIGCONT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmSpecs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn snapshot(index: u32, name: &str) -> Snapshot {
        Snapshot::new(index, name, "", None, VmState::Off, VmSpecs::default()).unwrap()
    }

    fn wait_for(backend: &ProcessBackend, state: VmState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if backend.current_state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_capture_apply_erase() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("disk.img");
        fs::write(&disk, b"version one").unwrap();

        let backend = ProcessBackend::new(Vec::new(), &disk, tmp.path().join("artifacts"));
        let mut snap = snapshot(1, "snapshot1");

        snap.artifact = backend.capture(&snap).unwrap();
        let artifact = backend.artifact_path(&snap);
        assert!(artifact.ends_with("artifacts/0001-snapshot1.img"));
        assert_eq!(fs::read(&artifact).unwrap(), b"version one");

        fs::write(&disk, b"version two").unwrap();
        backend.apply(&snap).unwrap();
        assert_eq!(fs::read(&disk).unwrap(), b"version one");

        backend.erase(&snap).unwrap();
        assert!(!artifact.exists());
        // Erasing again is harmless.
        backend.erase(&snap).unwrap();
    }

    #[test]
    fn test_capture_fails_without_disk() {
        let tmp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(
            Vec::new(),
            tmp.path().join("missing.img"),
            tmp.path().join("artifacts"),
        );
        let err = backend.capture(&snapshot(1, "s")).unwrap_err();
        assert!(err.to_string().contains("snapshot capture failed"));
    }

    #[test]
    fn test_start_without_command_fails() {
        let tmp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(Vec::new(), tmp.path().join("d.img"), tmp.path());
        assert_eq!(backend.current_state(), VmState::Off);
        let err = backend.start().unwrap_err();
        assert!(err.to_string().contains("no launch command"));
        assert_eq!(backend.current_state(), VmState::Off);

        let err = backend.suspend().unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn test_process_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(
            vec!["sleep".into(), "30".into()],
            tmp.path().join("d.img"),
            tmp.path(),
        );

        backend.start().unwrap();
        assert_eq!(backend.current_state(), VmState::Running);

        backend.suspend().unwrap();
        assert_eq!(backend.current_state(), VmState::Suspended);

        backend.start().unwrap();
        assert_eq!(backend.current_state(), VmState::Running);

        backend.stop(ShutdownPolicy::Graceful).unwrap();
        assert!(wait_for(&backend, VmState::Stopped));

        // Stopping a stopped process is a no-op.
        backend.stop(ShutdownPolicy::Force).unwrap();
    }

    #[test]
    fn test_forced_stop() {
        let tmp = TempDir::new().unwrap();
        let backend = ProcessBackend::new(
            vec!["sleep".into(), "30".into()],
            tmp.path().join("d.img"),
            tmp.path(),
        );
        backend.start().unwrap();
        backend.stop(ShutdownPolicy::Force).unwrap();
        assert!(wait_for(&backend, VmState::Stopped));
        assert!(backend.suspend().is_err());
    }
}
