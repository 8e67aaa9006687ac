//! Single-instance exclusivity lock
//!
//! A pid file guaranteeing at most one supervisor instance per host.
//! The firewall and resolver are host-global resources; two supervisors
//! fighting over them would undo each other's protection. A stale lock
//! (holder process no longer exists) is reclaimed automatically.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::LockError;

/// Default location of the lock file
pub const DEFAULT_LOCK_PATH: &str = "/run/tunnelguard/tunnelguard.pid";

/// Pid-file based single-holder exclusivity token
pub struct InstanceLock {
    path: PathBuf,
    held: bool,
}

impl InstanceLock {
    /// Lock at the default location
    pub fn new() -> Self {
        Self::at(DEFAULT_LOCK_PATH)
    }

    /// Lock at an explicit path
    pub fn at<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            held: false,
        }
    }

    /// Acquire the lock, reclaiming it if the previous holder is dead.
    ///
    /// Fails fast with `AlreadyRunning` when a live process holds it.
    pub fn acquire(&mut self) -> Result<(), LockError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        // Two rounds: the second one runs after a stale lock was removed
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id()).map_err(|e| self.io_error(e))?;
                    self.held = true;
                    tracing::debug!("Acquired instance lock at {}", self.path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_holder(&self.path) {
                        Some(pid) if process_alive(pid) => {
                            return Err(LockError::AlreadyRunning { pid });
                        }
                        _ => {
                            tracing::info!(
                                "Reclaiming stale lock at {} (holder is gone)",
                                self.path.display()
                            );
                            std::fs::remove_file(&self.path).map_err(|e| self.io_error(e))?;
                        }
                    }
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }

        // Another instance re-created the lock between our removal and
        // retry; report whoever holds it now
        match read_holder(&self.path) {
            Some(pid) => Err(LockError::AlreadyRunning { pid }),
            None => Err(self.io_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                "lock file contention",
            ))),
        }
    }

    /// Whether this instance currently holds the lock
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Re-validate that the lock file still names this process.
    ///
    /// Checked defensively before destructive firewall operations: if
    /// someone clobbered the lock, this supervisor no longer owns the
    /// host-global state.
    pub fn still_held(&self) -> bool {
        self.held && read_holder(&self.path) == Some(std::process::id())
    }

    /// Release the lock. Safe to call when not held.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove lock file: {}", e);
            }
        } else {
            tracing::debug!("Released instance lock");
        }
    }

    fn io_error(&self, e: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

impl Default for InstanceLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pid of the live process holding the lock at `path`, if any
pub fn live_holder<P: AsRef<Path>>(path: P) -> Option<u32> {
    let pid = read_holder(path.as_ref())?;
    process_alive(pid).then_some(pid)
}

fn read_holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything; EPERM
    // still means the process exists
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Far above any real pid_max, so never a live process
    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn second_acquire_yields_already_running() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        let mut first = InstanceLock::at(&path);
        first.acquire().unwrap();
        assert!(first.is_held());

        let mut second = InstanceLock::at(&path);
        match second.acquire() {
            Err(LockError::AlreadyRunning { pid }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");
        std::fs::write(&path, DEAD_PID.to_string()).unwrap();

        let mut lock = InstanceLock::at(&path);
        lock.acquire().unwrap();
        assert!(lock.still_held());
    }

    #[test]
    fn garbage_lock_content_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");
        std::fs::write(&path, "not a pid").unwrap();

        let mut lock = InstanceLock::at(&path);
        lock.acquire().unwrap();
    }

    #[test]
    fn start_stop_start_cycles_never_wedge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        for _ in 0..3 {
            let mut lock = InstanceLock::at(&path);
            lock.acquire().unwrap();
            lock.release();
            assert!(!path.exists());
        }
    }

    #[test]
    fn release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        let mut lock = InstanceLock::at(&path);
        lock.acquire().unwrap();
        lock.release();
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        {
            let mut lock = InstanceLock::at(&path);
            lock.acquire().unwrap();
        }
        assert!(!path.exists());

        let mut lock = InstanceLock::at(&path);
        lock.acquire().unwrap();
    }

    #[test]
    fn live_holder_reports_running_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        assert_eq!(live_holder(&path), None);

        let mut lock = InstanceLock::at(&path);
        lock.acquire().unwrap();
        assert_eq!(live_holder(&path), Some(std::process::id()));

        lock.release();
        assert_eq!(live_holder(&path), None);
    }

    #[test]
    fn still_held_detects_clobbered_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        let mut lock = InstanceLock::at(&path);
        lock.acquire().unwrap();
        assert!(lock.still_held());

        std::fs::write(&path, DEAD_PID.to_string()).unwrap();
        assert!(!lock.still_held());
    }
}
