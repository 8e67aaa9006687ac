//! Resolver pinning and restoration
//!
//! Backs up the system resolver configuration once, overwrites it with
//! the trusted server list, and restores the original bytes on
//! shutdown. While pinned, the file is marked immutable (best-effort)
//! so other processes cannot re-point DNS off the tunnel.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::DnsError;

/// Default resolver configuration file
pub const DEFAULT_RESOLV_PATH: &str = "/etc/resolv.conf";

/// Default location of the one-shot resolver backup
pub const DEFAULT_BACKUP_PATH: &str = "/var/lib/tunnelguard/resolv.conf.backup";

/// Guards the resolver configuration for one supervisor run.
///
/// The backup is captured exactly once: a second `pin` before `restore`
/// must not overwrite it, or a crash-and-retry cycle would lose the true
/// original and "restore" the pinned content instead.
pub struct DnsGuard {
    resolv_path: PathBuf,
    backup_path: PathBuf,
}

impl DnsGuard {
    /// Create a guard over the system resolver paths
    pub fn new() -> Self {
        Self {
            resolv_path: PathBuf::from(DEFAULT_RESOLV_PATH),
            backup_path: PathBuf::from(DEFAULT_BACKUP_PATH),
        }
    }

    /// Create a guard over explicit paths
    pub fn with_paths<P: AsRef<Path>, Q: AsRef<Path>>(resolv_path: P, backup_path: Q) -> Self {
        Self {
            resolv_path: resolv_path.as_ref().to_path_buf(),
            backup_path: backup_path.as_ref().to_path_buf(),
        }
    }

    /// Whether a backup from a previous `pin` is present
    pub fn has_backup(&self) -> bool {
        self.backup_path.exists()
    }

    /// Pin the resolver to the trusted server list.
    ///
    /// Captures the current resolver content as the backup if none
    /// exists yet, writes the trusted servers as the active
    /// configuration, then marks the file tamper-resistant.
    /// Tamper-resistance failure is a warning; a resolver write failure
    /// is an error.
    pub fn pin(&self, servers: &[IpAddr]) -> Result<(), DnsError> {
        if !self.has_backup() {
            let original = match std::fs::read(&self.resolv_path) {
                Ok(bytes) => bytes,
                // No resolver file at all is a valid original state
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => {
                    return Err(DnsError::BackupFailed {
                        reason: format!("reading {}: {}", self.resolv_path.display(), e),
                    })
                }
            };

            if let Some(parent) = self.backup_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DnsError::BackupFailed {
                    reason: format!("creating {}: {}", parent.display(), e),
                })?;
            }

            std::fs::write(&self.backup_path, &original).map_err(|e| DnsError::BackupFailed {
                reason: format!("writing {}: {}", self.backup_path.display(), e),
            })?;
            tracing::info!("Backed up resolver config to {}", self.backup_path.display());
        } else {
            tracing::debug!("Resolver backup already present, keeping the original");
        }

        // A previous run may have left the immutable flag set
        set_immutable(&self.resolv_path, false);

        let mut content = String::from("# Pinned by tunnelguard - do not edit\n");
        for server in servers {
            content.push_str(&format!("nameserver {}\n", server));
        }

        std::fs::write(&self.resolv_path, content).map_err(|e| DnsError::WriteFailed {
            reason: format!("writing {}: {}", self.resolv_path.display(), e),
        })?;

        set_immutable(&self.resolv_path, true);

        tracing::info!(servers = ?servers, "Resolver pinned to trusted servers");
        Ok(())
    }

    /// Restore the original resolver content and drop the backup.
    ///
    /// No-op when no backup exists.
    pub fn restore(&self) -> Result<(), DnsError> {
        if !self.has_backup() {
            tracing::debug!("No resolver backup present, nothing to restore");
            return Ok(());
        }

        set_immutable(&self.resolv_path, false);

        let original = std::fs::read(&self.backup_path).map_err(|e| DnsError::RestoreFailed {
            reason: format!("reading {}: {}", self.backup_path.display(), e),
        })?;

        std::fs::write(&self.resolv_path, &original).map_err(|e| DnsError::RestoreFailed {
            reason: format!("writing {}: {}", self.resolv_path.display(), e),
        })?;

        if let Err(e) = std::fs::remove_file(&self.backup_path) {
            tracing::warn!("Failed to delete resolver backup: {}", e);
        }

        tracing::info!("Resolver config restored");
        Ok(())
    }
}

impl Default for DnsGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Toggle the filesystem immutable flag on the resolver file.
///
/// Best-effort: not every platform or filesystem supports it, and
/// protection must not depend on it.
fn set_immutable(path: &Path, on: bool) {
    let flag = if on { "+i" } else { "-i" };
    match Command::new("chattr").arg(flag).arg(path).output() {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            tracing::warn!(
                "chattr {} {} failed: {}",
                flag,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => {
            tracing::warn!("chattr not available ({}), resolver left mutable", e);
        }
    }
}
