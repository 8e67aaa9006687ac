//! External tunnel client supervision
//!
//! Launches the tunnel client as a child process, waits for a
//! tunnel-shaped network interface to appear, and keeps both the
//! process and the interface under observation. The client is an
//! external program (OpenVPN, wg-quick style tools take their config
//! file as the single positional argument); this module never speaks
//! the tunnel protocol itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use crate::config::Config;
use crate::error::TunnelError;

/// Where interface names are enumerated
const DEFAULT_SYSFS_NET: &str = "/sys/class/net";

/// Default destination for the tunnel client's own output
pub const DEFAULT_TUNNEL_LOG: &str = "/var/log/tunnelguard/tunnel.log";

/// Cadence of the interface-appearance poll
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long terminate() waits after SIGTERM before force-killing
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Owning view of a running tunnel client process
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    /// Process id of the tunnel client
    pub pid: u32,
    /// Name of the tunnel interface the client brought up
    pub interface: String,
    /// When the interface was first sighted
    pub started_at: Instant,
}

impl TunnelHandle {
    /// Seconds since the tunnel came up
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Supervises the external tunnel client process.
///
/// Exclusively owns the child process; callers get a read-only view of
/// the [`TunnelHandle`].
pub struct TunnelSupervisor {
    client_bin: String,
    config_path: PathBuf,
    log_path: PathBuf,
    sysfs_net: PathBuf,
    startup_timeout: Duration,
    child: Option<Child>,
    handle: Option<TunnelHandle>,
}

impl TunnelSupervisor {
    /// Create a supervisor for the configured tunnel client
    pub fn new(config: &Config) -> Self {
        Self {
            client_bin: config.tunnel_client.clone(),
            config_path: config.tunnel_config.clone(),
            log_path: PathBuf::from(DEFAULT_TUNNEL_LOG),
            sysfs_net: PathBuf::from(DEFAULT_SYSFS_NET),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            child: None,
            handle: None,
        }
    }

    /// Create a supervisor with explicit paths (tests)
    pub fn with_paths<P, Q, R>(
        client_bin: &str,
        config_path: P,
        log_path: Q,
        sysfs_net: R,
        startup_timeout: Duration,
    ) -> Self
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        Self {
            client_bin: client_bin.to_string(),
            config_path: config_path.as_ref().to_path_buf(),
            log_path: log_path.as_ref().to_path_buf(),
            sysfs_net: sysfs_net.as_ref().to_path_buf(),
            startup_timeout,
            child: None,
            handle: None,
        }
    }

    /// Read-only view of the current handle, if a tunnel is up
    pub fn handle(&self) -> Option<&TunnelHandle> {
        self.handle.as_ref()
    }

    /// Launch the tunnel client and wait for its interface.
    ///
    /// Terminates any pre-existing client with the same identity first,
    /// then spawns the client in the background with its output
    /// appended to the shared log, and polls for a tunnel-shaped
    /// interface until the startup timeout.
    pub async fn launch(&mut self) -> Result<&TunnelHandle, TunnelError> {
        if !self.config_path.exists() {
            return Err(TunnelError::ConfigMissing {
                path: self.config_path.display().to_string(),
            });
        }

        // Idempotent pre-clean: our own previous child, then any
        // same-identity client left over from another run
        self.terminate().await;
        self.preclean_stale_clients();

        let log = self.open_client_log();
        let (stdout, stderr) = match log {
            Some(file) => {
                let err = file.try_clone().ok();
                (
                    Stdio::from(file),
                    err.map(Stdio::from).unwrap_or_else(Stdio::null),
                )
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut child = Command::new(&self.client_bin)
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // A cancelled launch (shutdown mid-poll) must not orphan the client
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::ProcessFailed {
                reason: format!("failed to spawn {}: {}", self.client_bin, e),
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, client = %self.client_bin, "Tunnel client started");

        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Some(interface) = self.find_tunnel_interface() {
                tracing::info!(interface = %interface, "Tunnel interface is up");
                self.child = Some(child);
                self.handle = Some(TunnelHandle {
                    pid,
                    interface,
                    started_at: Instant::now(),
                });
                return Ok(self.handle.as_ref().unwrap());
            }

            // The client dying before the interface appears is a
            // distinct failure from a plain timeout
            if let Ok(Some(status)) = child.try_wait() {
                return Err(TunnelError::ProcessFailed {
                    reason: format!("client exited with {} before the interface appeared", status),
                });
            }

            if Instant::now() >= deadline {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(TunnelError::Timeout {
                    seconds: self.startup_timeout.as_secs(),
                });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// True iff the client process is running AND its interface is
    /// still present. Either can fail independently: the transport can
    /// drop the interface during a rekey with the process alive, and
    /// the OS can keep the interface around briefly after the process
    /// dies.
    pub fn is_alive(&mut self) -> bool {
        let process_up = match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };

        let interface_up = self
            .handle
            .as_ref()
            .map(|h| self.sysfs_net.join(&h.interface).exists())
            .unwrap_or(false);

        process_up && interface_up
    }

    /// Stop the tunnel client: graceful signal, bounded grace period,
    /// force-kill fallback. Terminating an already-stopped tunnel is a
    /// no-op.
    pub async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            self.handle = None;
            return;
        };

        if let Some(pid) = child.id() {
            tracing::info!(pid, "Stopping tunnel client");
            send_sigterm(pid);

            let grace_deadline = Instant::now() + TERMINATE_GRACE;
            while Instant::now() < grace_deadline {
                if let Ok(Some(_)) = child.try_wait() {
                    self.handle = None;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            tracing::warn!(pid, "Tunnel client ignored SIGTERM, force-killing");
        }

        let _ = child.kill().await;
        let _ = child.wait().await;
        self.handle = None;
    }

    /// Kill any same-identity client from a previous run, best-effort
    fn preclean_stale_clients(&self) {
        let pattern = self.config_path.display().to_string();
        match std::process::Command::new("pkill")
            .args(["-f", &pattern])
            .output()
        {
            Ok(output) if output.status.success() => {
                tracing::info!("Terminated a stale tunnel client from a previous run");
            }
            // pkill exits 1 when nothing matched, which is the common case
            Ok(_) => {}
            Err(e) => tracing::debug!("pkill unavailable: {}", e),
        }
    }

    /// Open the shared log file for the client's native output
    fn open_client_log(&self) -> Option<std::fs::File> {
        if let Some(parent) = self.log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(
                    "Cannot open tunnel log {}: {}, discarding client output",
                    self.log_path.display(),
                    e
                );
                None
            }
        }
    }

    /// Scan for a tunnel-shaped interface
    fn find_tunnel_interface(&self) -> Option<String> {
        let entries = std::fs::read_dir(&self.sysfs_net).ok()?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| is_tunnel_interface(name))
            .collect();
        names.sort();
        names.into_iter().next()
    }
}

/// Whether an interface name looks like a point-to-point tunnel device
pub fn is_tunnel_interface(name: &str) -> bool {
    for prefix in ["tun", "tap", "wg", "utun"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if rest.chars().all(|c| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

/// Extract the first IPv4 address from `ip -4 addr show dev <iface>`
/// output of the form `    inet 10.8.0.2/24 brd ...`
pub fn parse_inet_addr(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| line.starts_with("inet "))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|cidr| cidr.split('/').next())
        .map(|addr| addr.to_string())
}

/// Query the tunnel interface's address for status reporting
pub fn interface_address(interface: &str) -> Option<String> {
    let output = std::process::Command::new("ip")
        .args(["-4", "addr", "show", "dev", interface])
        .output()
        .ok()?;
    parse_inet_addr(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
