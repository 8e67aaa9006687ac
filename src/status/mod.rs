//! Published status snapshots
//!
//! Persists a machine-readable snapshot of the supervisor state for
//! external consumers (status displays, panel widgets, the `status`
//! CLI command). The snapshot file is replaced atomically so readers
//! never observe a half-written document, and publication failures are
//! logged but never abort protection logic.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default location of the published snapshot
pub const DEFAULT_STATUS_PATH: &str = "/run/tunnelguard/status.json";

/// Supervisor connection state, mutated only by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Establishing,
    Protected,
    Degraded,
    Reconnecting,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Establishing => "establishing",
            Self::Protected => "protected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Machine-readable snapshot of the current supervisor state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Schema version for future migrations
    pub schema_version: u32,
    /// Current connection state
    pub state: ConnectionState,
    /// Address on the tunnel interface, when one is up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_address: Option<String>,
    /// Active trusted DNS servers
    pub dns_servers: Vec<String>,
    /// Seconds since the tunnel came up, when one is up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_uptime_secs: Option<u64>,
    /// When this snapshot was taken (Unix epoch seconds)
    pub timestamp: String,
}

impl StatusSnapshot {
    /// Build a snapshot for the given state with no tunnel details
    pub fn new(state: ConnectionState, dns_servers: Vec<String>) -> Self {
        Self {
            schema_version: 1,
            state,
            tunnel_address: None,
            dns_servers,
            tunnel_uptime_secs: None,
            timestamp: epoch_now(),
        }
    }
}

/// Writes snapshots to the published status location
pub struct StatusPublisher {
    path: PathBuf,
}

impl StatusPublisher {
    /// Publisher at the default status location
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STATUS_PATH),
        }
    }

    /// Publisher at an explicit path
    pub fn at<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Publish a snapshot atomically (write-to-temp-then-rename).
    ///
    /// Pure side effect: failures are logged and swallowed, because a
    /// broken status display must never take down protection.
    pub fn publish(&self, snapshot: &StatusSnapshot) {
        if let Err(e) = self.try_publish(snapshot) {
            tracing::warn!("Failed to publish status snapshot: {}", e);
        }
    }

    fn try_publish(&self, snapshot: &StatusSnapshot) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        // Same directory, so the rename is atomic on the same filesystem
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(state = %snapshot.state, "Published status snapshot");
        Ok(())
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the last published snapshot without touching live state.
///
/// Returns None if the file is missing or unparseable.
pub fn read_snapshot<P: AsRef<Path>>(path: P) -> Option<StatusSnapshot> {
    match std::fs::read_to_string(path.as_ref()) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Failed to parse status snapshot: {}", e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!("Failed to read status snapshot: {}", e);
            None
        }
    }
}

/// Current timestamp as Unix epoch seconds string
pub fn epoch_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs().to_string()
}
