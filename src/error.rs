//! Error types for the TunnelGuard supervisor

use thiserror::Error;

/// Main error type for TunnelGuard
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Required external tool missing
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// Exclusivity lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Tunnel process errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Firewall ruleset errors
    #[error("Firewall error: {0}")]
    Firewall(#[from] FirewallError),

    /// Resolver configuration errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Missing external tool errors, checked before any protection work starts
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("Required tool not found in PATH: {tool}")]
    Missing { tool: String },
}

/// Exclusivity lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another supervisor instance is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Lock file error at {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Tunnel process supervision errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel interface did not appear within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Tunnel config file not found: {path}")]
    ConfigMissing { path: String },

    #[error("Tunnel client process failed: {reason}")]
    ProcessFailed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Firewall ruleset errors
#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Failed to apply rule '{rule}': {reason}")]
    ApplyFailed { rule: String, reason: String },

    #[error("Firewall command could not be executed: {reason}")]
    CommandFailed { reason: String },
}

/// Resolver configuration errors
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Failed to back up resolver config: {reason}")]
    BackupFailed { reason: String },

    #[error("Failed to write resolver config: {reason}")]
    WriteFailed { reason: String },

    #[error("Failed to restore resolver config: {reason}")]
    RestoreFailed { reason: String },
}

impl GuardError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Lock(LockError::AlreadyRunning { pid }) => {
                format!(
                    "Another supervisor instance is already running (pid {}).\n  \
                     Use 'tunnelguard stop' to stop it first.",
                    pid
                )
            }

            Self::Dependency(DependencyError::Missing { tool }) => {
                format!(
                    "Required tool '{}' was not found in PATH.\n  \
                     Install it and try again.",
                    tool
                )
            }

            Self::Tunnel(TunnelError::ConfigMissing { path }) => {
                format!(
                    "Tunnel config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Tunnel(TunnelError::Timeout { seconds }) => {
                format!(
                    "The tunnel interface did not come up within {}s.\n  \
                     Check the tunnel client log for connection errors.",
                    seconds
                )
            }

            Self::Firewall(FirewallError::ApplyFailed { rule, .. }) => {
                format!(
                    "Failed to apply firewall rule '{}'.\n  \
                     Run with root privileges and check that iptables works.",
                    rule
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable via the reconnect policy
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Dependency(_) => false,
            Self::Lock(_) => false,
            Self::Config(ConfigError::ParseError { .. }) => false,
            Self::Config(ConfigError::InvalidValue { .. }) => false,

            // A missing config file falls back to defaults
            Self::Config(ConfigError::FileNotFound { .. }) => true,

            // Recoverable when the reconnect policy is driving
            Self::Tunnel(_) => true,
            Self::Firewall(_) => true,
            Self::Dns(_) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Dependency(_) => 2,
            Self::Lock(_) => 3,
            Self::Tunnel(_) => 4,
            Self::Firewall(_) => 5,
            Self::Dns(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for TunnelGuard operations
pub type Result<T> = std::result::Result<T, GuardError>;
