//! Supervisor configuration file parser
//!
//! Parses a `key = value` style config file. A missing file is not an
//! error: the supervisor runs with built-in defaults so a fresh install
//! works before any config has been written.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;

use crate::error::ConfigError;

/// Default location of the supervisor config file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tunnelguard/tunnelguard.conf";

/// Environment override for the tunnel startup timeout (seconds)
pub const ENV_STARTUP_TIMEOUT: &str = "TUNNELGUARD_STARTUP_TIMEOUT";

/// Complete supervisor configuration
///
/// Immutable once loaded for a supervisor run; changing values requires
/// a restart.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the external tunnel client's own config file
    pub tunnel_config: PathBuf,
    /// Tunnel client program to execute (name or absolute path)
    pub tunnel_client: String,
    /// Trusted DNS servers, in preference order (never empty)
    pub dns_servers: Vec<IpAddr>,
    /// Whether the killswitch firewall ruleset is applied at all
    pub killswitch_enabled: bool,
    /// Whether to reconnect automatically after tunnel loss
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts, in seconds
    pub reconnect_delay_secs: u64,
    /// Interval between tunnel health checks, in seconds (> 0)
    pub health_check_secs: u64,
    /// Local network to keep reachable while the killswitch is armed
    pub allowed_local_net: Option<IpNet>,
    /// UDP port the tunnel client negotiates on (firewall exception)
    pub endpoint_port: u16,
    /// How long to wait for the tunnel interface to appear, in seconds
    pub startup_timeout_secs: u64,
    /// Reconnect attempt bound; 0 means keep trying forever
    pub max_reconnect_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel_config: PathBuf::from("/etc/tunnelguard/tunnel.conf"),
            tunnel_client: "openvpn".to_string(),
            dns_servers: vec!["1.1.1.1".parse().unwrap(), "1.0.0.1".parse().unwrap()],
            killswitch_enabled: true,
            auto_reconnect: true,
            reconnect_delay_secs: 5,
            health_check_secs: 10,
            allowed_local_net: None,
            endpoint_port: 1194,
            startup_timeout_secs: 30,
            max_reconnect_attempts: 0,
        }
    }
}

impl Config {
    /// Load configuration for a supervisor run.
    ///
    /// A missing file yields the defaults; a present but malformed file
    /// is an error. Environment overrides are applied after the file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "tunnel_config" => {
                    config.tunnel_config = PathBuf::from(value);
                }
                "tunnel_client" => {
                    config.tunnel_client = value.to_string();
                }
                "dns_servers" => {
                    let mut servers = Vec::new();
                    for server_str in value.split(',') {
                        let server_str = server_str.trim();
                        if server_str.is_empty() {
                            continue;
                        }
                        let server: IpAddr =
                            server_str.parse().map_err(|_| ConfigError::InvalidValue {
                                field: "dns_servers".to_string(),
                                message: format!("not an IP address: {}", server_str),
                            })?;
                        servers.push(server);
                    }
                    config.dns_servers = servers;
                }
                "killswitch_enabled" => {
                    config.killswitch_enabled = parse_bool(value, line_num)?;
                }
                "auto_reconnect" => {
                    config.auto_reconnect = parse_bool(value, line_num)?;
                }
                "reconnect_delay" => {
                    config.reconnect_delay_secs =
                        value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid reconnect_delay: {}", value),
                        })?;
                }
                "health_check_interval" => {
                    config.health_check_secs =
                        value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid health_check_interval: {}", value),
                        })?;
                }
                "allowed_local_net" => {
                    let net: IpNet = value.parse().map_err(|_| ConfigError::InvalidValue {
                        field: "allowed_local_net".to_string(),
                        message: format!("not a CIDR network: {}", value),
                    })?;
                    config.allowed_local_net = Some(net);
                }
                "endpoint_port" => {
                    config.endpoint_port = value.parse().map_err(|_| ConfigError::ParseError {
                        line: line_num,
                        message: format!("Invalid endpoint_port: {}", value),
                    })?;
                }
                "startup_timeout" => {
                    config.startup_timeout_secs =
                        value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid startup_timeout: {}", value),
                        })?;
                }
                "max_reconnect_attempts" => {
                    config.max_reconnect_attempts =
                        value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid max_reconnect_attempts: {}", value),
                        })?;
                }
                _ => {
                    // Unknown key, ignore (forward compatibility)
                    tracing::debug!("Unknown config key: {}", key);
                }
            }
        }

        Ok(config)
    }

    /// Apply environment overrides on top of the file values
    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(ENV_STARTUP_TIMEOUT) {
            match value.parse() {
                Ok(secs) => self.startup_timeout_secs = secs,
                Err(_) => {
                    tracing::warn!(
                        "Ignoring invalid {} value: {}",
                        ENV_STARTUP_TIMEOUT,
                        value
                    );
                }
            }
        }
    }

    /// Validate cross-field constraints
    fn validate(&self) -> Result<(), ConfigError> {
        if self.dns_servers.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "dns_servers".to_string(),
                message: "at least one trusted DNS server is required".to_string(),
            });
        }

        if self.health_check_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Parse a boolean config value
fn parse_bool(value: &str, line_num: usize) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::ParseError {
            line: line_num,
            message: format!("Expected a boolean, got: {}", value),
        }),
    }
}
