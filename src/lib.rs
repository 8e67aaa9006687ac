//! TunnelGuard - Leak-Proof VPN Connection Supervisor
//!
//! Supervises an external VPN tunnel client and guarantees that no
//! traffic or DNS query traverses the underlying network path once
//! protection is armed.
//!
//! # Features
//!
//! - Killswitch firewall ruleset (default-deny, tunnel-only exceptions)
//! - Resolver pinning with tamper-resistance and exact restoration
//! - Tunnel client process supervision with interface health checks
//! - Automatic reconnect with deny-all tightening during the gap
//! - Single-instance lock with stale-lock reclamation
//! - Atomically published status snapshots for external consumers
//!
//! # Usage
//!
//! ```no_run
//! use tokio::sync::watch;
//! use tunnelguard::{Config, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/tunnelguard/tunnelguard.conf")?;
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let mut supervisor = Supervisor::new(config, shutdown_rx);
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod lock;
pub mod status;
pub mod supervisor;
pub mod tunnel;

pub use config::Config;
pub use error::GuardError;
pub use status::{ConnectionState, StatusSnapshot};
pub use supervisor::Supervisor;
