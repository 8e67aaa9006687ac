//! TunnelGuard CLI - Leak-Proof VPN Connection Supervisor
//!
//! Thin control surface over the supervisor: `start` runs the
//! protection state machine in the foreground, `stop` signals the
//! running instance, `status` reads the last published snapshot, and
//! `restart` chains the two.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tunnelguard::config::DEFAULT_CONFIG_PATH;
use tunnelguard::error::DependencyError;
use tunnelguard::lock::{self, DEFAULT_LOCK_PATH};
use tunnelguard::status::{self, DEFAULT_STATUS_PATH};
use tunnelguard::{Config, GuardError, Supervisor};

/// How long `stop` waits for the running instance to unwind
const STOP_GRACE: Duration = Duration::from_secs(20);

/// TunnelGuard - VPN connection supervisor with killswitch
#[derive(Parser, Debug)]
#[command(name = "tunnelguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the supervisor config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Start the supervisor in the foreground
    Start,
    /// Stop the running supervisor instance
    Stop,
    /// Stop the running instance, then start a new one
    Restart,
    /// Show the last published status snapshot
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), GuardError> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        CliCommand::Start => run_start(&config_path).await,
        CliCommand::Stop => run_stop().await,
        CliCommand::Restart => {
            run_stop().await?;
            run_start(&config_path).await
        }
        CliCommand::Status => run_status(),
    }
}

/// Load config, verify external tools, run the supervisor to completion
async fn run_start(config_path: &PathBuf) -> Result<(), GuardError> {
    let config = Config::load(config_path)?;
    check_dependencies(&config)?;
    check_privileges();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    tracing::info!("TunnelGuard supervisor starting...");
    let mut supervisor = Supervisor::new(config, shutdown_rx);
    supervisor.run().await
}

/// Signal the running instance and wait for it to unwind completely
async fn run_stop() -> Result<(), GuardError> {
    let Some(pid) = lock::live_holder(DEFAULT_LOCK_PATH) else {
        println!("No running supervisor instance found.");
        return Ok(());
    };

    tracing::info!(pid, "Stopping the running supervisor");
    send_sigterm(pid);

    // The unwind includes firewall disarm, DNS restore, and tunnel
    // termination, so give it a real grace period
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if lock::live_holder(DEFAULT_LOCK_PATH).is_none() {
            println!("Supervisor stopped.");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Err(GuardError::System(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("supervisor (pid {}) did not stop within {:?}", pid, STOP_GRACE),
    )))
}

/// Print the last published snapshot without touching live state
fn run_status() -> Result<(), GuardError> {
    match status::read_snapshot(DEFAULT_STATUS_PATH) {
        Some(snapshot) => {
            println!("State:   {}", snapshot.state);
            if let Some(addr) = &snapshot.tunnel_address {
                println!("Address: {}", addr);
            }
            if let Some(uptime) = snapshot.tunnel_uptime_secs {
                println!("Uptime:  {}s", uptime);
            }
            println!("DNS:     {}", snapshot.dns_servers.join(", "));
            println!("Updated: {}", snapshot.timestamp);
            Ok(())
        }
        None => {
            println!("No status published. Is the supervisor running?");
            Ok(())
        }
    }
}

/// Verify required external tools before any protection work starts
fn check_dependencies(config: &Config) -> Result<(), GuardError> {
    let mut tools = vec![config.tunnel_client.as_str(), "ip"];
    if config.killswitch_enabled {
        tools.push("iptables");
    }

    for tool in tools {
        if !command_exists(tool) {
            return Err(DependencyError::Missing {
                tool: tool.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Firewall and resolver mutations need root; warn early instead of
/// failing on the first iptables call
fn check_privileges() {
    #[cfg(unix)]
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("Running without root. Firewall and DNS changes may fail.");
        tracing::warn!("Run with sudo: sudo tunnelguard start");
    }
}

/// Check if a command exists and is executable
fn command_exists(command: &str) -> bool {
    std::process::Command::new("which")
        .arg(command)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Funnel Ctrl+C and SIGTERM into the shutdown channel.
///
/// The supervisor's unwind runs to completion before the process
/// exits; the signal only schedules it.
fn spawn_signal_handler(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("\nReceived Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("\nReceived SIGTERM, shutting down...");
            }
        }

        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
