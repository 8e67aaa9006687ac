//! Killswitch firewall ruleset
//!
//! Applies and removes an all-or-nothing iptables ruleset: default-deny
//! on every chain, with exceptions only for loopback, the configured
//! local network, the tunnel endpoint's negotiation port, the tunnel
//! interface itself, and DNS to the trusted servers.
//!
//! The deny policies are set *before* the previous exception rules are
//! flushed. Flushing first would leave a window where the old (possibly
//! permissive) ruleset is gone and nothing blocks traffic yet.

use std::process::Command;

use crate::config::Config;
use crate::error::FirewallError;

/// Executes firewall rule commands.
///
/// Production uses [`SystemRunner`]; tests substitute a recording
/// implementation so the emitted batch can be inspected without root.
pub trait RuleRunner: Send + Sync {
    /// Run a single rule command, failing if it exits non-zero
    fn run(&self, program: &str, args: &[String]) -> Result<(), FirewallError>;
}

/// Runs rule commands against the real system firewall
pub struct SystemRunner;

impl RuleRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<(), FirewallError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| FirewallError::CommandFailed {
                reason: format!("{} could not be spawned: {}", program, e),
            })?;

        if !output.status.success() {
            return Err(FirewallError::ApplyFailed {
                rule: format!("{} {}", program, args.join(" ")),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Manages the killswitch ruleset as write-only, idempotent-apply state
pub struct FirewallManager {
    runner: Box<dyn RuleRunner>,
    egress_interface: Option<String>,
}

impl FirewallManager {
    /// Create a manager driving the system firewall
    pub fn new() -> Self {
        Self {
            runner: Box::new(SystemRunner),
            egress_interface: detect_egress_interface(),
        }
    }

    /// Create a manager with an explicit runner and egress interface
    pub fn with_runner(runner: Box<dyn RuleRunner>, egress_interface: Option<String>) -> Self {
        Self {
            runner,
            egress_interface,
        }
    }

    /// Arm the killswitch.
    ///
    /// Applies the full ruleset as one sequential batch; the first
    /// failing command aborts the rest and surfaces the error. With
    /// `tunnel_iface = None` the same default-deny ruleset is produced
    /// minus the tunnel exceptions, so a missing tunnel never downgrades
    /// protection.
    pub fn arm(&self, config: &Config, tunnel_iface: Option<&str>) -> Result<(), FirewallError> {
        let batch = self.build_arm_batch(config, tunnel_iface);

        for args in &batch {
            self.runner.run("iptables", args)?;
        }

        tracing::info!(
            tunnel_iface = tunnel_iface.unwrap_or("<none>"),
            rules = batch.len(),
            "Killswitch armed"
        );
        Ok(())
    }

    /// Disarm the killswitch: default-allow policies, all managed rules
    /// cleared. Safe to call when no ruleset was ever armed.
    pub fn disarm(&self) -> Result<(), FirewallError> {
        for args in Self::build_disarm_batch() {
            self.runner.run("iptables", &args)?;
        }

        tracing::info!("Killswitch disarmed");
        Ok(())
    }

    /// Build the arm batch in application order
    fn build_arm_batch(&self, config: &Config, tunnel_iface: Option<&str>) -> Vec<Vec<String>> {
        let mut batch: Vec<Vec<String>> = Vec::new();

        // Default-deny must land before the old exceptions are flushed
        batch.push(rule(&["-P", "INPUT", "DROP"]));
        batch.push(rule(&["-P", "OUTPUT", "DROP"]));
        batch.push(rule(&["-P", "FORWARD", "DROP"]));
        batch.push(rule(&["-F"]));

        // Loopback
        batch.push(rule(&["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"]));
        batch.push(rule(&["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]));

        // Replies to connections we initiated
        batch.push(rule(&[
            "-A", "INPUT", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT",
        ]));

        // Local network, when configured
        if let Some(net) = &config.allowed_local_net {
            let net = net.to_string();
            batch.push(rule(&["-A", "OUTPUT", "-d", &net, "-j", "ACCEPT"]));
            batch.push(rule(&["-A", "INPUT", "-s", &net, "-j", "ACCEPT"]));
        }

        // Tunnel negotiation on the physical egress interface
        let port = config.endpoint_port.to_string();
        match &self.egress_interface {
            Some(egress) => {
                batch.push(rule(&[
                    "-A", "OUTPUT", "-o", egress, "-p", "udp", "--dport", &port, "-j", "ACCEPT",
                ]));
            }
            None => {
                // No default route right now; still let negotiation out
                batch.push(rule(&[
                    "-A", "OUTPUT", "-p", "udp", "--dport", &port, "-j", "ACCEPT",
                ]));
            }
        }

        // Everything through the tunnel itself
        if let Some(iface) = tunnel_iface {
            batch.push(rule(&["-A", "OUTPUT", "-o", iface, "-j", "ACCEPT"]));
            batch.push(rule(&["-A", "INPUT", "-i", iface, "-j", "ACCEPT"]));
            batch.push(rule(&["-A", "FORWARD", "-i", iface, "-j", "ACCEPT"]));
            batch.push(rule(&["-A", "FORWARD", "-o", iface, "-j", "ACCEPT"]));
        }

        // DNS only to the trusted servers
        for server in &config.dns_servers {
            let server = server.to_string();
            batch.push(rule(&[
                "-A", "OUTPUT", "-d", &server, "-p", "udp", "--dport", "53", "-j", "ACCEPT",
            ]));
            batch.push(rule(&[
                "-A", "OUTPUT", "-d", &server, "-p", "tcp", "--dport", "53", "-j", "ACCEPT",
            ]));
        }

        batch
    }

    /// Build the disarm batch
    fn build_disarm_batch() -> Vec<Vec<String>> {
        vec![
            rule(&["-P", "INPUT", "ACCEPT"]),
            rule(&["-P", "OUTPUT", "ACCEPT"]),
            rule(&["-P", "FORWARD", "ACCEPT"]),
            rule(&["-F"]),
        ]
    }
}

impl Default for FirewallManager {
    fn default() -> Self {
        Self::new()
    }
}

fn rule(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Find the interface carrying the default route
///
/// Parses `ip route show default` output of the form
/// `default via 192.168.1.1 dev eth0 ...`.
fn detect_egress_interface() -> Option<String> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .ok()?;

    let output_str = String::from_utf8_lossy(&output.stdout);
    output_str
        .split_whitespace()
        .skip_while(|&s| s != "dev")
        .nth(1)
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records the batch instead of touching the system firewall
    struct RecordingRunner {
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl RuleRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<(), FirewallError> {
            self.commands
                .lock()
                .unwrap()
                .push(format!("{} {}", program, args.join(" ")));
            Ok(())
        }
    }

    /// Fails once a fixed number of commands have run
    struct FailingRunner {
        commands: Arc<Mutex<Vec<String>>>,
        fail_after: usize,
    }

    impl RuleRunner for FailingRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<(), FirewallError> {
            let mut commands = self.commands.lock().unwrap();
            if commands.len() >= self.fail_after {
                return Err(FirewallError::ApplyFailed {
                    rule: format!("{} {}", program, args.join(" ")),
                    reason: "simulated failure".to_string(),
                });
            }
            commands.push(format!("{} {}", program, args.join(" ")));
            Ok(())
        }
    }

    fn recording_manager() -> (FirewallManager, Arc<Mutex<Vec<String>>>) {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let manager = FirewallManager::with_runner(
            Box::new(RecordingRunner {
                commands: Arc::clone(&commands),
            }),
            Some("eth0".to_string()),
        );
        (manager, commands)
    }

    #[test]
    fn deny_policies_precede_flush() {
        let (manager, commands) = recording_manager();
        manager.arm(&Config::default(), Some("tun0")).unwrap();

        let commands = commands.lock().unwrap();
        let flush_pos = commands
            .iter()
            .position(|c| c == "iptables -F")
            .expect("flush present");
        for chain in ["INPUT", "OUTPUT", "FORWARD"] {
            let policy_pos = commands
                .iter()
                .position(|c| *c == format!("iptables -P {} DROP", chain))
                .expect("deny policy present");
            assert!(
                policy_pos < flush_pos,
                "{} policy applied after flush",
                chain
            );
        }
    }

    #[test]
    fn arm_allows_tunnel_and_trusted_dns_only() {
        let (manager, commands) = recording_manager();
        manager.arm(&Config::default(), Some("tun0")).unwrap();

        let commands = commands.lock().unwrap();
        assert!(commands
            .iter()
            .any(|c| c == "iptables -A OUTPUT -o tun0 -j ACCEPT"));
        assert!(commands
            .iter()
            .any(|c| c == "iptables -A OUTPUT -d 1.1.1.1 -p udp --dport 53 -j ACCEPT"));
        assert!(commands
            .iter()
            .any(|c| c == "iptables -A OUTPUT -d 1.1.1.1 -p tcp --dport 53 -j ACCEPT"));
        // Negotiation confined to the physical egress interface
        assert!(commands
            .iter()
            .any(|c| c == "iptables -A OUTPUT -o eth0 -p udp --dport 1194 -j ACCEPT"));
    }

    #[test]
    fn arm_without_tunnel_is_still_default_deny() {
        let (manager, commands) = recording_manager();
        manager.arm(&Config::default(), None).unwrap();

        let commands = commands.lock().unwrap();
        assert!(commands.iter().any(|c| c == "iptables -P OUTPUT DROP"));
        assert!(
            !commands.iter().any(|c| c.contains("tun")),
            "no tunnel exceptions without an interface"
        );
    }

    #[test]
    fn arm_includes_local_net_when_configured() {
        let (manager, commands) = recording_manager();
        let mut config = Config::default();
        config.allowed_local_net = Some("192.168.1.0/24".parse().unwrap());
        manager.arm(&config, Some("tun0")).unwrap();

        let commands = commands.lock().unwrap();
        assert!(commands
            .iter()
            .any(|c| c == "iptables -A OUTPUT -d 192.168.1.0/24 -j ACCEPT"));
    }

    #[test]
    fn disarm_converges_regardless_of_history() {
        let (manager, commands) = recording_manager();

        // Any call history: arm twice, disarm twice
        manager.arm(&Config::default(), Some("tun0")).unwrap();
        manager.arm(&Config::default(), None).unwrap();
        manager.disarm().unwrap();
        commands.lock().unwrap().clear();
        manager.disarm().unwrap();

        let commands = commands.lock().unwrap();
        assert_eq!(
            *commands,
            vec![
                "iptables -P INPUT ACCEPT",
                "iptables -P OUTPUT ACCEPT",
                "iptables -P FORWARD ACCEPT",
                "iptables -F",
            ]
        );
    }

    #[test]
    fn first_failure_aborts_remaining_batch() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let manager = FirewallManager::with_runner(
            Box::new(FailingRunner {
                commands: Arc::clone(&commands),
                fail_after: 5,
            }),
            Some("eth0".to_string()),
        );

        let result = manager.arm(&Config::default(), Some("tun0"));
        assert!(matches!(result, Err(FirewallError::ApplyFailed { .. })));
        assert_eq!(commands.lock().unwrap().len(), 5);
    }
}
