//! Connection-protection state machine
//!
//! The orchestrator that owns the control loop: it drives the tunnel
//! client, the resolver guard, and the killswitch so that at every
//! observable instant the host is either fully open (tunnel up,
//! firewall armed, DNS pinned) or fully closed (all traffic blocked).
//!
//! Establishment order is deliberate: lock, tunnel, DNS, firewall last.
//! A failure partway through establishing must never strand a
//! default-deny firewall with no working tunnel behind it. Teardown
//! unwinds in reverse and runs every step even when an earlier one
//! failed, because a partial cleanup (restored DNS behind a still-armed
//! firewall) is strictly worse than a noisy complete one.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::config::Config;
use crate::dns::DnsGuard;
use crate::error::{DnsError, FirewallError, GuardError, LockError, TunnelError};
use crate::firewall::FirewallManager;
use crate::lock::InstanceLock;
use crate::status::{ConnectionState, StatusPublisher, StatusSnapshot};
use crate::tunnel::{TunnelHandle, TunnelSupervisor};

/// Tunnel lifecycle operations, as seen by the state machine
#[async_trait]
pub trait TunnelControl: Send {
    /// Start the tunnel client and wait for its interface
    async fn launch(&mut self) -> Result<TunnelHandle, TunnelError>;
    /// Whether the process and its interface are both still present
    fn is_alive(&mut self) -> bool;
    /// Stop the tunnel client (idempotent)
    async fn terminate(&mut self);
    /// Read-only view of the running tunnel, if any
    fn handle(&self) -> Option<TunnelHandle>;
    /// Address on the tunnel interface, for status reporting
    fn address(&self) -> Option<String>;
}

#[async_trait]
impl TunnelControl for TunnelSupervisor {
    async fn launch(&mut self) -> Result<TunnelHandle, TunnelError> {
        TunnelSupervisor::launch(self).await.map(|h| h.clone())
    }

    fn is_alive(&mut self) -> bool {
        TunnelSupervisor::is_alive(self)
    }

    async fn terminate(&mut self) {
        TunnelSupervisor::terminate(self).await;
    }

    fn handle(&self) -> Option<TunnelHandle> {
        TunnelSupervisor::handle(self).cloned()
    }

    fn address(&self) -> Option<String> {
        TunnelSupervisor::handle(self)
            .and_then(|h| crate::tunnel::interface_address(&h.interface))
    }
}

/// Killswitch operations, as seen by the state machine
pub trait FirewallControl: Send {
    /// Apply the full ruleset (None interface = deny-all, no tunnel exceptions)
    fn arm(&self, config: &Config, tunnel_iface: Option<&str>) -> Result<(), FirewallError>;
    /// Converge to default-allow with no managed rules
    fn disarm(&self) -> Result<(), FirewallError>;
}

impl FirewallControl for FirewallManager {
    fn arm(&self, config: &Config, tunnel_iface: Option<&str>) -> Result<(), FirewallError> {
        FirewallManager::arm(self, config, tunnel_iface)
    }

    fn disarm(&self) -> Result<(), FirewallError> {
        FirewallManager::disarm(self)
    }
}

/// Resolver operations, as seen by the state machine
pub trait DnsControl: Send {
    /// Pin the resolver to the trusted servers (backs up once)
    fn pin(&self, servers: &[IpAddr]) -> Result<(), DnsError>;
    /// Restore the original resolver content (no-op without backup)
    fn restore(&self) -> Result<(), DnsError>;
}

impl DnsControl for DnsGuard {
    fn pin(&self, servers: &[IpAddr]) -> Result<(), DnsError> {
        DnsGuard::pin(self, servers)
    }

    fn restore(&self) -> Result<(), DnsError> {
        DnsGuard::restore(self)
    }
}

/// Outcome of a cancellable establish step
enum StepOutcome {
    Completed,
    ShutdownRequested,
}

/// The connection-protection supervisor.
///
/// Runs a single cooperative control loop; no free-running workers
/// mutate firewall/DNS/tunnel state concurrently. The only external
/// concurrency concern (other supervisor processes) is handled by the
/// instance lock.
pub struct Supervisor<T, F, D>
where
    T: TunnelControl,
    F: FirewallControl,
    D: DnsControl,
{
    config: Config,
    tunnel: T,
    firewall: F,
    dns: D,
    lock: InstanceLock,
    publisher: StatusPublisher,
    shutdown: watch::Receiver<bool>,
    state: ConnectionState,
    events: broadcast::Sender<ConnectionState>,
    readiness_sent: bool,
}

impl Supervisor<TunnelSupervisor, FirewallManager, DnsGuard> {
    /// Production wiring: real tunnel client, iptables, resolv.conf
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> Self {
        let tunnel = TunnelSupervisor::new(&config);
        Self::with_parts(
            config,
            tunnel,
            FirewallManager::new(),
            DnsGuard::new(),
            InstanceLock::new(),
            StatusPublisher::new(),
            shutdown,
        )
    }
}

impl<T, F, D> Supervisor<T, F, D>
where
    T: TunnelControl,
    F: FirewallControl,
    D: DnsControl,
{
    /// Assemble a supervisor from explicit parts
    pub fn with_parts(
        config: Config,
        tunnel: T,
        firewall: F,
        dns: D,
        lock: InstanceLock,
        publisher: StatusPublisher,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            tunnel,
            firewall,
            dns,
            lock,
            publisher,
            shutdown,
            state: ConnectionState::Idle,
            events,
            readiness_sent: false,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    /// Run the supervisor until shutdown or a fatal error.
    ///
    /// On return all three effects are unwound: firewall disarmed, DNS
    /// restored, tunnel terminated, lock released.
    pub async fn run(&mut self) -> Result<(), GuardError> {
        // Fail fast before any side effect. On AlreadyRunning the other
        // instance owns the firewall, resolver, and published status,
        // so neither cleanup nor a status publish may run.
        if let Err(e) = self.lock.acquire() {
            self.state = ConnectionState::Stopped;
            return Err(e.into());
        }

        self.set_state(ConnectionState::Establishing);

        match self.establish().await {
            Ok(StepOutcome::Completed) => {
                self.set_state(ConnectionState::Protected);
                self.notify_ready();
            }
            Ok(StepOutcome::ShutdownRequested) => {
                self.shutdown_sequence().await;
                return Ok(());
            }
            Err(e) => {
                tracing::error!("Failed to establish protection: {}", e);
                self.shutdown_sequence().await;
                return Err(e);
            }
        }

        self.monitor().await;
        self.shutdown_sequence().await;
        Ok(())
    }

    /// One establish attempt: tunnel up, DNS pinned, firewall armed.
    ///
    /// The firewall is armed last so that a failure on an earlier step
    /// never leaves a default-deny ruleset stranded with no working
    /// tunnel behind it.
    async fn establish(&mut self) -> Result<StepOutcome, GuardError> {
        let mut shutdown = self.shutdown.clone();
        let launched = tokio::select! {
            result = self.tunnel.launch() => Some(result),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };

        let handle = match launched {
            Some(result) => result?,
            None => return Ok(StepOutcome::ShutdownRequested),
        };
        tracing::info!(interface = %handle.interface, pid = handle.pid, "Tunnel established");

        self.dns.pin(&self.config.dns_servers)?;

        if self.config.killswitch_enabled {
            if !self.lock.still_held() {
                return Err(LockError::Io {
                    path: "instance lock".to_string(),
                    reason: "lock lost before arming firewall".to_string(),
                }
                .into());
            }
            self.firewall.arm(&self.config, Some(&handle.interface))?;
        }

        Ok(StepOutcome::Completed)
    }

    /// Health-check loop; returns when shutdown is requested or the
    /// reconnect policy gives up.
    async fn monitor(&mut self) {
        let health_interval = Duration::from_secs(self.config.health_check_secs);
        let reconnect_delay = Duration::from_secs(self.config.reconnect_delay_secs);

        loop {
            if self.wait_or_shutdown(health_interval).await {
                return;
            }

            if self.tunnel.is_alive() {
                // Re-publish at least once per health-check cycle
                self.publish_status();
                continue;
            }

            tracing::warn!("Tunnel lost while protected");
            self.set_state(ConnectionState::Degraded);

            // The dead tunnel's stale allow-rule is a leak path. Tighten
            // to deny-all before anything else, including the reconnect
            // wait.
            self.rearm_deny_all();
            self.tunnel.terminate().await;

            if !self.config.auto_reconnect {
                tracing::info!("Auto-reconnect disabled, stopping");
                return;
            }

            let mut attempts: u32 = 0;
            loop {
                if self.wait_or_shutdown(reconnect_delay).await {
                    return;
                }

                attempts += 1;
                self.set_state(ConnectionState::Reconnecting);
                tracing::info!(attempt = attempts, "Attempting to re-establish the tunnel");

                match self.establish().await {
                    Ok(StepOutcome::Completed) => {
                        self.set_state(ConnectionState::Protected);
                        break;
                    }
                    Ok(StepOutcome::ShutdownRequested) => return,
                    Err(e) => {
                        tracing::warn!("Reconnect attempt {} failed: {}", attempts, e);
                        self.set_state(ConnectionState::Degraded);
                        self.rearm_deny_all();
                        self.tunnel.terminate().await;

                        let max = self.config.max_reconnect_attempts;
                        if max > 0 && attempts >= max {
                            tracing::error!("Giving up after {} reconnect attempts", attempts);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Unwind in reverse of establishment. Every step runs even if an
    /// earlier one failed; errors are logged, never re-raised.
    async fn shutdown_sequence(&mut self) {
        self.set_state(ConnectionState::Stopping);

        if self.config.killswitch_enabled {
            if self.lock.still_held() {
                if let Err(e) = self.firewall.disarm() {
                    tracing::error!("Failed to disarm firewall: {}", e);
                }
            } else {
                tracing::warn!("Lock no longer held, leaving the firewall untouched");
            }
        }

        if let Err(e) = self.dns.restore() {
            tracing::error!("Failed to restore resolver config: {}", e);
        }

        self.tunnel.terminate().await;
        self.lock.release();

        self.set_state(ConnectionState::Stopped);
    }

    /// Re-apply the deny-all ruleset with no tunnel exceptions
    fn rearm_deny_all(&mut self) {
        if !self.config.killswitch_enabled {
            return;
        }
        if !self.lock.still_held() {
            tracing::warn!("Lock no longer held, skipping firewall re-arm");
            return;
        }
        if let Err(e) = self.firewall.arm(&self.config, None) {
            tracing::error!("Failed to re-arm deny-all firewall: {}", e);
        }
    }

    /// Transition and publish; every transition is observable
    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::info!(from = %self.state, to = %state, "State transition");
        }
        self.state = state;
        let _ = self.events.send(state);
        self.publish_status();
    }

    /// Publish the current snapshot for external consumers
    fn publish_status(&self) {
        let mut snapshot = StatusSnapshot::new(
            self.state,
            self.config.dns_servers.iter().map(|s| s.to_string()).collect(),
        );

        if let Some(handle) = self.tunnel.handle() {
            snapshot.tunnel_uptime_secs = Some(handle.uptime_secs());
            snapshot.tunnel_address = self.tunnel.address();
        }

        self.publisher.publish(&snapshot);
    }

    /// Sleep for `duration`, or return early on shutdown.
    ///
    /// Returns true when shutdown was requested.
    async fn wait_or_shutdown(&mut self, duration: Duration) -> bool {
        if *self.shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = wait_for_shutdown(&mut self.shutdown) => true,
        }
    }

    /// Signal readiness to the process manager, exactly once per run
    fn notify_ready(&mut self) {
        if self.readiness_sent {
            return;
        }
        self.readiness_sent = true;

        #[cfg(unix)]
        if let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") {
            match std::os::unix::net::UnixDatagram::unbound() {
                Ok(socket) => {
                    if let Err(e) = socket.send_to(b"READY=1", &socket_path) {
                        tracing::debug!("Readiness notification failed: {}", e);
                    } else {
                        tracing::info!("Signaled readiness to the process manager");
                    }
                }
                Err(e) => tracing::debug!("Cannot create notify socket: {}", e),
            }
        }

        tracing::info!("Protection established");
    }
}

/// Resolve once the shutdown flag becomes true
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped; shutdown can never arrive this way
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockTunnelState {
        alive: bool,
        handle: Option<TunnelHandle>,
        launch_failures: VecDeque<TunnelError>,
        launches: u32,
        terminates: u32,
    }

    #[derive(Clone)]
    struct MockTunnel {
        state: Arc<Mutex<MockTunnelState>>,
    }

    impl MockTunnel {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockTunnelState::default())),
            }
        }

        fn drop_tunnel(&self) {
            self.state.lock().unwrap().alive = false;
        }

        fn fail_next_launches(&self, count: usize) {
            let mut state = self.state.lock().unwrap();
            for _ in 0..count {
                state.launch_failures.push_back(TunnelError::Timeout { seconds: 1 });
            }
        }

        fn launches(&self) -> u32 {
            self.state.lock().unwrap().launches
        }

        fn terminates(&self) -> u32 {
            self.state.lock().unwrap().terminates
        }
    }

    #[async_trait]
    impl TunnelControl for MockTunnel {
        async fn launch(&mut self) -> Result<TunnelHandle, TunnelError> {
            let mut state = self.state.lock().unwrap();
            state.launches += 1;
            if let Some(err) = state.launch_failures.pop_front() {
                return Err(err);
            }
            let handle = TunnelHandle {
                pid: 4242,
                interface: "tun0".to_string(),
                started_at: Instant::now(),
            };
            state.alive = true;
            state.handle = Some(handle.clone());
            Ok(handle)
        }

        fn is_alive(&mut self) -> bool {
            self.state.lock().unwrap().alive
        }

        async fn terminate(&mut self) {
            let mut state = self.state.lock().unwrap();
            state.terminates += 1;
            state.alive = false;
            state.handle = None;
        }

        fn handle(&self) -> Option<TunnelHandle> {
            self.state.lock().unwrap().handle.clone()
        }

        fn address(&self) -> Option<String> {
            self.state
                .lock()
                .unwrap()
                .handle
                .as_ref()
                .map(|_| "10.8.0.2".to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum FwCall {
        Arm(Option<String>),
        Disarm,
    }

    #[derive(Clone)]
    struct MockFirewall {
        calls: Arc<Mutex<Vec<FwCall>>>,
        fail_arm: Arc<Mutex<bool>>,
    }

    impl MockFirewall {
        fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_arm: Arc::new(Mutex::new(false)),
            }
        }

        fn set_fail_arm(&self, fail: bool) {
            *self.fail_arm.lock().unwrap() = fail;
        }

        fn calls(&self) -> Vec<FwCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FirewallControl for MockFirewall {
        fn arm(&self, _config: &Config, tunnel_iface: Option<&str>) -> Result<(), FirewallError> {
            if *self.fail_arm.lock().unwrap() {
                return Err(FirewallError::ApplyFailed {
                    rule: "iptables -P OUTPUT DROP".to_string(),
                    reason: "simulated".to_string(),
                });
            }
            self.calls
                .lock()
                .unwrap()
                .push(FwCall::Arm(tunnel_iface.map(|s| s.to_string())));
            Ok(())
        }

        fn disarm(&self) -> Result<(), FirewallError> {
            self.calls.lock().unwrap().push(FwCall::Disarm);
            Ok(())
        }
    }

    #[derive(Clone)]
    struct MockDns {
        pinned: Arc<Mutex<bool>>,
        pins: Arc<Mutex<u32>>,
        restores: Arc<Mutex<u32>>,
    }

    impl MockDns {
        fn new() -> Self {
            Self {
                pinned: Arc::new(Mutex::new(false)),
                pins: Arc::new(Mutex::new(0)),
                restores: Arc::new(Mutex::new(0)),
            }
        }

        fn is_pinned(&self) -> bool {
            *self.pinned.lock().unwrap()
        }

        fn restores(&self) -> u32 {
            *self.restores.lock().unwrap()
        }
    }

    impl DnsControl for MockDns {
        fn pin(&self, _servers: &[IpAddr]) -> Result<(), DnsError> {
            *self.pinned.lock().unwrap() = true;
            *self.pins.lock().unwrap() += 1;
            Ok(())
        }

        fn restore(&self) -> Result<(), DnsError> {
            *self.pinned.lock().unwrap() = false;
            *self.restores.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Harness {
        tunnel: MockTunnel,
        firewall: MockFirewall,
        dns: MockDns,
        shutdown_tx: watch::Sender<bool>,
        events: broadcast::Receiver<ConnectionState>,
        lock_path: std::path::PathBuf,
        _dir: TempDir,
        task: tokio::task::JoinHandle<Result<(), GuardError>>,
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.health_check_secs = 1;
        config.reconnect_delay_secs = 5;
        config
    }

    fn spawn_supervisor(config: Config) -> Harness {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("guard.pid");
        let status_path = dir.path().join("status.json");

        let tunnel = MockTunnel::new();
        let firewall = MockFirewall::new();
        let dns = MockDns::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut supervisor = Supervisor::with_parts(
            config,
            tunnel.clone(),
            firewall.clone(),
            dns.clone(),
            InstanceLock::at(&lock_path),
            StatusPublisher::at(&status_path),
            shutdown_rx,
        );
        let events = supervisor.subscribe();

        let task = tokio::spawn(async move { supervisor.run().await });

        Harness {
            tunnel,
            firewall,
            dns,
            shutdown_tx,
            events,
            lock_path,
            _dir: dir,
            task,
        }
    }

    async fn wait_for_state(
        events: &mut broadcast::Receiver<ConnectionState>,
        target: ConnectionState,
    ) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        loop {
            let state = tokio::time::timeout(Duration::from_secs(600), events.recv())
                .await
                .expect("timed out waiting for state")
                .expect("event channel closed");
            seen.push(state);
            if state == target {
                return seen;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loss_recovery_sequence_and_rearm() {
        let mut harness = spawn_supervisor(test_config());

        wait_for_state(&mut harness.events, ConnectionState::Protected).await;
        let loss_detected_at = tokio::time::Instant::now();
        harness.tunnel.drop_tunnel();

        let seen = wait_for_state(&mut harness.events, ConnectionState::Protected).await;
        let recovered_at = tokio::time::Instant::now();

        // Protected -> Degraded -> Reconnecting -> Protected
        assert_eq!(
            seen,
            vec![
                ConnectionState::Degraded,
                ConnectionState::Reconnecting,
                ConnectionState::Protected,
            ]
        );

        // Reconnect waited out the configured delay
        assert!(recovered_at.duration_since(loss_detected_at) >= Duration::from_secs(5));

        // The firewall was tightened to deny-all before the reconnect,
        // and never disarmed during the gap
        let calls = harness.firewall.calls();
        assert_eq!(
            calls,
            vec![
                FwCall::Arm(Some("tun0".to_string())),
                FwCall::Arm(None),
                FwCall::Arm(Some("tun0".to_string())),
            ]
        );

        harness.shutdown_tx.send(true).unwrap();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_reconnect_wait_unwinds_everything() {
        let mut harness = spawn_supervisor(test_config());

        wait_for_state(&mut harness.events, ConnectionState::Protected).await;

        // Every relaunch fails, so the machine cycles through Degraded
        harness.tunnel.fail_next_launches(1000);
        harness.tunnel.drop_tunnel();
        wait_for_state(&mut harness.events, ConnectionState::Reconnecting).await;
        wait_for_state(&mut harness.events, ConnectionState::Degraded).await;

        // Signal arrives somewhere inside the reconnect wait
        harness.shutdown_tx.send(true).unwrap();
        let seen = wait_for_state(&mut harness.events, ConnectionState::Stopped).await;
        assert!(seen.contains(&ConnectionState::Stopping));

        harness.task.await.unwrap().unwrap();
        assert!(!harness.dns.is_pinned(), "DNS must be restored");
        assert_eq!(harness.firewall.calls().last(), Some(&FwCall::Disarm));
        assert!(!harness.lock_path.exists(), "lock must be released");
    }

    #[tokio::test(start_paused = true)]
    async fn initial_establish_failure_stops_with_full_cleanup() {
        let mut harness = spawn_failing_initial();
        let seen = wait_for_state(&mut harness.events, ConnectionState::Stopped).await;
        assert!(seen.contains(&ConnectionState::Stopping));
        assert!(!seen.contains(&ConnectionState::Protected));

        let result = harness.task.await.unwrap();
        assert!(matches!(result, Err(GuardError::Tunnel(_))));
        assert_eq!(harness.tunnel.launches(), 1);
        assert!(harness.dns.restores() > 0, "cleanup restores DNS");
        assert!(!harness.lock_path.exists(), "lock released after failure");
    }

    /// A harness whose first (and only) launch fails before run() starts
    fn spawn_failing_initial() -> Harness {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("guard.pid");

        let tunnel = MockTunnel::new();
        tunnel.fail_next_launches(1);
        let firewall = MockFirewall::new();
        let dns = MockDns::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut supervisor = Supervisor::with_parts(
            test_config(),
            tunnel.clone(),
            firewall.clone(),
            dns.clone(),
            InstanceLock::at(&lock_path),
            StatusPublisher::at(dir.path().join("status.json")),
            shutdown_rx,
        );
        let events = supervisor.subscribe();
        let task = tokio::spawn(async move { supervisor.run().await });

        Harness {
            tunnel,
            firewall,
            dns,
            shutdown_tx,
            events,
            lock_path,
            _dir: dir,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn firewall_failure_never_reaches_protected() {
        let dir = TempDir::new().unwrap();
        let tunnel = MockTunnel::new();
        let firewall = MockFirewall::new();
        firewall.set_fail_arm(true);
        let dns = MockDns::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut supervisor = Supervisor::with_parts(
            test_config(),
            tunnel.clone(),
            firewall,
            dns,
            InstanceLock::at(dir.path().join("guard.pid")),
            StatusPublisher::at(dir.path().join("status.json")),
            shutdown_rx,
        );
        let mut events = supervisor.subscribe();

        let task = tokio::spawn(async move { supervisor.run().await });
        let seen = wait_for_state(&mut events, ConnectionState::Stopped).await;

        assert!(!seen.contains(&ConnectionState::Protected));
        let result = task.await.unwrap();
        assert!(matches!(result, Err(GuardError::Firewall(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_bounded_when_configured() {
        let mut config = test_config();
        config.max_reconnect_attempts = 2;
        let mut harness = spawn_supervisor(config);

        wait_for_state(&mut harness.events, ConnectionState::Protected).await;
        harness.tunnel.fail_next_launches(1000);
        harness.tunnel.drop_tunnel();

        wait_for_state(&mut harness.events, ConnectionState::Stopped).await;
        harness.task.await.unwrap().unwrap();

        // Initial launch plus exactly two bounded reconnect attempts
        assert_eq!(harness.tunnel.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_with_reconnect_disabled_stops_cleanly() {
        let mut config = test_config();
        config.auto_reconnect = false;
        let mut harness = spawn_supervisor(config);

        wait_for_state(&mut harness.events, ConnectionState::Protected).await;
        harness.tunnel.drop_tunnel();

        let seen = wait_for_state(&mut harness.events, ConnectionState::Stopped).await;
        assert_eq!(
            seen,
            vec![
                ConnectionState::Degraded,
                ConnectionState::Stopping,
                ConnectionState::Stopped,
            ]
        );

        harness.task.await.unwrap().unwrap();
        assert_eq!(harness.tunnel.launches(), 1);
        assert!(harness.tunnel.terminates() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_instance_is_rejected_without_touching_effects() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("guard.pid");

        // A live holder: this test process itself
        let mut holder = InstanceLock::at(&lock_path);
        holder.acquire().unwrap();

        let tunnel = MockTunnel::new();
        let firewall = MockFirewall::new();
        let dns = MockDns::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let status_path = dir.path().join("status.json");
        let mut supervisor = Supervisor::with_parts(
            test_config(),
            tunnel.clone(),
            firewall.clone(),
            dns.clone(),
            InstanceLock::at(&lock_path),
            StatusPublisher::at(&status_path),
            shutdown_rx,
        );

        let result = supervisor.run().await;
        assert!(matches!(
            result,
            Err(GuardError::Lock(LockError::AlreadyRunning { .. }))
        ));

        // The other instance's firewall, resolver, and published status
        // were not touched
        assert!(firewall.calls().is_empty());
        assert_eq!(dns.restores(), 0);
        assert_eq!(tunnel.launches(), 0);
        assert!(lock_path.exists(), "holder's lock file must survive");
        assert!(!status_path.exists(), "loser must not publish status");
    }
}
