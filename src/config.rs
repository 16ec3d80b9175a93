//! Configuration for the circuit pool.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the circuit pool.
///
/// Every operational tuning constant is adjustable; the defaults mirror a
/// three-instance pool racing against a target that blocks most Tor exits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Desired number of instances; the pool self-maintains toward this.
    pub target_size: usize,
    /// Path to the tor binary.
    pub tor_binary: PathBuf,
    /// Base torrc template; bridge and transport lines are inherited by
    /// every instance.
    pub torrc_template: Option<PathBuf>,
    /// Root directory for per-instance data directories and PID tracking.
    pub data_dir: PathBuf,
    /// Data directory of the long-lived reference instance, used to seed
    /// new instances' network-state caches. `None` disables acceleration.
    pub reference_data_dir: Option<PathBuf>,
    /// Whether the pool launches and supervises the reference instance
    /// itself. When false, something else must keep it running.
    pub manage_reference: bool,
    /// SOCKS port of the managed reference instance.
    pub reference_socks_port: u16,
    /// Control port of the managed reference instance.
    pub reference_control_port: u16,
    /// First SOCKS port; instance `i` listens on `base_socks_port + i`.
    pub base_socks_port: u16,
    /// First control port; instance `i` uses `base_control_port + i`.
    pub base_control_port: u16,
    /// Control-port password, empty for cookie-less auth.
    pub control_password: String,
    /// Interval between health monitor ticks.
    pub health_check_interval: Duration,
    /// Timeout for a single control-port liveness probe.
    pub probe_timeout: Duration,
    /// Bound on `Starting -> Healthy`; exceeded means `Failed`.
    pub bootstrap_timeout: Duration,
    /// A bootstrapping instance whose progress has not advanced for this
    /// long is treated as failed.
    pub stall_timeout: Duration,
    /// A healthy instance whose control port has been unreachable for this
    /// long is treated as failed.
    pub control_timeout: Duration,
    /// Consecutive probe misses before an instance is restarted.
    pub probe_miss_threshold: u32,
    /// Restart attempts before an instance is retired and replaced.
    pub max_restarts: u32,
    /// How long a blocked instance stays ineligible.
    pub cooldown_window: Duration,
    /// Race fan-out: number of instances probed concurrently per acquire.
    pub race_size: usize,
    /// Default deadline for `acquire` when the caller passes none.
    pub acquire_timeout: Duration,
    /// Interval between reference-snapshot refreshes.
    pub snapshot_refresh_interval: Duration,
    /// Maximum requests per second per instance (rate-limiter hook).
    pub max_requests_per_second: f64,
    /// URL the default SOCKS probe fetches through an instance.
    pub probe_url: String,
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// SOCKS port for the instance at `index`.
    pub fn socks_port(&self, index: usize) -> u16 {
        self.base_socks_port + index as u16
    }

    /// Control port for the instance at `index`.
    pub fn control_port(&self, index: usize) -> u16 {
        self.base_control_port + index as u16
    }
}

/// Builder for `PoolConfig`.
pub struct PoolConfigBuilder {
    target_size: Option<usize>,
    tor_binary: Option<PathBuf>,
    torrc_template: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    reference_data_dir: Option<PathBuf>,
    manage_reference: Option<bool>,
    reference_socks_port: Option<u16>,
    reference_control_port: Option<u16>,
    base_socks_port: Option<u16>,
    base_control_port: Option<u16>,
    control_password: Option<String>,
    health_check_interval: Option<Duration>,
    probe_timeout: Option<Duration>,
    bootstrap_timeout: Option<Duration>,
    stall_timeout: Option<Duration>,
    control_timeout: Option<Duration>,
    probe_miss_threshold: Option<u32>,
    max_restarts: Option<u32>,
    cooldown_window: Option<Duration>,
    race_size: Option<usize>,
    acquire_timeout: Option<Duration>,
    snapshot_refresh_interval: Option<Duration>,
    max_requests_per_second: Option<f64>,
    probe_url: Option<String>,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            target_size: None,
            tor_binary: None,
            torrc_template: None,
            data_dir: None,
            reference_data_dir: None,
            manage_reference: None,
            reference_socks_port: None,
            reference_control_port: None,
            base_socks_port: None,
            base_control_port: None,
            control_password: None,
            health_check_interval: None,
            probe_timeout: None,
            bootstrap_timeout: None,
            stall_timeout: None,
            control_timeout: None,
            probe_miss_threshold: None,
            max_restarts: None,
            cooldown_window: None,
            race_size: None,
            acquire_timeout: None,
            snapshot_refresh_interval: None,
            max_requests_per_second: None,
            probe_url: None,
        }
    }

    /// Set the desired instance count.
    pub fn target_size(mut self, n: usize) -> Self {
        self.target_size = Some(n);
        self
    }

    /// Set the tor binary path.
    pub fn tor_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.tor_binary = Some(path.into());
        self
    }

    /// Set the base torrc template path.
    pub fn torrc_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.torrc_template = Some(path.into());
        self
    }

    /// Set the pool data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// Set the reference instance data directory used for seeding.
    pub fn reference_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_data_dir = Some(path.into());
        self
    }

    /// Let the pool launch and supervise the reference instance itself.
    pub fn manage_reference(mut self, yes: bool) -> Self {
        self.manage_reference = Some(yes);
        self
    }

    /// Set the SOCKS port of the managed reference instance.
    pub fn reference_socks_port(mut self, port: u16) -> Self {
        self.reference_socks_port = Some(port);
        self
    }

    /// Set the control port of the managed reference instance.
    pub fn reference_control_port(mut self, port: u16) -> Self {
        self.reference_control_port = Some(port);
        self
    }

    /// Set the first SOCKS port of the pool range.
    pub fn base_socks_port(mut self, port: u16) -> Self {
        self.base_socks_port = Some(port);
        self
    }

    /// Set the first control port of the pool range.
    pub fn base_control_port(mut self, port: u16) -> Self {
        self.base_control_port = Some(port);
        self
    }

    /// Set the control-port password.
    pub fn control_password(mut self, pwd: impl Into<String>) -> Self {
        self.control_password = Some(pwd.into());
        self
    }

    /// Set the interval between health monitor ticks.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    /// Set the timeout for a single liveness probe.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Set the bootstrap deadline.
    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = Some(timeout);
        self
    }

    /// Set the bootstrap stall deadline.
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    /// Set the control unreachability deadline for healthy instances.
    pub fn control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = Some(timeout);
        self
    }

    /// Set how many consecutive probe misses trigger a restart.
    pub fn probe_miss_threshold(mut self, n: u32) -> Self {
        self.probe_miss_threshold = Some(n);
        self
    }

    /// Set how many restarts an instance gets before being replaced.
    pub fn max_restarts(mut self, n: u32) -> Self {
        self.max_restarts = Some(n);
        self
    }

    /// Set the block cooldown window.
    pub fn cooldown_window(mut self, window: Duration) -> Self {
        self.cooldown_window = Some(window);
        self
    }

    /// Set the race fan-out size.
    pub fn race_size(mut self, k: usize) -> Self {
        self.race_size = Some(k);
        self
    }

    /// Set the default acquire deadline.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set the reference-snapshot refresh interval.
    pub fn snapshot_refresh_interval(mut self, interval: Duration) -> Self {
        self.snapshot_refresh_interval = Some(interval);
        self
    }

    /// Set the maximum requests per second per instance.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Set the URL the default probe fetches through an instance.
    pub fn probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = Some(url.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        PoolConfig {
            target_size: self.target_size.unwrap_or(3),
            tor_binary: self.tor_binary.unwrap_or_else(|| PathBuf::from("tor")),
            torrc_template: self.torrc_template,
            data_dir: self
                .data_dir
                .unwrap_or_else(|| PathBuf::from("tor-data-pool")),
            reference_data_dir: self.reference_data_dir,
            manage_reference: self.manage_reference.unwrap_or(false),
            reference_socks_port: self.reference_socks_port.unwrap_or(9050),
            reference_control_port: self.reference_control_port.unwrap_or(9051),
            base_socks_port: self.base_socks_port.unwrap_or(9060),
            base_control_port: self.base_control_port.unwrap_or(9160),
            control_password: self.control_password.unwrap_or_default(),
            health_check_interval: self
                .health_check_interval
                .unwrap_or(Duration::from_secs(10)),
            probe_timeout: self.probe_timeout.unwrap_or(Duration::from_secs(5)),
            bootstrap_timeout: self
                .bootstrap_timeout
                .unwrap_or(Duration::from_secs(120)),
            stall_timeout: self.stall_timeout.unwrap_or(Duration::from_secs(90)),
            control_timeout: self.control_timeout.unwrap_or(Duration::from_secs(30)),
            probe_miss_threshold: self.probe_miss_threshold.unwrap_or(3),
            max_restarts: self.max_restarts.unwrap_or(3),
            cooldown_window: self.cooldown_window.unwrap_or(Duration::from_secs(300)),
            race_size: self.race_size.unwrap_or(3),
            acquire_timeout: self.acquire_timeout.unwrap_or(Duration::from_secs(30)),
            snapshot_refresh_interval: self
                .snapshot_refresh_interval
                .unwrap_or(Duration::from_secs(180)),
            max_requests_per_second: self.max_requests_per_second.unwrap_or(5.0),
            probe_url: self
                .probe_url
                .unwrap_or_else(|| "https://check.torproject.org/api/ip".to_string()),
        }
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
