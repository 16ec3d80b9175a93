//! Circuit instance representation and its lifecycle state machine.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;

/// Direct (non-keyed) rate limiter shared per instance.
pub type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Pool-local identifier of a circuit instance. Never reused within one
/// pool, even when an instance is retired and its slot refilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit-{}", self.0)
    }
}

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Render as a SOCKS5 proxy URL.
    pub fn socks_url(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }

    /// Render as a plain `host:port` address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Lifecycle state of a circuit instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Subprocess spawned, control port not yet answering.
    Starting,
    /// Control port answering, bootstrap below 100%.
    Bootstrapping,
    /// Bootstrapped and answering probes; eligible for allocation.
    Healthy,
    /// Blocked by the target; waiting out the cooldown window with a
    /// rotated identity.
    CoolingDown,
    /// Crashed, stalled, or past the probe-miss threshold; waiting for the
    /// supervisor to restart it.
    Failed,
    /// Retired. Terminal.
    Stopped,
}

impl InstanceState {
    /// Whether a transition from `self` to `next` is legal.
    ///
    /// The graph is monotonic along
    /// `Starting -> Bootstrapping -> Healthy -> Stopped` except for the
    /// `Healthy <-> CoolingDown` cycle and the `Failed -> Starting` restart
    /// edge.
    pub fn can_move_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Starting, Bootstrapping)
                | (Starting, Failed)
                | (Bootstrapping, Healthy)
                | (Bootstrapping, Failed)
                | (Healthy, CoolingDown)
                | (Healthy, Failed)
                | (CoolingDown, Healthy)
                | (CoolingDown, Failed)
                | (Failed, Starting)
                | (Starting, Stopped)
                | (Bootstrapping, Stopped)
                | (Healthy, Stopped)
                | (CoolingDown, Stopped)
                | (Failed, Stopped)
        )
    }
}

/// Outcome of using a circuit, reported by the caller after each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request went through.
    Success,
    /// The target actively rejected this identity (content-level block, not
    /// a network error). Triggers cooldown and rotation.
    Blocked,
    /// Network-level failure. Counted toward the restart threshold.
    Error,
}

/// Terminal state of one racing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Won,
    Lost,
    Error,
    Timeout,
}

/// One anonymizing subprocess and its proxy endpoint.
#[derive(Debug, Clone)]
pub struct CircuitInstance {
    /// Stable pool-local identifier.
    pub id: InstanceId,
    /// Slot index; drives deterministic port allocation, survives
    /// retire-and-replace.
    pub index: usize,
    /// SOCKS endpoint exposed to callers.
    pub proxy_endpoint: Endpoint,
    /// Control endpoint for lifecycle and identity commands.
    pub control_endpoint: Endpoint,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Probe misses since the last success.
    pub consecutive_failures: u32,
    /// Ineligible for allocation while `now < cooldown_until`.
    pub cooldown_until: Option<Instant>,
    /// Incremented on every identity rotation; handles from an older
    /// generation are stale.
    pub circuit_generation: u64,
    /// A rotation was issued but not yet confirmed over the control port.
    pub rotation_pending: bool,
    /// Last successful liveness probe.
    pub last_health_check: Option<Instant>,
    /// Bootstrap progress, 0..=100.
    pub bootstrap_pct: u8,
    /// Last time bootstrap progress advanced.
    pub last_progress_at: Instant,
    /// Last time the control port answered.
    pub last_control_ok: Instant,
    /// Restarts consumed by this instance.
    pub restart_count: u32,
    /// Successful verification probes.
    pub probe_successes: u64,
    /// Failed verification probes.
    pub probe_failures: u64,
    /// Duration of the last successful probe, seconds.
    pub last_probe_secs: Option<f64>,
    /// When the current subprocess was spawned.
    pub started_at: Instant,
    /// Per-instance rate limiter, awaited before each raced probe.
    pub limiter: Arc<DirectLimiter>,
    /// Private data directory of the subprocess.
    pub data_dir: PathBuf,
}

impl CircuitInstance {
    pub fn new(
        id: InstanceId,
        index: usize,
        socks_port: u16,
        control_port: u16,
        data_dir: PathBuf,
        max_rps: f64,
    ) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(max_rps.ceil() as u32)
                .unwrap_or_else(|| NonZeroU32::new(1).unwrap()),
        );
        let now = Instant::now();
        Self {
            id,
            index,
            proxy_endpoint: Endpoint::local(socks_port),
            control_endpoint: Endpoint::local(control_port),
            state: InstanceState::Starting,
            consecutive_failures: 0,
            cooldown_until: None,
            circuit_generation: 0,
            rotation_pending: false,
            last_health_check: None,
            bootstrap_pct: 0,
            last_progress_at: now,
            last_control_ok: now,
            restart_count: 0,
            probe_successes: 0,
            probe_failures: 0,
            last_probe_secs: None,
            started_at: now,
            limiter: Arc::new(RateLimiter::direct(quota)),
            data_dir,
        }
    }

    /// Apply a state transition, returning whether it was legal. Illegal
    /// transitions are dropped unchanged; callers log them.
    pub fn transition(&mut self, next: InstanceState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_move_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    /// Whether this instance can participate in a race right now.
    pub fn is_eligible(&self, now: Instant) -> bool {
        if self.state != InstanceState::Healthy {
            return false;
        }
        match self.cooldown_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// Whether the cooldown window has elapsed and the identity rotation
    /// confirmed, so the instance may be released back to `Healthy`.
    pub fn cooldown_expired(&self, now: Instant) -> bool {
        self.state == InstanceState::CoolingDown
            && !self.rotation_pending
            && self.cooldown_until.is_some_and(|until| now >= until)
    }

    /// Fraction of verification probes that succeeded.
    pub fn probe_success_rate(&self) -> f64 {
        let total = self.probe_successes + self.probe_failures;
        if total == 0 {
            return 0.0;
        }
        self.probe_successes as f64 / total as f64
    }

    /// Reset bookkeeping after a (re)spawn.
    pub fn mark_respawned(&mut self) {
        let now = Instant::now();
        self.state = InstanceState::Starting;
        self.bootstrap_pct = 0;
        self.last_progress_at = now;
        self.last_control_ok = now;
        self.started_at = now;
        // consecutive_failures is cleared only by a later successful probe,
        // so a crash loop cannot masquerade as recovered.
    }
}

/// Handle to an acquired circuit, returned by `acquire`.
///
/// `generation` pins the identity the caller raced against; if the instance
/// has rotated since, the handle is stale and its outcome reports are
/// applied only where still meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitHandle {
    pub instance_id: InstanceId,
    pub proxy_endpoint: Endpoint,
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inst() -> CircuitInstance {
        CircuitInstance::new(
            InstanceId(1),
            0,
            9060,
            9160,
            PathBuf::from("/tmp/instance-0"),
            5.0,
        )
    }

    #[test]
    fn lifecycle_is_monotonic_except_cooldown_cycle() {
        use InstanceState::*;
        assert!(Starting.can_move_to(Bootstrapping));
        assert!(Bootstrapping.can_move_to(Healthy));
        assert!(Healthy.can_move_to(CoolingDown));
        assert!(CoolingDown.can_move_to(Healthy));
        assert!(Failed.can_move_to(Starting));

        assert!(!Healthy.can_move_to(Bootstrapping));
        assert!(!Healthy.can_move_to(Starting));
        assert!(!CoolingDown.can_move_to(Bootstrapping));
        assert!(!Stopped.can_move_to(Starting));
        assert!(!Stopped.can_move_to(Healthy));
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let mut i = inst();
        assert!(i.transition(InstanceState::Bootstrapping));
        assert!(!i.transition(InstanceState::CoolingDown));
        assert_eq!(i.state, InstanceState::Bootstrapping);
        assert!(i.transition(InstanceState::Healthy));
        assert!(i.transition(InstanceState::Healthy)); // self-loop is a no-op
    }

    #[test]
    fn cooling_instance_is_never_eligible() {
        let mut i = inst();
        i.state = InstanceState::Healthy;
        let now = Instant::now();
        assert!(i.is_eligible(now));

        i.state = InstanceState::CoolingDown;
        i.cooldown_until = Some(now + Duration::from_secs(300));
        assert!(!i.is_eligible(now));
        // Even past the window, CoolingDown itself blocks eligibility until
        // the health monitor releases it.
        assert!(!i.is_eligible(now + Duration::from_secs(301)));
    }

    #[test]
    fn cooldown_release_requires_rotation_confirmation() {
        let mut i = inst();
        let now = Instant::now();
        i.state = InstanceState::CoolingDown;
        i.cooldown_until = Some(now);
        i.rotation_pending = true;
        assert!(!i.cooldown_expired(now + Duration::from_secs(1)));
        i.rotation_pending = false;
        assert!(i.cooldown_expired(now + Duration::from_secs(1)));
    }

    #[test]
    fn respawn_keeps_failure_count() {
        let mut i = inst();
        i.state = InstanceState::Failed;
        i.consecutive_failures = 4;
        i.bootstrap_pct = 85;
        i.mark_respawned();
        assert_eq!(i.state, InstanceState::Starting);
        assert_eq!(i.bootstrap_pct, 0);
        assert_eq!(i.consecutive_failures, 4);
    }
}
