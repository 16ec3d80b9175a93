//! Health monitor policy.
//!
//! The monitor loop lives in the pool facade; this module is the pure
//! decision logic applied to each instance per tick, so the transition rules
//! (crash, stall, probe-miss threshold, bootstrap completion) are testable
//! without processes or sockets.

use crate::config::PoolConfig;
use crate::instance::{CircuitInstance, InstanceState};
use log::{info, warn};
use std::collections::HashMap;
use tokio::time::Instant;

/// What the monitor saw when it looked at one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeObservation {
    /// The subprocess is gone.
    ProcessExited,
    /// The control port answered with a bootstrap percentage.
    Progress(u8),
    /// The control port did not answer.
    Unreachable,
}

/// What the pool should do with the instance after this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    /// The instance just became healthy.
    BecameHealthy,
    /// The instance must be handed to the supervisor for restart.
    NeedsRestart,
}

/// Apply one observation to one instance. Mutates state per the policy
/// table; the caller holds the pool lock.
pub fn apply_observation(
    instance: &mut CircuitInstance,
    obs: ProbeObservation,
    now: Instant,
    config: &PoolConfig,
) -> HealthAction {
    match instance.state {
        InstanceState::Failed | InstanceState::Stopped | InstanceState::CoolingDown => {
            return HealthAction::None
        }
        _ => {}
    }

    if obs == ProbeObservation::ProcessExited {
        warn!("{}: subprocess exited", instance.id);
        instance.transition(InstanceState::Failed);
        return HealthAction::NeedsRestart;
    }

    match instance.state {
        InstanceState::Starting | InstanceState::Bootstrapping => {
            if let ProbeObservation::Progress(pct) = obs {
                instance.transition(InstanceState::Bootstrapping);
                instance.last_control_ok = now;
                if pct != instance.bootstrap_pct {
                    instance.bootstrap_pct = pct;
                    instance.last_progress_at = now;
                }
                if pct >= 100 {
                    instance.transition(InstanceState::Healthy);
                    instance.last_health_check = Some(now);
                    instance.consecutive_failures = 0;
                    info!(
                        "{}: bootstrapped (socks:{})",
                        instance.id, instance.proxy_endpoint.port
                    );
                    return HealthAction::BecameHealthy;
                }
            }
            // Stall and overall bootstrap deadline, checked regardless of
            // whether the control port answered this tick.
            if now.duration_since(instance.last_progress_at) > config.stall_timeout {
                warn!(
                    "{}: stalled at {}% bootstrap",
                    instance.id, instance.bootstrap_pct
                );
                instance.transition(InstanceState::Failed);
                return HealthAction::NeedsRestart;
            }
            if now.duration_since(instance.started_at) > config.bootstrap_timeout {
                warn!(
                    "{}: bootstrap timeout after {}s",
                    instance.id,
                    config.bootstrap_timeout.as_secs()
                );
                instance.transition(InstanceState::Failed);
                return HealthAction::NeedsRestart;
            }
            HealthAction::None
        }
        InstanceState::Healthy => match obs {
            ProbeObservation::Progress(_) => {
                instance.last_control_ok = now;
                instance.last_health_check = Some(now);
                instance.consecutive_failures = 0;
                HealthAction::None
            }
            ProbeObservation::Unreachable => {
                instance.consecutive_failures += 1;
                let past_threshold =
                    instance.consecutive_failures >= config.probe_miss_threshold;
                let unreachable_too_long =
                    now.duration_since(instance.last_control_ok) > config.control_timeout;
                if past_threshold || unreachable_too_long {
                    warn!(
                        "{}: control endpoint unresponsive ({} consecutive misses)",
                        instance.id, instance.consecutive_failures
                    );
                    instance.transition(InstanceState::Failed);
                    HealthAction::NeedsRestart
                } else {
                    HealthAction::None
                }
            }
            ProbeObservation::ProcessExited => unreachable!("handled above"),
        },
        _ => HealthAction::None,
    }
}

/// One-line health summary, logged periodically by the monitor.
pub fn summary_line(instances: &[CircuitInstance], now: Instant) -> String {
    let mut by_state: HashMap<&'static str, usize> = HashMap::new();
    let mut total_restarts = 0u32;
    let mut probe_parts = Vec::new();

    for inst in instances {
        let label = match inst.state {
            InstanceState::Starting => "starting",
            InstanceState::Bootstrapping => "bootstrapping",
            InstanceState::Healthy => "healthy",
            InstanceState::CoolingDown => "cooling",
            InstanceState::Failed => "failed",
            InstanceState::Stopped => "stopped",
        };
        *by_state.entry(label).or_insert(0) += 1;
        total_restarts += inst.restart_count;

        let total = inst.probe_successes + inst.probe_failures;
        if total > 0 {
            let pct = (100 * inst.probe_successes / total) as u32;
            let cooling = match inst.cooldown_until {
                Some(until) if until > now => {
                    format!(" cooldown:{}s", until.duration_since(now).as_secs())
                }
                _ => String::new(),
            };
            probe_parts.push(format!(
                "#{}={}/{} ({pct}%){cooling}",
                inst.index, inst.probe_successes, total
            ));
        } else {
            probe_parts.push(format!("#{}=no probes", inst.index));
        }
    }

    let mut states: Vec<_> = by_state.into_iter().collect();
    states.sort();
    let states_str = states
        .iter()
        .map(|(s, n)| format!("{n} {s}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "pool health: [{}] restarts: {}, probes: {}",
        states_str,
        total_restarts,
        probe_parts.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceId;
    use std::path::PathBuf;
    use std::time::Duration;

    fn cfg() -> PoolConfig {
        PoolConfig::builder()
            .probe_miss_threshold(3)
            .stall_timeout(Duration::from_secs(90))
            .bootstrap_timeout(Duration::from_secs(120))
            .control_timeout(Duration::from_secs(30))
            .build()
    }

    fn inst(state: InstanceState) -> CircuitInstance {
        let mut i = CircuitInstance::new(
            InstanceId(1),
            0,
            9060,
            9160,
            PathBuf::from("/tmp/i"),
            5.0,
        );
        i.state = state;
        i
    }

    #[test]
    fn bootstrap_completion_becomes_healthy_and_resets_failures() {
        let config = cfg();
        let mut i = inst(InstanceState::Bootstrapping);
        i.consecutive_failures = 2;
        let now = Instant::now();

        let action = apply_observation(&mut i, ProbeObservation::Progress(100), now, &config);
        assert_eq!(action, HealthAction::BecameHealthy);
        assert_eq!(i.state, InstanceState::Healthy);
        assert_eq!(i.consecutive_failures, 0);
        assert_eq!(i.last_health_check, Some(now));
    }

    #[test]
    fn partial_progress_stays_bootstrapping() {
        let config = cfg();
        let mut i = inst(InstanceState::Starting);
        let now = Instant::now();
        let action = apply_observation(&mut i, ProbeObservation::Progress(40), now, &config);
        assert_eq!(action, HealthAction::None);
        assert_eq!(i.state, InstanceState::Bootstrapping);
        assert_eq!(i.bootstrap_pct, 40);
    }

    #[test]
    fn three_misses_fail_a_healthy_instance() {
        let config = cfg();
        let mut i = inst(InstanceState::Healthy);
        let now = Instant::now();

        for miss in 1..=2u32 {
            let action = apply_observation(&mut i, ProbeObservation::Unreachable, now, &config);
            assert_eq!(action, HealthAction::None, "miss {miss} below threshold");
            assert_eq!(i.state, InstanceState::Healthy);
        }
        let action = apply_observation(&mut i, ProbeObservation::Unreachable, now, &config);
        assert_eq!(action, HealthAction::NeedsRestart);
        assert_eq!(i.state, InstanceState::Failed);
        assert_eq!(i.consecutive_failures, 3);
    }

    #[test]
    fn successful_probe_resets_miss_count() {
        let config = cfg();
        let mut i = inst(InstanceState::Healthy);
        let now = Instant::now();
        apply_observation(&mut i, ProbeObservation::Unreachable, now, &config);
        apply_observation(&mut i, ProbeObservation::Unreachable, now, &config);
        apply_observation(&mut i, ProbeObservation::Progress(100), now, &config);
        assert_eq!(i.consecutive_failures, 0);
        assert_eq!(i.state, InstanceState::Healthy);
    }

    #[test]
    fn crash_always_wins() {
        let config = cfg();
        let mut i = inst(InstanceState::Healthy);
        let action =
            apply_observation(&mut i, ProbeObservation::ProcessExited, Instant::now(), &config);
        assert_eq!(action, HealthAction::NeedsRestart);
        assert_eq!(i.state, InstanceState::Failed);
    }

    #[test]
    fn stalled_bootstrap_escalates() {
        let config = cfg();
        let mut i = inst(InstanceState::Bootstrapping);
        i.bootstrap_pct = 85;
        let stalled_at = i.last_progress_at + Duration::from_secs(91);

        let action =
            apply_observation(&mut i, ProbeObservation::Progress(85), stalled_at, &config);
        assert_eq!(action, HealthAction::NeedsRestart);
        assert_eq!(i.state, InstanceState::Failed);
    }

    #[test]
    fn cooling_instances_are_left_alone() {
        let config = cfg();
        let mut i = inst(InstanceState::CoolingDown);
        let action =
            apply_observation(&mut i, ProbeObservation::Unreachable, Instant::now(), &config);
        assert_eq!(action, HealthAction::None);
        assert_eq!(i.state, InstanceState::CoolingDown);
    }

    #[test]
    fn summary_counts_states() {
        let now = Instant::now();
        let line = summary_line(&[inst(InstanceState::Healthy), inst(InstanceState::Failed)], now);
        assert!(line.contains("1 healthy"));
        assert!(line.contains("1 failed"));
    }
}
