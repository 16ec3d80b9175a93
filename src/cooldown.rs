//! Cooldown registry.
//!
//! A block signal is a content-level rejection by the target, not a network
//! fault. The response is rotate-and-wait: set a cooldown window, request a
//! new identity, and keep the instance out of every race until both the
//! window has elapsed and the rotation is confirmed. Restarting would be
//! wasted work: the subprocess is fine, only its identity is burned.

use crate::instance::{CircuitInstance, InstanceId, InstanceState};
use log::info;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const RECENT_BLOCKS_CAP: usize = 64;

/// Tracks blocked instances and recent block events. Mutated only under the
/// pool facade's lock.
pub struct CooldownRegistry {
    window: Duration,
    recent: VecDeque<(InstanceId, Instant)>,
}

impl CooldownRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: VecDeque::new(),
        }
    }

    /// Apply a block report. Returns `true` if the instance entered cooldown
    /// now; `false` when it was already cooling, in which case nothing
    /// changes. A second `blocked` report must not extend the window.
    pub fn apply_block(&mut self, instance: &mut CircuitInstance, now: Instant) -> bool {
        if instance.state == InstanceState::CoolingDown {
            return false;
        }
        if !instance.transition(InstanceState::CoolingDown) {
            // Failed/Stopped instances are already out of rotation; record
            // the event for stats but leave the state alone.
            self.push_event(instance.id, now);
            return false;
        }
        instance.cooldown_until = Some(now + self.window);
        instance.rotation_pending = true;
        instance.probe_failures += 1;
        self.push_event(instance.id, now);
        info!(
            "{}: blocked by target, cooling down for {}s with identity rotation",
            instance.id,
            self.window.as_secs()
        );
        true
    }

    /// Record that the identity rotation ordered by `apply_block` was
    /// confirmed over the control channel.
    pub fn confirm_rotation(&mut self, instance: &mut CircuitInstance) {
        if instance.rotation_pending {
            instance.rotation_pending = false;
            instance.circuit_generation += 1;
        }
    }

    /// Release an instance whose window has elapsed and whose rotation is
    /// confirmed. Returns `true` when it went back to `Healthy`.
    pub fn try_release(&mut self, instance: &mut CircuitInstance, now: Instant) -> bool {
        if !instance.cooldown_expired(now) {
            return false;
        }
        if instance.transition(InstanceState::Healthy) {
            instance.cooldown_until = None;
            info!(
                "{}: cooldown expired, back in rotation at generation {}",
                instance.id, instance.circuit_generation
            );
            true
        } else {
            false
        }
    }

    /// Number of block events in the trailing window, for `stats()`.
    pub fn recent_blocks(&self, now: Instant, lookback: Duration) -> usize {
        self.recent
            .iter()
            .filter(|(_, at)| now.duration_since(*at) <= lookback)
            .count()
    }

    fn push_event(&mut self, id: InstanceId, at: Instant) {
        if self.recent.len() == RECENT_BLOCKS_CAP {
            self.recent.pop_front();
        }
        self.recent.push_back((id, at));
    }
}
