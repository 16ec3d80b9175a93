//! Circuit pool facade.
//!
//! Single entry point for callers and for the background tasks. All mutation
//! of shared pool state goes through this module under one `RwLock`; the
//! health monitor, the racer, and outcome reports never touch each other's
//! data directly.

use crate::bootstrap::SnapshotStore;
use crate::config::PoolConfig;
use crate::cooldown::CooldownRegistry;
use crate::error::PoolError;
use crate::health::{self, HealthAction, ProbeObservation};
use crate::instance::{
    AttemptOutcome, CircuitHandle, CircuitInstance, InstanceId, InstanceState, Outcome,
};
use crate::probe::{ProbeAction, ProbeVerdict, SocksProbe};
use crate::racer::{self, AttemptReport};
use crate::supervisor::{instance_data_dir, Launcher, TorLauncher};

use futures::future;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::watch;

/// How far back `stats()` counts block events.
const RECENT_BLOCK_LOOKBACK: Duration = Duration::from_secs(600);
/// Cadence of the one-line health summary in the log.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);
/// How many past races keep their attempt records around.
const RACE_HISTORY: u64 = 8;

/// Read-only snapshot of pool health, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub healthy_count: usize,
    pub cooldown_count: usize,
    pub failed_count: usize,
    pub total: usize,
    /// Block events in the trailing ten minutes.
    pub recent_blocks: usize,
}

/// Bookkeeping for one attempt of the most recent race.
#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    started_at: Instant,
    outcome: AttemptOutcome,
}

struct PoolState {
    instances: HashMap<InstanceId, CircuitInstance>,
    cooldown: CooldownRegistry,
    /// Attempt records of recent races, keyed by race sequence number so
    /// concurrent acquires never touch each other's bookkeeping.
    attempts: HashMap<(u64, InstanceId), AttemptRecord>,
    /// Sequence number of the most recently begun race.
    last_race: u64,
}

/// A self-healing pool of anonymizing circuits.
pub struct CircuitPool {
    pub config: PoolConfig,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ProbeAction>,
    snapshots: Arc<SnapshotStore>,
    state: RwLock<PoolState>,
    next_id: AtomicU64,
    race_seq: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    last_summary: Mutex<Instant>,
}

impl CircuitPool {
    /// Start a pool of real tor subprocesses and the background health and
    /// snapshot tasks. Returns as soon as every spawn has been attempted;
    /// use [`wait_ready`](Self::wait_ready) to block for a usable circuit.
    pub async fn start(config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        let snapshots = Arc::new(SnapshotStore::new(
            config.reference_data_dir.clone(),
            &config.data_dir,
        ));
        // Capture a snapshot up front so even the first spawns are seeded.
        snapshots.refresh().await;

        let launcher = Arc::new(TorLauncher::new(config.clone(), Arc::clone(&snapshots)));
        launcher.cleanup_stale().await;

        let probe = Arc::new(SocksProbe::new(
            config.probe_url.clone(),
            config.probe_timeout,
        ));
        Self::start_inner(config, launcher, probe, snapshots).await
    }

    /// Start a pool with a custom launcher and probe. This is the seam for
    /// tests and for embedders that manage processes themselves.
    pub async fn start_with(
        config: PoolConfig,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ProbeAction>,
    ) -> Result<Arc<Self>, PoolError> {
        let snapshots = Arc::new(SnapshotStore::new(
            config.reference_data_dir.clone(),
            &config.data_dir,
        ));
        Self::start_inner(config, launcher, probe, snapshots).await
    }

    async fn start_inner(
        config: PoolConfig,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ProbeAction>,
        snapshots: Arc<SnapshotStore>,
    ) -> Result<Arc<Self>, PoolError> {
        let (shutdown_tx, _) = watch::channel(false);
        let cooldown = CooldownRegistry::new(config.cooldown_window);
        let pool = Arc::new(Self {
            config,
            launcher,
            probe,
            snapshots,
            state: RwLock::new(PoolState {
                instances: HashMap::new(),
                cooldown,
                attempts: HashMap::new(),
                last_race: 0,
            }),
            next_id: AtomicU64::new(0),
            race_seq: AtomicU64::new(0),
            shutdown_tx,
            last_summary: Mutex::new(Instant::now()),
        });

        info!(
            "starting circuit pool: {} instances, socks {}+, control {}+",
            pool.config.target_size, pool.config.base_socks_port, pool.config.base_control_port
        );

        if pool.config.manage_reference {
            // The long-lived reference instance keeps the snapshot source
            // warm; losing it only slows bootstrap, so failure is not fatal.
            if let Err(e) = pool.launcher.start_reference().await {
                warn!("reference instance start failed, seeding runs cold: {e}");
            }
        }

        for index in 0..pool.config.target_size {
            let instance = pool.fresh_instance(index);
            pool.spawn_instance(instance).await;
        }

        pool.spawn_health_loop();
        pool.spawn_snapshot_loop();
        Ok(pool)
    }

    fn fresh_instance(&self, index: usize) -> CircuitInstance {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        CircuitInstance::new(
            id,
            index,
            self.config.socks_port(index),
            self.config.control_port(index),
            instance_data_dir(&self.config.data_dir, index),
            self.config.max_requests_per_second,
        )
    }

    /// Launch one instance and register it. A failed spawn leaves the
    /// instance `Failed` for the health monitor's restart cadence; the
    /// launcher already did its single immediate retry.
    async fn spawn_instance(&self, mut instance: CircuitInstance) {
        match self.launcher.spawn(&instance).await {
            Ok(()) => {}
            Err(e) => {
                warn!("{}: spawn failed: {e}", instance.id);
                instance.state = InstanceState::Failed;
            }
        }
        self.state.write().instances.insert(instance.id, instance);
    }

    /// Block until at least one instance is `Healthy`, or the timeout
    /// elapses, or every instance is terminal with restarts exhausted.
    /// Returns the healthy count.
    pub async fn wait_ready(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut last_log = Instant::now();

        loop {
            {
                let st = self.state.read();
                let healthy = st
                    .instances
                    .values()
                    .filter(|i| i.state == InstanceState::Healthy)
                    .count();
                if healthy > 0 {
                    info!(
                        "pool ready: {healthy}/{} instances healthy",
                        self.config.target_size
                    );
                    return healthy;
                }
                let all_terminal = !st.instances.is_empty()
                    && st.instances.values().all(|i| {
                        i.state == InstanceState::Stopped
                            || (i.state == InstanceState::Failed
                                && i.restart_count >= self.config.max_restarts)
                    });
                if all_terminal {
                    warn!("pool: every instance failed with restarts exhausted");
                    return 0;
                }
            }

            if Instant::now() >= deadline {
                warn!("pool: not ready after {}s", timeout.as_secs());
                return 0;
            }

            if last_log.elapsed() >= Duration::from_secs(10) {
                let st = self.state.read();
                let pcts: Vec<String> = st
                    .instances
                    .values()
                    .filter(|i| i.state == InstanceState::Bootstrapping)
                    .map(|i| format!("#{}:{}%", i.index, i.bootstrap_pct))
                    .collect();
                drop(st);
                if !pcts.is_empty() {
                    info!("pool bootstrapping: {}", pcts.join(", "));
                }
                last_log = Instant::now();
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Acquire a working circuit by racing up to `race_size` eligible
    /// instances. Returns the first instance whose verification probe
    /// succeeds, or `PoolExhausted` when none is eligible or none succeeds
    /// within the deadline.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<CircuitHandle, PoolError> {
        if *self.shutdown_tx.borrow() {
            return Err(PoolError::PoolExhausted);
        }
        let candidates = self.eligible_candidates();
        if candidates.is_empty() {
            debug!("acquire: no eligible instance, failing fast");
            return Err(PoolError::PoolExhausted);
        }
        let deadline = timeout.unwrap_or(self.config.acquire_timeout);
        racer::race(
            self,
            candidates,
            Arc::clone(&self.probe),
            deadline,
            self.config.probe_timeout,
        )
        .await
    }

    /// Mandatory bookkeeping after using an acquired circuit.
    ///
    /// `Success` clears the failure counter, `Error` bumps it, `Blocked`
    /// starts the rotate-and-wait cooldown. Reports against a rotated
    /// (stale) generation are dropped where they would misfire: a stale
    /// `Blocked` never cools the already-rotated identity. Repeated
    /// `Blocked` reports are idempotent.
    pub fn report_outcome(self: &Arc<Self>, handle: &CircuitHandle, outcome: Outcome) {
        let now = Instant::now();
        let mut rotation: Option<CircuitInstance> = None;
        {
            let mut st = self.state.write();
            let PoolState {
                instances,
                cooldown,
                ..
            } = &mut *st;
            let Some(instance) = instances.get_mut(&handle.instance_id) else {
                debug!("outcome report for unknown {}", handle.instance_id);
                return;
            };
            match outcome {
                Outcome::Success => {
                    instance.consecutive_failures = 0;
                    instance.probe_successes += 1;
                    instance.last_health_check = Some(now);
                }
                Outcome::Error => {
                    instance.consecutive_failures += 1;
                    instance.probe_failures += 1;
                }
                Outcome::Blocked => {
                    if handle.generation < instance.circuit_generation {
                        debug!(
                            "{}: stale block report (gen {} < {}), ignoring",
                            instance.id, handle.generation, instance.circuit_generation
                        );
                        return;
                    }
                    if cooldown.apply_block(instance, now) {
                        rotation = Some(instance.clone());
                    }
                }
            }
        }
        if let Some(snapshot) = rotation {
            self.spawn_rotation(snapshot);
        }
    }

    /// Whether a handle refers to an identity the instance no longer has.
    pub fn is_stale(&self, handle: &CircuitHandle) -> bool {
        let st = self.state.read();
        match st.instances.get(&handle.instance_id) {
            Some(inst) => inst.circuit_generation > handle.generation,
            None => true,
        }
    }

    /// Read-only health snapshot. Never blocks acquire or report paths
    /// beyond the shared read lock.
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let st = self.state.read();
        let mut stats = PoolStats {
            healthy_count: 0,
            cooldown_count: 0,
            failed_count: 0,
            total: st.instances.len(),
            recent_blocks: st.cooldown.recent_blocks(now, RECENT_BLOCK_LOOKBACK),
        };
        for inst in st.instances.values() {
            match inst.state {
                InstanceState::Healthy => stats.healthy_count += 1,
                InstanceState::CoolingDown => stats.cooldown_count += 1,
                InstanceState::Failed => stats.failed_count += 1,
                _ => {}
            }
        }
        stats
    }

    /// Attempt outcomes of the most recent race, for diagnostics and tests.
    pub fn race_attempts(&self) -> Vec<(InstanceId, AttemptOutcome)> {
        let st = self.state.read();
        let mut out: Vec<_> = st
            .attempts
            .iter()
            .filter(|((race, _), _)| *race == st.last_race)
            .map(|((_, id), r)| (*id, r.outcome))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Stop every subprocess and retire the pool. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("shutting down circuit pool");
        let snapshot: Vec<CircuitInstance> = {
            let st = self.state.read();
            st.instances.values().cloned().collect()
        };
        future::join_all(snapshot.iter().map(|inst| self.launcher.terminate(inst))).await;
        if self.config.manage_reference {
            self.launcher.stop_reference().await;
        }
        let mut st = self.state.write();
        for inst in st.instances.values_mut() {
            inst.transition(InstanceState::Stopped);
        }
        drop(st);
        info!("circuit pool stopped");
    }

    // ------------------------------------------------------------------
    // Racer interface
    // ------------------------------------------------------------------

    /// Healthy, non-cooling instances, shuffled, capped at the race size.
    fn eligible_candidates(&self) -> Vec<CircuitInstance> {
        let now = Instant::now();
        let st = self.state.read();
        let mut eligible: Vec<CircuitInstance> = st
            .instances
            .values()
            .filter(|i| i.is_eligible(now))
            .cloned()
            .collect();
        drop(st);
        let mut rng = rand::rng();
        eligible.shuffle(&mut rng);
        eligible.truncate(self.config.race_size.max(1));
        eligible
    }

    /// Open the attempt records for a new race and return its sequence
    /// number. Records of races older than `RACE_HISTORY` are dropped.
    pub(crate) fn begin_race(&self, ids: impl Iterator<Item = InstanceId>) -> u64 {
        let race = self.race_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let started_at = Instant::now();
        let mut st = self.state.write();
        st.last_race = race;
        st.attempts
            .retain(|(r, _), _| race.saturating_sub(*r) < RACE_HISTORY);
        for id in ids {
            st.attempts.insert(
                (race, id),
                AttemptRecord {
                    started_at,
                    outcome: AttemptOutcome::Pending,
                },
            );
        }
        race
    }

    /// Record the winning attempt and build the caller's handle. Returns
    /// `None` when the winner lost eligibility while its probe was in
    /// flight (a concurrent blocked report cooled it, the health monitor
    /// failed it, or the pool shut down); the probe success still counts,
    /// but the attempt is a loss and the race goes on without it.
    pub(crate) fn finish_race_won(&self, report: &AttemptReport) -> Option<CircuitHandle> {
        let now = Instant::now();
        let mut st = self.state.write();
        let PoolState {
            instances, attempts, ..
        } = &mut *st;
        let instance = instances.get_mut(&report.id)?;
        if instance.state != InstanceState::Healthy {
            debug!(
                "{}: probe won but instance is {:?} now, treating as lost",
                instance.id, instance.state
            );
            instance.probe_successes += 1;
            instance.last_probe_secs = report.elapsed;
            if let Some(rec) = attempts.get_mut(&(report.race, report.id)) {
                rec.outcome = AttemptOutcome::Lost;
            }
            return None;
        }
        if let Some(rec) = attempts.get_mut(&(report.race, report.id)) {
            rec.outcome = AttemptOutcome::Won;
        }
        instance.probe_successes += 1;
        instance.consecutive_failures = 0;
        instance.last_probe_secs = report.elapsed;
        instance.last_health_check = Some(now);
        Some(CircuitHandle {
            instance_id: instance.id,
            proxy_endpoint: instance.proxy_endpoint.clone(),
            generation: instance.circuit_generation,
        })
    }

    /// Record a non-winning attempt, late or not. A blocked verdict still
    /// cools the instance down unless its identity rotated in the meantime.
    pub(crate) fn record_loser(self: &Arc<Self>, report: &AttemptReport, outcome: AttemptOutcome) {
        let now = Instant::now();
        let mut rotation: Option<CircuitInstance> = None;
        {
            let mut st = self.state.write();
            if let Some(rec) = st.attempts.get_mut(&(report.race, report.id)) {
                if rec.outcome == AttemptOutcome::Pending {
                    let age = now.saturating_duration_since(rec.started_at);
                    debug!(
                        "{}: attempt resolved {outcome:?} {:.1}s after race start",
                        report.id,
                        age.as_secs_f64()
                    );
                    rec.outcome = outcome;
                }
            }
            let PoolState {
                instances,
                cooldown,
                ..
            } = &mut *st;
            let Some(instance) = instances.get_mut(&report.id) else {
                return;
            };
            match report.verdict {
                Some(ProbeVerdict::Ok) => {
                    instance.probe_successes += 1;
                    instance.last_probe_secs = report.elapsed;
                    instance.last_health_check = Some(now);
                }
                Some(ProbeVerdict::Blocked) => {
                    if report.generation >= instance.circuit_generation
                        && cooldown.apply_block(instance, now)
                    {
                        rotation = Some(instance.clone());
                    }
                }
                Some(ProbeVerdict::Error) => {
                    instance.probe_failures += 1;
                }
                None => {
                    if report.timed_out {
                        instance.probe_failures += 1;
                    }
                }
            }
        }
        if let Some(snapshot) = rotation {
            self.spawn_rotation(snapshot);
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    fn spawn_rotation(self: &Arc<Self>, snapshot: CircuitInstance) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match pool.launcher.rotate_identity(&snapshot).await {
                Ok(()) => {
                    let mut st = pool.state.write();
                    let PoolState {
                        instances,
                        cooldown,
                        ..
                    } = &mut *st;
                    if let Some(inst) = instances.get_mut(&snapshot.id) {
                        cooldown.confirm_rotation(inst);
                        debug!(
                            "{}: identity rotated to generation {}",
                            inst.id, inst.circuit_generation
                        );
                    }
                }
                Err(e) => {
                    // Left pending; the health monitor retries next tick.
                    debug!("{}: identity rotation failed: {e}", snapshot.id);
                }
            }
        });
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.health_tick().await,
                    _ = shutdown.changed() => {
                        debug!("health monitor stopping");
                        return;
                    }
                }
            }
        });
    }

    fn spawn_snapshot_loop(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.snapshot_refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.snapshots.refresh().await,
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// One health monitor pass over every instance. Public so tests can
    /// drive ticks deterministically; the background loop calls this too.
    #[doc(hidden)]
    pub async fn health_tick(self: &Arc<Self>) {
        let snapshot: Vec<CircuitInstance> = {
            let st = self.state.read();
            st.instances.values().cloned().collect()
        };
        let now = Instant::now();

        // Cooling instances first: retry an unconfirmed rotation, then see
        // whether the window has run out.
        for inst in snapshot
            .iter()
            .filter(|i| i.state == InstanceState::CoolingDown)
        {
            if inst.rotation_pending && self.launcher.rotate_identity(inst).await.is_ok() {
                let mut st = self.state.write();
                let PoolState {
                    instances,
                    cooldown,
                    ..
                } = &mut *st;
                if let Some(i) = instances.get_mut(&inst.id) {
                    cooldown.confirm_rotation(i);
                }
            }
            let mut st = self.state.write();
            let PoolState {
                instances,
                cooldown,
                ..
            } = &mut *st;
            if let Some(i) = instances.get_mut(&inst.id) {
                cooldown.try_release(i, Instant::now());
            }
        }

        // Probe everything else concurrently, then apply under one lock.
        let probed: Vec<&CircuitInstance> = snapshot
            .iter()
            .filter(|i| {
                matches!(
                    i.state,
                    InstanceState::Starting
                        | InstanceState::Bootstrapping
                        | InstanceState::Healthy
                )
            })
            .collect();
        let observations = future::join_all(probed.into_iter().map(|inst| async move {
            let obs = if !self.launcher.is_running(inst.id).await {
                ProbeObservation::ProcessExited
            } else {
                match self.launcher.bootstrap_progress(inst).await {
                    Ok(pct) => ProbeObservation::Progress(pct),
                    Err(_) => ProbeObservation::Unreachable,
                }
            };
            (inst.id, obs)
        }))
        .await;

        {
            let mut st = self.state.write();
            for (id, obs) in observations {
                if let Some(i) = st.instances.get_mut(&id) {
                    let action = health::apply_observation(i, obs, now, &self.config);
                    if action == HealthAction::NeedsRestart {
                        debug!("{}: queued for restart", i.id);
                    }
                }
            }
        }

        self.restart_pass().await;

        let due = {
            let mut last = self.last_summary.lock();
            if last.elapsed() >= SUMMARY_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            let all: Vec<CircuitInstance> = {
                let st = self.state.read();
                st.instances.values().cloned().collect()
            };
            info!("{}", health::summary_line(&all, Instant::now()));
        }
    }

    /// Restart or replace at most one failed instance per tick, so a bad
    /// network moment does not respawn the whole pool at once.
    async fn restart_pass(self: &Arc<Self>) {
        let candidate: Option<CircuitInstance> = {
            let st = self.state.read();
            st.instances
                .values()
                .find(|i| i.state == InstanceState::Failed)
                .cloned()
        };
        let Some(failed) = candidate else { return };

        if failed.restart_count < self.config.max_restarts {
            info!(
                "{}: restarting (attempt {}/{})",
                failed.id,
                failed.restart_count + 1,
                self.config.max_restarts
            );
            self.launcher.terminate(&failed).await;
            let respawn: Option<CircuitInstance> = {
                let mut st = self.state.write();
                st.instances.get_mut(&failed.id).map(|i| {
                    i.mark_respawned();
                    i.restart_count += 1;
                    i.clone()
                })
            };
            if let Some(inst) = respawn {
                if let Err(e) = self.launcher.spawn(&inst).await {
                    warn!("{}: relaunch failed: {e}", inst.id);
                    if let Some(i) = self.state.write().instances.get_mut(&inst.id) {
                        i.transition(InstanceState::Failed);
                    }
                }
            }
        } else {
            // Restarts exhausted: retire this instance for good and refill
            // the slot, keeping the pool at target size.
            info!(
                "{}: retired after {} restarts, replacing slot {}",
                failed.id, failed.restart_count, failed.index
            );
            self.launcher.terminate(&failed).await;
            let replacement = self.fresh_instance(failed.index);
            {
                let mut st = self.state.write();
                st.instances.remove(&failed.id);
            }
            self.spawn_instance(replacement).await;
        }
    }

    // ------------------------------------------------------------------
    // Test support
    // ------------------------------------------------------------------

    /// Force an instance's state, bypassing probes. Test support.
    #[doc(hidden)]
    pub fn force_state(&self, id: InstanceId, state: InstanceState) {
        if let Some(i) = self.state.write().instances.get_mut(&id) {
            i.state = state;
        }
    }

    /// Snapshot one instance. Test support.
    #[doc(hidden)]
    pub fn instance_snapshot(&self, id: InstanceId) -> Option<CircuitInstance> {
        self.state.read().instances.get(&id).cloned()
    }

    /// Ids currently in the pool, sorted by slot index. Test support.
    #[doc(hidden)]
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let st = self.state.read();
        let mut ids: Vec<_> = st.instances.values().map(|i| (i.index, i.id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}
