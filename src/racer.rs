//! Circuit allocator / racer.
//!
//! One acquire call fans out up to `k` concurrent verification probes, one
//! per eligible instance, and returns the first success. Losers get a
//! best-effort cancellation signal through a watch channel; an attempt whose
//! probe is already in flight runs to completion and its verdict is still
//! applied to pool state, so a late block report cools the instance even
//! though the race is over.

use crate::error::PoolError;
use crate::instance::{AttemptOutcome, CircuitHandle, CircuitInstance, InstanceId};
use crate::pool::CircuitPool;
use crate::probe::{ProbeAction, ProbeVerdict};
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// What one attempt task reports back to the allocator.
pub(crate) struct AttemptReport {
    /// Sequence number of the race this attempt belongs to.
    pub race: u64,
    pub id: InstanceId,
    pub generation: u64,
    pub verdict: Option<ProbeVerdict>,
    /// Probe duration in seconds, when a probe actually ran.
    pub elapsed: Option<f64>,
    pub timed_out: bool,
}

/// Race the given candidates; first successful probe wins.
pub(crate) async fn race(
    pool: &Arc<CircuitPool>,
    candidates: Vec<CircuitInstance>,
    probe: Arc<dyn ProbeAction>,
    deadline: Duration,
    probe_timeout: Duration,
) -> Result<CircuitHandle, PoolError> {
    debug_assert!(!candidates.is_empty());

    let (report_tx, mut report_rx) = mpsc::channel::<AttemptReport>(candidates.len());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let race = pool.begin_race(candidates.iter().map(|c| c.id));

    for inst in candidates {
        let tx = report_tx.clone();
        let mut cancel = cancel_rx.clone();
        let probe = Arc::clone(&probe);
        tokio::spawn(async move {
            // The rate-limiter gate is the one point where cancellation is
            // honored immediately; once the probe is in flight it finishes.
            tokio::select! {
                _ = inst.limiter.until_ready() => {}
                _ = cancel.changed() => {
                    let _ = tx
                        .send(AttemptReport {
                            race,
                            id: inst.id,
                            generation: inst.circuit_generation,
                            verdict: None,
                            elapsed: None,
                            timed_out: false,
                        })
                        .await;
                    return;
                }
            }

            let started = Instant::now();
            let (verdict, timed_out) =
                match timeout(probe_timeout, probe.probe(&inst.proxy_endpoint)).await {
                    Ok(v) => (Some(v), false),
                    Err(_) => (None, true),
                };
            let _ = tx
                .send(AttemptReport {
                    race,
                    id: inst.id,
                    generation: inst.circuit_generation,
                    verdict,
                    elapsed: Some(started.elapsed().as_secs_f64()),
                    timed_out,
                })
                .await;
        });
    }
    drop(report_tx);

    let deadline_at = tokio::time::Instant::now() + deadline;

    loop {
        match tokio::time::timeout_at(deadline_at, report_rx.recv()).await {
            Err(_) => {
                let _ = cancel_tx.send(true);
                drain_remaining(pool, report_rx);
                debug!("acquire deadline of {deadline:?} elapsed with no winner");
                return Err(PoolError::PoolExhausted);
            }
            // Every attempt reported, none succeeded.
            Ok(None) => return Err(PoolError::PoolExhausted),
            Ok(Some(report)) => {
                if report.verdict == Some(ProbeVerdict::Ok) {
                    match pool.finish_race_won(&report) {
                        Some(handle) => {
                            let _ = cancel_tx.send(true);
                            drain_remaining(pool, report_rx);
                            return Ok(handle);
                        }
                        // The winner went ineligible while its probe was in
                        // flight; keep waiting for another attempt.
                        None => continue,
                    }
                }
                pool.record_loser(&report, outcome_for(&report));
            }
        }
    }
}

/// Keep accepting reports from attempts that outlived the race, so their
/// verdicts still land in pool state.
fn drain_remaining(pool: &Arc<CircuitPool>, mut rx: mpsc::Receiver<AttemptReport>) {
    let pool = Arc::clone(pool);
    tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            pool.record_loser(&report, outcome_for(&report));
        }
    });
}

fn outcome_for(report: &AttemptReport) -> AttemptOutcome {
    match report.verdict {
        Some(ProbeVerdict::Ok) => AttemptOutcome::Lost,
        Some(ProbeVerdict::Blocked) | Some(ProbeVerdict::Error) => AttemptOutcome::Error,
        None if report.timed_out => AttemptOutcome::Timeout,
        None => AttemptOutcome::Lost,
    }
}
