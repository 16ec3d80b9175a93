//! Error types for the tor-circuit-pool crate.

use thiserror::Error;

/// Failure modes of the circuit pool.
///
/// Only `PoolExhausted` is expected to reach callers of
/// [`CircuitPool::acquire`](crate::pool::CircuitPool::acquire); the other
/// variants are absorbed internally by the health monitor and surface in
/// `stats()` instead.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The subprocess failed to launch (missing binary, port conflict).
    #[error("failed to spawn instance {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// An instance never reached `Healthy` within the bootstrap bound.
    #[error("instance {index} did not bootstrap within {seconds}s")]
    BootstrapTimeout { index: usize, seconds: u64 },

    /// A liveness or verification probe failed.
    #[error("probe failed: {0}")]
    Probe(String),

    /// The control channel refused or garbled a command.
    #[error("control channel error: {0}")]
    Control(String),

    /// No eligible circuit at acquire time. Callers should back off.
    #[error("no eligible circuit in pool")]
    PoolExhausted,
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Control(e.to_string())
    }
}
