//! # tor-circuit-pool
//!
//! A self-healing pool of Tor circuits for reaching detection-averse targets.
//!
//! The pool launches N tor subprocesses on adjacent port pairs, accelerates
//! their bootstrap by seeding cached network state from a long-lived
//! reference instance, health-checks them on a timer, and answers `acquire`
//! calls by racing several circuits concurrently and handing back the first
//! one whose verification probe succeeds. Circuits the target blocks are
//! cooled down with a rotated identity instead of being restarted.

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod cooldown;
pub mod error;
pub mod health;
pub mod instance;
pub mod pool;
pub mod probe;
mod racer;
pub mod supervisor;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::PoolError;
pub use instance::{
    AttemptOutcome, CircuitHandle, CircuitInstance, Endpoint, InstanceId, InstanceState, Outcome,
};
pub use pool::{CircuitPool, PoolStats};
pub use probe::{ProbeAction, ProbeVerdict, SocksProbe};
pub use supervisor::Launcher;
