//! Instance process supervisor.
//!
//! Owns the subprocess side of each circuit: port allocation, torrc
//! generation, data-directory preparation, spawn/stop/restart, stale-process
//! cleanup, and PID tracking for crash recovery.

use crate::bootstrap::SnapshotStore;
use crate::config::PoolConfig;
use crate::control::ControlClient;
use crate::error::PoolError;
use crate::instance::{CircuitInstance, Endpoint, InstanceId};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Seam between the pool and the operating system. The production
/// implementation spawns real tor subprocesses; tests substitute a scripted
/// launcher so pool behavior runs without a tor binary.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn the subprocess for an instance. Must return promptly; readiness
    /// is the health monitor's problem.
    async fn spawn(&self, instance: &CircuitInstance) -> Result<(), PoolError>;

    /// Stop an instance's subprocess, gracefully if possible.
    async fn terminate(&self, instance: &CircuitInstance);

    /// Whether the subprocess is still alive.
    async fn is_running(&self, id: InstanceId) -> bool;

    /// Liveness probe: bootstrap progress over the control endpoint.
    async fn bootstrap_progress(&self, instance: &CircuitInstance) -> Result<u8, PoolError>;

    /// Ask the instance for a new circuit identity.
    async fn rotate_identity(&self, instance: &CircuitInstance) -> Result<(), PoolError>;

    /// Launch the long-lived reference instance whose data directory seeds
    /// the pool. Only called when the pool is configured to manage it; a
    /// launcher that leaves the reference to someone else keeps the no-op.
    async fn start_reference(&self) -> Result<(), PoolError> {
        Ok(())
    }

    /// Stop a reference instance previously started by `start_reference`.
    async fn stop_reference(&self) {}
}

/// Production launcher: one `tor` subprocess per instance.
pub struct TorLauncher {
    config: PoolConfig,
    snapshots: Arc<SnapshotStore>,
    children: Mutex<HashMap<InstanceId, Child>>,
    reference: Mutex<Option<Child>>,
}

impl TorLauncher {
    pub fn new(config: PoolConfig, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            config,
            snapshots,
            children: Mutex::new(HashMap::new()),
            reference: Mutex::new(None),
        }
    }

    /// Kill leftovers from a previous run recorded in the PID file. Best
    /// effort; a PID that is gone or belongs to someone else is skipped.
    pub async fn cleanup_stale(&self) {
        let pid_file = pid_file_path(&self.config.data_dir);
        let Ok(content) = tokio::fs::read_to_string(&pid_file).await else {
            return;
        };
        let mut killed = 0usize;
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(_idx), Some(pid)) = (parts.next(), parts.next()) else {
                continue;
            };
            if kill_pid(pid).await {
                killed += 1;
            }
        }
        let _ = tokio::fs::remove_file(&pid_file).await;
        if killed > 0 {
            info!("cleaned up {killed} stale instance process(es) from previous run");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    /// Record live PIDs for crash recovery on the next run.
    async fn save_pids(&self) {
        let children = self.children.lock().await;
        let mut lines = String::new();
        for (id, child) in children.iter() {
            if let Some(pid) = child.id() {
                lines.push_str(&format!("{} {}\n", id.0, pid));
            }
        }
        drop(children);
        let pid_file = pid_file_path(&self.config.data_dir);
        if let Err(e) = tokio::fs::write(&pid_file, lines).await {
            debug!("failed to save PID file: {e}");
        }
    }

    /// Prepare an instance's data directory: create it, clear a stale lock
    /// left by a crashed run, seed the latest network-state snapshot.
    async fn prepare_data_dir(&self, instance: &CircuitInstance) -> Result<(), std::io::Error> {
        tokio::fs::create_dir_all(&instance.data_dir).await?;
        let lock = instance.data_dir.join("lock");
        if tokio::fs::try_exists(&lock).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&lock).await;
        }
        // Seeding failure is non-fatal: the instance bootstraps unaccelerated.
        if let Err(e) = self.snapshots.seed(&instance.data_dir).await {
            warn!(
                "instance {}: snapshot seeding failed, bootstrapping cold: {e}",
                instance.index
            );
        }
        Ok(())
    }

    async fn spawn_once(&self, instance: &CircuitInstance) -> Result<Child, std::io::Error> {
        self.prepare_data_dir(instance).await?;

        let template = match &self.config.torrc_template {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };
        let torrc = generate_torrc(
            template.as_deref(),
            instance.proxy_endpoint.port,
            instance.control_endpoint.port,
            &instance.data_dir,
            &format!("pool instance {}", instance.index),
        );
        let torrc_path = torrc_path(&self.config.data_dir, instance.index);
        tokio::fs::write(&torrc_path, torrc).await?;

        Command::new(&self.config.tor_binary)
            .arg("-f")
            .arg(&torrc_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }

    fn control_client(&self, instance: &CircuitInstance) -> ControlClient {
        ControlClient::new(
            instance.control_endpoint.clone(),
            self.config.control_password.clone(),
            self.config.probe_timeout,
        )
    }

    fn reference_control_client(&self) -> ControlClient {
        ControlClient::new(
            Endpoint::local(self.config.reference_control_port),
            self.config.control_password.clone(),
            self.config.probe_timeout,
        )
    }
}

#[async_trait]
impl Launcher for TorLauncher {
    async fn spawn(&self, instance: &CircuitInstance) -> Result<(), PoolError> {
        // One immediate retry on spawn failure, then the instance is left
        // Failed for the health monitor's restart cadence.
        let child = match self.spawn_once(instance).await {
            Ok(child) => child,
            Err(first) => {
                warn!(
                    "instance {}: spawn failed ({first}), retrying once",
                    instance.index
                );
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                self.spawn_once(instance).await.map_err(|source| {
                    PoolError::Spawn {
                        index: instance.index,
                        source,
                    }
                })?
            }
        };

        info!(
            "instance {} ({}): spawned pid {:?} (socks:{}, control:{})",
            instance.index,
            instance.id,
            child.id(),
            instance.proxy_endpoint.port,
            instance.control_endpoint.port
        );
        self.children.lock().await.insert(instance.id, child);
        self.save_pids().await;
        Ok(())
    }

    async fn terminate(&self, instance: &CircuitInstance) {
        // Ask nicely over the control port first; tor flushes its state
        // files on SIGNAL SHUTDOWN, which keeps future seeds warm.
        let _ = self.control_client(instance).graceful_stop().await;

        let mut children = self.children.lock().await;
        if let Some(mut child) = children.remove(&instance.id) {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("instance {}: already exited ({status})", instance.index)
                }
                _ => {
                    if let Err(e) = child.kill().await {
                        debug!("instance {}: kill failed: {e}", instance.index);
                    }
                }
            }
        }
        drop(children);
        self.save_pids().await;
    }

    async fn is_running(&self, id: InstanceId) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn bootstrap_progress(&self, instance: &CircuitInstance) -> Result<u8, PoolError> {
        self.control_client(instance).bootstrap_progress().await
    }

    async fn rotate_identity(&self, instance: &CircuitInstance) -> Result<(), PoolError> {
        self.control_client(instance).rotate_identity().await
    }

    async fn start_reference(&self) -> Result<(), PoolError> {
        let Some(dir) = self.config.reference_data_dir.clone() else {
            return Ok(());
        };
        // An already-running reference (ours from a previous run, or one
        // someone else keeps alive) answers its control port; adopt it.
        if self.reference_control_client().bootstrap_progress().await.is_ok() {
            debug!("reference instance already running, adopting it");
            return Ok(());
        }

        tokio::fs::create_dir_all(&dir).await?;
        let lock = dir.join("lock");
        if tokio::fs::try_exists(&lock).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&lock).await;
        }

        let template = match &self.config.torrc_template {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };
        let torrc = generate_torrc(
            template.as_deref(),
            self.config.reference_socks_port,
            self.config.reference_control_port,
            &dir,
            "reference instance",
        );
        let torrc_path = self.config.data_dir.join("torrc-reference");
        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        tokio::fs::write(&torrc_path, torrc).await?;

        let child = Command::new(&self.config.tor_binary)
            .arg("-f")
            .arg(&torrc_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!(
            "reference instance: spawned pid {:?} (socks:{}, control:{})",
            child.id(),
            self.config.reference_socks_port,
            self.config.reference_control_port
        );
        *self.reference.lock().await = Some(child);
        Ok(())
    }

    async fn stop_reference(&self) {
        let Some(mut child) = self.reference.lock().await.take() else {
            // Adopted or never started; an adopted reference is left alone.
            return;
        };
        let _ = self.reference_control_client().graceful_stop().await;
        match child.try_wait() {
            Ok(Some(status)) => debug!("reference instance already exited ({status})"),
            _ => {
                if let Err(e) = child.kill().await {
                    debug!("reference instance kill failed: {e}");
                }
            }
        }
        info!("reference instance stopped");
    }
}

/// Path of the instance's data directory under the pool root.
pub fn instance_data_dir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("instance-{index}"))
}

fn torrc_path(root: &Path, index: usize) -> PathBuf {
    root.join(format!("torrc-pool-{index}"))
}

fn pid_file_path(root: &Path) -> PathBuf {
    root.join("pool-pids.txt")
}

async fn kill_pid(pid: &str) -> bool {
    #[cfg(unix)]
    let mut cmd = {
        let mut c = Command::new("kill");
        c.arg("-9").arg(pid);
        c
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut c = Command::new("taskkill");
        c.arg("/F").arg("/PID").arg(pid);
        c
    };
    match cmd.output().await {
        Ok(out) if out.status.success() => {
            debug!("killed stale pid {pid}");
            true
        }
        _ => false,
    }
}

/// Build a torrc for one tor process. Instance-specific keys from the
/// template are stripped and re-emitted with the given ports and data
/// directory; bridge and transport lines pass through untouched.
pub fn generate_torrc(
    template: Option<&str>,
    socks_port: u16,
    control_port: u16,
    data_dir: &Path,
    label: &str,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(base) = template {
        for line in base.lines() {
            let stripped = line.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                lines.push(line.to_string());
                continue;
            }
            let key = stripped
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_ascii_lowercase();
            if matches!(
                key.as_str(),
                "socksport" | "controlport" | "datadirectory" | "log"
            ) {
                continue;
            }
            lines.push(line.to_string());
        }
    }

    let data_dir = data_dir.display();
    lines.push(String::new());
    lines.push(format!("# {label}"));
    lines.push(format!("SocksPort {socks_port}"));
    lines.push(format!("ControlPort {control_port}"));
    lines.push(format!("DataDirectory {data_dir}"));
    lines.push(format!("Log notice file {data_dir}/tor.log"));
    lines.join("\n")
}
