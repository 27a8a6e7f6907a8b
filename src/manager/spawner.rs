//! Worker process spawning
//!
//! Workers are the same executable re-launched with [`ROLE_ENV`] set. The
//! manager talks to each child over NDJSON on stdin/stdout; three tasks per
//! child forward outbound messages, inbound messages, and the exit status
//! into the manager's event channel.

use super::record::WorkerHandle;
use super::ManagerEvent;
use crate::error::FleetError;
use crate::ipc::transport::{read_messages, write_messages};
use crate::ipc::{ClusterId, ManagerMessage, WorkerMessage};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Environment variable marking a process as a worker
pub const ROLE_ENV: &str = "FLEET_CLUSTER_ROLE";
/// Value of [`ROLE_ENV`] for workers
pub const WORKER_ROLE: &str = "worker";
/// Environment variable carrying the worker's cluster id
pub const CLUSTER_ID_ENV: &str = "FLEET_CLUSTER_ID";

/// Live connection to a spawned worker
#[derive(Debug)]
pub struct WorkerLink {
    pub pid: Option<u32>,
    pub tx: mpsc::UnboundedSender<ManagerMessage>,
}

/// Starts worker processes for the manager
pub trait WorkerSpawner: Send {
    /// Start a worker for `cluster_id`. Everything the worker sends, and its
    /// eventual exit, must be reported on `events` tagged with `handle`.
    fn spawn(
        &mut self,
        handle: WorkerHandle,
        cluster_id: ClusterId,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Result<WorkerLink, FleetError>;

    /// Stop every worker started so far
    fn shutdown(&mut self) {}
}

/// Spawns workers as child processes of the current executable
pub struct ProcessSpawner {
    program: PathBuf,
    envs: Vec<(String, String)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProcessSpawner {
    pub fn new(program: PathBuf) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            program,
            envs: Vec::new(),
            shutdown_tx,
        }
    }

    /// Re-launch the running executable as workers
    pub fn current_exe() -> Result<Self, FleetError> {
        let program = std::env::current_exe()
            .map_err(|e| FleetError::Config(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(program))
    }

    /// Extra environment for every worker
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        handle: WorkerHandle,
        cluster_id: ClusterId,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Result<WorkerLink, FleetError> {
        let mut child = Command::new(&self.program)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ROLE_ENV, WORKER_ROLE)
            .env(CLUSTER_ID_ENV, cluster_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FleetError::SpawnFailed { cluster_id, source })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or(FleetError::ChannelClosed { cluster_id })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(FleetError::ChannelClosed { cluster_id })?;

        info!(cluster_id, %handle, pid, "Worker process spawned");

        let (tx, rx) = mpsc::unbounded_channel::<ManagerMessage>();

        tokio::spawn(async move {
            if let Err(e) = write_messages(stdin, rx).await {
                debug!(cluster_id, %handle, error = %e, "Worker stdin closed");
            }
        });

        let inbound = events.clone();
        tokio::spawn(async move {
            let forward = inbound.clone();
            let result = read_messages(stdout, move |message: WorkerMessage| {
                let _ = forward.send(ManagerEvent::Message { handle, message });
            })
            .await;
            if let Err(e) = result {
                warn!(cluster_id, %handle, error = %e, "Worker stdout read failed");
            }
            let _ = inbound.send(ManagerEvent::Disconnected { handle });
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!(cluster_id, %handle, error = %e, "Waiting on worker failed");
                            None
                        }
                    };
                    let _ = events.send(ManagerEvent::Exited { handle, code });
                }
                _ = shutdown_rx.recv() => {
                    if let Err(e) = child.kill().await {
                        warn!(cluster_id, %handle, error = %e, "Failed to kill worker");
                    }
                }
            }
        });

        Ok(WorkerLink { pid, tx })
    }

    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
