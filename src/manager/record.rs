//! Worker records and the handle ↔ cluster index

use crate::ipc::{ClusterId, ManagerMessage, WorkerStats};
use crate::shard::ShardRange;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Opaque reference to one worker process incarnation.
///
/// A new handle is allocated on every spawn, so messages from a replaced
/// process can be told apart from its successor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerHandle(pub u64);

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Record created, process not started yet
    Spawning,
    /// Process running, shards not ready
    Online,
    /// `shards-started` received
    Ready,
    /// IPC pipe closed; an exit is expected next
    Disconnected,
    /// Process gone and not replaced (yet)
    Exited,
}

impl WorkerState {
    /// Reachable over IPC
    pub fn is_online(&self) -> bool {
        matches!(self, WorkerState::Online | WorkerState::Ready)
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkerState::Spawning => "spawning",
            WorkerState::Online => "online",
            WorkerState::Ready => "ready",
            WorkerState::Disconnected => "disconnected",
            WorkerState::Exited => "exited",
        }
    }
}

/// Manager-side view of one cluster
#[derive(Debug)]
pub struct WorkerRecord {
    pub cluster_id: ClusterId,
    pub handle: Option<WorkerHandle>,
    pub range: ShardRange,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub spawned_at: Instant,
    pub restarts: u32,
    pub last_stats: Option<WorkerStats>,
    link: Option<mpsc::UnboundedSender<ManagerMessage>>,
}

impl WorkerRecord {
    pub fn new(cluster_id: ClusterId, range: ShardRange) -> Self {
        Self {
            cluster_id,
            handle: None,
            range,
            state: WorkerState::Spawning,
            pid: None,
            spawned_at: Instant::now(),
            restarts: 0,
            last_stats: None,
            link: None,
        }
    }

    /// Send a message to the worker; false if it has no live pipe
    pub fn send(&self, message: ManagerMessage) -> bool {
        match &self.link {
            Some(link) => link.send(message).is_ok(),
            None => false,
        }
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            cluster_id: self.cluster_id,
            handle: self.handle,
            pid: self.pid,
            state: self.state,
            first_shard_id: self.range.first,
            last_shard_id: self.range.last,
            restarts: self.restarts,
            uptime_secs: self.spawned_at.elapsed().as_secs(),
            guilds: self.last_stats.as_ref().map(|s| s.guilds),
        }
    }
}

/// Serializable registry snapshot entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub cluster_id: ClusterId,
    pub handle: Option<WorkerHandle>,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub first_shard_id: u32,
    pub last_shard_id: u32,
    pub restarts: u32,
    pub uptime_secs: u64,
    pub guilds: Option<u64>,
}

/// Records ordered by cluster id plus the reverse handle index.
///
/// All mutation of the index goes through [`Registry::attach`] and
/// [`Registry::detach`] so a handle never outlives its process.
#[derive(Debug, Default)]
pub struct Registry {
    workers: BTreeMap<ClusterId, WorkerRecord>,
    handles: HashMap<WorkerHandle, ClusterId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: WorkerRecord) {
        if let Some(old) = self.workers.insert(record.cluster_id, record) {
            if let Some(handle) = old.handle {
                self.handles.remove(&handle);
            }
        }
    }

    /// Bind a freshly spawned process to `cluster_id`, replacing any
    /// previous handle. Returns the handle that was replaced.
    pub fn attach(
        &mut self,
        cluster_id: ClusterId,
        handle: WorkerHandle,
        pid: Option<u32>,
        link: mpsc::UnboundedSender<ManagerMessage>,
    ) -> Option<WorkerHandle> {
        let record = self.workers.get_mut(&cluster_id)?;
        let previous = record.handle.replace(handle);
        if let Some(old) = previous {
            self.handles.remove(&old);
        }
        self.handles.insert(handle, cluster_id);

        record.pid = pid;
        record.link = Some(link);
        record.state = WorkerState::Online;
        record.spawned_at = Instant::now();
        record.last_stats = None;
        previous
    }

    /// Unbind the process of `cluster_id` and mark the record exited
    pub fn detach(&mut self, cluster_id: ClusterId) -> Option<WorkerHandle> {
        let record = self.workers.get_mut(&cluster_id)?;
        record.state = WorkerState::Exited;
        record.link = None;
        record.pid = None;
        let handle = record.handle.take();
        if let Some(handle) = handle {
            self.handles.remove(&handle);
        }
        handle
    }

    pub fn cluster_for(&self, handle: WorkerHandle) -> Option<ClusterId> {
        self.handles.get(&handle).copied()
    }

    pub fn get(&self, cluster_id: ClusterId) -> Option<&WorkerRecord> {
        self.workers.get(&cluster_id)
    }

    pub fn get_mut(&mut self, cluster_id: ClusterId) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&cluster_id)
    }

    /// Records in ascending cluster id order
    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of live handles in the index
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|r| r.state == state).count()
    }

    /// Send to every reachable worker in cluster id order; returns how many
    /// messages were handed to a pipe
    pub fn broadcast(&self, message: &ManagerMessage) -> usize {
        self.workers
            .values()
            .filter(|r| r.send(message.clone()))
            .count()
    }

    pub fn summaries(&self) -> Vec<WorkerSummary> {
        self.workers.values().map(WorkerRecord::summary).collect()
    }
}
