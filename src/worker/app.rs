//! Hosted application interface
//!
//! A worker runs one [`Application`]. It is launched once all of the
//! worker's shards are ready, and receives every `broadcast` and
//! `direct-send` payload addressed to its cluster.

use super::cache::EntityCache;
use crate::error::FleetError;
use crate::ipc::{ClusterId, EntityKind, FetchRequest, LogLevel, WorkerMessage};
use crate::notify::Notification;
use crate::shard::ShardRange;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub trait Application: Send + Sync + 'static {
    /// Called once, after the first time every shard is ready. An error
    /// makes the worker exit so the manager replaces it.
    fn on_launch(&self, ctx: LaunchContext) -> impl Future<Output = Result<(), FleetError>> + Send;

    /// Payload from another cluster. `from` is `None` for broadcasts.
    fn on_message(&self, from: Option<ClusterId>, payload: Value) {
        let _ = (from, payload);
    }
}

/// What an application gets at launch
#[derive(Clone)]
pub struct LaunchContext {
    pub cluster_id: ClusterId,
    pub cluster_count: u32,
    pub shards: ShardRange,
    pub total_shards: u32,
    pub cache: EntityCache,
    pub http: Arc<twilight_http::Client>,
    pub cluster: ClusterHandle,
    pub logger: ClusterLogger,
}

pub(crate) type FetchWaiters = Arc<DashMap<Uuid, oneshot::Sender<Option<Value>>>>;

/// Messaging with the rest of the fleet through the manager
#[derive(Clone)]
pub struct ClusterHandle {
    cluster_id: ClusterId,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    cache: EntityCache,
    waiters: FetchWaiters,
}

impl ClusterHandle {
    pub(crate) fn new(
        cluster_id: ClusterId,
        outbound: mpsc::UnboundedSender<WorkerMessage>,
        cache: EntityCache,
        waiters: FetchWaiters,
    ) -> Self {
        Self {
            cluster_id,
            outbound,
            cache,
            waiters,
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub async fn fetch_user(&self, id: u64) -> Result<Option<Value>, FleetError> {
        self.fetch(EntityKind::User, id).await
    }

    pub async fn fetch_guild(&self, id: u64) -> Result<Option<Value>, FleetError> {
        self.fetch(EntityKind::Guild, id).await
    }

    pub async fn fetch_channel(&self, id: u64) -> Result<Option<Value>, FleetError> {
        self.fetch(EntityKind::Channel, id).await
    }

    /// Look up an entity anywhere in the fleet. Resolves to `None` when no
    /// worker has it before the manager's fetch timeout.
    pub async fn fetch(&self, kind: EntityKind, id: u64) -> Result<Option<Value>, FleetError> {
        if let Some(value) = self.cache.lookup(kind, id) {
            return Ok(Some(value));
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id, tx);

        let request = WorkerMessage::FetchRequest(FetchRequest { request_id, kind, id });
        if self.outbound.send(request).is_err() {
            self.waiters.remove(&request_id);
            return Err(self.closed());
        }

        rx.await.map_err(|_| self.closed())
    }

    /// Deliver `payload` to every cluster, this one included
    pub fn broadcast(&self, payload: Value) -> Result<(), FleetError> {
        self.send(WorkerMessage::Broadcast { payload })
    }

    pub fn send_to(&self, cluster_id: ClusterId, payload: Value) -> Result<(), FleetError> {
        self.send(WorkerMessage::DirectSend { cluster_id, payload })
    }

    /// Post a webhook notification through the manager
    pub fn notify(&self, notification: Notification) -> Result<(), FleetError> {
        self.send(WorkerMessage::Notify { notification })
    }

    fn send(&self, message: WorkerMessage) -> Result<(), FleetError> {
        self.outbound.send(message).map_err(|_| self.closed())
    }

    fn closed(&self) -> FleetError {
        FleetError::ChannelClosed {
            cluster_id: self.cluster_id,
        }
    }
}

/// Writes lines into the manager's log, tagged with this cluster
#[derive(Clone)]
pub struct ClusterLogger {
    outbound: mpsc::UnboundedSender<WorkerMessage>,
}

impl ClusterLogger {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { outbound }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.write(LogLevel::Log, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.write(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.write(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.write(LogLevel::Error, message.into());
    }

    /// Only shown when the manager runs with debug output
    pub fn debug(&self, message: impl Into<String>) {
        self.write(LogLevel::Debug, message.into());
    }

    fn write(&self, level: LogLevel, message: String) {
        let _ = self.outbound.send(WorkerMessage::LifecycleLog { level, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::FetchResponse;
    use serde_json::json;

    fn handle() -> (ClusterHandle, mpsc::UnboundedReceiver<WorkerMessage>, FetchWaiters) {
        let (tx, rx) = mpsc::unbounded_channel();
        let waiters: FetchWaiters = Arc::default();
        let handle = ClusterHandle::new(2, tx, EntityCache::new(), Arc::clone(&waiters));
        (handle, rx, waiters)
    }

    #[tokio::test]
    async fn fetch_waits_for_correlated_response() {
        let (handle, mut rx, waiters) = handle();

        let pending = tokio::spawn(async move { handle.fetch_user(42).await });

        let request = match rx.recv().await {
            Some(WorkerMessage::FetchRequest(request)) => request,
            other => panic!("expected fetch request, got {other:?}"),
        };
        assert_eq!(request.kind, EntityKind::User);
        assert_eq!(request.id, 42);

        let response = FetchResponse {
            request_id: request.request_id,
            id: 42,
            value: Some(json!({"id": 42})),
        };
        let (_, waiter) = waiters.remove(&response.request_id).unwrap();
        waiter.send(response.value).unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), Some(json!({"id": 42})));
    }

    #[tokio::test]
    async fn fetch_answers_from_local_cache() {
        let (handle, mut rx, _) = handle();
        handle.cache.insert_user(crate::worker::cache::CachedUser {
            id: 7,
            name: "local".to_string(),
            bot: false,
        });

        let value = handle.fetch_user(7).await.unwrap();
        assert!(value.is_some());
        assert!(rx.try_recv().is_err(), "no round trip for cached entities");
    }

    #[tokio::test]
    async fn send_to_addresses_target_cluster() {
        let (handle, mut rx, _) = handle();
        handle.send_to(5, json!("hi")).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WorkerMessage::DirectSend {
                cluster_id: 5,
                payload: json!("hi"),
            })
        );
    }

    #[tokio::test]
    async fn closed_manager_channel_is_an_error() {
        let (handle, rx, _) = handle();
        drop(rx);
        let err = handle.broadcast(json!({})).unwrap_err();
        assert_eq!(err.error_type_label(), "channel_closed");
    }
}
