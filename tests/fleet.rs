//! Manager scenarios against in-memory workers
//!
//! Worker processes are replaced by channels: the spawner keeps each
//! worker's inbound receiver, and tests play the worker side by feeding
//! `ManagerEvent`s tagged with the handle the manager allocated.

use serde_json::json;
use shard_fleet::config::FleetConfig;
use shard_fleet::ipc::{ClusterId, EntityKind, FetchRequest, FetchResponse, ManagerMessage, WorkerMessage, WorkerStats};
use shard_fleet::manager::{ManagerEvent, WorkerHandle, WorkerLink, WorkerSpawner, WorkerState};
use shard_fleet::shard::ShardRange;
use shard_fleet::{ClusterManager, FleetError};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

type Inboxes = Arc<Mutex<HashMap<WorkerHandle, mpsc::UnboundedReceiver<ManagerMessage>>>>;

#[derive(Default)]
struct ChannelSpawner {
    inboxes: Inboxes,
    spawned: Arc<Mutex<Vec<(WorkerHandle, ClusterId)>>>,
    /// Fail the next spawn attempt
    fail_next: Arc<AtomicBool>,
}

impl WorkerSpawner for ChannelSpawner {
    fn spawn(
        &mut self,
        handle: WorkerHandle,
        cluster_id: ClusterId,
        _events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Result<WorkerLink, FleetError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(FleetError::SpawnFailed {
                cluster_id,
                source: io::Error::new(io::ErrorKind::Other, "fork failed"),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().unwrap().insert(handle, rx);
        self.spawned.lock().unwrap().push((handle, cluster_id));
        Ok(WorkerLink {
            pid: Some(1000 + handle.0 as u32),
            tx,
        })
    }
}

struct Fleet {
    manager: ClusterManager,
    inboxes: Inboxes,
    spawned: Arc<Mutex<Vec<(WorkerHandle, ClusterId)>>>,
    fail_next: Arc<AtomicBool>,
}

impl Fleet {
    fn new(clusters: u32) -> Self {
        let mut config = FleetConfig::new("token");
        config.cluster_count = clusters;
        config.startup_cooldown = Duration::from_secs(5);
        config.queue_timeout = Duration::from_secs(60);
        config.fetch_timeout = Duration::from_secs(5);
        Self::with_config(config)
    }

    fn with_config(config: FleetConfig) -> Self {
        let spawner = ChannelSpawner::default();
        let inboxes = Arc::clone(&spawner.inboxes);
        let spawned = Arc::clone(&spawner.spawned);
        let fail_next = Arc::clone(&spawner.fail_next);
        Self {
            manager: ClusterManager::new(config, spawner),
            inboxes,
            spawned,
            fail_next,
        }
    }

    fn send(&mut self, handle: u64, message: WorkerMessage) {
        self.manager.handle_event(ManagerEvent::Message {
            handle: WorkerHandle(handle),
            message,
        });
    }

    /// Everything delivered to `handle` so far
    fn drain(&self, handle: u64) -> Vec<ManagerMessage> {
        let mut inboxes = self.inboxes.lock().unwrap();
        match inboxes.get_mut(&WorkerHandle(handle)) {
            Some(inbox) => std::iter::from_fn(|| inbox.try_recv().ok()).collect(),
            None => Vec::new(),
        }
    }
}

fn connected_range(messages: &[ManagerMessage]) -> Option<ShardRange> {
    messages.iter().find_map(|m| match m {
        ManagerMessage::Connect(directive) => Some(directive.range()),
        _ => None,
    })
}

fn stats(guilds: u64) -> WorkerStats {
    WorkerStats {
        guilds,
        users: guilds * 3,
        memory_bytes: 4096,
        shard_count: 1,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn five_shards_over_two_clusters_start_in_order_and_aggregate() {
    let mut fleet = Fleet::new(2);
    let stats_rx = fleet.manager.stats();
    let status_rx = fleet.manager.status();

    let ranges = fleet.manager.start(5).unwrap();
    assert_eq!(ranges, vec![ShardRange::new(0, 2), ShardRange::new(3, 4)]);
    assert_eq!(fleet.manager.queue_len(), 2);

    // Cluster 0 connects first and blocks cluster 1 until ready
    fleet.manager.dispatch_next().await;
    assert_eq!(connected_range(&fleet.drain(1)), Some(ShardRange::new(0, 2)));
    assert_eq!(fleet.manager.in_flight(), Some(0));
    assert!(fleet.drain(2).is_empty());

    fleet.send(1, WorkerMessage::ShardsStarted);
    assert_eq!(fleet.manager.in_flight(), None);

    fleet.manager.dispatch_next().await;
    let directive = fleet.drain(2).into_iter().find_map(|m| match m {
        ManagerMessage::Connect(d) => Some(d),
        _ => None,
    });
    let directive = directive.expect("cluster 1 connect");
    assert_eq!(directive.cluster_id, 1);
    assert_eq!(directive.range(), ShardRange::new(3, 4));
    assert_eq!(directive.max_shards, 5);
    assert_eq!(directive.cluster_count, 2);

    fleet.send(2, WorkerMessage::ShardsStarted);
    assert_eq!(fleet.manager.queue_len(), 0);

    let status = status_rx.borrow().clone();
    assert!(status.started);
    assert!(status.all_ready());
    assert_eq!(status.ready_clusters(), 2);

    let round = fleet.manager.begin_stats_round().expect("workers online");
    for handle in [1, 2] {
        assert!(fleet
            .drain(handle)
            .contains(&ManagerMessage::StatsRequest { round }));
    }

    // Replies arrive out of cluster order
    fleet.send(
        2,
        WorkerMessage::StatsReport {
            round: Some(round),
            stats: stats(7),
        },
    );
    assert!(stats_rx.borrow().is_none(), "round incomplete");
    fleet.send(
        1,
        WorkerMessage::StatsReport {
            round: Some(round),
            stats: stats(10),
        },
    );

    let aggregate = stats_rx.borrow().clone().expect("round published");
    assert_eq!(aggregate.guilds, 17);
    assert_eq!(aggregate.users, 51);
    assert_eq!(aggregate.total_memory_bytes, 8192);
    let order: Vec<ClusterId> = aggregate.clusters.iter().map(|c| c.cluster_id).collect();
    assert_eq!(order, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn crashed_worker_is_replaced_under_same_identity() {
    let mut fleet = Fleet::new(2);
    fleet.manager.start(4).unwrap();

    fleet.manager.handle_event(ManagerEvent::Exited {
        handle: WorkerHandle(1),
        code: Some(1),
    });

    let registry = fleet.manager.registry();
    let record = registry.get(0).unwrap();
    assert_eq!(record.handle, Some(WorkerHandle(3)));
    assert_eq!(record.range, ShardRange::new(0, 1));
    assert_eq!(record.restarts, 1);
    assert_eq!(record.state, WorkerState::Online);
    assert_eq!(registry.cluster_for(WorkerHandle(1)), None);
    assert_eq!(registry.cluster_for(WorkerHandle(3)), Some(0));
    assert_eq!(registry.handle_count(), 2);
    assert_eq!(
        *fleet.spawned.lock().unwrap(),
        vec![(WorkerHandle(1), 0), (WorkerHandle(2), 1), (WorkerHandle(3), 0)]
    );

    // The replacement's connect went to the back of the queue
    assert_eq!(fleet.manager.queue_len(), 2);
    fleet.manager.dispatch_next().await;
    assert_eq!(connected_range(&fleet.drain(2)), Some(ShardRange::new(2, 3)));
    fleet.send(2, WorkerMessage::ShardsStarted);
    fleet.manager.dispatch_next().await;
    assert_eq!(connected_range(&fleet.drain(3)), Some(ShardRange::new(0, 1)));

    // Late traffic from the dead incarnation changes nothing
    fleet.send(1, WorkerMessage::ShardsStarted);
    fleet.manager.handle_event(ManagerEvent::Exited {
        handle: WorkerHandle(1),
        code: Some(1),
    });
    let record = fleet.manager.registry().get(0).unwrap();
    assert_eq!(record.state, WorkerState::Online);
    assert_eq!(record.restarts, 1);
    assert_eq!(fleet.manager.in_flight(), Some(0));
}

#[tokio::test(start_paused = true)]
async fn crash_while_connecting_releases_the_queue() {
    let mut fleet = Fleet::new(2);
    fleet.manager.start(2).unwrap();

    fleet.manager.dispatch_next().await;
    assert_eq!(fleet.manager.in_flight(), Some(0));

    fleet.manager.handle_event(ManagerEvent::Exited {
        handle: WorkerHandle(1),
        code: None,
    });
    assert_eq!(fleet.manager.in_flight(), None);

    fleet.manager.dispatch_next().await;
    assert_eq!(fleet.manager.in_flight(), Some(1));
    assert_eq!(connected_range(&fleet.drain(2)), Some(ShardRange::new(1, 1)));
}

#[tokio::test(start_paused = true)]
async fn failed_replacement_is_retried_by_maintenance() {
    let mut fleet = Fleet::new(2);
    fleet.manager.start(2).unwrap();

    fleet.fail_next.store(true, Ordering::SeqCst);
    fleet.manager.handle_event(ManagerEvent::Exited {
        handle: WorkerHandle(1),
        code: Some(1),
    });

    let record = fleet.manager.registry().get(0).unwrap();
    assert_eq!(record.state, WorkerState::Exited);
    assert_eq!(record.handle, None);
    assert_eq!(record.restarts, 0);
    assert_eq!(fleet.manager.registry().handle_count(), 1);

    fleet.manager.maintain();

    let record = fleet.manager.registry().get(0).unwrap();
    assert_eq!(record.state, WorkerState::Online);
    assert_eq!(record.handle, Some(WorkerHandle(4)));
    assert_eq!(record.range, ShardRange::new(0, 0));
    assert_eq!(record.restarts, 1);
    assert_eq!(fleet.manager.registry().cluster_for(WorkerHandle(4)), Some(0));

    // One connect per cluster, the retried one last
    assert_eq!(fleet.manager.queue_len(), 2);
    fleet.manager.dispatch_next().await;
    assert_eq!(connected_range(&fleet.drain(2)), Some(ShardRange::new(1, 1)));
    fleet.send(2, WorkerMessage::ShardsStarted);
    fleet.manager.dispatch_next().await;
    assert_eq!(connected_range(&fleet.drain(4)), Some(ShardRange::new(0, 0)));
}

#[tokio::test]
async fn fetch_answer_is_routed_to_the_requester_only() {
    let mut fleet = Fleet::new(2);
    fleet.manager.start(2).unwrap();

    let request = FetchRequest {
        request_id: Uuid::new_v4(),
        kind: EntityKind::User,
        id: 4242,
    };
    fleet.send(2, WorkerMessage::FetchRequest(request.clone()));
    assert_eq!(fleet.manager.pending_fetches(), 1);
    assert!(fleet
        .drain(1)
        .contains(&ManagerMessage::FetchRequest(request.clone())));
    fleet.drain(2);

    let answer = FetchResponse {
        request_id: request.request_id,
        id: 4242,
        value: Some(json!({"id": 4242, "name": "someone", "bot": false})),
    };
    fleet.send(1, WorkerMessage::FetchResponse(answer.clone()));
    assert_eq!(fleet.manager.pending_fetches(), 0);
    assert_eq!(fleet.drain(2), vec![ManagerMessage::FetchResponse(answer)]);

    // A second worker answering the settled request is dropped
    fleet.send(
        2,
        WorkerMessage::FetchResponse(FetchResponse {
            request_id: request.request_id,
            id: 4242,
            value: None,
        }),
    );
    assert!(fleet.drain(1).is_empty());
    assert!(fleet.drain(2).is_empty());
}

#[tokio::test]
async fn payloads_are_relayed_between_workers() {
    let mut fleet = Fleet::new(3);
    fleet.manager.start(3).unwrap();

    fleet.send(
        1,
        WorkerMessage::DirectSend {
            cluster_id: 2,
            payload: json!("ping"),
        },
    );
    assert_eq!(
        fleet.drain(3),
        vec![ManagerMessage::DirectSend {
            cluster_id: 0,
            payload: json!("ping"),
        }]
    );
    assert!(fleet.drain(2).is_empty());

    fleet.send(2, WorkerMessage::Broadcast { payload: json!({"reload": true}) });
    for handle in 1..=3 {
        assert_eq!(
            fleet.drain(handle),
            vec![ManagerMessage::Broadcast {
                payload: json!({"reload": true}),
            }]
        );
    }
}

#[tokio::test]
async fn stats_round_skips_workers_that_are_gone() {
    let mut config = FleetConfig::new("token");
    config.cluster_count = 2;
    let mut fleet = Fleet::with_config(config);
    fleet.manager.start(2).unwrap();
    let stats_rx = fleet.manager.stats();

    fleet.manager.handle_event(ManagerEvent::Disconnected {
        handle: WorkerHandle(2),
    });
    assert_eq!(
        fleet.manager.registry().get(1).unwrap().state,
        WorkerState::Disconnected
    );

    let round = fleet.manager.begin_stats_round().unwrap();
    fleet.send(
        1,
        WorkerMessage::StatsReport {
            round: Some(round),
            stats: stats(3),
        },
    );
    let aggregate = stats_rx.borrow().clone().unwrap();
    assert_eq!(aggregate.guilds, 3);
    assert_eq!(aggregate.clusters.len(), 1);
}

#[tokio::test]
async fn operator_restart_through_running_loop() {
    let mut config = FleetConfig::new("token");
    config.stats_enabled = false;
    let fleet = Fleet::with_config(config);
    let Fleet {
        mut manager,
        inboxes,
        ..
    } = fleet;
    manager.start(1).unwrap();
    let control = manager.control();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(manager.run(async {
        let _ = stop_rx.await;
    }));

    assert!(assert_ok!(control.restart(0).await));
    assert!(!assert_ok!(control.restart(9).await));

    let received: Vec<ManagerMessage> = {
        let mut inboxes = inboxes.lock().unwrap();
        let inbox = inboxes.get_mut(&WorkerHandle(1)).unwrap();
        std::iter::from_fn(|| inbox.try_recv().ok()).collect()
    };
    assert!(received.contains(&ManagerMessage::RestartRequest));

    stop_tx.send(()).unwrap();
    task.await.unwrap();
    assert_err!(control.restart(0).await);
}
