//! Cross-worker entity fetch bridge
//!
//! Pending lookups are keyed by the requester's correlation id, so two
//! workers asking for the same entity at once each get their own answer.

use crate::ipc::{ClusterId, EntityKind, FetchRequest, FetchResponse};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingFetch {
    pub requester: ClusterId,
    pub kind: EntityKind,
    pub id: u64,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct FetchBridge {
    pending: HashMap<Uuid, PendingFetch>,
    timeout: Duration,
}

impl FetchBridge {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, request: &FetchRequest, requester: ClusterId) {
        self.pending.insert(
            request.request_id,
            PendingFetch {
                requester,
                kind: request.kind,
                id: request.id,
                deadline: Instant::now() + self.timeout,
            },
        );
    }

    /// Remove the pending entry answered by `response` and return who asked.
    /// `None` for unknown, already answered, or expired requests.
    pub fn resolve(&mut self, response: &FetchResponse) -> Option<ClusterId> {
        self.pending
            .remove(&response.request_id)
            .map(|pending| pending.requester)
    }

    /// Remove and return every entry whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<(Uuid, PendingFetch)> {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    pub fn contains(&self, request_id: &Uuid) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64) -> FetchRequest {
        FetchRequest {
            request_id: Uuid::new_v4(),
            kind: EntityKind::User,
            id,
        }
    }

    #[tokio::test]
    async fn resolve_removes_entry_once() {
        let mut bridge = FetchBridge::new(Duration::from_secs(5));
        let req = request(42);
        bridge.register(&req, 1);

        let response = FetchResponse {
            request_id: req.request_id,
            id: 42,
            value: Some(serde_json::json!({"id": 42})),
        };
        assert_eq!(bridge.resolve(&response), Some(1));
        assert_eq!(bridge.resolve(&response), None);
        assert!(bridge.is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_entity_do_not_clobber() {
        let mut bridge = FetchBridge::new(Duration::from_secs(5));
        let a = request(42);
        let b = request(42);
        bridge.register(&a, 0);
        bridge.register(&b, 1);
        assert_eq!(bridge.len(), 2);

        let answer = |req: &FetchRequest| FetchResponse {
            request_id: req.request_id,
            id: 42,
            value: None,
        };
        assert_eq!(bridge.resolve(&answer(&b)), Some(1));
        assert_eq!(bridge.resolve(&answer(&a)), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_returns_overdue_entries() {
        let mut bridge = FetchBridge::new(Duration::from_secs(5));
        let req = request(7);
        bridge.register(&req, 2);

        assert!(bridge.expire(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(5)).await;

        let expired = bridge.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, req.request_id);
        assert_eq!(expired[0].1.requester, 2);
        assert!(!bridge.contains(&req.request_id));
    }
}
