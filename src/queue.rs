//! Sequential, rate-limited dispatch queue
//!
//! Holds connect directives and hands them out one at a time. The next item
//! is only released once the in-flight item has been acknowledged with
//! [`StartupQueue::advance`] and the cooldown has passed. An item that is
//! never acknowledged is dropped after the dispatch timeout so the queue
//! cannot wedge.
//!
//! The queue owns no task. The owner awaits [`StartupQueue::next_dispatch`]
//! inside its event loop; the future is cancel-safe.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// One queued directive
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem<K, P> {
    pub key: K,
    pub payload: P,
}

#[derive(Debug, Clone, PartialEq)]
struct InFlight<K> {
    key: K,
    dispatched_at: Instant,
}

/// Outcome of a completion signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The in-flight item was completed and removed
    Advanced,
    /// Nothing matching was in flight; the signal was ignored
    Ignored,
}

pub struct StartupQueue<K, P> {
    items: VecDeque<QueueItem<K, P>>,
    in_flight: Option<InFlight<K>>,
    /// Earliest instant the head may be dispatched; `None` while idle
    ready_at: Option<Instant>,
    last_completed: Option<Instant>,
    cooldown: Duration,
    dispatch_timeout: Duration,
}

impl<K, P> StartupQueue<K, P>
where
    K: Clone + PartialEq + Debug,
    P: Clone,
{
    pub fn new(cooldown: Duration, dispatch_timeout: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            in_flight: None,
            ready_at: None,
            last_completed: None,
            cooldown,
            dispatch_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Key of the item currently waiting for its completion signal
    pub fn in_flight(&self) -> Option<&K> {
        self.in_flight.as_ref().map(|f| &f.key)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Append an item. An idle queue schedules it right away, still
    /// respecting the cooldown since the last completion.
    pub fn enqueue(&mut self, key: K, payload: P) {
        debug!(?key, queued = self.items.len() + 1, "Queueing item");
        self.items.push_back(QueueItem { key, payload });

        if self.in_flight.is_none() && self.ready_at.is_none() {
            self.ready_at = Some(self.earliest_dispatch());
        }
    }

    /// Completion signal for `key`.
    ///
    /// Only the in-flight item can be advanced. Duplicate or late signals
    /// (the item already advanced or timed out) are ignored.
    pub fn advance(&mut self, key: &K) -> Advance {
        match &self.in_flight {
            Some(f) if &f.key == key => {
                self.complete_head();
                Advance::Advanced
            }
            _ => {
                debug!(?key, "Ignoring completion signal for item not in flight");
                Advance::Ignored
            }
        }
    }

    /// Drop queued items for `key` that have not been dispatched yet.
    /// Returns how many were removed.
    pub fn remove_pending(&mut self, key: &K) -> usize {
        let before = self.items.len();
        let skip = usize::from(self.in_flight.is_some());
        let mut index = 0;
        self.items.retain(|item| {
            let keep = index < skip || &item.key != key;
            index += 1;
            keep
        });
        if self.items.is_empty() {
            self.ready_at = None;
        }
        before - self.items.len()
    }

    /// Wait for the next item to become dispatchable and mark it in flight.
    ///
    /// Also performs the timeout fallback for a stalled in-flight item.
    /// Pending forever while there is nothing to dispatch.
    pub async fn next_dispatch(&mut self) -> QueueItem<K, P> {
        loop {
            if let Some(f) = &self.in_flight {
                sleep_until(f.dispatched_at + self.dispatch_timeout).await;
                warn!(
                    key = ?f.key,
                    timeout_ms = self.dispatch_timeout.as_millis() as u64,
                    "No completion signal before timeout, advancing queue"
                );
                self.complete_head();
                continue;
            }

            let at = match (self.items.front(), self.ready_at) {
                (Some(_), Some(at)) => at,
                _ => return std::future::pending().await,
            };

            sleep_until(at).await;

            if let Some(head) = self.items.front().cloned() {
                self.ready_at = None;
                self.in_flight = Some(InFlight {
                    key: head.key.clone(),
                    dispatched_at: Instant::now(),
                });
                return head;
            }
        }
    }

    fn complete_head(&mut self) {
        self.items.pop_front();
        self.in_flight = None;
        let now = Instant::now();
        self.last_completed = Some(now);
        self.ready_at = if self.items.is_empty() {
            None
        } else {
            Some(now + self.cooldown)
        };
    }

    fn earliest_dispatch(&self) -> Instant {
        let now = Instant::now();
        match self.last_completed {
            Some(done) if done + self.cooldown > now => done + self.cooldown,
            _ => now,
        }
    }
}
