//! Startup queue ordering under a paused clock

use shard_fleet::queue::{Advance, StartupQueue};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready, task};

const COOLDOWN: Duration = Duration::from_secs(10);
const TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::test(start_paused = true)]
async fn dispatches_in_order_with_cooldown_between_items() {
    let mut queue = StartupQueue::new(COOLDOWN, TIMEOUT);
    for cluster in 0..4u32 {
        queue.enqueue(cluster, format!("connect {cluster}"));
    }

    let start = Instant::now();
    let mut dispatched = Vec::new();
    for expected in 0..4u32 {
        let item = queue.next_dispatch().await;
        assert_eq!(item.key, expected);
        assert_eq!(item.payload, format!("connect {expected}"));
        assert_eq!(Instant::now() - start, COOLDOWN * expected);
        dispatched.push(item.key);

        // Readiness arrives immediately
        assert_eq!(queue.advance(&expected), Advance::Advanced);
    }

    assert_eq!(dispatched, vec![0, 1, 2, 3]);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn holds_next_item_until_completion_signal() {
    let mut queue = StartupQueue::new(COOLDOWN, TIMEOUT);
    queue.enqueue(0u32, ());
    queue.enqueue(1u32, ());

    queue.next_dispatch().await;

    {
        let mut next = task::spawn(queue.next_dispatch());
        assert_pending!(next.poll());
        tokio::time::advance(COOLDOWN * 3).await;
        assert_pending!(next.poll());
    }

    queue.advance(&0);
    let mut next = task::spawn(queue.next_dispatch());
    assert_pending!(next.poll());
    tokio::time::advance(COOLDOWN).await;
    let item = assert_ready!(next.poll());
    assert_eq!(item.key, 1);
}

#[tokio::test(start_paused = true)]
async fn empty_queue_stays_pending() {
    let mut queue: StartupQueue<u32, ()> = StartupQueue::new(COOLDOWN, TIMEOUT);
    let mut next = task::spawn(queue.next_dispatch());
    assert_pending!(next.poll());
    tokio::time::advance(TIMEOUT * 2).await;
    assert_pending!(next.poll());
}

#[tokio::test(start_paused = true)]
async fn stalled_head_is_released_after_timeout() {
    let mut queue = StartupQueue::new(COOLDOWN, TIMEOUT);
    queue.enqueue(0u32, ());
    queue.enqueue(1u32, ());

    let start = Instant::now();
    queue.next_dispatch().await;
    let item = queue.next_dispatch().await;

    assert_eq!(item.key, 1);
    assert_eq!(Instant::now() - start, TIMEOUT + COOLDOWN);
    assert_eq!(queue.advance(&0), Advance::Ignored, "late signal for timed-out item");
}
