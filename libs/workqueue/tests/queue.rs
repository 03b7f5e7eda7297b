//! Integration tests for delayed and rate-limited queues.
//!
//! Timer-driven tests run with a paused clock so delays are deterministic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use groupscale_workqueue::{
    DelayingQueue, ItemExponentialFailureRateLimiter, RateLimitingQueue,
};
use tokio::time::{timeout, Instant};

#[tokio::test(start_paused = true)]
async fn test_add_after_delivers_at_ready_time() {
    let queue = DelayingQueue::new("delayed");
    let start = Instant::now();

    queue.add_after("a", Duration::from_secs(1));
    assert!(queue.is_empty());

    let early = timeout(Duration::from_millis(500), queue.get()).await;
    assert!(early.is_err(), "key delivered before its ready time");

    assert_eq!(queue.get().await, Some("a"));
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_add_after_keeps_earliest_ready_time() {
    let queue = DelayingQueue::new("delayed");
    let start = Instant::now();

    queue.add_after("a", Duration::from_secs(5));
    queue.add_after("a", Duration::from_secs(1));

    assert_eq!(queue.get().await, Some("a"));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(5));
    queue.done(&"a");

    let again = timeout(Duration::from_secs(10), queue.get()).await;
    assert!(again.is_err(), "superseded timer must not fire");
}

#[tokio::test(start_paused = true)]
async fn test_zero_delay_adds_immediately() {
    let queue = DelayingQueue::new("delayed");
    queue.add_after(7u32, Duration::ZERO);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some(7));
}

#[tokio::test(start_paused = true)]
async fn test_delayed_add_after_shutdown_is_dropped() {
    let queue = DelayingQueue::new("delayed");
    queue.add_after("pending", Duration::from_millis(100));
    queue.shut_down();
    queue.add_after("late", Duration::from_millis(10));
    queue.add("late");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.get().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_requeue_backs_off() {
    let queue = RateLimitingQueue::new(
        "limited",
        ItemExponentialFailureRateLimiter::new(Duration::from_millis(100), Duration::from_secs(10)),
    );

    queue.add("key");
    let key = queue.get().await.unwrap();

    let start = Instant::now();
    queue.add_rate_limited(key);
    queue.done(&key);
    assert_eq!(queue.num_requeues(&key), 1);

    let key = queue.get().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));

    let start = Instant::now();
    queue.add_rate_limited(key);
    queue.done(&key);
    let key = queue.get().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(queue.num_requeues(&key), 2);

    queue.forget(&key);
    queue.done(&key);
    assert_eq!(queue.num_requeues(&key), 0);
    assert_eq!(queue.stats().retries, 2);
}

#[tokio::test]
async fn test_shutdown_wakes_blocked_getters() {
    let queue = Arc::new(DelayingQueue::<String>::new("shutdown"));

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shut_down();

    for waiter in waiters {
        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("getter was not woken")
            .unwrap();
        assert_eq!(result, None);
    }

    // Future gets return immediately too.
    assert_eq!(queue.get().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_adds_racing_shutdown_do_not_panic() {
    let queue = Arc::new(RateLimitingQueue::<u32>::with_default_limiter("race"));

    let adders: Vec<_> = (0..8)
        .map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for n in 0..500 {
                    queue.add(i * 1000 + n);
                    queue.add_after(n, Duration::from_millis(1));
                    queue.add_rate_limited(n);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.shut_down();

    for adder in adders {
        adder.await.unwrap();
    }
    assert!(queue.is_shutting_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_concurrent_delivery_of_same_key() {
    let queue = Arc::new(DelayingQueue::<u32>::new("dedup"));
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let processed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let processed = processed.clone();
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    assert!(
                        in_flight.lock().unwrap().insert(key),
                        "key {key} delivered twice concurrently"
                    );
                    tokio::task::yield_now().await;
                    in_flight.lock().unwrap().remove(&key);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&key);
                }
            })
        })
        .collect();

    for round in 0..200u32 {
        queue.add(round % 5);
        if round % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    // Let the workers drain before shutting down.
    while !queue.is_empty() || queue.stats().in_flight > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    queue.shut_down();

    for worker in workers {
        worker.await.unwrap();
    }
    assert!(processed.load(Ordering::SeqCst) >= 5);
}
