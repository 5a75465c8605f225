//! End-to-end pipeline against the in-memory store
//!
//! Subscriber appends events, the sweeper snapshots and drains them, and events
//! arriving while a sweep is running land in the next backlog.

use std::sync::Arc;
use std::time::{Duration, Instant};

use expiry_sweeper::backlog::{BacklogStore, FsyncPolicy};
use expiry_sweeper::store::{ExpiredKey, InMemoryStore, KeyType, KeyspaceStore};
use expiry_sweeper::subscriber::{EventSubscriber, SubscriberExit};
use expiry_sweeper::sweeper::{RetryConfig, SweepSettings, Sweeper};
use tempfile::tempdir;

const DB: u32 = 0;

fn settings(interval_ms: u64) -> SweepSettings {
    SweepSettings {
        interval: Duration::from_millis(interval_ms),
        retry: RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
    }
}

fn keys(names: &[&str]) -> Vec<ExpiredKey> {
    names.iter().map(|&n| ExpiredKey::from(n)).collect()
}

/// Poll until the backlog holds `count` records.
async fn wait_for_backlog(backlog: &BacklogStore, count: usize) {
    for _ in 0..400 {
        if backlog.read_back().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("backlog never reached {} records", count);
}

async fn wait_for_type_calls(store: &InMemoryStore, count: usize) {
    for _ in 0..400 {
        if store.type_calls().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("never saw {} TYPE calls", count);
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_events_are_swept_once_each_in_order() {
    let dir = tempdir().unwrap();
    let backlog = Arc::new(BacklogStore::open(dir.path(), FsyncPolicy::Always).unwrap());
    let store = Arc::new(InMemoryStore::new());

    let subscription = store.subscribe_expired(DB).await.unwrap();
    let subscriber = EventSubscriber::new(backlog.clone()).spawn(subscription);
    for key in ["k1", "k2", "k1", "k3"] {
        store.publish_expired(DB, key);
    }
    wait_for_backlog(&backlog, 4).await;

    let interval = Duration::from_millis(30);
    let sweeper = Arc::new(Sweeper::new(backlog.clone(), store.clone(), settings(30)));
    let started = Instant::now();
    let cycle = tokio::spawn({
        let sweeper = sweeper.clone();
        async move { sweeper.run_cycle().await }
    });

    // Drain is running: the backlog was swapped out and new events go to a new one.
    wait_for_type_calls(&store, 1).await;
    assert!(backlog.read_back().unwrap().is_empty());
    store.publish_expired(DB, "late");
    wait_for_backlog(&backlog, 1).await;

    let report = cycle.await.unwrap().unwrap();
    assert!(started.elapsed() >= interval * 2);
    assert_eq!(store.inspected_keys(), vec!["k1", "k2", "k3"]);
    assert_eq!(report.snapshot_keys, 3);
    assert_eq!(report.evicted, 3);
    assert!(!backlog.paths().snapshot.exists());
    assert_eq!(backlog.read_back().unwrap(), keys(&["late"]));

    let calls = store.type_calls();
    for pair in calls.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= interval);
    }

    store.close_subscriptions();
    let exit = subscriber.await.unwrap().unwrap();
    assert!(matches!(exit, SubscriberExit::Closed { received: 5 }));
}

#[tokio::test]
async fn test_aborted_sweep_is_resumed_next_cycle() {
    let dir = tempdir().unwrap();
    let backlog = Arc::new(BacklogStore::open(dir.path(), FsyncPolicy::Never).unwrap());
    let store = Arc::new(InMemoryStore::new());
    for key in keys(&["a", "b"]) {
        backlog.append(&key).unwrap();
    }
    let sweeper = Sweeper::new(backlog.clone(), store.clone(), settings(0));

    // More transient failures than retries: the cycle gives up on "a".
    store.fail_next_type_calls(3);
    let err = sweeper.run_cycle().await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(backlog.has_pending_snapshot());

    backlog.append(&ExpiredKey::from("c")).unwrap();
    store.insert_key("b", KeyType::String);
    let report = sweeper.run_cycle().await.unwrap();

    assert!(report.recovered);
    assert_eq!(report.snapshot_keys, 3);
    assert_eq!(report.evicted, 2);
    assert_eq!(report.still_present, 1);
    assert!(!backlog.has_pending_snapshot());
}

#[tokio::test]
async fn test_restart_picks_up_existing_backlog() {
    let dir = tempdir().unwrap();
    {
        let backlog = BacklogStore::open(dir.path(), FsyncPolicy::Always).unwrap();
        for key in keys(&["x y", "tab\tkey", "x y"]) {
            backlog.append(&key).unwrap();
        }
    }

    let backlog = Arc::new(BacklogStore::open(dir.path(), FsyncPolicy::Never).unwrap());
    let store = Arc::new(InMemoryStore::new());
    let report = Sweeper::new(backlog, store.clone(), settings(0))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.swapped_records, 3);
    assert_eq!(store.inspected_keys(), vec!["x y", "tab\tkey"]);
}
