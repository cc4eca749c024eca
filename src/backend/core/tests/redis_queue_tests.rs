//! Tests for the Redis queue store against a live server.
//!
//! Each test skips unless `REDIS_URL` is set and uses its own key prefix, so
//! runs never see each other's queues.
//!
//! Tests cover:
//! - Expired leases are redelivered without spending an attempt
//! - Nack delays the job and records the attempt
//! - Resolving a lease that is already released writes nothing
//! - Deferring keeps the attempt count
//! - Delayed jobs are promoted once due
//! - The dead list is bounded
//! - Malformed entries are parked instead of redelivered

use perch_core::jobs::{EnqueueOptions, QueueStore, RedisQueueStore};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

const VISIBILITY: Duration = Duration::from_secs(30);

/// A store under a fresh prefix, or `None` when no Redis is configured.
async fn store(dead_letter_max: usize) -> Option<(RedisQueueStore, String)> {
    let url = match std::env::var("REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("REDIS_URL not set; skipping Redis queue test");
            return None;
        }
    };
    let prefix = format!("perch-test-{}", Uuid::new_v4());
    let store = RedisQueueStore::connect(&url, prefix.clone(), dead_letter_max)
        .await
        .expect("connect to REDIS_URL");
    Some((store, prefix))
}

#[tokio::test]
async fn test_redis_expired_lease_is_redelivered() {
    let Some((store, _)) = store(10).await else { return };
    store.enqueue("q", json!({"n": 1})).await.unwrap();

    let leased = store.lease("q", Duration::from_millis(100)).await.unwrap().unwrap();
    assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let again = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    assert_eq!(again.job.id, leased.job.id);
    assert_eq!(again.job.attempts, 0);
}

#[tokio::test]
async fn test_redis_nack_delays_and_counts_attempt() {
    let Some((store, _)) = store(10).await else { return };
    store.enqueue("q", json!({})).await.unwrap();

    let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    store.nack(&leased.handle, Duration::from_millis(100), "boom").await.unwrap();

    let stats = store.stats("q").await.unwrap();
    assert_eq!((stats.pending, stats.delayed, stats.leased), (0, 1, 0));
    assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let retried = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    assert_eq!(retried.job.id, leased.job.id);
    assert_eq!(retried.job.attempts, 1);
    assert_eq!(retried.job.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_redis_resolving_a_released_lease_writes_nothing() {
    let Some((store, _)) = store(10).await else { return };
    store.enqueue("q", json!({})).await.unwrap();

    let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    store.ack(&leased.handle).await.unwrap();

    // The lease is gone, so neither call may leave a copy of the job behind.
    store.nack(&leased.handle, Duration::ZERO, "late").await.unwrap();
    store.dead_letter(&leased.handle, "late").await.unwrap();
    store.defer(&leased.handle, Duration::ZERO).await.unwrap();

    let stats = store.stats("q").await.unwrap();
    assert_eq!((stats.pending, stats.delayed, stats.leased, stats.dead), (0, 0, 0, 0));
    assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());
}

#[tokio::test]
async fn test_redis_defer_keeps_attempts() {
    let Some((store, _)) = store(10).await else { return };
    store.enqueue("q", json!({})).await.unwrap();

    let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    store.defer(&leased.handle, Duration::from_millis(50)).await.unwrap();
    assert_eq!(store.stats("q").await.unwrap().delayed, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    assert_eq!(again.job.id, leased.job.id);
    assert_eq!(again.job.attempts, 0);
}

#[tokio::test]
async fn test_redis_delayed_job_is_promoted_when_due() {
    let Some((store, _)) = store(10).await else { return };
    store
        .enqueue_with("q", json!({"n": 1}), EnqueueOptions::delayed(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(store.stats("q").await.unwrap().delayed, 1);
    assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    assert_eq!(leased.job.payload["n"], 1);
    assert_eq!(store.stats("q").await.unwrap().delayed, 0);
}

#[tokio::test]
async fn test_redis_dead_letter_is_bounded() {
    let Some((store, _)) = store(2).await else { return };
    for n in 0..3 {
        store.enqueue("q", json!({ "n": n })).await.unwrap();
        let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
        store.dead_letter(&leased.handle, "fatal").await.unwrap();
    }

    let dead = store.dead_letters("q", 10).await.unwrap();
    assert_eq!(dead.len(), 2);
    assert_eq!(dead[0].job.payload["n"], 2);
    assert_eq!(dead[0].job.attempts, 1);
    assert_eq!(dead[0].reason, "fatal");
    assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());
}

#[tokio::test]
async fn test_redis_malformed_entry_is_parked() {
    let Some((store, prefix)) = store(10).await else { return };
    let url = std::env::var("REDIS_URL").unwrap();
    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("RPUSH")
        .arg(format!("{}:q:ready", prefix))
        .arg("{not json")
        .query_async::<_, i64>(&mut conn)
        .await
        .unwrap();
    store.enqueue("q", json!({"n": 1})).await.unwrap();

    // The broken entry is set aside and the next lease gets the good job.
    assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());
    let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
    assert_eq!(leased.job.payload["n"], 1);

    let stats = store.stats("q").await.unwrap();
    assert_eq!((stats.leased, stats.dead), (1, 1));

    let parked: Vec<String> = redis::cmd("LRANGE")
        .arg(format!("{}:q:dead", prefix))
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    let record: serde_json::Value = serde_json::from_str(&parked[0]).unwrap();
    assert_eq!(record["raw"], "{not json");
    assert!(record["reason"].as_str().unwrap().starts_with("malformed job"));

    // Parked entries are not job records and are left out of the listing.
    assert!(store.dead_letters("q", 10).await.unwrap().is_empty());
}
