//! PostgreSQL job store integration tests.
//!
//! These start a PostgreSQL container and are ignored by default:
//! `cargo test -p keel-jobs --test postgres_store -- --ignored`

mod common;

use common::TestDatabase;
use futures::future::{join_all, FutureExt};
use keel_jobs::{
    error_class, ExecutionError, FailOutcome, JobContext, JobError, JobStatus, JobStore,
    ManualClock, NewJob, RetryPolicy, TaskDefinition, TaskHandler, TaskRegistry,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn registry() -> Arc<TaskRegistry> {
    let handler: TaskHandler = Arc::new(|_args: serde_json::Value, _ctx: JobContext| {
        async { Ok::<(), ExecutionError>(()) }.boxed()
    });
    Arc::new(
        TaskRegistry::builder()
            .register_fn(
                TaskDefinition::new("fetch").retry(
                    RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60))
                        .retry_on(["io"]),
                ),
                handler,
            )
            .build()
            .unwrap(),
    )
}

fn queues() -> Vec<String> {
    vec!["default".to_string()]
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_claim_order_and_exclusivity() {
    let db = TestDatabase::new().await;
    let clock = ManualClock::fixed();
    let store = Arc::new(db.store(registry(), &clock));

    let later = store
        .enqueue(NewJob::new("fetch", json!({"n": 0})).delay(Duration::from_secs(5)))
        .await
        .unwrap();
    let mut ready = Vec::new();
    for n in 1..=20 {
        ready.push(store.enqueue(NewJob::new("fetch", json!({ "n": n }))).await.unwrap());
    }

    let first = store.claim_next(&queues(), "w-0").await.unwrap().unwrap();
    assert_eq!(first.id, ready[0]);
    assert_eq!(first.status, JobStatus::InProgress);
    assert_eq!(first.claim_owner.as_deref(), Some("w-0"));

    // 30 concurrent claimers race for the remaining 19 ready jobs.
    let claims = join_all((1..=30).map(|n| {
        let store = store.clone();
        async move { store.claim_next(&queues(), &format!("w-{n}")).await.unwrap() }
    }))
    .await;

    let claimed: Vec<_> = claims.into_iter().flatten().map(|job| job.id).collect();
    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 19);
    assert_eq!(unique.len(), 19);
    assert!(!unique.contains(&later));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lock_key_suppression_and_release() {
    let db = TestDatabase::new().await;
    let clock = ManualClock::fixed();
    let store = db.store(registry(), &clock);

    let first = store
        .enqueue(NewJob::new("fetch", json!({})).lock_key("fetch:books"))
        .await
        .unwrap();
    let err = store
        .enqueue(NewJob::new("fetch", json!({})).lock_key("fetch:books"))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::DuplicateLock { ref lock_key } if lock_key == "fetch:books"));

    // Still held while in progress and while waiting for a retry.
    store.claim_next(&queues(), "w").await.unwrap().unwrap();
    assert!(store
        .enqueue(NewJob::new("fetch", json!({})).lock_key("fetch:books"))
        .await
        .unwrap_err()
        .is_duplicate_lock());

    store.complete(first, "w").await.unwrap();
    store
        .enqueue(NewJob::new("fetch", json!({})).lock_key("fetch:books"))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_retry_schedule_then_terminal_failure() {
    let db = TestDatabase::new().await;
    let clock = ManualClock::fixed();
    let store = db.store(registry(), &clock);
    let error = ExecutionError::new("io", "connection reset");

    let id = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();

    let mut delays = Vec::new();
    loop {
        let job = store.claim_next(&queues(), "w").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        match store.fail(id, "w", &error).await.unwrap().unwrap() {
            FailOutcome::Retried { delay, .. } => {
                delays.push(delay);
                assert!(store.claim_next(&queues(), "w").await.unwrap().is_none());
                clock.advance(delay);
            }
            FailOutcome::Failed { attempts } => {
                assert_eq!(attempts, 3);
                break;
            }
        }
    }

    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.unwrap().class, "io");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_non_retryable_class_fails_immediately() {
    let db = TestDatabase::new().await;
    let clock = ManualClock::fixed();
    let store = db.store(registry(), &clock);

    let id = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();
    store.claim_next(&queues(), "w").await.unwrap().unwrap();

    let outcome = store
        .fail(id, "w", &ExecutionError::new("validation", "bad input"))
        .await
        .unwrap();
    assert_eq!(outcome, Some(FailOutcome::Failed { attempts: 1 }));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stall_reclaim_and_late_reports() {
    let db = TestDatabase::new().await;
    let clock = ManualClock::fixed();
    let store = db.store(registry(), &clock);

    let id = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();
    store.claim_next(&queues(), "w-dead").await.unwrap().unwrap();

    clock.advance(Duration::from_secs(30));
    assert!(store.reclaim_stalled(Duration::from_secs(60)).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(31));
    let reclaimed = store.reclaim_stalled(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].previous_owner.as_deref(), Some("w-dead"));
    assert!(reclaimed[0].outcome.is_retry());

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.unwrap().class, error_class::WORKER_LOST);

    // The old owner's reports are ignored.
    assert!(!store.heartbeat(id, "w-dead").await.unwrap());
    assert!(!store.complete(id, "w-dead").await.unwrap());
    assert!(store
        .fail(id, "w-dead", &ExecutionError::new("io", "late"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_purge_and_stats() {
    let db = TestDatabase::new().await;
    let clock = ManualClock::fixed();
    let store = db.store(registry(), &clock);

    let pending = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();
    let running = store
        .enqueue(NewJob::new("fetch", json!({})).queue("other"))
        .await
        .unwrap();
    store
        .claim_next(&["other".to_string()], "w")
        .await
        .unwrap()
        .unwrap();

    assert!(store.cancel(pending).await.unwrap());
    assert!(!store.cancel(pending).await.unwrap());
    assert!(matches!(
        store.cancel(running).await,
        Err(JobError::InvalidState { .. })
    ));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].queue, "default");
    assert_eq!(stats[0].cancelled, 1);
    assert_eq!(stats[1].queue, "other");
    assert_eq!(stats[1].in_progress, 1);

    clock.advance(Duration::from_secs(3600));
    assert_eq!(store.purge_terminal(Duration::from_secs(60)).await.unwrap(), 1);
    assert!(store.get(pending).await.unwrap().is_none());
    assert!(store.get(running).await.unwrap().is_some());

    store.health_check().await.unwrap();
}
