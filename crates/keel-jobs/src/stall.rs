//! Stall detector.
//!
//! Periodically takes jobs back from workers that stopped heartbeating.
//! Each reclaimed job is failed with a `worker_lost` error through the
//! same retry path as an ordinary failure, so it consumes one attempt and
//! is either rescheduled or moved to `failed`.
//!
//! Sweeps are idempotent per job, so running more than one detector
//! against the same store is safe.

use crate::clock::SharedClock;
use crate::error::{error_class, JobResult};
use crate::events::{JobEvent, JobEventKind};
use crate::job::JobId;
use crate::store::SharedJobStore;
use keel_config::StallConfig;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs put back to `pending`.
    pub requeued: usize,
    /// Jobs that had no attempts left and were moved to `failed`.
    pub exhausted: usize,
    /// Every reclaimed job.
    pub job_ids: Vec<JobId>,
}

impl SweepReport {
    /// Total jobs reclaimed.
    pub fn total(&self) -> usize {
        self.requeued + self.exhausted
    }
}

/// Periodic stalled-job reclamation.
pub struct StallDetector {
    store: SharedJobStore,
    clock: SharedClock,
    threshold: Duration,
    interval: Duration,
}

impl StallDetector {
    /// Creates a detector that reclaims claims whose heartbeat is older
    /// than `threshold`, sweeping every `interval`.
    pub fn new(
        store: SharedJobStore,
        clock: SharedClock,
        threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            threshold,
            interval,
        }
    }

    /// Creates a detector from configuration.
    pub fn from_config(store: SharedJobStore, clock: SharedClock, config: &StallConfig) -> Self {
        Self::new(store, clock, config.threshold(), config.check_interval())
    }

    /// Heartbeat age after which a claim is considered lost.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Runs one sweep.
    pub async fn sweep_once(&self) -> JobResult<SweepReport> {
        let reclaimed = self.store.reclaim_stalled(self.threshold).await?;
        let now = self.clock.now();

        let mut report = SweepReport::default();
        for entry in &reclaimed {
            let requeued = entry.outcome.is_retry();
            let attempt = entry.outcome.attempts();

            JobEvent::new(
                JobEventKind::StallReclaimed {
                    previous_owner: entry.previous_owner.clone(),
                    requeued,
                },
                &entry.job,
                attempt,
                now,
            )
            .emit();

            if requeued {
                report.requeued += 1;
            } else {
                JobEvent::new(
                    JobEventKind::Failed {
                        error_class: error_class::WORKER_LOST.to_string(),
                    },
                    &entry.job,
                    attempt,
                    now,
                )
                .emit();
                report.exhausted += 1;
            }
            report.job_ids.push(entry.job.id);
        }

        if report.total() > 0 {
            info!(
                requeued = report.requeued,
                exhausted = report.exhausted,
                threshold_secs = self.threshold.as_secs(),
                "Reclaimed stalled jobs"
            );
        } else {
            debug!("No stalled jobs");
        }

        Ok(report)
    }

    /// Sweeps every interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "Starting stall detector"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "Stall sweep failed");
                    }
                }
            }
        }

        info!("Stall detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ExecutionError;
    use crate::job::{JobContext, JobStatus, NewJob};
    use crate::registry::{TaskDefinition, TaskHandler, TaskRegistry};
    use crate::retry::RetryPolicy;
    use crate::store::{InMemoryJobStore, JobStore};
    use futures::future::FutureExt;
    use serde_json::json;
    use std::sync::Arc;

    fn setup(max_attempts: u32) -> (Arc<InMemoryJobStore>, ManualClock, StallDetector) {
        let handler: TaskHandler = Arc::new(|_args: serde_json::Value, _ctx: JobContext| {
            async { Ok::<(), ExecutionError>(()) }.boxed()
        });
        let registry = Arc::new(
            TaskRegistry::builder()
                .register_fn(
                    TaskDefinition::new("fetch").retry(RetryPolicy::exponential(
                        max_attempts,
                        Duration::from_secs(1),
                        Duration::from_secs(60),
                    )),
                    handler,
                )
                .build()
                .unwrap(),
        );
        let clock = ManualClock::fixed();
        let store = Arc::new(InMemoryJobStore::new(registry, Arc::new(clock.clone())));
        let detector = StallDetector::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        (store, clock, detector)
    }

    fn queues() -> Vec<String> {
        vec!["default".to_string()]
    }

    #[tokio::test]
    async fn test_lapsed_claim_is_requeued() {
        let (store, clock, detector) = setup(3);
        let id = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();
        store.claim_next(&queues(), "w-1").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(61));
        let report = detector.sweep_once().await.unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(report.exhausted, 0);
        assert_eq!(report.job_ids, vec![id]);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.claim_owner, None);
        assert_eq!(job.last_error.unwrap().class, error_class::WORKER_LOST);
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_left_alone() {
        let (store, clock, detector) = setup(3);
        let id = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();
        store.claim_next(&queues(), "w-1").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(50));
        assert!(store.heartbeat(id, "w-1").await.unwrap());
        clock.advance(Duration::from_secs(50));

        assert_eq!(detector.sweep_once().await.unwrap(), SweepReport::default());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_exhausted_job_fails() {
        let (store, clock, detector) = setup(1);
        let id = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();
        store.claim_next(&queues(), "w-1").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(120));
        let report = detector.sweep_once().await.unwrap();
        assert_eq!(report.exhausted, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_repeated_sweeps_never_leave_job_in_progress() {
        let (store, clock, detector) = setup(2);
        let id = store.enqueue(NewJob::new("fetch", json!({}))).await.unwrap();

        for _ in 0..2 {
            clock.advance(Duration::from_secs(5));
            store.claim_next(&queues(), "w-1").await.unwrap().unwrap();
            clock.advance(Duration::from_secs(61));
            assert_eq!(detector.sweep_once().await.unwrap().total(), 1);
        }

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);

        // A second sweep has nothing left to do.
        assert_eq!(detector.sweep_once().await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (_store, _clock, detector) = setup(3);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { detector.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
