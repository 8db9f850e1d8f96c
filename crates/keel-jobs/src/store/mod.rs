//! Job store abstraction.
//!
//! The store is the only shared mutable state in the system. Every
//! transition is a single atomic conditional update, so any number of
//! workers and stall detectors may race against it.

mod memory;

pub use memory::InMemoryJobStore;

use crate::error::{ExecutionError, JobResult};
use crate::job::{Job, JobId, JobStatus, LastError, NewJob};
use crate::retry::{RetryDecision, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Result of a failed attempt, as applied by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `pending`, claimable again at `scheduled_at`.
    Retried {
        attempts: u32,
        delay: Duration,
        scheduled_at: DateTime<Utc>,
    },
    /// Terminal `failed`.
    Failed { attempts: u32 },
}

impl FailOutcome {
    /// Attempt count after the failure.
    pub fn attempts(self) -> u32 {
        match self {
            FailOutcome::Retried { attempts, .. } | FailOutcome::Failed { attempts } => attempts,
        }
    }

    /// Returns true if the job will run again.
    pub fn is_retry(self) -> bool {
        matches!(self, FailOutcome::Retried { .. })
    }
}

/// A job taken back from a silent worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedJob {
    /// The job after reclamation.
    pub job: Job,
    /// The worker that lost the claim.
    pub previous_owner: Option<String>,
    /// How the synthetic failure was applied.
    pub outcome: FailOutcome,
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,
    /// Jobs waiting to run, including delayed ones.
    pub pending: u64,
    /// Jobs claimed by a worker.
    pub in_progress: u64,
    /// Jobs that finished successfully.
    pub succeeded: u64,
    /// Jobs that gave up.
    pub failed: u64,
    /// Jobs withdrawn before running.
    pub cancelled: u64,
}

impl QueueStats {
    pub(crate) fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::InProgress => self.in_progress += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    /// Total jobs in the queue.
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.succeeded + self.failed + self.cancelled
    }
}

/// Durable job storage.
///
/// Timestamps are taken from the store's clock. `heartbeat`, `complete`
/// and `fail` only act while `worker_id` still owns the claim; a late call
/// from a worker whose claim was reclaimed is a silent no-op.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a pending job.
    ///
    /// Fails with [`JobError::DuplicateLock`](crate::JobError::DuplicateLock)
    /// when a live job already holds the lock key.
    async fn enqueue(&self, job: NewJob) -> JobResult<JobId>;

    /// Claims the earliest ready job across `queues`, ordered by
    /// `(scheduled_at, id)`.
    async fn claim_next(&self, queues: &[String], worker_id: &str) -> JobResult<Option<Job>>;

    /// Refreshes `heartbeat_at`. Returns false if the claim is gone.
    async fn heartbeat(&self, job_id: JobId, worker_id: &str) -> JobResult<bool>;

    /// Marks the job succeeded. Returns false if the claim is gone.
    async fn complete(&self, job_id: JobId, worker_id: &str) -> JobResult<bool>;

    /// Applies a failed attempt through the task's retry policy.
    /// Returns `None` if the claim is gone.
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &ExecutionError,
    ) -> JobResult<Option<FailOutcome>>;

    /// Fails every in-progress job whose heartbeat is older than
    /// `threshold` with a `worker_lost` error.
    async fn reclaim_stalled(&self, threshold: Duration) -> JobResult<Vec<ReclaimedJob>>;

    /// Point read.
    async fn get(&self, job_id: JobId) -> JobResult<Option<Job>>;

    /// Cancels a pending job.
    ///
    /// Returns false for jobs that are already terminal and fails with
    /// `InvalidState` for jobs in progress.
    async fn cancel(&self, job_id: JobId) -> JobResult<bool>;

    /// Deletes terminal jobs whose last transition is older than
    /// `older_than`. Returns the number deleted.
    async fn purge_terminal(&self, older_than: Duration) -> JobResult<u64>;

    /// Counts jobs per queue and status.
    async fn stats(&self) -> JobResult<Vec<QueueStats>>;

    /// Checks that the store is reachable.
    async fn health_check(&self) -> JobResult<()>;

    /// Waits until new work may be available or `max_wait` elapses.
    async fn wait_for_jobs(&self, max_wait: Duration);
}

/// Shared store handle.
pub type SharedJobStore = Arc<dyn JobStore>;

/// Applies a failed attempt to `job` in place.
///
/// Attempts always increase by one. Unknown tasks and undecodable
/// arguments stop immediately regardless of policy.
pub(crate) fn apply_failure(
    job: &mut Job,
    policy: &RetryPolicy,
    error: &ExecutionError,
    now: DateTime<Utc>,
) -> FailOutcome {
    let attempts = job.attempts.saturating_add(1);
    let decision = if error.is_always_terminal() {
        RetryDecision::Stop
    } else {
        policy.decide_after_attempt(attempts, &error.class)
    };

    job.attempts = attempts;
    job.last_error = Some(LastError {
        class: error.class.clone(),
        message: error.message.clone(),
    });
    job.clear_claim();
    job.updated_at = now;

    match decision {
        RetryDecision::Retry { delay } => {
            let scheduled_at = crate::clock::add_duration(now, delay);
            job.status = JobStatus::Pending;
            job.scheduled_at = scheduled_at;
            FailOutcome::Retried {
                attempts,
                delay,
                scheduled_at,
            }
        }
        RetryDecision::Stop => {
            job.status = JobStatus::Failed;
            FailOutcome::Failed { attempts }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn claimed_job(now: DateTime<Utc>, attempts: u32) -> Job {
        Job {
            id: JobId::from(1),
            task_name: "t".into(),
            arguments: serde_json::json!({}),
            queue: "default".into(),
            status: JobStatus::InProgress,
            attempts,
            scheduled_at: now,
            claimed_at: Some(now),
            heartbeat_at: Some(now),
            claim_owner: Some("w".into()),
            last_error: None,
            lock_key: Some("k".into()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_apply_failure_reschedules() {
        let now = ManualClock::fixed().now();
        let mut job = claimed_job(now, 0);
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10));

        let outcome = apply_failure(&mut job, &policy, &ExecutionError::new("io", "reset"), now);

        assert_eq!(
            outcome,
            FailOutcome::Retried {
                attempts: 1,
                delay: Duration::from_secs(1),
                scheduled_at: now + chrono::Duration::seconds(1),
            }
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.claim_owner, None);
        assert_eq!(job.heartbeat_at, None);
        assert_eq!(job.last_error.as_ref().unwrap().class, "io");
        assert_eq!(job.lock_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_apply_failure_exhausts() {
        let now = ManualClock::fixed().now();
        let mut job = claimed_job(now, 2);
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10));

        let outcome = apply_failure(&mut job, &policy, &ExecutionError::new("io", "reset"), now);

        assert_eq!(outcome, FailOutcome::Failed { attempts: 3 });
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
    }

    #[test]
    fn test_unknown_task_is_terminal_even_with_attempts_left() {
        let now = ManualClock::fixed().now();
        let mut job = claimed_job(now, 0);
        let outcome = apply_failure(
            &mut job,
            &RetryPolicy::default(),
            &ExecutionError::unknown_task("t"),
            now,
        );
        assert_eq!(outcome, FailOutcome::Failed { attempts: 1 });
    }

    #[test]
    fn test_queue_stats_total() {
        let mut stats = QueueStats::new("default");
        stats.add(JobStatus::Pending, 2);
        stats.add(JobStatus::Failed, 1);
        stats.add(JobStatus::Succeeded, 4);
        assert_eq!(stats.total(), 7);
        assert_eq!(stats.pending, 2);
    }
}
