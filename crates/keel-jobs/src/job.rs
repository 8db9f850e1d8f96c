//! Job records and execution context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Unique, monotonically assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Returns the raw identifier.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` and a free worker.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Gave up after exhausting attempts or on a non-retryable error.
    Failed,
    /// Withdrawn before it ran.
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns the storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true for statuses that hold a lock key.
    pub fn is_live(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }

    /// Returns true once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{s}'"))
    }
}

/// Classification and message of the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Error class, as matched by retry policies.
    pub class: String,
    /// Failure detail.
    pub message: String,
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,
    /// Registry key of the task to run.
    pub task_name: String,
    /// Serialized task arguments.
    pub arguments: serde_json::Value,
    /// Queue partition.
    pub queue: String,
    /// Current status.
    pub status: JobStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last heartbeat from the claim owner.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Worker holding the claim.
    pub claim_owner: Option<String>,
    /// Most recent failure.
    pub last_error: Option<LastError>,
    /// Deduplication key.
    pub lock_key: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Returns true if `worker_id` currently holds the claim.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::InProgress && self.claim_owner.as_deref() == Some(worker_id)
    }

    pub(crate) fn clear_claim(&mut self) {
        self.claimed_at = None;
        self.heartbeat_at = None;
        self.claim_owner = None;
    }
}

/// When a new job becomes claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// As soon as a worker is free.
    #[default]
    Now,
    /// After a delay measured from the store's clock at insertion.
    After(Duration),
    /// At an absolute time.
    At(DateTime<Utc>),
}

impl Schedule {
    /// Resolves the schedule against `now`.
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Now => now,
            Schedule::After(delay) => crate::clock::add_duration(now, delay),
            Schedule::At(at) => at,
        }
    }
}

/// A job about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Registry key of the task to run.
    pub task_name: String,
    /// Serialized task arguments.
    pub arguments: serde_json::Value,
    /// Queue partition.
    pub queue: String,
    /// When the job becomes claimable.
    pub schedule: Schedule,
    /// Deduplication key.
    pub lock_key: Option<String>,
}

impl NewJob {
    /// Creates a job for the default queue, claimable immediately.
    pub fn new(task_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            task_name: task_name.into(),
            arguments,
            queue: crate::DEFAULT_QUEUE.to_string(),
            schedule: Schedule::Now,
            lock_key: None,
        }
    }

    /// Sets the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Delays the first claim.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.schedule = Schedule::After(delay);
        self
    }

    /// Schedules the first claim at an absolute time.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Schedule::At(at);
        self
    }

    /// Sets the deduplication key.
    pub fn lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = Some(lock_key.into());
        self
    }
}

/// Context handed to a task executor for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Task name.
    pub task_name: String,

    /// Queue name.
    pub queue: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum attempts allowed.
    pub max_attempts: u32,

    /// Worker ID processing this job.
    pub worker_id: String,

    /// Job was scheduled at this time.
    pub scheduled_at: DateTime<Utc>,

    /// Job started executing at this time.
    pub started_at: DateTime<Utc>,

    cancellation: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        max_attempts: u32,
        worker_id: &str,
        started_at: DateTime<Utc>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            task_name: job.task_name.clone(),
            queue: job.queue.clone(),
            attempt: job.attempts + 1,
            max_attempts,
            worker_id: worker_id.to_string(),
            scheduled_at: job.scheduled_at,
            started_at,
            cancellation,
        }
    }

    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Returns true once the attempt has been cancelled (timeout, lost
    /// claim or shutdown).
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the attempt is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    /// Returns the attempt's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}
