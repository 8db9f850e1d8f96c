//! Structured job lifecycle events.
//!
//! One event per state transition, logged under the `keel::events` target
//! with the job id, task, attempt number and timestamp, and mirrored into
//! the metrics in [`crate::metrics`].

use crate::job::{Job, JobId};
use crate::metrics::JobMetrics;
use crate::store::FailOutcome;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

/// Log target for lifecycle events.
pub const EVENT_TARGET: &str = "keel::events";

/// What happened to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    /// Inserted as pending.
    Enqueued,
    /// Rejected because a live job holds the lock key.
    Suppressed { lock_key: String },
    /// Claimed by a worker.
    Claimed { worker_id: String },
    /// Finished successfully.
    Succeeded { duration: Duration },
    /// Attempt failed; rescheduled after `delay`.
    Retried {
        delay: Duration,
        error_class: String,
    },
    /// Attempt failed; no more retries.
    Failed { error_class: String },
    /// Claim taken back from a silent worker.
    StallReclaimed {
        previous_owner: Option<String>,
        requeued: bool,
    },
    /// Withdrawn before running.
    Cancelled,
}

impl JobEventKind {
    /// Short event name.
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Enqueued => "enqueued",
            JobEventKind::Suppressed { .. } => "suppressed",
            JobEventKind::Claimed { .. } => "claimed",
            JobEventKind::Succeeded { .. } => "succeeded",
            JobEventKind::Retried { .. } => "retried",
            JobEventKind::Failed { .. } => "failed",
            JobEventKind::StallReclaimed { .. } => "stall_reclaimed",
            JobEventKind::Cancelled => "cancelled",
        }
    }

    /// Maps a failure outcome to the matching event.
    pub fn from_outcome(outcome: FailOutcome, error_class: &str) -> Self {
        match outcome {
            FailOutcome::Retried { delay, .. } => JobEventKind::Retried {
                delay,
                error_class: error_class.to_string(),
            },
            FailOutcome::Failed { .. } => JobEventKind::Failed {
                error_class: error_class.to_string(),
            },
        }
    }
}

/// A job lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    /// Transition.
    pub kind: JobEventKind,
    /// Job ID. `None` for suppressed enqueues, which never got one.
    pub job_id: Option<JobId>,
    /// Task name.
    pub task_name: String,
    /// Queue name.
    pub queue: String,
    /// Attempt number the event refers to.
    pub attempt: u32,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl JobEvent {
    /// Creates an event for an existing job.
    pub fn new(kind: JobEventKind, job: &Job, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            job_id: Some(job.id),
            task_name: job.task_name.clone(),
            queue: job.queue.clone(),
            attempt,
            at,
        }
    }

    /// Logs the event and records its metric.
    pub fn emit(&self) {
        let job_id = self.job_id.map(JobId::get);
        let task = self.task_name.as_str();
        let queue = self.queue.as_str();
        let timestamp = self.at.to_rfc3339();

        match &self.kind {
            JobEventKind::Enqueued => {
                JobMetrics::job_enqueued(queue, task);
                info!(target: EVENT_TARGET, event = "enqueued", job_id, task, queue, attempt = self.attempt, %timestamp, "Job enqueued");
            }
            JobEventKind::Suppressed { lock_key } => {
                JobMetrics::job_suppressed(queue, task);
                info!(target: EVENT_TARGET, event = "suppressed", task, queue, lock_key = %lock_key, %timestamp, "Job suppressed by lock key");
            }
            JobEventKind::Claimed { worker_id } => {
                info!(target: EVENT_TARGET, event = "claimed", job_id, task, queue, attempt = self.attempt, worker_id = %worker_id, %timestamp, "Job claimed");
            }
            JobEventKind::Succeeded { duration } => {
                JobMetrics::job_succeeded(queue, task, *duration);
                info!(target: EVENT_TARGET, event = "succeeded", job_id, task, queue, attempt = self.attempt, duration_ms = duration.as_millis() as u64, %timestamp, "Job succeeded");
            }
            JobEventKind::Retried { delay, error_class } => {
                JobMetrics::job_retried(queue, task, error_class);
                warn!(target: EVENT_TARGET, event = "retried", job_id, task, queue, attempt = self.attempt, delay_secs = delay.as_secs_f64(), error_class = %error_class, %timestamp, "Job attempt failed, retry scheduled");
            }
            JobEventKind::Failed { error_class } => {
                JobMetrics::job_failed(queue, task, error_class);
                warn!(target: EVENT_TARGET, event = "failed", job_id, task, queue, attempt = self.attempt, error_class = %error_class, %timestamp, "Job failed");
            }
            JobEventKind::StallReclaimed {
                previous_owner,
                requeued,
            } => {
                JobMetrics::job_stall_reclaimed(queue, task);
                warn!(target: EVENT_TARGET, event = "stall_reclaimed", job_id, task, queue, attempt = self.attempt, previous_owner = ?previous_owner, requeued, %timestamp, "Stalled job reclaimed");
            }
            JobEventKind::Cancelled => {
                JobMetrics::job_cancelled(queue, task);
                info!(target: EVENT_TARGET, event = "cancelled", job_id, task, queue, attempt = self.attempt, %timestamp, "Job cancelled");
            }
        }
    }
}
