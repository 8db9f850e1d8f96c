//! Producer handle.
//!
//! [`JobQueue`] is the only write path into the queue from outside the
//! engine. It wraps a store and emits one lifecycle event per call.

use crate::clock::SharedClock;
use crate::error::{JobError, JobResult};
use crate::events::{JobEvent, JobEventKind};
use crate::job::{Job, JobId, JobStatus, NewJob, Schedule};
use crate::metrics::JobMetrics;
use crate::store::{QueueStats, SharedJobStore};
use crate::task::Task;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

/// Cloneable producer handle over a job store.
#[derive(Clone)]
pub struct JobQueue {
    store: SharedJobStore,
    clock: SharedClock,
}

impl JobQueue {
    /// Creates a handle.
    pub fn new(store: SharedJobStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &SharedJobStore {
        &self.store
    }

    /// Enqueues a job.
    ///
    /// A held lock key surfaces as [`JobError::DuplicateLock`]; callers that
    /// only want "at most one pending" semantics can treat it as success.
    pub async fn enqueue(&self, job: NewJob) -> JobResult<JobId> {
        let task_name = job.task_name.clone();
        let queue = job.queue.clone();
        let lock_key = job.lock_key.clone();

        match self.store.enqueue(job).await {
            Ok(id) => {
                JobEvent {
                    kind: JobEventKind::Enqueued,
                    job_id: Some(id),
                    task_name,
                    queue,
                    attempt: 0,
                    at: self.clock.now(),
                }
                .emit();
                Ok(id)
            }
            Err(err @ JobError::DuplicateLock { .. }) => {
                JobEvent {
                    kind: JobEventKind::Suppressed {
                        lock_key: lock_key.unwrap_or_default(),
                    },
                    job_id: None,
                    task_name,
                    queue,
                    attempt: 0,
                    at: self.clock.now(),
                }
                .emit();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Starts a builder for a typed task.
    pub fn task<T: Task>(&self, task: T) -> QueuedJob<'_, T> {
        QueuedJob::new(self, task)
    }

    /// Enqueues a typed task with default options.
    pub async fn enqueue_task<T: Task>(&self, task: T) -> JobResult<JobId> {
        self.task(task).send().await
    }

    /// Re-enqueues a failed or cancelled job as a fresh job.
    ///
    /// The original row is left untouched; the copy starts with zero
    /// attempts and keeps task, arguments, queue and lock key.
    pub async fn retry_failed(&self, job_id: JobId) -> JobResult<JobId> {
        let job = self.require(job_id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(JobError::InvalidState {
                expected: "failed or cancelled".to_string(),
                actual: job.status.to_string(),
            });
        }

        let mut copy = NewJob::new(job.task_name, job.arguments).queue(job.queue);
        copy.lock_key = job.lock_key;

        let new_id = self.enqueue(copy).await?;
        info!(job_id = %job_id, new_job_id = %new_id, "Re-enqueued job");
        Ok(new_id)
    }

    /// Cancels a pending job.
    pub async fn cancel(&self, job_id: JobId) -> JobResult<bool> {
        let job = self.require(job_id).await?;
        let cancelled = self.store.cancel(job_id).await?;
        if cancelled {
            JobEvent::new(JobEventKind::Cancelled, &job, job.attempts, self.clock.now()).emit();
        } else {
            debug!(job_id = %job_id, status = %job.status, "Cancel ignored for terminal job");
        }
        Ok(cancelled)
    }

    /// Point read.
    pub async fn get(&self, job_id: JobId) -> JobResult<Option<Job>> {
        self.store.get(job_id).await
    }

    /// Counts jobs per queue and status, refreshing the queue gauges.
    pub async fn stats(&self) -> JobResult<Vec<QueueStats>> {
        let stats = self.store.stats().await?;
        for queue in &stats {
            JobMetrics::update_queue_stats(queue);
        }
        Ok(stats)
    }

    /// Deletes terminal jobs older than `older_than`.
    pub async fn purge_terminal(&self, older_than: Duration) -> JobResult<u64> {
        let purged = self.store.purge_terminal(older_than).await?;
        if purged > 0 {
            JobMetrics::jobs_purged(purged);
            info!(purged, older_than_secs = older_than.as_secs(), "Purged terminal jobs");
        }
        Ok(purged)
    }

    async fn require(&self, job_id: JobId) -> JobResult<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }
}

/// Builder for enqueuing a typed task with options.
pub struct QueuedJob<'a, T: Task> {
    queue: &'a JobQueue,
    task: T,
    queue_name: String,
    schedule: Schedule,
    lock_key: Option<String>,
}

impl<'a, T: Task> QueuedJob<'a, T> {
    fn new(queue: &'a JobQueue, task: T) -> Self {
        Self {
            queue,
            task,
            queue_name: T::QUEUE.to_string(),
            schedule: Schedule::Now,
            lock_key: None,
        }
    }

    /// Set a delay before execution.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.schedule = Schedule::After(delay);
        self
    }

    /// Schedule for a specific time.
    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.schedule = Schedule::At(scheduled_at);
        self
    }

    /// Override the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = queue.into();
        self
    }

    /// Set the deduplication key.
    pub fn lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = Some(lock_key.into());
        self
    }

    /// Build the new job.
    pub fn build(self) -> JobResult<NewJob> {
        Ok(NewJob {
            task_name: T::NAME.to_string(),
            arguments: serde_json::to_value(&self.task)?,
            queue: self.queue_name,
            schedule: self.schedule,
            lock_key: self.lock_key,
        })
    }

    /// Enqueue the job.
    pub async fn send(self) -> JobResult<JobId> {
        let queue = self.queue;
        let job = self.build()?;
        queue.enqueue(job).await
    }
}
