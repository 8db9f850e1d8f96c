//! In-process job store.
//!
//! Keeps every job behind one mutex, which makes each operation trivially
//! atomic. Used for tests and single-process deployments (`memory://`).

use super::{apply_failure, FailOutcome, JobStore, QueueStats, ReclaimedJob};
use crate::clock::{sub_duration, SharedClock};
use crate::error::{ExecutionError, JobError, JobResult};
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::registry::TaskRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
    /// Lock keys held by live jobs.
    locks: HashMap<String, JobId>,
}

impl State {
    fn release_lock(&mut self, job: &Job) {
        if let Some(key) = &job.lock_key {
            if self.locks.get(key) == Some(&job.id) {
                self.locks.remove(key);
            }
        }
    }
}

/// Job store held in memory.
pub struct InMemoryJobStore {
    state: Mutex<State>,
    registry: Arc<TaskRegistry>,
    clock: SharedClock,
    notify: Notify,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    pub fn new(registry: Arc<TaskRegistry>, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            registry,
            clock,
            notify: Notify::new(),
        }
    }

    /// Number of jobs held, in any status.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Returns true if the store holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> JobResult<JobId> {
        let now = self.clock.now();
        let id = {
            let mut state = self.state.lock();

            if let Some(key) = &new_job.lock_key {
                if state.locks.contains_key(key) {
                    return Err(JobError::DuplicateLock {
                        lock_key: key.clone(),
                    });
                }
            }

            let id = JobId::from(state.next_id);
            state.next_id += 1;

            if let Some(key) = &new_job.lock_key {
                state.locks.insert(key.clone(), id);
            }

            state.jobs.insert(
                id,
                Job {
                    id,
                    task_name: new_job.task_name,
                    arguments: new_job.arguments,
                    queue: new_job.queue,
                    status: JobStatus::Pending,
                    attempts: 0,
                    scheduled_at: new_job.schedule.resolve(now),
                    claimed_at: None,
                    heartbeat_at: None,
                    claim_owner: None,
                    last_error: None,
                    lock_key: new_job.lock_key,
                    created_at: now,
                    updated_at: now,
                },
            );
            id
        };

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim_next(&self, queues: &[String], worker_id: &str) -> JobResult<Option<Job>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let next = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.scheduled_at <= now
                    && queues.iter().any(|q| *q == job.queue)
            })
            .min_by_key(|job| (job.scheduled_at, job.id))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::InProgress;
        job.claimed_at = Some(now);
        job.heartbeat_at = Some(now);
        job.claim_owner = Some(worker_id.to_string());
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: JobId, worker_id: &str) -> JobResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.is_claimed_by(worker_id) => {
                job.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, job_id: JobId, worker_id: &str) -> JobResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !job.is_claimed_by(worker_id) {
            debug!(job_id = %job_id, worker_id, "Discarding late completion");
            return Ok(false);
        }

        job.status = JobStatus::Succeeded;
        job.attempts = job.attempts.saturating_add(1);
        job.clear_claim();
        job.updated_at = now;

        let job = job.clone();
        state.release_lock(&job);
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &ExecutionError,
    ) -> JobResult<Option<FailOutcome>> {
        let now = self.clock.now();
        let outcome = {
            let mut state = self.state.lock();

            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if !job.is_claimed_by(worker_id) {
                debug!(job_id = %job_id, worker_id, "Discarding late failure");
                return Ok(None);
            }

            let policy = self.registry.retry_policy(&job.task_name);
            let outcome = apply_failure(job, &policy, error, now);
            if !outcome.is_retry() {
                let job = job.clone();
                state.release_lock(&job);
            }
            outcome
        };

        if outcome.is_retry() {
            self.notify.notify_waiters();
        }
        Ok(Some(outcome))
    }

    async fn reclaim_stalled(&self, threshold: Duration) -> JobResult<Vec<ReclaimedJob>> {
        let now = self.clock.now();
        let cutoff = sub_duration(now, threshold);
        let error = ExecutionError::worker_lost();

        let reclaimed = {
            let mut state = self.state.lock();

            let stalled: Vec<JobId> = state
                .jobs
                .values()
                .filter(|job| {
                    job.status == JobStatus::InProgress
                        && job.heartbeat_at.map_or(true, |beat| beat < cutoff)
                })
                .map(|job| job.id)
                .collect();

            let mut reclaimed = Vec::with_capacity(stalled.len());
            for id in stalled {
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                let previous_owner = job.claim_owner.clone();
                let policy = self.registry.retry_policy(&job.task_name);
                let outcome = apply_failure(job, &policy, &error, now);
                let job = job.clone();
                if !outcome.is_retry() {
                    state.release_lock(&job);
                }
                reclaimed.push(ReclaimedJob {
                    job,
                    previous_owner,
                    outcome,
                });
            }
            reclaimed
        };

        if reclaimed.iter().any(|r| r.outcome.is_retry()) {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn get(&self, job_id: JobId) -> JobResult<Option<Job>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn cancel(&self, job_id: JobId) -> JobResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Err(JobError::NotFound(job_id));
        };

        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.updated_at = now;
                let job = job.clone();
                state.release_lock(&job);
                Ok(true)
            }
            JobStatus::InProgress => Err(JobError::InvalidState {
                expected: JobStatus::Pending.to_string(),
                actual: job.status.to_string(),
            }),
            _ => Ok(false),
        }
    }

    async fn purge_terminal(&self, older_than: Duration) -> JobResult<u64> {
        let cutoff = sub_duration(self.clock.now(), older_than);
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn stats(&self) -> JobResult<Vec<QueueStats>> {
        let state = self.state.lock();
        let mut by_queue: BTreeMap<&str, QueueStats> = BTreeMap::new();
        for job in state.jobs.values() {
            by_queue
                .entry(job.queue.as_str())
                .or_insert_with(|| QueueStats::new(job.queue.as_str()))
                .add(job.status, 1);
        }
        Ok(by_queue.into_values().collect())
    }

    async fn health_check(&self) -> JobResult<()> {
        Ok(())
    }

    async fn wait_for_jobs(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
