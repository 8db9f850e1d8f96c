//! Cron scheduler for periodic tasks.
//!
//! Each periodic task enqueues an ordinary job whenever its cron schedule
//! fires. The job's arguments carry the fire time as `{"timestamp": <unix>}`
//! and its lock key is `periodic:{name}`, so a run that is still pending or
//! in progress suppresses the next one, in this process or any other.

use crate::clock::SharedClock;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, NewJob};
use crate::metrics::SchedulerMetrics;
use crate::queue::JobQueue;
use crate::task::Task;
use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Periodic task definition.
#[derive(Clone)]
pub struct PeriodicTask {
    /// Unique name for this periodic task.
    pub name: String,

    /// Cron expression.
    pub cron: String,

    /// Task enqueued when the schedule fires.
    pub task_name: String,

    /// Queue the job is enqueued on.
    pub queue: String,

    /// Is the task enabled.
    pub enabled: bool,

    /// Parsed cron schedule.
    schedule: Schedule,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("cron", &self.cron)
            .field("task_name", &self.task_name)
            .field("queue", &self.queue)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl PeriodicTask {
    /// Create a periodic task that enqueues `task_name` on the default queue.
    pub fn new(
        name: impl Into<String>,
        cron_expr: &str,
        task_name: impl Into<String>,
    ) -> JobResult<Self> {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|e| JobError::Configuration(format!("Invalid cron expression: {}", e)))?;

        Ok(Self {
            name: name.into(),
            cron: cron_expr.to_string(),
            task_name: task_name.into(),
            queue: crate::DEFAULT_QUEUE.to_string(),
            enabled: true,
            schedule,
        })
    }

    /// Create a periodic task for a typed task, on its declared queue.
    pub fn for_task<T: Task>(name: impl Into<String>, cron_expr: &str) -> JobResult<Self> {
        Ok(Self::new(name, cron_expr, T::NAME)?.queue(T::QUEUE))
    }

    /// Set the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set whether the task is enabled.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Calculate the next fire time strictly after `from`.
    pub fn next_run_from(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// Lock key shared by every run of this task.
    pub fn lock_key(&self) -> String {
        format!("periodic:{}", self.name)
    }

    /// The job enqueued for a fire at `fired_at`.
    pub fn job_for(&self, fired_at: DateTime<Utc>) -> NewJob {
        NewJob::new(
            self.task_name.clone(),
            serde_json::json!({ "timestamp": fired_at.timestamp() }),
        )
        .queue(self.queue.clone())
        .lock_key(self.lock_key())
    }
}

struct Entry {
    task: PeriodicTask,
    next_run: Option<DateTime<Utc>>,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Scheduler ID.
    pub id: String,

    /// Number of periodic tasks.
    pub periodic_tasks: usize,

    /// Jobs enqueued so far.
    pub jobs_triggered: u64,

    /// Fires skipped because the previous run still held the lock.
    pub jobs_suppressed: u64,
}

/// Cron scheduler over a job queue.
pub struct Scheduler {
    /// Unique scheduler ID.
    id: String,

    /// Producer handle.
    queue: JobQueue,

    /// Clock used for fire times.
    clock: SharedClock,

    /// How often due tasks are checked.
    poll_interval: Duration,

    /// Registered periodic tasks.
    tasks: RwLock<HashMap<String, Entry>>,

    /// Running flag.
    running: AtomicBool,

    /// Jobs triggered counter.
    jobs_triggered: AtomicU64,

    /// Suppressed fires counter.
    jobs_suppressed: AtomicU64,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(queue: JobQueue, clock: SharedClock, poll_interval: Duration) -> Self {
        Self {
            id: format!("scheduler-{}", Uuid::new_v4()),
            queue,
            clock,
            poll_interval,
            tasks: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            jobs_triggered: AtomicU64::new(0),
            jobs_suppressed: AtomicU64::new(0),
        }
    }

    /// Get scheduler ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a periodic task. Its first fire is the next cron time
    /// after now.
    pub fn register(&self, task: PeriodicTask) {
        let next_run = task.next_run_from(self.clock.now());
        info!(
            periodic = %task.name,
            cron = %task.cron,
            task = %task.task_name,
            next_run = ?next_run,
            "Registered periodic task"
        );
        self.tasks
            .write()
            .insert(task.name.clone(), Entry { task, next_run });
    }

    /// Register a periodic task from a cron expression.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        cron_expr: &str,
        task_name: impl Into<String>,
    ) -> JobResult<()> {
        self.register(PeriodicTask::new(name, cron_expr, task_name)?);
        Ok(())
    }

    /// Unregister a periodic task.
    pub fn unregister(&self, name: &str) -> Option<PeriodicTask> {
        self.tasks.write().remove(name).map(|entry| entry.task)
    }

    /// Enqueues every enabled task whose fire time has passed.
    ///
    /// Missed fires collapse into one. A held lock key skips the fire;
    /// other enqueue errors leave it due for the next tick.
    pub async fn tick(&self) -> JobResult<Vec<JobId>> {
        let now = self.clock.now();

        let due: Vec<(PeriodicTask, DateTime<Utc>)> = {
            let tasks = self.tasks.read();
            tasks
                .values()
                .filter(|entry| entry.task.enabled)
                .filter_map(|entry| match entry.next_run {
                    Some(at) if at <= now => Some((entry.task.clone(), at)),
                    _ => None,
                })
                .collect()
        };

        let mut enqueued = Vec::with_capacity(due.len());
        for (task, fired_at) in due {
            let advance = match self.queue.enqueue(task.job_for(fired_at)).await {
                Ok(job_id) => {
                    debug!(periodic = %task.name, job_id = %job_id, "Enqueued periodic task");
                    SchedulerMetrics::job_triggered(&self.id, &task.name);
                    self.jobs_triggered.fetch_add(1, Ordering::Relaxed);
                    enqueued.push(job_id);
                    true
                }
                Err(JobError::DuplicateLock { .. }) => {
                    info!(periodic = %task.name, "Previous run still live, skipping");
                    self.jobs_suppressed.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(e) => {
                    error!(periodic = %task.name, error = %e, "Failed to enqueue periodic task");
                    false
                }
            };

            if advance {
                if let Some(entry) = self.tasks.write().get_mut(&task.name) {
                    entry.next_run = entry.task.next_run_from(now);
                }
            }
        }

        Ok(enqueued)
    }

    /// Ticks every poll interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Scheduler already running".to_string()));
        }

        info!(
            scheduler_id = %self.id,
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            periodic_tasks = self.tasks.read().len(),
            "Starting scheduler"
        );

        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(scheduler_id = %self.id, "Received shutdown signal");
                    break;
                }

                _ = poll.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Failed to check periodic tasks");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(scheduler_id = %self.id, "Scheduler stopped");

        Ok(())
    }

    /// Enqueue a periodic task immediately, outside its schedule.
    pub async fn trigger(&self, name: &str) -> JobResult<JobId> {
        let task = self
            .tasks
            .read()
            .get(name)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| JobError::Configuration(format!("Periodic task not found: {}", name)))?;

        self.queue.enqueue(task.job_for(self.clock.now())).await
    }

    /// Get scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            id: self.id.clone(),
            periodic_tasks: self.tasks.read().len(),
            jobs_triggered: self.jobs_triggered.load(Ordering::Relaxed),
            jobs_suppressed: self.jobs_suppressed.load(Ordering::Relaxed),
        }
    }

    /// List all registered periodic tasks, sorted by name.
    pub fn list_tasks(&self) -> Vec<PeriodicTaskInfo> {
        let mut tasks: Vec<PeriodicTaskInfo> = self
            .tasks
            .read()
            .values()
            .map(|entry| PeriodicTaskInfo {
                name: entry.task.name.clone(),
                cron: entry.task.cron.clone(),
                task_name: entry.task.task_name.clone(),
                queue: entry.task.queue.clone(),
                enabled: entry.task.enabled,
                next_run: entry.next_run,
            })
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Enable a periodic task.
    pub fn enable_task(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Disable a periodic task.
    pub fn disable_task(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        if let Some(entry) = self.tasks.write().get_mut(name) {
            entry.task.enabled = enabled;
            true
        } else {
            false
        }
    }
}

/// Information about a periodic task.
#[derive(Debug, Clone)]
pub struct PeriodicTaskInfo {
    /// Periodic task name.
    pub name: String,

    /// Cron expression.
    pub cron: String,

    /// Task enqueued on fire.
    pub task_name: String,

    /// Target queue.
    pub queue: String,

    /// Is enabled.
    pub enabled: bool,

    /// Next fire time.
    pub next_run: Option<DateTime<Utc>>,
}

/// Common cron expressions.
pub mod cron_expressions {
    /// Every minute.
    pub const EVERY_MINUTE: &str = "0 * * * * *";

    /// Every 5 minutes.
    pub const EVERY_5_MINUTES: &str = "0 */5 * * * *";

    /// Every 10 minutes.
    pub const EVERY_10_MINUTES: &str = "0 */10 * * * *";

    /// Every hour.
    pub const EVERY_HOUR: &str = "0 0 * * * *";

    /// Every day at midnight.
    pub const DAILY_MIDNIGHT: &str = "0 0 0 * * *";

    /// Every Monday at midnight.
    pub const WEEKLY_MONDAY: &str = "0 0 0 * * MON";
}
