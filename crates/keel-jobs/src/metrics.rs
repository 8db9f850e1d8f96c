//! Prometheus metrics for job queue monitoring.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job queue system.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "keel_jobs_enqueued_total";
    /// Total enqueues suppressed by a held lock key.
    pub const JOBS_SUPPRESSED_TOTAL: &str = "keel_jobs_suppressed_total";
    /// Total jobs claimed by a worker.
    pub const JOBS_CLAIMED_TOTAL: &str = "keel_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "keel_jobs_succeeded_total";
    /// Total failed attempts rescheduled for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "keel_jobs_retried_total";
    /// Total jobs that reached terminal failure.
    pub const JOBS_FAILED_TOTAL: &str = "keel_jobs_failed_total";
    /// Total jobs reclaimed from silent workers.
    pub const JOBS_STALL_RECLAIMED_TOTAL: &str = "keel_jobs_stall_reclaimed_total";
    /// Total jobs cancelled.
    pub const JOBS_CANCELLED_TOTAL: &str = "keel_jobs_cancelled_total";
    /// Total terminal jobs deleted by retention.
    pub const JOBS_PURGED_TOTAL: &str = "keel_jobs_purged_total";

    /// Current jobs per queue and status.
    pub const JOBS: &str = "keel_jobs";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "keel_job_duration_seconds";
    /// Time between `scheduled_at` and claim, in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "keel_job_wait_time_seconds";

    /// Workers currently executing a job.
    pub const WORKERS_BUSY: &str = "keel_workers_busy";
    /// Worker pool concurrency.
    pub const WORKERS_CONCURRENCY: &str = "keel_workers_concurrency";
    /// Failed store calls made by workers.
    pub const WORKER_STORE_ERRORS_TOTAL: &str = keel_resilience::STORE_ERRORS_TOTAL;

    /// Periodic tasks enqueued by the scheduler.
    pub const SCHEDULER_JOBS_TRIGGERED: &str = "keel_scheduler_jobs_triggered_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_SUPPRESSED_TOTAL,
        "Total number of enqueues rejected because the lock key was held"
    );
    describe_counter!(names::JOBS_CLAIMED_TOTAL, "Total number of jobs claimed by workers");
    describe_counter!(
        names::JOBS_SUCCEEDED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed attempts rescheduled"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that failed terminally"
    );
    describe_counter!(
        names::JOBS_STALL_RECLAIMED_TOTAL,
        "Total number of jobs reclaimed from workers that stopped heartbeating"
    );
    describe_counter!(names::JOBS_CANCELLED_TOTAL, "Total number of jobs cancelled");
    describe_counter!(
        names::JOBS_PURGED_TOTAL,
        "Total number of terminal jobs deleted by retention"
    );

    describe_gauge!(names::JOBS, "Current number of jobs by queue and status");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Delay between a job becoming ready and being claimed, in seconds"
    );

    describe_gauge!(names::WORKERS_BUSY, "Number of workers executing a job");
    describe_gauge!(
        names::WORKERS_CONCURRENCY,
        "Worker pool concurrency setting"
    );
    describe_counter!(
        names::WORKER_STORE_ERRORS_TOTAL,
        "Store calls that failed, by operation"
    );

    describe_counter!(
        names::SCHEDULER_JOBS_TRIGGERED,
        "Total number of periodic tasks enqueued"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, task: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .increment(1);
    }

    /// Record an enqueue suppressed by a lock key.
    pub fn job_suppressed(queue: &str, task: &str) {
        counter!(
            names::JOBS_SUPPRESSED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .increment(1);
    }

    /// Record a job claimed.
    pub fn job_claimed(queue: &str, task: &str, wait_time: Duration) {
        counter!(
            names::JOBS_CLAIMED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_WAIT_TIME_SECONDS,
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .record(wait_time.as_secs_f64());
    }

    /// Record a job completed.
    pub fn job_succeeded(queue: &str, task: &str, duration: Duration) {
        counter!(
            names::JOBS_SUCCEEDED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "task" => task.to_string(),
            "status" => "succeeded"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt that will be retried.
    pub fn job_retried(queue: &str, task: &str, error_class: &str) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string(),
            "error_class" => error_class.to_string()
        )
        .increment(1);
    }

    /// Record a terminal failure.
    pub fn job_failed(queue: &str, task: &str, error_class: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string(),
            "error_class" => error_class.to_string()
        )
        .increment(1);
    }

    /// Record an attempt's duration when it did not succeed.
    pub fn attempt_failed(queue: &str, task: &str, duration: Duration) {
        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "task" => task.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job reclaimed from a silent worker.
    pub fn job_stall_reclaimed(queue: &str, task: &str) {
        counter!(
            names::JOBS_STALL_RECLAIMED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .increment(1);
    }

    /// Record a job cancelled.
    pub fn job_cancelled(queue: &str, task: &str) {
        counter!(
            names::JOBS_CANCELLED_TOTAL,
            "queue" => queue.to_string(),
            "task" => task.to_string()
        )
        .increment(1);
    }

    /// Record terminal jobs purged.
    pub fn jobs_purged(count: u64) {
        counter!(names::JOBS_PURGED_TOTAL).increment(count);
    }

    /// Update the per-queue status gauges.
    pub fn update_queue_stats(stats: &crate::store::QueueStats) {
        for (status, count) in [
            ("pending", stats.pending),
            ("in_progress", stats.in_progress),
            ("succeeded", stats.succeeded),
            ("failed", stats.failed),
            ("cancelled", stats.cancelled),
        ] {
            gauge!(
                names::JOBS,
                "queue" => stats.queue.clone(),
                "status" => status
            )
            .set(count as f64);
        }
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Set the pool's configured concurrency.
    pub fn set_concurrency(pool_id: &str, concurrency: usize) {
        gauge!(
            names::WORKERS_CONCURRENCY,
            "pool_id" => pool_id.to_string()
        )
        .set(concurrency as f64);
    }

    /// A worker started executing a job.
    pub fn worker_busy(pool_id: &str) {
        gauge!(names::WORKERS_BUSY, "pool_id" => pool_id.to_string()).increment(1.0);
    }

    /// A worker finished executing a job.
    pub fn worker_idle(pool_id: &str) {
        gauge!(names::WORKERS_BUSY, "pool_id" => pool_id.to_string()).decrement(1.0);
    }
}

/// Scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a periodic task enqueued.
    pub fn job_triggered(scheduler_id: &str, periodic_name: &str) {
        counter!(
            names::SCHEDULER_JOBS_TRIGGERED,
            "scheduler_id" => scheduler_id.to_string(),
            "periodic" => periodic_name.to_string()
        )
        .increment(1);
    }
}
