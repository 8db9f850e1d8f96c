//! Worker loop and worker pool.
//!
//! A [`Worker`] claims one job at a time, runs its executor on a spawned
//! task under the task's execution timeout, heartbeats while it runs and
//! reports the outcome back to the store. A [`WorkerPool`] runs
//! `concurrency` workers against the same store and coordinates shutdown.

use crate::clock::SharedClock;
use crate::error::{ExecutionError, JobError, JobResult};
use crate::events::{JobEvent, JobEventKind};
use crate::job::{Job, JobContext};
use crate::metrics::{names, JobMetrics, WorkerMetrics};
use crate::registry::{RegisteredTask, TaskRegistry};
use crate::store::{FailOutcome, SharedJobStore};
use keel_config::WorkerConfig;
use keel_resilience::{with_timeout, StoreRetry};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,

    /// Queues to claim from.
    pub queues: Vec<String>,

    /// Longest wait for new work before polling again.
    pub poll_interval: Duration,

    /// Heartbeat interval while a job runs.
    pub heartbeat_interval: Duration,

    /// How long a cancelled executor may take to exit.
    pub cancel_grace: Duration,

    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,

    /// Pause between retries of a failed store call.
    pub store_retry_interval: Duration,

    /// Deadline for a single store call.
    pub store_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            queues: config.queues.clone(),
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            cancel_grace: config.cancel_grace(),
            shutdown_timeout: config.shutdown_timeout(),
            store_retry_interval: config.store_retry_interval(),
            store_timeout: config.store_timeout(),
        }
    }
}

/// What one worker iteration did with the job it claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Marked succeeded.
    Succeeded,
    /// Failed and rescheduled.
    Retried { delay: Duration },
    /// Failed terminally.
    Failed,
    /// Not reported. The claim was lost, or the executor did not exit
    /// after cancellation and the job is left to the stall detector.
    Abandoned,
}

/// How the executor run ended, before anything is reported.
enum Execution {
    Finished(Result<(), ExecutionError>),
    /// Heartbeat found the claim gone.
    ClaimLost,
    /// Timed out and ignored cancellation.
    Detached,
    /// Shutdown deadline passed.
    Interrupted,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// A single worker loop.
pub struct Worker {
    id: String,
    pool_id: String,
    store: SharedJobStore,
    registry: Arc<TaskRegistry>,
    clock: SharedClock,
    config: WorkerPoolConfig,
    retry: StoreRetry,
    /// Stops claiming new jobs.
    shutdown: CancellationToken,
    /// Cancels running executors.
    abort: CancellationToken,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    /// Create a standalone worker.
    pub fn new(
        id: impl Into<String>,
        store: SharedJobStore,
        registry: Arc<TaskRegistry>,
        clock: SharedClock,
        config: WorkerPoolConfig,
    ) -> Self {
        let id = id.into();
        let retry = StoreRetry::new(config.store_retry_interval, config.store_timeout);
        Self {
            pool_id: id.clone(),
            id,
            store,
            registry,
            clock,
            config,
            retry,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            counters: Arc::default(),
        }
    }

    /// Worker ID, recorded as `claim_owner` on claimed jobs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that stops the loop after the current job.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token that cancels the running executor.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Runs until the shutdown token fires.
    pub async fn run(&self) {
        info!(worker_id = %self.id, queues = ?self.config.queues, "Worker started");

        while !self.shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = self.store.wait_for_jobs(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    error!(worker_id = %self.id, error = %err, "Worker iteration failed");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.store_retry_interval) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claims and processes at most one job.
    ///
    /// Returns `Ok(None)` when nothing is ready. Errors are store faults
    /// that outlived the store-call retry.
    pub async fn run_once(&self) -> JobResult<Option<AttemptOutcome>> {
        let claimed = self
            .retry
            .execute("claim_next", &self.shutdown, || {
                self.store.claim_next(&self.config.queues, &self.id)
            })
            .await?;

        let Some(job) = claimed else {
            return Ok(None);
        };

        let attempt = job.attempts + 1;
        let span = info_span!(
            "job",
            job_id = %job.id,
            task = %job.task_name,
            queue = %job.queue,
            attempt
        );
        self.process(job).instrument(span).await.map(Some)
    }

    async fn process(&self, job: Job) -> JobResult<AttemptOutcome> {
        let now = self.clock.now();
        let attempt = job.attempts + 1;
        let wait = (now - job.scheduled_at).to_std().unwrap_or_default();

        JobMetrics::job_claimed(&job.queue, &job.task_name, wait);
        JobEvent::new(
            JobEventKind::Claimed {
                worker_id: self.id.clone(),
            },
            &job,
            attempt,
            now,
        )
        .emit();

        WorkerMetrics::worker_busy(&self.pool_id);
        let started = Instant::now();

        let outcome = match self.registry.get(&job.task_name) {
            Some(task) => match self.supervise(&job, task).await {
                Execution::Finished(Ok(())) => self.report_success(&job, attempt, started).await,
                Execution::Finished(Err(error)) => self.report_failure(&job, error, started).await,
                Execution::ClaimLost | Execution::Detached | Execution::Interrupted => {
                    Ok(AttemptOutcome::Abandoned)
                }
            },
            None => {
                error!(task = %job.task_name, "No task registered for job");
                self.report_failure(&job, ExecutionError::unknown_task(&job.task_name), started)
                    .await
            }
        };

        WorkerMetrics::worker_idle(&self.pool_id);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Runs the executor, heartbeating until it exits, times out, loses
    /// its claim or is interrupted by shutdown.
    async fn supervise(&self, job: &Job, task: &RegisteredTask) -> Execution {
        let token = self.abort.child_token();
        let ctx = JobContext::new(
            job,
            task.retry.max_attempts,
            &self.id,
            self.clock.now(),
            token.clone(),
        );

        let mut handle = tokio::spawn(task.execute(job.arguments.clone(), ctx));

        let deadline = tokio::time::sleep(task.execution_timeout);
        tokio::pin!(deadline);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                joined = &mut handle => return Execution::Finished(flatten(joined)),

                () = &mut deadline => {
                    warn!(
                        timeout_secs = task.execution_timeout.as_secs_f64(),
                        "Job exceeded its execution timeout, cancelling"
                    );
                    token.cancel();
                    // Whatever the executor returns now, the attempt ran out of time.
                    return match self.await_exit(&mut handle).await {
                        Some(_) => {
                            Execution::Finished(Err(ExecutionError::timeout(task.execution_timeout)))
                        }
                        None => {
                            handle.abort();
                            warn!(
                                grace_secs = self.config.cancel_grace.as_secs_f64(),
                                "Executor ignored cancellation; leaving the job to the stall detector"
                            );
                            Execution::Detached
                        }
                    };
                }

                () = self.abort.cancelled() => {
                    return match self.await_exit(&mut handle).await {
                        Some(result) => Execution::Finished(result),
                        None => {
                            handle.abort();
                            info!("Shutdown interrupted the job; leaving it to the stall detector");
                            Execution::Interrupted
                        }
                    };
                }

                _ = heartbeat.tick() => {
                    let beat = with_timeout(self.config.store_timeout, || {
                        self.store.heartbeat(job.id, &self.id)
                    })
                    .await;

                    match beat {
                        Ok(true) => debug!("Heartbeat"),
                        Ok(false) => {
                            warn!("Claim lost while running, cancelling executor");
                            token.cancel();
                            if self.await_exit(&mut handle).await.is_none() {
                                handle.abort();
                            }
                            return Execution::ClaimLost;
                        }
                        Err(err) => {
                            metrics::counter!(names::WORKER_STORE_ERRORS_TOTAL, "operation" => "heartbeat")
                                .increment(1);
                            warn!(error = %err, "Heartbeat failed");
                        }
                    }
                }
            }
        }
    }

    /// Waits up to the cancel grace for a cancelled executor to exit.
    async fn await_exit(
        &self,
        handle: &mut JoinHandle<Result<(), ExecutionError>>,
    ) -> Option<Result<(), ExecutionError>> {
        tokio::time::timeout(self.config.cancel_grace, handle)
            .await
            .ok()
            .map(flatten)
    }

    async fn report_success(
        &self,
        job: &Job,
        attempt: u32,
        started: Instant,
    ) -> JobResult<AttemptOutcome> {
        let completed = self
            .retry
            .execute("complete", &self.abort, || self.store.complete(job.id, &self.id))
            .await?;

        if !completed {
            info!("Claim lost before completion; result discarded");
            return Ok(AttemptOutcome::Abandoned);
        }

        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        JobEvent::new(
            JobEventKind::Succeeded {
                duration: started.elapsed(),
            },
            job,
            attempt,
            self.clock.now(),
        )
        .emit();
        Ok(AttemptOutcome::Succeeded)
    }

    async fn report_failure(
        &self,
        job: &Job,
        error: ExecutionError,
        started: Instant,
    ) -> JobResult<AttemptOutcome> {
        JobMetrics::attempt_failed(&job.queue, &job.task_name, started.elapsed());
        warn!(error_class = %error.class, error = %error.message, "Job attempt failed");

        let outcome = self
            .retry
            .execute("fail", &self.abort, || self.store.fail(job.id, &self.id, &error))
            .await?;

        let Some(outcome) = outcome else {
            info!("Claim lost before failure was recorded; result discarded");
            return Ok(AttemptOutcome::Abandoned);
        };

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        JobEvent::new(
            JobEventKind::from_outcome(outcome, &error.class),
            job,
            outcome.attempts(),
            self.clock.now(),
        )
        .emit();

        Ok(match outcome {
            FailOutcome::Retried { delay, .. } => AttemptOutcome::Retried { delay },
            FailOutcome::Failed { .. } => AttemptOutcome::Failed,
        })
    }
}

/// Maps a join result to the executor's result. Panics become a `panic`
/// failure; an aborted task counts as cancelled.
fn flatten(joined: Result<Result<(), ExecutionError>, JoinError>) -> Result<(), ExecutionError> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "executor panicked".to_string());
            Err(ExecutionError::panicked(message))
        }
        Err(_) => Err(ExecutionError::cancelled()),
    }
}

/// Worker pool for concurrent job processing.
pub struct WorkerPool {
    /// Unique pool ID.
    id: String,

    /// Job store.
    store: SharedJobStore,

    /// Task registry.
    registry: Arc<TaskRegistry>,

    /// Clock shared with the store.
    clock: SharedClock,

    /// Pool configuration.
    config: WorkerPoolConfig,

    /// Stops claiming.
    shutdown: CancellationToken,

    /// Cancels in-flight executors once the shutdown timeout passes.
    abort: CancellationToken,

    /// Running flag.
    running: Arc<AtomicBool>,

    /// Counters shared by every worker.
    counters: Arc<WorkerCounters>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        store: SharedJobStore,
        registry: Arc<TaskRegistry>,
        clock: SharedClock,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            id: format!("worker-pool-{}", Uuid::new_v4()),
            store,
            registry,
            clock,
            config,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::default(),
        }
    }

    fn worker(&self, n: usize) -> Worker {
        Worker {
            id: format!("{}-{}", self.id, n),
            pool_id: self.id.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            retry: StoreRetry::new(self.config.store_retry_interval, self.config.store_timeout),
            shutdown: self.shutdown.clone(),
            abort: self.abort.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Runs the workers until [`stop`](Self::stop) is called or the
    /// shutdown token fires, then drains in-flight jobs.
    pub async fn run(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Internal("Worker pool already running".to_string()));
        }

        let concurrency = self.config.concurrency.max(1);
        info!(
            pool_id = %self.id,
            concurrency,
            queues = ?self.config.queues,
            "Starting worker pool"
        );
        WorkerMetrics::set_concurrency(&self.id, concurrency);

        let mut workers = JoinSet::new();
        for n in 1..=concurrency {
            let worker = self.worker(n);
            let span = info_span!("worker", worker_id = %worker.id);
            workers.spawn(async move { worker.run().await }.instrument(span));
        }

        self.shutdown.cancelled().await;

        info!(pool_id = %self.id, "Waiting for workers to finish...");
        if tokio::time::timeout(self.config.shutdown_timeout, drain(&mut workers))
            .await
            .is_err()
        {
            warn!(
                pool_id = %self.id,
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout reached, cancelling in-flight jobs"
            );
            self.abort.cancel();
            let last_call = self.config.cancel_grace + self.config.store_timeout;
            if tokio::time::timeout(last_call, drain(&mut workers)).await.is_err() {
                workers.abort_all();
            }
        }

        self.running.store(false, Ordering::SeqCst);

        info!(
            pool_id = %self.id,
            processed = self.counters.processed.load(Ordering::Relaxed),
            succeeded = self.counters.succeeded.load(Ordering::Relaxed),
            failed = self.counters.failed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );

        Ok(())
    }

    /// Stop the worker pool.
    pub fn stop(&self) {
        info!(pool_id = %self.id, "Stopping worker pool...");
        self.shutdown.cancel();
    }

    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.config.concurrency,
            jobs_processed: self.counters.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            queues: self.config.queues.clone(),
        }
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(error = %err, "Worker task panicked");
            }
        }
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    /// Pool ID.
    pub id: String,

    /// Is running.
    pub running: bool,

    /// Configured concurrency.
    pub concurrency: usize,

    /// Jobs claimed and processed.
    pub jobs_processed: u64,

    /// Jobs completed successfully.
    pub jobs_succeeded: u64,

    /// Failed attempts recorded, retried or terminal.
    pub jobs_failed: u64,

    /// Queues being processed.
    pub queues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::error_class;
    use crate::job::{JobStatus, NewJob};
    use crate::registry::{TaskDefinition, TaskHandler};
    use crate::retry::RetryPolicy;
    use crate::store::{InMemoryJobStore, JobStore};
    use futures::future::FutureExt;
    use serde_json::json;

    fn test_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: 1,
            queues: vec!["default".to_string()],
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            store_retry_interval: Duration::from_millis(10),
            store_timeout: Duration::from_secs(5),
        }
    }

    fn handler<F, Fut>(f: F) -> TaskHandler
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        Arc::new(move |args: serde_json::Value, ctx: JobContext| f(args, ctx).boxed())
    }

    fn explode() -> Result<(), ExecutionError> {
        panic!("boom")
    }

    fn registry() -> Arc<TaskRegistry> {
        let quick = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10));
        Arc::new(
            TaskRegistry::builder()
                .register_fn(
                    TaskDefinition::new("ok"),
                    handler(|_, _| async { Ok::<(), ExecutionError>(()) }),
                )
                .register_fn(
                    TaskDefinition::new("flaky").retry(quick.clone()),
                    handler(|_, _| async { Err(ExecutionError::new("io", "connection reset")) }),
                )
                .register_fn(
                    TaskDefinition::new("typed").retry(quick.clone()),
                    handler(|args, _| async move {
                        args.get("n")
                            .and_then(serde_json::Value::as_u64)
                            .map(|_| ())
                            .ok_or_else(|| ExecutionError::invalid_arguments("missing field `n`"))
                    }),
                )
                .register_fn(
                    TaskDefinition::new("cooperative")
                        .retry(quick.clone())
                        .timeout(Duration::from_secs(1)),
                    handler(|_, ctx| async move {
                        ctx.cancelled().await;
                        Err(ExecutionError::cancelled())
                    }),
                )
                .register_fn(
                    TaskDefinition::new("ignores_timeout")
                        .retry(quick.clone())
                        .timeout(Duration::from_secs(1)),
                    handler(|_, ctx| async move {
                        ctx.cancelled().await;
                        Ok::<(), ExecutionError>(())
                    }),
                )
                .register_fn(
                    TaskDefinition::new("interruptible").retry(quick.clone()),
                    handler(|_, ctx| async move {
                        ctx.cancelled().await;
                        Err(ExecutionError::new("io", "upload interrupted"))
                    }),
                )
                .register_fn(
                    TaskDefinition::new("stubborn")
                        .retry(quick.clone())
                        .timeout(Duration::from_secs(1)),
                    handler(|_, _| async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<(), ExecutionError>(())
                    }),
                )
                .register_fn(
                    TaskDefinition::new("slow").retry(quick.clone()),
                    handler(|_, _| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<(), ExecutionError>(())
                    }),
                )
                .register_fn(
                    TaskDefinition::new("panics").retry(quick),
                    handler(|_, _| async { explode() }),
                )
                .build()
                .unwrap(),
        )
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
        worker: Worker,
    }

    fn harness(config: WorkerPoolConfig) -> Harness {
        let clock = ManualClock::fixed();
        let registry = registry();
        let store = Arc::new(InMemoryJobStore::new(registry.clone(), Arc::new(clock.clone())));
        let worker = Worker::new(
            "worker-1",
            store.clone(),
            registry,
            Arc::new(clock.clone()),
            config,
        );
        Harness {
            store,
            clock,
            worker,
        }
    }

    async fn enqueue(store: &InMemoryJobStore, task: &str) -> crate::job::JobId {
        store.enqueue(NewJob::new(task, json!({}))).await.unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "ok").await;

        assert_eq!(h.worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.claim_owner, None);
    }

    #[tokio::test]
    async fn test_nothing_ready_returns_none() {
        let h = harness(test_config());
        h.store
            .enqueue(NewJob::new("ok", json!({})).delay(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(h.worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failures_back_off_then_fail() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "flaky").await;

        assert_eq!(
            h.worker.run_once().await.unwrap(),
            Some(AttemptOutcome::Retried {
                delay: Duration::from_secs(1)
            })
        );
        // Not ready until the backoff passes.
        assert_eq!(h.worker.run_once().await.unwrap(), None);

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(
            h.worker.run_once().await.unwrap(),
            Some(AttemptOutcome::Retried {
                delay: Duration::from_secs(2)
            })
        );

        h.clock.advance(Duration::from_secs(2));
        assert_eq!(h.worker.run_once().await.unwrap(), Some(AttemptOutcome::Failed));

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.unwrap().class, "io");
    }

    #[tokio::test]
    async fn test_unknown_task_fails_without_retry() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "no.such.task").await;

        assert_eq!(h.worker.run_once().await.unwrap(), Some(AttemptOutcome::Failed));

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.unwrap().class, error_class::UNKNOWN_TASK);
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_without_retry() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "typed").await;

        assert_eq!(h.worker.run_once().await.unwrap(), Some(AttemptOutcome::Failed));
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.last_error.unwrap().class, error_class::INVALID_ARGUMENTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_cooperative_executor() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "cooperative").await;

        assert_eq!(
            h.worker.run_once().await.unwrap(),
            Some(AttemptOutcome::Retried {
                delay: Duration::from_secs(1)
            })
        );
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.unwrap().class, error_class::TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_timeout_still_counts_as_timeout() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "ignores_timeout").await;

        assert_eq!(
            h.worker.run_once().await.unwrap(),
            Some(AttemptOutcome::Retried {
                delay: Duration::from_secs(1)
            })
        );
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.unwrap().class, error_class::TIMEOUT);
    }

    #[tokio::test]
    async fn test_error_returned_on_shutdown_is_reported() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "interruptible").await;
        let abort = h.worker.abort_token();

        let worker = Arc::new(h.worker);
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });

        while h.store.get(id).await.unwrap().unwrap().status != JobStatus::InProgress {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        abort.cancel();

        assert_eq!(
            running.await.unwrap().unwrap(),
            Some(AttemptOutcome::Retried {
                delay: Duration::from_secs(1)
            })
        );
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let last_error = job.last_error.unwrap();
        assert_eq!(last_error.class, "io");
        assert_eq!(last_error.message, "upload interrupted");
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_executor_is_aborted() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let registry = Arc::new(
            TaskRegistry::builder()
                .register_fn(
                    TaskDefinition::new("stubborn").timeout(Duration::from_secs(1)),
                    handler(move |_, _| {
                        let guard = DropFlag(flag.clone());
                        async move {
                            let _guard = guard;
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            Ok::<(), ExecutionError>(())
                        }
                    }),
                )
                .build()
                .unwrap(),
        );
        let clock = ManualClock::fixed();
        let store = Arc::new(InMemoryJobStore::new(registry.clone(), Arc::new(clock.clone())));
        let worker = Worker::new(
            "worker-1",
            store.clone(),
            registry,
            Arc::new(clock),
            test_config(),
        );
        enqueue(&store, "stubborn").await;

        assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Abandoned));

        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_executor_is_left_to_stall_detector() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "stubborn").await;

        assert_eq!(h.worker.run_once().await.unwrap(), Some(AttemptOutcome::Abandoned));

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.attempts, 0);
        assert!(job.is_claimed_by("worker-1"));
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_failure() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "panics").await;

        assert!(matches!(
            h.worker.run_once().await.unwrap(),
            Some(AttemptOutcome::Retried { .. })
        ));
        let error = h.store.get(id).await.unwrap().unwrap().last_error.unwrap();
        assert_eq!(error.class, error_class::PANIC);
        assert!(error.message.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_after_reclaim_is_discarded() {
        let h = harness(test_config());
        let id = enqueue(&h.store, "slow").await;

        let worker = Arc::new(h.worker);
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });

        while h.store.get(id).await.unwrap().unwrap().status != JobStatus::InProgress {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.clock.advance(Duration::from_secs(120));
        let reclaimed = h.store.reclaim_stalled(Duration::from_secs(60)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        assert_eq!(
            running.await.unwrap().unwrap(),
            Some(AttemptOutcome::Abandoned)
        );

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.unwrap().class, error_class::WORKER_LOST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_heartbeat_cancels_executor() {
        let config = WorkerPoolConfig {
            heartbeat_interval: Duration::from_millis(100),
            ..test_config()
        };
        let h = harness(config);
        let id = h
            .store
            .enqueue(NewJob::new("cooperative", json!({})))
            .await
            .unwrap();

        let worker = Arc::new(h.worker);
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });

        while h.store.get(id).await.unwrap().unwrap().status != JobStatus::InProgress {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.clock.advance(Duration::from_secs(120));
        h.store.reclaim_stalled(Duration::from_secs(60)).await.unwrap();

        assert_eq!(
            running.await.unwrap().unwrap(),
            Some(AttemptOutcome::Abandoned)
        );
        // Only the reclaim consumed an attempt.
        assert_eq!(h.store.get(id).await.unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn test_worker_pool_config_from_worker_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_pool_processes_jobs_and_shuts_down() {
        let clock = ManualClock::fixed();
        let registry = registry();
        let store = Arc::new(InMemoryJobStore::new(registry.clone(), Arc::new(clock.clone())));
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(enqueue(&store, "ok").await);
        }

        let pool = Arc::new(WorkerPool::new(
            store.clone(),
            registry,
            Arc::new(clock.clone()),
            WorkerPoolConfig {
                concurrency: 3,
                ..test_config()
            },
        ));
        assert!(pool.id().starts_with("worker-pool-"));

        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run().await }
        });

        for id in &ids {
            while store.get(*id).await.unwrap().unwrap().status != JobStatus::Succeeded {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert!(pool.is_running());
        assert!(pool.run().await.is_err());

        pool.stop();
        running.await.unwrap().unwrap();

        let stats = pool.stats();
        assert!(!stats.running);
        assert_eq!(stats.jobs_processed, 5);
        assert_eq!(stats.jobs_succeeded, 5);
        assert_eq!(stats.jobs_failed, 0);
    }
}
