//! Built-in demonstration tasks.

use async_trait::async_trait;
use keel_jobs::{ExecutionError, JobContext, RegistryBuilder, Task};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Fails its first `fail_attempts` attempts, then succeeds.
///
/// Useful for watching the backoff schedule from the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoFlaky {
    #[serde(default)]
    pub fail_attempts: u32,
}

#[async_trait]
impl Task for DemoFlaky {
    const NAME: &'static str = "demo.flaky";

    async fn run(self, ctx: JobContext) -> Result<(), ExecutionError> {
        if ctx.attempt <= self.fail_attempts {
            return Err(ExecutionError::new(
                "flaky",
                format!("attempt {} of {} planned failures", ctx.attempt, self.fail_attempts),
            ));
        }
        info!(job_id = %ctx.job_id, attempt = ctx.attempt, "demo.flaky succeeded");
        Ok(())
    }
}

/// Sleeps for `seconds`, giving up early when the attempt is cancelled.
///
/// Unknown argument fields are ignored, so it also serves as the target of
/// the periodic demo schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemoSleep {
    #[serde(default)]
    pub seconds: u64,
}

#[async_trait]
impl Task for DemoSleep {
    const NAME: &'static str = "demo.sleep";

    async fn run(self, ctx: JobContext) -> Result<(), ExecutionError> {
        tokio::select! {
            () = ctx.cancelled() => Err(ExecutionError::cancelled()),
            () = tokio::time::sleep(Duration::from_secs(self.seconds)) => {
                info!(job_id = %ctx.job_id, seconds = self.seconds, "demo.sleep finished");
                Ok(())
            }
        }
    }
}

/// Registers every demonstration task.
pub fn register_demo_tasks(builder: RegistryBuilder) -> RegistryBuilder {
    builder.register::<DemoFlaky>().register::<DemoSleep>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_jobs::{
        AttemptOutcome, InMemoryJobStore, JobQueue, JobStatus, JobStore, ManualClock, RetryPolicy,
        SharedJobStore, TaskRegistry, Worker, WorkerPoolConfig,
    };
    use std::sync::Arc;

    fn setup() -> (JobQueue, Worker, SharedJobStore, ManualClock) {
        let clock = ManualClock::fixed();
        let registry = Arc::new(
            register_demo_tasks(TaskRegistry::builder())
                .default_retry(RetryPolicy::exponential(
                    3,
                    Duration::from_secs(1),
                    Duration::from_secs(10),
                ))
                .build()
                .unwrap(),
        );
        let store: SharedJobStore =
            Arc::new(InMemoryJobStore::new(registry.clone(), Arc::new(clock.clone())));
        let queue = JobQueue::new(store.clone(), Arc::new(clock.clone()));
        let worker = Worker::new(
            "w-demo",
            store.clone(),
            registry,
            Arc::new(clock.clone()),
            WorkerPoolConfig::default(),
        );
        (queue, worker, store, clock)
    }

    #[test]
    fn test_register_demo_tasks() {
        let registry = register_demo_tasks(TaskRegistry::builder()).build().unwrap();
        assert!(registry.contains("demo.flaky"));
        assert!(registry.contains("demo.sleep"));
    }

    #[tokio::test]
    async fn test_flaky_recovers_after_planned_failures() {
        let (queue, worker, store, clock) = setup();
        let id = queue.enqueue_task(DemoFlaky { fail_attempts: 1 }).await.unwrap();

        assert_eq!(
            worker.run_once().await.unwrap(),
            Some(AttemptOutcome::Retried {
                delay: Duration::from_secs(1)
            })
        );
        clock.advance(Duration::from_secs(1));
        assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_sleep_ignores_periodic_arguments() {
        let (queue, worker, _store, _clock) = setup();
        queue
            .enqueue(keel_jobs::NewJob::new(
                DemoSleep::NAME,
                serde_json::json!({ "timestamp": 1_700_000_000 }),
            ))
            .await
            .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), Some(AttemptOutcome::Succeeded));
    }
}
