//! Keel Jobs - Durable Background Job Queue
//!
//! A store-backed job queue with:
//! - Typed task definitions with serde-serialized arguments
//! - Worker pools with concurrency control, heartbeats and execution timeouts
//! - Exponential-backoff retry policies with per-task error-class allow lists
//! - Stall detection that reclaims jobs from workers that stopped heartbeating
//! - Deduplication through lock keys
//! - Cron-based periodic tasks
//! - In-memory and PostgreSQL stores
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Keel Jobs Architecture                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  JobQueue (producer)        Scheduler (periodic)                 │
//! │     │                           │                                │
//! │     └─────────────┬─────────────┘                                │
//! │                   ▼                                              │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                 JobStore (single source of truth)        │    │
//! │  │   pending ──claim──▶ in_progress ──▶ succeeded            │    │
//! │  │      ▲                   │      └──▶ failed              │    │
//! │  │      └──── retry ────────┘                               │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │          ▲                              ▲                        │
//! │          │ claim / heartbeat / report   │ reclaim_stalled        │
//! │  ┌───────┴──────────────────┐   ┌───────┴────────┐              │
//! │  │       Worker Pool        │   │ Stall Detector │              │
//! │  │  ┌────────┐ ┌────────┐   │   └────────────────┘              │
//! │  │  │Worker 1│ │Worker N│   │                                   │
//! │  │  └────────┘ └────────┘   │                                   │
//! │  └──────────────────────────┘                                   │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Task for SendEmail {
//!     const NAME: &'static str = "emails.send";
//!     const QUEUE: &'static str = "emails";
//!
//!     async fn run(self, ctx: JobContext) -> Result<(), ExecutionError> {
//!         // Send email
//!         Ok(())
//!     }
//! }
//!
//! let registry = Arc::new(TaskRegistry::builder().register::<SendEmail>().build()?);
//! let store: SharedJobStore = Arc::new(InMemoryJobStore::new(registry.clone(), clock.clone()));
//!
//! JobQueue::new(store.clone(), clock.clone())
//!     .task(SendEmail { to: "user@example.com".into() })
//!     .lock_key("welcome:user@example.com")
//!     .send()
//!     .await?;
//! ```

pub mod clock;
pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod stall;
pub mod store;
pub mod task;
pub mod worker;

/// Queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{error_class, ExecutionError, JobError, JobResult};
pub use events::{JobEvent, JobEventKind, EVENT_TARGET};
pub use job::{Job, JobContext, JobId, JobStatus, LastError, NewJob, Schedule};
pub use metrics::{register_metrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use postgres::{create_pool, run_migrations, PgJobStore};
pub use queue::{JobQueue, QueuedJob};
pub use registry::{RegisteredTask, RegistryBuilder, TaskDefinition, TaskHandler, TaskRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{cron_expressions, PeriodicTask, PeriodicTaskInfo, Scheduler, SchedulerStats};
pub use stall::{StallDetector, SweepReport};
pub use store::{FailOutcome, InMemoryJobStore, JobStore, QueueStats, ReclaimedJob, SharedJobStore};
pub use task::Task;
pub use worker::{AttemptOutcome, Worker, WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::job::{JobContext, JobId, JobStatus, NewJob};
    pub use crate::queue::JobQueue;
    pub use crate::registry::{TaskDefinition, TaskRegistry};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{InMemoryJobStore, JobStore, SharedJobStore};
    pub use crate::task::Task;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
    pub use crate::{ExecutionError, JobError, JobResult};
}
