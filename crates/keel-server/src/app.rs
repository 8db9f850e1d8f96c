//! Application assembly.
//!
//! [`AppBuilder`] turns an [`AppConfig`] into a running [`App`]: it picks the
//! store backend, builds the task registry and creates the worker pool,
//! stall detector and periodic scheduler that [`App::run`] drives until
//! shutdown.

use crate::tasks::register_demo_tasks;
use keel_config::AppConfig;
use keel_core::{KeelError, KeelResult};
use keel_jobs::{
    create_pool, run_migrations, InMemoryJobStore, JobError, JobQueue, PeriodicTask, PgJobStore,
    RetryPolicy, Scheduler, SharedClock, SharedJobStore, StallDetector, SystemClock, TaskRegistry,
    WorkerPool, WorkerPoolConfig,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Maps an engine error onto the process-level error type.
pub fn engine_error(err: JobError) -> KeelError {
    match err {
        JobError::Database(e) => KeelError::Database(e.to_string()),
        JobError::Migration(e) => KeelError::Database(e.to_string()),
        JobError::Timeout(msg) => KeelError::Timeout(msg),
        JobError::Configuration(msg) => KeelError::Configuration(msg),
        other => KeelError::Internal(other.to_string()),
    }
}

/// Builds the task registry with the configured defaults.
pub fn build_registry(config: &AppConfig) -> KeelResult<TaskRegistry> {
    register_demo_tasks(TaskRegistry::builder())
        .default_retry(RetryPolicy::from(&config.retry))
        .default_timeout(config.worker.job_timeout())
        .build()
        .map_err(engine_error)
}

/// The job store selected by `database.url`.
#[derive(Clone)]
pub enum StoreBackend {
    /// In-process store for development and tests.
    Memory(Arc<InMemoryJobStore>),
    /// PostgreSQL store.
    Postgres(Arc<PgJobStore>),
}

impl StoreBackend {
    /// Connects the store named by the configuration, applying migrations
    /// when asked to.
    pub async fn connect(
        config: &AppConfig,
        registry: Arc<TaskRegistry>,
        clock: SharedClock,
    ) -> KeelResult<Self> {
        if config.database.is_memory() {
            warn!("Using the in-memory job store; jobs will not survive a restart");
            return Ok(Self::Memory(Arc::new(InMemoryJobStore::new(registry, clock))));
        }

        let pool = create_pool(&config.database).await.map_err(engine_error)?;
        if config.database.run_migrations {
            run_migrations(&pool).await.map_err(engine_error)?;
        }
        Ok(Self::Postgres(Arc::new(PgJobStore::new(pool, registry, clock))))
    }

    /// Returns the store as a trait object.
    pub fn shared(&self) -> SharedJobStore {
        match self {
            Self::Memory(store) => store.clone(),
            Self::Postgres(store) => store.clone(),
        }
    }
}

/// Application builder.
pub struct AppBuilder {
    config: Option<AppConfig>,
    periodic: Vec<PeriodicTask>,
}

impl AppBuilder {
    /// Creates a new application builder.
    pub fn new() -> Self {
        Self {
            config: None,
            periodic: Vec::new(),
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Adds a periodic task, registered when the scheduler is enabled.
    pub fn with_periodic_task(mut self, task: PeriodicTask) -> Self {
        self.periodic.push(task);
        self
    }

    /// Connects the store and assembles the components.
    pub async fn build(self) -> KeelResult<App> {
        let config = self.config.unwrap_or_default();
        let clock: SharedClock = Arc::new(SystemClock);

        let registry = Arc::new(build_registry(&config)?);
        info!(tasks = ?registry.names(), "Task registry built");

        let backend = StoreBackend::connect(&config, registry.clone(), clock.clone()).await?;
        let store = backend.shared();
        let queue = JobQueue::new(store.clone(), clock.clone());

        let pool = Arc::new(WorkerPool::new(
            store.clone(),
            registry,
            clock.clone(),
            WorkerPoolConfig::from(&config.worker),
        ));

        let stall = config
            .stall
            .enabled
            .then(|| Arc::new(StallDetector::from_config(store, clock.clone(), &config.stall)));

        let scheduler = config.scheduler.enabled.then(|| {
            let scheduler = Scheduler::new(queue.clone(), clock, config.scheduler.poll_interval());
            for task in self.periodic {
                scheduler.register(task);
            }
            Arc::new(scheduler)
        });

        Ok(App {
            config,
            backend,
            queue,
            pool,
            stall,
            scheduler,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An assembled worker process.
pub struct App {
    config: AppConfig,
    backend: StoreBackend,
    queue: JobQueue,
    pool: Arc<WorkerPool>,
    stall: Option<Arc<StallDetector>>,
    scheduler: Option<Arc<Scheduler>>,
}

impl App {
    /// Returns the effective configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Returns a producer handle on the same store.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Cancelling this token starts a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.pool.shutdown_token()
    }

    /// Runs the worker pool and the background loops until shutdown.
    ///
    /// Returns once the pool has drained.
    pub async fn run(self) -> KeelResult<()> {
        let shutdown = self.pool.shutdown_token();
        let mut background: JoinSet<Result<(), JobError>> = JoinSet::new();

        if let StoreBackend::Postgres(store) = &self.backend {
            let store = store.clone();
            let token = shutdown.clone();
            background.spawn(async move { store.listen(token).await });
        }

        if let Some(detector) = self.stall.clone() {
            let token = shutdown.clone();
            background.spawn(async move {
                detector.run(token).await;
                Ok(())
            });
        }

        if let Some(scheduler) = self.scheduler.clone() {
            let token = shutdown.clone();
            background.spawn(async move { scheduler.run(token).await });
        }

        let result = self.pool.run().await.map_err(engine_error);

        // The pool can also stop on its own error; take the loops down with it.
        shutdown.cancel();
        while let Some(joined) = background.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Background loop exited with an error"),
                Err(err) => error!(error = %err, "Background loop panicked"),
            }
        }

        let stats = self.pool.stats();
        info!(
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            "Worker process stopped"
        );
        result
    }
}
