//! Task registry.
//!
//! Built once at startup with [`RegistryBuilder`] and frozen into an
//! immutable [`TaskRegistry`] that workers and stores share.

use crate::error::{ExecutionError, JobError, JobResult};
use crate::job::JobContext;
use crate::retry::RetryPolicy;
use crate::task::Task;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Executor over raw JSON arguments.
pub type TaskHandler = Arc<
    dyn Fn(serde_json::Value, JobContext) -> BoxFuture<'static, Result<(), ExecutionError>>
        + Send
        + Sync,
>;

/// Registration settings for one task.
///
/// Unset fields fall back to the registry defaults when the registry is
/// built.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    /// Task name.
    pub name: String,
    /// Queue jobs of this task are enqueued on by default.
    pub queue: String,
    /// Retry policy override.
    pub retry: Option<RetryPolicy>,
    /// Execution timeout override.
    pub execution_timeout: Option<Duration>,
}

impl TaskDefinition {
    /// Creates a definition on the default queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: crate::DEFAULT_QUEUE.to_string(),
            retry: None,
            execution_timeout: None,
        }
    }

    /// Sets the queue.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// A resolved registry entry.
#[derive(Clone)]
pub struct RegisteredTask {
    /// Task name.
    pub name: String,
    /// Default queue.
    pub queue: String,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Upper bound on one attempt.
    pub execution_timeout: Duration,
    handler: TaskHandler,
}

impl RegisteredTask {
    /// Starts one attempt.
    pub fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: JobContext,
    ) -> BoxFuture<'static, Result<(), ExecutionError>> {
        (self.handler)(arguments, ctx)
    }
}

impl fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("execution_timeout", &self.execution_timeout)
            .finish_non_exhaustive()
    }
}

/// Collects task registrations.
pub struct RegistryBuilder {
    default_retry: RetryPolicy,
    default_timeout: Duration,
    tasks: Vec<(TaskDefinition, TaskHandler)>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Creates a builder with a five-attempt policy and a five minute
    /// timeout as defaults.
    pub fn new() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            default_timeout: Duration::from_secs(300),
            tasks: Vec::new(),
        }
    }

    /// Sets the retry policy for tasks that do not override it.
    #[must_use]
    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Sets the execution timeout for tasks that do not override it.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Registers a typed task.
    #[must_use]
    pub fn register<T: Task>(self) -> Self {
        let handler: TaskHandler = Arc::new(|arguments: serde_json::Value, ctx: JobContext| {
            async move {
                let task: T =
                    serde_json::from_value(arguments).map_err(ExecutionError::invalid_arguments)?;
                task.run(ctx).await
            }
            .boxed()
        });
        self.register_fn(T::definition(), handler)
    }

    /// Registers a handler over raw JSON arguments.
    #[must_use]
    pub fn register_fn(mut self, definition: TaskDefinition, handler: TaskHandler) -> Self {
        self.tasks.push((definition, handler));
        self
    }

    /// Freezes the registry.
    ///
    /// Fails if two registrations share a name.
    pub fn build(self) -> JobResult<TaskRegistry> {
        let mut tasks = HashMap::with_capacity(self.tasks.len());

        for (definition, handler) in self.tasks {
            if tasks.contains_key(&definition.name) {
                return Err(JobError::Configuration(format!(
                    "task '{}' is registered more than once",
                    definition.name
                )));
            }

            let entry = RegisteredTask {
                name: definition.name.clone(),
                queue: definition.queue,
                retry: definition
                    .retry
                    .unwrap_or_else(|| self.default_retry.clone()),
                execution_timeout: definition.execution_timeout.unwrap_or(self.default_timeout),
                handler,
            };

            info!(
                task = %entry.name,
                queue = %entry.queue,
                max_attempts = entry.retry.max_attempts,
                timeout_secs = entry.execution_timeout.as_secs(),
                "Registered task"
            );
            tasks.insert(definition.name, entry);
        }

        Ok(TaskRegistry { tasks })
    }
}

/// Immutable map from task name to executor and settings.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    /// Starts a builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Looks up a task.
    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    /// Returns the retry policy for `name`, or a never-retry policy for
    /// unknown tasks.
    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        self.tasks
            .get(name)
            .map_or_else(RetryPolicy::never, |task| task.retry.clone())
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
