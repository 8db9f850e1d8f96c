//! Typed task definitions.

use crate::error::ExecutionError;
use crate::job::JobContext;
use crate::registry::TaskDefinition;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// A unit of work the worker knows how to run.
///
/// The task value itself is the job's arguments: it is serialized at
/// enqueue time and deserialized again for every attempt, so it must not
/// hold anything that cannot survive a round trip through JSON.
///
/// # Example
///
/// ```rust,ignore
/// use keel_jobs::{ExecutionError, JobContext, Task};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct FetchCategory {
///     category: String,
/// }
///
/// #[async_trait::async_trait]
/// impl Task for FetchCategory {
///     const NAME: &'static str = "books.fetch_category";
///     const QUEUE: &'static str = "fetch";
///
///     async fn run(self, ctx: JobContext) -> Result<(), ExecutionError> {
///         tokio::select! {
///             _ = ctx.cancelled() => Err(ExecutionError::cancelled()),
///             res = fetch(&self.category) => res.map_err(|e| ExecutionError::new("http", e.to_string())),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name for this task type.
    const NAME: &'static str;

    /// Queue name for this task type.
    const QUEUE: &'static str = crate::DEFAULT_QUEUE;

    /// Registry entry for this task. Override to set a retry policy or
    /// execution timeout.
    fn definition() -> TaskDefinition {
        TaskDefinition::new(Self::NAME).queue(Self::QUEUE)
    }

    /// Runs one attempt.
    async fn run(self, ctx: JobContext) -> Result<(), ExecutionError>;
}
