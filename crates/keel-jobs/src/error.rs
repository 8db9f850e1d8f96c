//! Job error types.

use crate::job::JobId;
use keel_resilience::{Elapsed, Retriable};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors raised by the engine itself, as opposed to a task's own failure.
#[derive(Debug, Error)]
pub enum JobError {
    /// Another live job already holds the lock key; the new job was not
    /// inserted.
    #[error("Job suppressed: lock key '{lock_key}' is held by a live job")]
    DuplicateLock { lock_key: String },

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Invalid job state.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A store call ran past its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true for store faults.
    ///
    /// These are retried by the caller against the store and never charged
    /// to a job's attempt budget.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            JobError::Database(err) => !matches!(
                err,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)
            ),
            JobError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true if this is a lock-key suppression.
    pub fn is_duplicate_lock(&self) -> bool {
        matches!(self, JobError::DuplicateLock { .. })
    }
}

impl Retriable for JobError {
    fn is_retriable(&self) -> bool {
        self.is_infrastructure()
    }
}

impl From<Elapsed> for JobError {
    fn from(elapsed: Elapsed) -> Self {
        JobError::Timeout(elapsed.to_string())
    }
}

impl From<keel_core::KeelError> for JobError {
    fn from(err: keel_core::KeelError) -> Self {
        match err {
            keel_core::KeelError::Configuration(msg) => JobError::Configuration(msg),
            keel_core::KeelError::Timeout(msg) => JobError::Timeout(msg),
            other => JobError::Internal(other.to_string()),
        }
    }
}

/// Well-known execution error classes.
pub mod error_class {
    /// The attempt ran past the task's execution timeout.
    pub const TIMEOUT: &str = "timeout";
    /// The executor stopped because its cancellation token fired.
    pub const CANCELLED: &str = "cancelled";
    /// The worker holding the claim stopped heartbeating.
    pub const WORKER_LOST: &str = "worker_lost";
    /// No task is registered under the job's name.
    pub const UNKNOWN_TASK: &str = "unknown_task";
    /// The stored arguments do not decode into the task's type.
    pub const INVALID_ARGUMENTS: &str = "invalid_arguments";
    /// The executor panicked.
    pub const PANIC: &str = "panic";
    /// Default class for errors converted without an explicit class.
    pub const ERROR: &str = "error";
}

/// A classified failure returned by a task executor.
///
/// `class` is what retry policies match against; `message` is kept on the
/// job as `last_error` for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{class}: {message}")]
pub struct ExecutionError {
    /// Error classification.
    pub class: String,
    /// Human-readable detail.
    pub message: String,
}

impl ExecutionError {
    /// Creates an error with an explicit class.
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// The attempt exceeded its execution timeout.
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            error_class::TIMEOUT,
            format!("execution exceeded {}s", after.as_secs_f64()),
        )
    }

    /// The executor observed cancellation.
    pub fn cancelled() -> Self {
        Self::new(error_class::CANCELLED, "execution was cancelled")
    }

    /// The claim expired without a heartbeat.
    pub fn worker_lost() -> Self {
        Self::new(
            error_class::WORKER_LOST,
            "worker stopped heartbeating; claim reclaimed by stall detector",
        )
    }

    /// No task is registered under `task_name`.
    pub fn unknown_task(task_name: &str) -> Self {
        Self::new(
            error_class::UNKNOWN_TASK,
            format!("no task registered under '{task_name}'"),
        )
    }

    /// Arguments failed to decode.
    pub fn invalid_arguments(err: impl std::fmt::Display) -> Self {
        Self::new(error_class::INVALID_ARGUMENTS, err.to_string())
    }

    /// The executor panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(error_class::PANIC, message)
    }

    /// Returns true for failures the engine treats as terminal no matter
    /// what the task's retry policy says.
    pub fn is_always_terminal(&self) -> bool {
        self.class == error_class::UNKNOWN_TASK || self.class == error_class::INVALID_ARGUMENTS
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(error_class::ERROR, format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_errors_are_infrastructure() {
        let err = JobError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_infrastructure());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_row_not_found_is_not_infrastructure() {
        assert!(!JobError::Database(sqlx::Error::RowNotFound).is_infrastructure());
    }

    #[test]
    fn test_timeout_is_infrastructure() {
        let err = JobError::from(Elapsed(Duration::from_secs(3)));
        assert!(matches!(err, JobError::Timeout(_)));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn test_engine_errors_are_not_infrastructure() {
        assert!(!JobError::DuplicateLock { lock_key: "x".into() }.is_infrastructure());
        assert!(!JobError::NotFound(JobId::from(1)).is_infrastructure());
        assert!(!JobError::Configuration("bad".into()).is_infrastructure());
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!JobError::from(json).is_infrastructure());
    }

    #[test]
    fn test_duplicate_lock_display() {
        let err = JobError::DuplicateLock {
            lock_key: "fetch:books".into(),
        };
        assert!(err.is_duplicate_lock());
        assert!(err.to_string().contains("fetch:books"));
    }

    #[test]
    fn test_error_display_invalid_state() {
        let err = JobError::InvalidState {
            expected: "pending".into(),
            actual: "in_progress".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pending") && msg.contains("in_progress"));
    }

    #[test]
    fn test_from_keel_error() {
        let err = JobError::from(keel_core::KeelError::configuration("no url"));
        assert!(matches!(err, JobError::Configuration(msg) if msg == "no url"));
    }

    #[test]
    fn test_execution_error_classes() {
        assert_eq!(ExecutionError::worker_lost().class, error_class::WORKER_LOST);
        assert_eq!(ExecutionError::cancelled().class, error_class::CANCELLED);
        assert!(ExecutionError::timeout(Duration::from_secs(30)).message.contains("30"));
        assert!(ExecutionError::unknown_task("nope").is_always_terminal());
        assert!(ExecutionError::invalid_arguments("missing field").is_always_terminal());
        assert!(!ExecutionError::new("http", "502").is_always_terminal());
    }

    #[test]
    fn test_execution_error_from_anyhow() {
        let err = ExecutionError::from(anyhow::anyhow!("upstream down"));
        assert_eq!(err.class, error_class::ERROR);
        assert_eq!(err.to_string(), "error: upstream down");
    }
}
