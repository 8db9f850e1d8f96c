//! Timeout wrapper for async operations.

use keel_core::KeelError;
use std::time::Duration;
use thiserror::Error;

/// An operation ran past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Operation timed out after {0:?}")]
pub struct Elapsed(pub Duration);

impl From<Elapsed> for KeelError {
    fn from(elapsed: Elapsed) -> Self {
        Self::Timeout(elapsed.to_string())
    }
}

/// Wraps an async operation with a timeout.
///
/// The error type only needs to know how to represent an [`Elapsed`]
/// deadline, so each crate keeps its own error enum.
pub async fn with_timeout<F, Fut, T, E>(duration: Duration, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: From<Elapsed>,
{
    tokio::time::timeout(duration, f())
        .await
        .map_err(|_| E::from(Elapsed(duration)))?
}
