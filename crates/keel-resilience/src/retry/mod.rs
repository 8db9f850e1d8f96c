//! Fixed-interval retry for store calls.
//!
//! A store call that fails with a transient error is logged, paused for a
//! fixed interval and tried again. This never touches a job's attempt
//! counter.

use crate::timeout::{with_timeout, Elapsed};
use keel_core::KeelError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Counter bumped for every failed store call.
pub const STORE_ERRORS_TOTAL: &str = "keel_worker_store_errors_total";

/// Errors that can say whether retrying the same call may succeed.
pub trait Retriable {
    /// Returns true for transient infrastructure failures.
    fn is_retriable(&self) -> bool;
}

impl Retriable for KeelError {
    fn is_retriable(&self) -> bool {
        KeelError::is_retriable(self)
    }
}

/// Store-call retry configuration.
#[derive(Debug, Clone)]
pub struct StoreRetry {
    /// Pause between attempts.
    pub interval: Duration,
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
    /// Give up after this many attempts. `None` retries until shutdown.
    pub max_attempts: Option<u32>,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            call_timeout: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl StoreRetry {
    /// Creates a retry that keeps going until shutdown.
    pub fn new(interval: Duration, call_timeout: Duration) -> Self {
        Self {
            interval,
            call_timeout,
            max_attempts: None,
        }
    }

    /// Caps the number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Executes a store call, retrying transient failures.
    ///
    /// Non-retriable errors are returned immediately. When `shutdown` fires
    /// during the pause the last error is returned.
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: &'static str,
        shutdown: &CancellationToken,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retriable + Display + From<Elapsed>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match with_timeout(self.call_timeout, || f()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Store call recovered");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            metrics::counter!(STORE_ERRORS_TOTAL, "operation" => operation).increment(1);

            if !err.is_retriable() {
                return Err(err);
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(operation, attempt, error = %err, "Store call failed, giving up");
                return Err(err);
            }

            warn!(
                operation,
                attempt,
                error = %err,
                retry_in_ms = self.interval.as_millis() as u64,
                "Store call failed, retrying"
            );

            tokio::select! {
                () = shutdown.cancelled() => return Err(err),
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_retry() -> StoreRetry {
        StoreRetry::new(Duration::from_millis(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_retry_success() {
        let token = CancellationToken::new();
        let result: Result<i32, KeelError> =
            fast_retry().execute("get", &token, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_until_store_recovers() {
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, KeelError> = fast_retry()
            .execute("claim_next", &token, || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(KeelError::Database("connection refused".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retriable_error_is_returned_immediately() {
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, KeelError> = fast_retry()
            .execute("cancel", &token, || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(KeelError::Conflict("duplicate".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(KeelError::Conflict(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_caps_retries() {
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, KeelError> = fast_retry()
            .with_max_attempts(3)
            .execute("enqueue", &token, || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(KeelError::Database("down".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();

        let retry = StoreRetry::new(Duration::from_secs(3600), Duration::from_secs(1));
        let result: Result<i32, KeelError> = retry
            .execute("heartbeat", &token, || async {
                Err(KeelError::Database("down".into()))
            })
            .await;

        assert!(matches!(result, Err(KeelError::Database(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_and_is_retried() {
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let retry = StoreRetry::new(Duration::from_millis(10), Duration::from_millis(50));
        let result: Result<i32, KeelError> = retry
            .execute("complete", &token, || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(1)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
