//! Retry policy with capped exponential backoff.

use keel_config::RetryConfig;
use std::collections::BTreeSet;
use std::time::Duration;

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`.
    Retry { delay: Duration },
    /// Give up.
    Stop,
}

impl RetryDecision {
    /// Returns the delay, if the decision is to retry.
    pub fn delay(self) -> Option<Duration> {
        match self {
            RetryDecision::Retry { delay } => Some(delay),
            RetryDecision::Stop => None,
        }
    }
}

/// Per-task retry policy.
///
/// Delays grow as `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Error classes that may be retried. Empty means every class.
    pub retryable_error_classes: BTreeSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(2), Duration::from_secs(300))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::exponential(config.max_attempts, config.base_delay(), config.max_delay())
    }
}

impl RetryPolicy {
    /// Creates an exponential policy that retries every error class.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            retryable_error_classes: BTreeSet::new(),
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::exponential(1, Duration::ZERO, Duration::ZERO)
    }

    /// Restricts retries to the given error classes.
    #[must_use]
    pub fn retry_on<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_classes = classes.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if errors of `class` may be retried.
    pub fn is_retryable(&self, class: &str) -> bool {
        self.retryable_error_classes.is_empty() || self.retryable_error_classes.contains(class)
    }

    /// Returns `min(base_delay * 2^attempts_so_far, max_delay)`.
    pub fn delay_for(&self, attempts_so_far: u32) -> Duration {
        1u32.checked_shl(attempts_so_far)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decides what happens after `attempts_so_far` attempts failed with
    /// `error_class`.
    pub fn decide(&self, attempts_so_far: u32, error_class: &str) -> RetryDecision {
        if attempts_so_far >= self.max_attempts {
            return RetryDecision::Stop;
        }
        if !self.is_retryable(error_class) {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempts_so_far),
        }
    }

    /// Decision applied by a store when an attempt fails.
    ///
    /// `attempts_made` already counts the failing attempt. Exhaustion and
    /// class checks use it directly; the delay grows from `base_delay` for
    /// the first failure, so a three-attempt policy with a one second base
    /// waits 1s, then 2s, then stops.
    pub fn decide_after_attempt(&self, attempts_made: u32, error_class: &str) -> RetryDecision {
        match self.decide(attempts_made, error_class) {
            RetryDecision::Stop => RetryDecision::Stop,
            RetryDecision::Retry { .. } => RetryDecision::Retry {
                delay: self.delay_for(attempts_made.saturating_sub(1)),
            },
        }
    }
}
