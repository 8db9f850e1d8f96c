//! Configuration validation module.
//!
//! Checks every section at startup so that bad values fail fast instead of
//! surfacing as falsely reclaimed jobs or stuck workers at runtime.

use crate::AppConfig;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Pool size configuration is invalid (min must be <= max).
    InvalidPoolSize { min: u32, max: u32 },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: u32, maximum: u32 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Sampling ratio must be between 0.0 and 1.0.
    InvalidSamplingRatio { value: f64 },
    /// Timeout or interval must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Worker concurrency must be at least one.
    InvalidConcurrency { value: usize },
    /// The worker must listen on at least one queue.
    EmptyQueueList,
    /// A queue name is blank.
    BlankQueueName,
    /// Retry settings are inconsistent.
    InvalidRetryPolicy { message: String },
    /// Stall threshold would reclaim jobs that are still running.
    StallThresholdTooShort {
        threshold_secs: u64,
        minimum_secs: u64,
    },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPoolSize { min, max } => {
                write!(
                    f,
                    "Invalid pool size: min ({}) cannot be greater than max ({})",
                    min, max
                )
            }
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {} exceeds maximum allowed ({})", value, maximum)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidSamplingRatio { value } => {
                write!(
                    f,
                    "Invalid sampling ratio: {} (must be between 0.0 and 1.0)",
                    value
                )
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{}' (valid: trace, debug, info, warn, error)",
                    value
                )
            }
            Self::InvalidConcurrency { value } => {
                write!(f, "Worker concurrency must be at least 1, got {}", value)
            }
            Self::EmptyQueueList => write!(f, "Worker queues cannot be empty"),
            Self::BlankQueueName => write!(f, "Worker queue names cannot be blank"),
            Self::InvalidRetryPolicy { message } => {
                write!(f, "Invalid retry policy: {}", message)
            }
            Self::StallThresholdTooShort {
                threshold_secs,
                minimum_secs,
            } => {
                write!(
                    f,
                    "Stall threshold {}s must exceed job timeout plus heartbeat interval ({}s)",
                    threshold_secs, minimum_secs
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    fn require_positive(&mut self, name: &str, value: u64) {
        if value == 0 {
            self.add_error(ConfigValidationError::NonPositiveTimeout {
                name: name.to_string(),
                value,
            });
        }
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: u32 = 1000;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];
    /// Longest retry delay accepted, one year. Keeps `now + delay` a valid
    /// timestamp in every store.
    pub const MAX_RETRY_DELAY_SECS: f64 = 31_536_000.0;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        Self::validate_database(&config.database, &mut result);
        Self::validate_worker(&config.worker, &mut result);
        Self::validate_stall(config, &mut result);
        Self::validate_retry(&config.retry, &mut result);
        Self::validate_scheduler(&config.scheduler, &mut result);
        Self::validate_observability(config, &mut result);

        result.into_result()
    }

    fn validate_database(config: &crate::DatabaseConfig, result: &mut ValidationResult) {
        if config.url.is_empty() {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        } else if !config.is_memory() {
            match Url::parse(&config.url) {
                Ok(url) if matches!(url.scheme(), "postgres" | "postgresql") => {}
                Ok(url) => result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "database".to_string(),
                    message: format!(
                        "unsupported scheme '{}' (expected postgres://, postgresql:// or memory://)",
                        url.scheme()
                    ),
                }),
                Err(e) => result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "database".to_string(),
                    message: e.to_string(),
                }),
            }
        }

        if config.min_connections > config.max_connections {
            result.add_error(ConfigValidationError::InvalidPoolSize {
                min: config.min_connections,
                max: config.max_connections,
            });
        }
        if config.max_connections > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: config.max_connections,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        result.require_positive("database.connect_timeout_secs", config.connect_timeout_secs);
        result.require_positive("database.idle_timeout_secs", config.idle_timeout_secs);
    }

    fn validate_worker(config: &crate::WorkerConfig, result: &mut ValidationResult) {
        if config.concurrency == 0 {
            result.add_error(ConfigValidationError::InvalidConcurrency {
                value: config.concurrency,
            });
        }

        if config.queues.is_empty() {
            result.add_error(ConfigValidationError::EmptyQueueList);
        } else if config.queues.iter().any(|q| q.trim().is_empty()) {
            result.add_error(ConfigValidationError::BlankQueueName);
        }

        result.require_positive("worker.poll_interval_ms", config.poll_interval_ms);
        result.require_positive("worker.heartbeat_interval_secs", config.heartbeat_interval_secs);
        result.require_positive("worker.job_timeout_secs", config.job_timeout_secs);
        result.require_positive("worker.shutdown_timeout_secs", config.shutdown_timeout_secs);
        result.require_positive("worker.store_retry_interval_ms", config.store_retry_interval_ms);
        result.require_positive("worker.store_timeout_secs", config.store_timeout_secs);
    }

    fn validate_stall(config: &AppConfig, result: &mut ValidationResult) {
        if !config.stall.enabled {
            return;
        }

        result.require_positive("stall.check_interval_secs", config.stall.check_interval_secs);

        let minimum = config
            .worker
            .job_timeout_secs
            .saturating_add(config.worker.heartbeat_interval_secs);
        if config.stall.threshold_secs <= minimum {
            result.add_error(ConfigValidationError::StallThresholdTooShort {
                threshold_secs: config.stall.threshold_secs,
                minimum_secs: minimum,
            });
        }
    }

    fn validate_retry(config: &crate::RetryConfig, result: &mut ValidationResult) {
        if config.max_attempts == 0 {
            result.add_error(ConfigValidationError::InvalidRetryPolicy {
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        for (name, value) in [
            ("base_delay_secs", config.base_delay_secs),
            ("max_delay_secs", config.max_delay_secs),
        ] {
            if Duration::try_from_secs_f64(value).is_err() || value > Self::MAX_RETRY_DELAY_SECS {
                result.add_error(ConfigValidationError::InvalidRetryPolicy {
                    message: format!(
                        "{} must be between 0 and {}, got {}",
                        name,
                        Self::MAX_RETRY_DELAY_SECS,
                        value
                    ),
                });
            }
        }
        if config.max_delay_secs < config.base_delay_secs {
            result.add_error(ConfigValidationError::InvalidRetryPolicy {
                message: format!(
                    "max_delay_secs ({}) must be >= base_delay_secs ({})",
                    config.max_delay_secs, config.base_delay_secs
                ),
            });
        }
    }

    fn validate_scheduler(config: &crate::SchedulerConfig, result: &mut ValidationResult) {
        if config.enabled {
            result.require_positive("scheduler.poll_interval_secs", config.poll_interval_secs);
        }
    }

    fn validate_observability(config: &AppConfig, result: &mut ValidationResult) {
        let level = config.observability.log_level.to_lowercase();
        if !Self::VALID_LOG_LEVELS.contains(&level.as_str()) {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: config.observability.log_level.clone(),
            });
        }

        if config.observability.metrics_enabled
            && config
                .observability
                .metrics_addr
                .parse::<std::net::SocketAddr>()
                .is_err()
        {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "metrics_addr".to_string(),
                message: format!("not a socket address: {}", config.observability.metrics_addr),
            });
        }

        if !(0.0..=1.0).contains(&config.telemetry.sampling_ratio) {
            result.add_error(ConfigValidationError::InvalidSamplingRatio {
                value: config.telemetry.sampling_ratio,
            });
        }

        if let Some(ref endpoint) = config.telemetry.otlp_endpoint {
            if Url::parse(endpoint).is_err() {
                result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "otlp_endpoint".to_string(),
                    message: format!("Invalid URL format: {}", endpoint),
                });
            }
        }
    }
}
