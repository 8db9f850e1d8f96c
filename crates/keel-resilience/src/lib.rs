//! # Keel Resilience
//!
//! Infrastructure resilience for the Keel worker: a fixed-interval retry
//! for store calls and a timeout wrapper. Job-level retries are a separate
//! concern handled by `keel_jobs::RetryPolicy`.

pub mod retry;
pub mod timeout;

pub use retry::*;
pub use timeout::*;
