//! # Keel Core
//!
//! Error types shared by every Keel crate, plus the tracing and
//! OpenTelemetry bootstrap used by the worker binary.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::*;
