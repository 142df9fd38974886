//! Shared data and error model for flowline pipelines.

pub mod error;
pub mod record;

pub use error::{BackoffClass, ErrorCategory, RetryPolicy, StageError};
pub use record::{Batch, Record};
