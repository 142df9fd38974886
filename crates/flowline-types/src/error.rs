//! Structured error model for stage operations.
//!
//! [`StageError`] carries classification and retry metadata for failures
//! surfaced by source, transform, and sink implementations. Construct via
//! category-specific factory methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a stage error.
///
/// Determines default retry behavior and operator-facing categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid stage configuration.
    Config,
    /// Transient I/O failure while fetching or writing (retryable).
    TransientIo,
    /// Rate limit exceeded by the external system (retryable).
    RateLimit,
    /// Invalid or corrupt data.
    Data,
    /// Internal stage error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::TransientIo => "transient_io",
            Self::RateLimit => "rate_limit",
            Self::Data => "data",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffClass {
    /// Millisecond-scale retry.
    Fast,
    /// Second-scale retry.
    Normal,
    /// Minute-scale retry.
    Slow,
}

/// Structured error from a stage operation.
///
/// Carries classification and retry metadata. Construct via the
/// category-specific factory methods (e.g. [`StageError::transient_io`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct StageError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub backoff_class: BackoffClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    fn new(
        category: ErrorCategory,
        retryable: bool,
        backoff_class: BackoffClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            backoff_class,
            details: None,
        }
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, false, BackoffClass::Normal, code, message)
    }

    /// Transient I/O error (retryable, normal backoff).
    #[must_use]
    pub fn transient_io(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientIo, true, BackoffClass::Normal, code, message)
    }

    /// Rate limit error (retryable, slow backoff).
    #[must_use]
    pub fn rate_limit(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, true, BackoffClass::Slow, code, message);
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// Data validation error (not retryable).
    #[must_use]
    pub fn data(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Data, false, BackoffClass::Normal, code, message)
    }

    /// Internal stage error (not retryable).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, false, BackoffClass::Normal, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the default backoff class.
    #[must_use]
    pub fn with_backoff_class(mut self, class: BackoffClass) -> Self {
        self.backoff_class = class;
        self
    }
}

fn default_max_retries() -> u32 {
    RetryPolicy::DEFAULT_MAX_RETRIES
}

fn default_backoff_ms() -> u64 {
    RetryPolicy::DEFAULT_BACKOFF_MS
}

/// Per-stage retry policy.
///
/// Retries are local to a stage's unit of work (one fetch, one process call,
/// one write) and invisible to the executor until exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = fail on first error).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for [`BackoffClass::Fast`]; other classes scale it up.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 2;
    pub const DEFAULT_BACKOFF_MS: u64 = 100;

    /// Policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: Self::DEFAULT_BACKOFF_MS,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            backoff_ms: Self::DEFAULT_BACKOFF_MS,
        }
    }
}
