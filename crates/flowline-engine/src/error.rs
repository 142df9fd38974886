//! Pipeline error model and retry backoff helpers.

use std::time::Duration;

use flowline_types::{BackoffClass, RetryPolicy, StageError};

use crate::stage::StageRole;

const BACKOFF_NORMAL_MULTIPLIER: u64 = 10;
const BACKOFF_SLOW_MULTIPLIER: u64 = 50;
const BACKOFF_MAX_MS: u64 = 60_000;

/// Terminal error of a pipeline run.
///
/// `Stage` wraps the first stage failure observed by the controller together
/// with the sink's durable partial count at shutdown. `Infrastructure` wraps
/// host-side faults (worker panics, join failures) that are never retryable.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Invalid run configuration. Fatal, surfaced before any worker starts.
    #[error("invalid pipeline configuration: {0}")]
    Configuration(String),

    /// A stage failed after exhausting its local retries.
    #[error("stage '{stage}' ({role}) failed: {error} ({records_written} records written)")]
    Stage {
        stage: String,
        role: StageRole,
        #[source]
        error: StageError,
        records_written: u64,
    },

    /// The overall run deadline expired and every stage was cancelled.
    #[error("pipeline timed out ({records_written} records written)")]
    Timeout { records_written: u64 },

    /// Worker panic or other host-side fault.
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    /// Name of the failing stage, if this error is attributed to one.
    #[must_use]
    pub fn failing_stage(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Records the sink had durably written when the run terminated.
    #[must_use]
    pub fn records_written(&self) -> Option<u64> {
        match self {
            Self::Stage {
                records_written, ..
            }
            | Self::Timeout { records_written } => Some(*records_written),
            _ => None,
        }
    }
}

/// Compute retry delay based on error hints, policy base, and attempt number.
pub(crate) fn compute_backoff(policy: &RetryPolicy, err: &StageError, attempt: u32) -> Duration {
    // An explicit retry_after from the stage wins.
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms.min(BACKOFF_MAX_MS));
    }

    let base_ms: u64 = match err.backoff_class {
        BackoffClass::Fast => policy.backoff_ms,
        BackoffClass::Normal => policy.backoff_ms.saturating_mul(BACKOFF_NORMAL_MULTIPLIER),
        BackoffClass::Slow => policy.backoff_ms.saturating_mul(BACKOFF_SLOW_MULTIPLIER),
    };

    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_fast_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        let err = StageError::transient_io("X", "y").with_backoff_class(BackoffClass::Fast);
        assert_eq!(compute_backoff(&policy, &err, 1), Duration::from_millis(100));
        assert_eq!(compute_backoff(&policy, &err, 2), Duration::from_millis(200));
        assert_eq!(compute_backoff(&policy, &err, 3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_normal_scales_base() {
        let policy = RetryPolicy::default();
        let err = StageError::transient_io("X", "y");
        assert_eq!(compute_backoff(&policy, &err, 1), Duration::from_millis(1000));
        assert_eq!(compute_backoff(&policy, &err, 2), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_slow_scales_base() {
        let policy = RetryPolicy::default();
        let err = StageError::rate_limit("X", "y", None);
        assert_eq!(compute_backoff(&policy, &err, 1), Duration::from_millis(5000));
        assert_eq!(compute_backoff(&policy, &err, 2), Duration::from_millis(10000));
    }

    #[test]
    fn backoff_respects_retry_after() {
        let policy = RetryPolicy::default();
        let err = StageError::rate_limit("X", "y", Some(7500));
        assert_eq!(compute_backoff(&policy, &err, 1), Duration::from_millis(7500));
        assert_eq!(compute_backoff(&policy, &err, 5), Duration::from_millis(7500));
    }

    #[test]
    fn backoff_capped_at_60s() {
        let policy = RetryPolicy::default();
        let err = StageError::transient_io("X", "y");
        assert_eq!(
            compute_backoff(&policy, &err, 20),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn pipeline_error_accessors() {
        let err = PipelineError::Stage {
            stage: "parse".to_string(),
            role: StageRole::Transform,
            error: StageError::data("BAD_ROW", "unparseable"),
            records_written: 12,
        };
        assert_eq!(err.failing_stage(), Some("parse"));
        assert_eq!(err.records_written(), Some(12));

        let err = PipelineError::Timeout {
            records_written: 3,
        };
        assert_eq!(err.failing_stage(), None);
        assert_eq!(err.records_written(), Some(3));

        let err = PipelineError::Configuration("queue_capacity must be at least 1".into());
        assert_eq!(err.records_written(), None);
    }

    #[test]
    fn pipeline_error_display() {
        let err = PipelineError::Stage {
            stage: "writer".to_string(),
            role: StageRole::Sink,
            error: StageError::transient_io("CONN_RESET", "reset"),
            records_written: 40,
        };
        let msg = err.to_string();
        assert!(msg.contains("writer"));
        assert!(msg.contains("sink"));
        assert!(msg.contains("40 records written"));
    }
}
