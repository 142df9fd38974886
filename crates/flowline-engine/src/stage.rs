//! Stage capability traits and terminal stage state.
//!
//! A stage wraps exactly one capability — fetch, process, or write — behind a
//! uniform execution contract. Implementations are resolved generically at
//! pipeline construction; stages never reference each other directly.

use async_trait::async_trait;
use flowline_types::{Batch, StageError};
use std::fmt;

/// Role of a stage within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    Source,
    Transform,
    Sink,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Source => "source",
            Self::Transform => "transform",
            Self::Sink => "sink",
        };
        f.write_str(s)
    }
}

/// Produces the initial record stream.
///
/// The engine assigns strictly increasing sequence ids as payloads are
/// emitted and groups them into batches. `fetch_next` may block on I/O
/// internally; that blocking is opaque to the engine.
#[async_trait]
pub trait Source<T>: Send {
    /// Fetch the next payload, or `None` when the source is exhausted.
    async fn fetch_next(&mut self) -> Result<Option<T>, StageError>;

    /// Optional partition/ordering key for a payload.
    fn key(&self, _payload: &T) -> Option<String> {
        None
    }
}

/// Maps an input batch stream to an output batch stream.
///
/// `process` must be pure with respect to pipeline state: no hidden state
/// mutation visible outside the call. It takes the batch by reference so the
/// engine can re-apply it when a retryable error is returned.
#[async_trait]
pub trait Transform<In, Out>: Send {
    async fn process(&mut self, batch: &Batch<In>) -> Result<Batch<Out>, StageError>;

    /// Whether this transform preserves record order end-to-end. Record
    /// order from the source survives the whole chain only if every
    /// transform claims this; the engine itself never reorders.
    fn order_preserving(&self) -> bool {
        true
    }
}

/// Consumes and persists the final stream.
#[async_trait]
pub trait Sink<T>: Send {
    /// Persist a batch, returning the number of records durably written.
    ///
    /// A retried `write` may see the same batch again; deduplication is the
    /// sink's concern.
    async fn write(&mut self, batch: &Batch<T>) -> Result<u64, StageError>;
}

/// Terminal state of a single stage worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    /// Clean completion; count of records processed (records written, for a
    /// sink).
    Completed(u64),
    /// The wrapped capability failed after exhausting local retries.
    Failed(StageError, u64),
    /// Cooperative shutdown observed at a blocking point.
    Cancelled(u64),
}

impl StageResult {
    #[must_use]
    pub fn records(&self) -> u64 {
        match self {
            Self::Completed(n) | Self::Failed(_, n) | Self::Cancelled(n) => *n,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// What a stage worker reports back to the executor when it terminates.
#[derive(Debug)]
pub struct StageOutcome {
    pub stage: String,
    pub role: StageRole,
    pub result: StageResult,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_display() {
        assert_eq!(StageRole::Source.to_string(), "source");
        assert_eq!(StageRole::Transform.to_string(), "transform");
        assert_eq!(StageRole::Sink.to_string(), "sink");
    }

    #[test]
    fn stage_result_records() {
        assert_eq!(StageResult::Completed(5).records(), 5);
        assert_eq!(
            StageResult::Failed(StageError::internal("X", "y"), 3).records(),
            3
        );
        assert_eq!(StageResult::Cancelled(7).records(), 7);
    }

    #[test]
    fn only_completed_is_completed() {
        assert!(StageResult::Completed(0).is_completed());
        assert!(!StageResult::Cancelled(0).is_completed());
        assert!(!StageResult::Failed(StageError::internal("X", "y"), 0).is_completed());
    }
}
