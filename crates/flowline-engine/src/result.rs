//! Pipeline run summary types.

use crate::stage::StageRole;

/// Aggregate result of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Records the source emitted.
    pub records_read: u64,
    /// Records the sink durably wrote.
    pub records_written: u64,
    /// Wall-clock duration of the run.
    pub duration_secs: f64,
    /// Whether source record order survived end-to-end (every transform
    /// declared order preservation).
    pub order_preserved: bool,
    /// Per-stage breakdown in chain order.
    pub stages: Vec<StageReport>,
}

/// Per-stage counts and timing for a completed run.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: String,
    pub role: StageRole,
    /// Records processed by the stage (written, for the sink).
    pub records: u64,
    pub duration_secs: f64,
}
