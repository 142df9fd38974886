//! Pipeline executor and failure/cancellation controller.
//!
//! [`execute`] launches one worker per stage, then acts as the single
//! authority over terminal signals: the first failure observed flips the
//! shared cancellation token, later failures are logged as context, and
//! every worker is joined before the call returns.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ExecuteConfig;
use crate::error::PipelineError;
use crate::pipeline::{LaunchCtx, PipelineDefinition, StageDescriptor};
use crate::result::{RunSummary, StageReport};
use crate::stage::{StageOutcome, StageResult, StageRole};

enum FailureCause {
    Stage {
        stage: String,
        role: StageRole,
        error: flowline_types::StageError,
    },
    Panic(anyhow::Error),
}

#[derive(Default)]
struct Collector {
    outcomes: Vec<StageOutcome>,
    primary: Option<FailureCause>,
}

/// Execute a pipeline definition to completion.
///
/// Validates the configuration, runs every stage concurrently, and waits for
/// all workers to reach a terminal state. The definition is consumed: each
/// run requires a freshly built pipeline.
///
/// # Errors
///
/// - [`PipelineError::Configuration`] for invalid config values or duplicate
///   stage names, before any worker starts.
/// - [`PipelineError::Stage`] when a stage fails after exhausting retries;
///   carries the first failing stage and the sink's partial count.
/// - [`PipelineError::Timeout`] when `overall_timeout_ms` expires first.
/// - [`PipelineError::Infrastructure`] when a worker panics.
pub async fn execute(
    definition: PipelineDefinition,
    config: &ExecuteConfig,
) -> Result<RunSummary, PipelineError> {
    config.validate().map_err(PipelineError::Configuration)?;
    validate_stage_names(definition.stages())?;

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let ctx = LaunchCtx {
        queue_capacity: config.queue_capacity,
        batch_size: config.batch_size,
        retry: config.retry,
        cancel: cancel.clone(),
    };

    let order_preserved = definition.order_preserving();
    tracing::info!(
        stages = definition.stages().len(),
        queue_capacity = config.queue_capacity,
        batch_size = config.batch_size,
        "Starting pipeline run"
    );

    let mut workers = JoinSet::new();
    let stages = definition.launch(&ctx, &mut workers);

    let mut collector = Collector::default();
    let timed_out = match config.overall_timeout_ms {
        Some(ms) => {
            let deadline = Duration::from_millis(ms);
            let drained = tokio::time::timeout(
                deadline,
                drain_workers(&mut workers, &cancel, &mut collector),
            )
            .await;
            if drained.is_err() {
                tracing::warn!(timeout_ms = ms, "Run deadline expired, cancelling pipeline");
                cancel.cancel();
                drain_workers(&mut workers, &cancel, &mut collector).await;
                true
            } else {
                false
            }
        }
        None => {
            drain_workers(&mut workers, &cancel, &mut collector).await;
            false
        }
    };

    let records_written = records_for_role(&collector.outcomes, StageRole::Sink);
    let records_read = records_for_role(&collector.outcomes, StageRole::Source);

    if let Some(cause) = collector.primary {
        return Err(match cause {
            FailureCause::Stage { stage, role, error } => PipelineError::Stage {
                stage,
                role,
                error,
                records_written,
            },
            FailureCause::Panic(error) => PipelineError::Infrastructure(error),
        });
    }

    if timed_out {
        return Err(PipelineError::Timeout { records_written });
    }

    let duration_secs = started.elapsed().as_secs_f64();
    let stage_reports = stage_reports(&stages, collector.outcomes);
    tracing::info!(
        records_read,
        records_written,
        duration_secs,
        "Pipeline run completed"
    );

    Ok(RunSummary {
        records_read,
        records_written,
        duration_secs,
        order_preserved,
        stages: stage_reports,
    })
}

fn validate_stage_names(stages: &[StageDescriptor]) -> Result<(), PipelineError> {
    let mut seen = HashSet::new();
    for descriptor in stages {
        if !seen.insert(descriptor.name.as_str()) {
            return Err(PipelineError::Configuration(format!(
                "duplicate stage name '{}'",
                descriptor.name
            )));
        }
    }
    Ok(())
}

/// Join workers as they terminate. The first `Failed` outcome becomes the
/// primary cause and triggers cancellation; everything after it is context.
async fn drain_workers(
    workers: &mut JoinSet<StageOutcome>,
    cancel: &CancellationToken,
    collector: &mut Collector,
) {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(outcome) => {
                if let StageResult::Failed(error, _) = &outcome.result {
                    if collector.primary.is_none() {
                        tracing::error!(
                            stage = %outcome.stage,
                            role = %outcome.role,
                            error = %error,
                            "Stage failed, cancelling pipeline"
                        );
                        collector.primary = Some(FailureCause::Stage {
                            stage: outcome.stage.clone(),
                            role: outcome.role,
                            error: error.clone(),
                        });
                        cancel.cancel();
                    } else {
                        tracing::warn!(
                            stage = %outcome.stage,
                            error = %error,
                            "Stage failed during shutdown"
                        );
                    }
                }
                collector.outcomes.push(outcome);
            }
            Err(join_err) => {
                if collector.primary.is_none() {
                    collector.primary = Some(FailureCause::Panic(anyhow::anyhow!(
                        "stage worker panicked: {join_err}"
                    )));
                }
                cancel.cancel();
            }
        }
    }
}

fn records_for_role(outcomes: &[StageOutcome], role: StageRole) -> u64 {
    outcomes
        .iter()
        .find(|o| o.role == role)
        .map_or(0, |o| o.result.records())
}

/// Arrange collected outcomes into the definition's chain order.
fn stage_reports(stages: &[StageDescriptor], outcomes: Vec<StageOutcome>) -> Vec<StageReport> {
    let mut remaining = outcomes;
    let mut reports = Vec::with_capacity(stages.len());
    for descriptor in stages {
        if let Some(idx) = remaining.iter().position(|o| o.stage == descriptor.name) {
            let outcome = remaining.swap_remove(idx);
            reports.push(StageReport {
                stage: outcome.stage,
                role: outcome.role,
                records: outcome.result.records(),
                duration_secs: outcome.duration_secs,
            });
        }
    }
    reports
}
