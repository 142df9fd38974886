//! Typed pipeline construction.
//!
//! [`Pipeline`] is a builder over the type flowing out of the last wired
//! stage: `Pipeline::source(..)` starts a chain, `.transform(..)` extends it,
//! `.sink(..)` closes it into a [`PipelineDefinition`]. The output type of
//! stage *i* must be the input type of stage *i+1* — the compiler enforces
//! the adjacency invariant at construction, and the builder shape guarantees
//! exactly one source and one sink.

use flowline_types::RetryPolicy;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::queue::{self, BatchReceiver};
use crate::runner;
use crate::stage::{Sink, Source, StageOutcome, StageRole, Transform};

/// Identity and declared properties of one stage in a definition.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub role: StageRole,
    /// Whether the stage preserves record order (always true for sources and
    /// sinks; declared by each transform).
    pub order_preserving: bool,
}

/// Everything a launch closure needs to wire queues and spawn workers.
pub(crate) struct LaunchCtx {
    pub(crate) queue_capacity: usize,
    pub(crate) batch_size: usize,
    pub(crate) retry: RetryPolicy,
    pub(crate) cancel: CancellationToken,
}

type LaunchStage<T> =
    Box<dyn FnOnce(&LaunchCtx, &mut JoinSet<StageOutcome>) -> BatchReceiver<T> + Send>;

/// A partially built pipeline whose current output payload type is `T`.
pub struct Pipeline<T> {
    stages: Vec<StageDescriptor>,
    launch: LaunchStage<T>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Start a pipeline with its single source stage.
    pub fn source<S>(name: impl Into<String>, source: S) -> Self
    where
        S: Source<T> + 'static,
    {
        let name = name.into();
        let descriptor = StageDescriptor {
            name: name.clone(),
            role: StageRole::Source,
            order_preserving: true,
        };
        let launch: LaunchStage<T> = Box::new(move |ctx, workers| {
            let (tx, rx) = queue::bounded(ctx.queue_capacity, ctx.cancel.clone());
            workers.spawn(runner::run_source_stage(
                name,
                source,
                tx,
                ctx.batch_size,
                ctx.retry,
                ctx.cancel.clone(),
            ));
            rx
        });
        Self {
            stages: vec![descriptor],
            launch,
        }
    }

    /// Append a transform stage. The transform's input type must match the
    /// current chain output type.
    pub fn transform<U, F>(self, name: impl Into<String>, transform: F) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Transform<T, U> + 'static,
    {
        let name = name.into();
        let mut stages = self.stages;
        stages.push(StageDescriptor {
            name: name.clone(),
            role: StageRole::Transform,
            order_preserving: transform.order_preserving(),
        });
        let upstream = self.launch;
        let launch: LaunchStage<U> = Box::new(move |ctx, workers| {
            let input = upstream(ctx, workers);
            let (tx, rx) = queue::bounded(ctx.queue_capacity, ctx.cancel.clone());
            workers.spawn(runner::run_transform_stage(
                name,
                transform,
                input,
                tx,
                ctx.retry,
                ctx.cancel.clone(),
            ));
            rx
        });
        Pipeline { stages, launch }
    }

    /// Close the chain with its single sink stage.
    pub fn sink<K>(self, name: impl Into<String>, sink: K) -> PipelineDefinition
    where
        K: Sink<T> + 'static,
    {
        let name = name.into();
        let mut stages = self.stages;
        stages.push(StageDescriptor {
            name: name.clone(),
            role: StageRole::Sink,
            order_preserving: true,
        });
        let upstream = self.launch;
        let launch = Box::new(move |ctx: &LaunchCtx, workers: &mut JoinSet<StageOutcome>| {
            let input = upstream(ctx, workers);
            workers.spawn(runner::run_sink_stage(
                name,
                sink,
                input,
                ctx.retry,
                ctx.cancel.clone(),
            ));
        });
        PipelineDefinition { stages, launch }
    }
}

/// A complete, executable pipeline: one source, zero or more transforms, one
/// sink.
///
/// Consumed by [`crate::execute`]; each execution requires a freshly built
/// definition, so a consumed run cannot be re-executed.
pub struct PipelineDefinition {
    stages: Vec<StageDescriptor>,
    launch: Box<dyn FnOnce(&LaunchCtx, &mut JoinSet<StageOutcome>) + Send>,
}

impl PipelineDefinition {
    /// Stage descriptors in chain order (source first, sink last).
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// True when every transform in the chain declares order preservation,
    /// so source record order survives end-to-end.
    #[must_use]
    pub fn order_preserving(&self) -> bool {
        self.stages.iter().all(|s| s.order_preserving)
    }

    /// Wire queues, spawn one worker per stage, and hand back the
    /// descriptors for reporting.
    pub(crate) fn launch(
        self,
        ctx: &LaunchCtx,
        workers: &mut JoinSet<StageOutcome>,
    ) -> Vec<StageDescriptor> {
        (self.launch)(ctx, workers);
        self.stages
    }
}

impl std::fmt::Debug for PipelineDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDefinition")
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}
