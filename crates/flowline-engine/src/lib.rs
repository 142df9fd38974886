//! Staged, concurrent data pipeline engine.
//!
//! A pipeline is a typed chain of one source, zero or more transforms, and
//! one sink. [`execute`] runs one concurrent worker per stage, connected by
//! bounded FIFO queues that provide backpressure, with a shared cancellation
//! token for prompt shutdown on the first stage failure.

pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod queue;
pub mod result;
pub(crate) mod runner;
pub mod stage;

pub use config::ExecuteConfig;
pub use error::PipelineError;
pub use executor::execute;
pub use pipeline::{Pipeline, PipelineDefinition, StageDescriptor};
pub use result::{RunSummary, StageReport};
pub use stage::{Sink, Source, StageResult, StageRole, Transform};
