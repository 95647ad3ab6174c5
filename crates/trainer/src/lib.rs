pub mod accumulator;
pub mod backbone;
pub mod config;
pub mod datasets;
pub mod error;
pub mod evaluator;
pub mod example;
pub mod label;
pub mod launch;
pub mod llm_output;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod prefetch;
pub mod provider;
pub mod sinks;
pub mod tch_backbone;

#[cfg(test)]
pub(crate) mod mock;

pub use accumulator::BatchAccumulator;
pub use backbone::{Backbone, ForwardOutput, LossTerm};
pub use config::{LabelType, LlmSource, ModelType, NonFinitePolicy, RetryPolicy, RunConfig, TrainerConfig};
pub use error::{Result, TrainError};
pub use evaluator::{EvalReport, Evaluator};
pub use example::{Batch, Example, Split};
pub use label::{GroundTruth, Label, LabelRequirements, LabelStrategy, LlmGenerated};
pub use launch::{launch, LaunchOptions};
pub use model::{ModelStrategy, Standard, TaskPrefix};
pub use orchestrator::{Orchestrator, Phase, RunReport, StopSignal, TrainState};
pub use provider::{DatasetProvider, InMemoryProvider};
pub use tch_backbone::TchBackbone;
