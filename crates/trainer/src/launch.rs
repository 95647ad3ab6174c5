//! Wires configuration, data, backbone and sinks into an [`Orchestrator`].

use std::path::PathBuf;
use tch::Device;
use tokio::runtime::Handle;

use inference::SamplingParams;

use crate::config::{LabelType, RunConfig, TrainerConfig};
use crate::datasets::{self, LoadOptions};
use crate::error::{Result, TrainError};
use crate::evaluator::Evaluator;
use crate::label::{label_strategy, LabelGenerator, NoGenerator, SampledTeacherGenerator};
use crate::model::model_strategy;
use crate::orchestrator::{Orchestrator, RunReport, StopSignal};
use crate::prefetch::PrefetchProvider;
use crate::provider::{DatasetProvider, InMemoryProvider};
use crate::sinks::{load_checkpoint_record, DirCheckpointSink, JsonlMetricsSink, LogMetricsSink};
use crate::tch_backbone::TchBackbone;

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Checkpoint directory to continue from instead of `from_pretrained`.
    pub resume_from: Option<PathBuf>,
    /// Pretrained model that writes missing `llm_generated` labels.
    pub label_teacher: Option<PathBuf>,
}

/// Validates everything that can be checked without loading a model.
pub fn validate(run: &RunConfig, trainer: &TrainerConfig) -> Result<()> {
    run.validate()?;
    trainer.validate()?;
    datasets::lookup(&run.dataset)?;
    Ok(())
}

pub fn launch(run: RunConfig, trainer: TrainerConfig, options: LaunchOptions, stop: StopSignal) -> Result<RunReport> {
    validate(&run, &trainer)?;
    let spec = datasets::lookup(&run.dataset)?;
    let model = model_strategy::<TchBackbone>(run.model_type, trainer.alpha, trainer.output_rationale);
    let requirements = model.requirements();

    let load = LoadOptions {
        llm: Some(trainer.llm),
        require_llm: requirements.rationale
            || (run.label_type == LabelType::LlmGenerated && options.label_teacher.is_none()),
        subsample: trainer.subsample,
        seed: trainer.seed,
    };
    let loaded = datasets::load_dataset(&trainer.data_root, &run.dataset, &load)?;

    let eval_batch_size = trainer.eval_batch_size.unwrap_or(run.batch_size);
    let in_memory = InMemoryProvider::new(loaded.splits, run.batch_size, eval_batch_size, trainer.seed);
    let provider: Box<dyn DatasetProvider> = if trainer.prefetch > 0 {
        let runtime = Handle::try_current()
            .map_err(|e| TrainError::Provider(format!("prefetch needs a tokio runtime: {e}")))?;
        Box::new(PrefetchProvider::spawn(
            in_memory,
            trainer.prefetch,
            trainer.provider_timeout(),
            runtime,
        ))
    } else {
        Box::new(in_memory)
    };

    let device = Device::cuda_if_available();
    log::info!("using device {:?}", device);
    let weights = options.resume_from.as_ref().unwrap_or(&run.from_pretrained);
    let backbone = TchBackbone::from_pretrained(
        weights,
        device,
        trainer.learning_rate,
        trainer.weight_decay,
        trainer.max_input_length,
        trainer.max_target_length,
    )?;

    let generator: Box<dyn LabelGenerator> = match &options.label_teacher {
        Some(dir) => {
            log::info!("llm labels will be sampled from {:?}", dir);
            let teacher = inference::load_pretrained(dir, device)?;
            Box::new(SampledTeacherGenerator::new(
                teacher,
                SamplingParams::default(),
                trainer.max_input_length,
                trainer.max_target_length,
            ))
        }
        None => Box::new(NoGenerator),
    };
    let labels = label_strategy(run.label_type, requirements, trainer.seed, spec.format, trainer.llm, generator);

    let evaluator = Evaluator::new(
        spec.eval_split(),
        trainer.gen_max_len,
        spec.equation_label,
        trainer.provider_retry.clone(),
    );
    let output_dir = trainer.output_dir.clone();
    let resume_state = match &options.resume_from {
        Some(dir) => Some(load_checkpoint_record(dir)?.train_state),
        None => None,
    };

    let mut orchestrator = Orchestrator::new(run, trainer, backbone, model, labels, provider, evaluator)?
        .with_checkpoint_sink(Box::new(DirCheckpointSink::new(&output_dir)))
        .with_metrics_sink(Box::new(LogMetricsSink))
        .with_metrics_sink(Box::new(JsonlMetricsSink::create(&output_dir)?))
        .with_stop_signal(stop);
    if let Some(state) = resume_state {
        orchestrator = orchestrator.resume(state);
    }

    Ok(orchestrator.run())
}
