use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::accumulator::BatchAccumulator;
use crate::backbone::Backbone;
use crate::config::{NonFinitePolicy, RunConfig, TrainerConfig};
use crate::error::{Result, TrainError};
use crate::evaluator::{EvalReport, Evaluator};
use crate::example::{Batch, Example, Split};
use crate::label::LabelStrategy;
use crate::model::ModelStrategy;
use crate::provider::{fetch_with_retry, DatasetProvider};
use crate::sinks::{CheckpointRecord, CheckpointSink, MetricsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Running,
    EvaluatingAside,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Running => "running",
            Phase::EvaluatingAside => "evaluating_aside",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    /// Process exit code for a run that ended in this phase.
    pub fn exit_code(&self) -> i32 {
        match self {
            Phase::Completed => 0,
            Phase::Cancelled => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Committed training progress. Parameters and optimizer state live in the
/// backbone; this is the part the orchestrator owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub global_step: u64,
    /// Epoch in progress (or the number of finished epochs once complete).
    pub epoch: usize,
    /// Mean loss of the last committed group.
    pub last_loss: Option<f64>,
    /// Training micro-batches of `epoch` already covered by committed steps.
    #[serde(default)]
    pub batches_in_epoch: usize,
}

/// Cooperative cancellation, checked between micro-batches.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub final_state: Phase,
    pub train_state: TrainState,
    /// Optimizer steps committed by this run.
    pub steps: u64,
    pub evaluations: Vec<EvalReport>,
    pub skipped_examples: usize,
    pub discarded_groups: usize,
    pub last_error: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.final_state.exit_code()
    }
}

enum Finish {
    Completed,
    Cancelled,
}

/// Drives one training run: pulls micro-batches, labels them, runs the
/// model strategy, accumulates gradients, commits optimizer steps and
/// evaluates on cadence.
pub struct Orchestrator<B: Backbone> {
    run: RunConfig,
    trainer: TrainerConfig,
    backbone: B,
    model: Box<dyn ModelStrategy<B>>,
    labels: Box<dyn LabelStrategy>,
    provider: Box<dyn DatasetProvider>,
    evaluator: Evaluator,
    checkpoints: Option<Box<dyn CheckpointSink>>,
    metrics: Vec<Box<dyn MetricsSink>>,
    stop: StopSignal,
    accumulator: BatchAccumulator,
    state: TrainState,
    phase: Phase,
    steps: u64,
    evaluations: Vec<EvalReport>,
    skipped_examples: usize,
    discarded_groups: usize,
    /// Micro-batches fetched so far in the current epoch.
    epoch_batches: usize,
}

impl<B: Backbone> Orchestrator<B> {
    /// Validates the configuration; nothing runs until [`Orchestrator::run`].
    pub fn new(
        run: RunConfig,
        trainer: TrainerConfig,
        backbone: B,
        model: Box<dyn ModelStrategy<B>>,
        labels: Box<dyn LabelStrategy>,
        provider: Box<dyn DatasetProvider>,
        evaluator: Evaluator,
    ) -> Result<Self> {
        run.validate()?;
        trainer.validate()?;
        for split in [Split::Train, evaluator.split()] {
            if !provider.has_split(split) {
                return Err(TrainError::InvalidConfig(format!("dataset provider has no {split} split")));
            }
        }
        log::info!(
            "run: dataset={} model_type={} label_type={} batch_size={} grad_steps={} eval_steps={}",
            run.dataset,
            model.name(),
            labels.name(),
            run.batch_size,
            run.grad_steps,
            run.eval_steps
        );

        let accumulator = BatchAccumulator::new(run.grad_steps);
        Ok(Self {
            run,
            trainer,
            backbone,
            model,
            labels,
            provider,
            evaluator,
            checkpoints: None,
            metrics: Vec::new(),
            stop: StopSignal::new(),
            accumulator,
            state: TrainState::default(),
            phase: Phase::Init,
            steps: 0,
            evaluations: Vec::new(),
            skipped_examples: 0,
            discarded_groups: 0,
            epoch_batches: 0,
        })
    }

    pub fn with_checkpoint_sink(mut self, sink: Box<dyn CheckpointSink>) -> Self {
        self.checkpoints = Some(sink);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.metrics.push(sink);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Continues from a checkpointed state. The accumulator starts empty and
    /// the micro-batches the state already covers are skipped.
    pub fn resume(mut self, state: TrainState) -> Self {
        log::info!(
            "resuming at step {} (epoch {}, {} micro-batch(es) in)",
            state.global_step,
            state.epoch,
            state.batches_in_epoch
        );
        self.state = state;
        self.accumulator = BatchAccumulator::new(self.run.grad_steps);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn run(&mut self) -> RunReport {
        self.phase = Phase::Running;
        log::info!("training started at step {}", self.state.global_step);

        let mut last_error = None;
        match self.train() {
            Ok(finish) => {
                self.phase = match finish {
                    Finish::Completed => Phase::Completed,
                    Finish::Cancelled => Phase::Cancelled,
                };
                if self.state.global_step > 0 {
                    if let Err(err) = self.checkpoint() {
                        log::error!("final checkpoint failed: {err}");
                        self.phase = Phase::Failed;
                        last_error = Some(err.to_string());
                    }
                }
            }
            Err(err) => {
                log::error!("training failed at step {}: {err}", self.state.global_step);
                let dropped = self.accumulator.discard(&mut self.backbone);
                if dropped > 0 {
                    log::warn!("dropped {dropped} uncommitted micro-batch(es)");
                }
                self.phase = Phase::Failed;
                if self.state.global_step > 0 {
                    if let Err(save_err) = self.checkpoint() {
                        log::error!("could not checkpoint the failed run: {save_err}");
                    }
                }
                last_error = Some(err.to_string());
            }
        }

        log::info!(
            "run {} at step {} ({} step(s) this run, {} evaluation(s))",
            self.phase,
            self.state.global_step,
            self.steps,
            self.evaluations.len()
        );
        RunReport {
            final_state: self.phase,
            train_state: self.state.clone(),
            steps: self.steps,
            evaluations: std::mem::take(&mut self.evaluations),
            skipped_examples: self.skipped_examples,
            discarded_groups: self.discarded_groups,
            last_error,
        }
    }

    fn max_steps_reached(&self) -> bool {
        self.trainer.max_steps.is_some_and(|max| self.state.global_step >= max)
    }

    fn train(&mut self) -> Result<Finish> {
        let mut consecutive_discards = 0u32;

        for epoch in self.state.epoch..self.trainer.epochs {
            self.state.epoch = epoch;
            self.provider.reset(Split::Train, epoch)?;
            log::info!("epoch {}/{}", epoch + 1, self.trainer.epochs);
            self.epoch_batches = 0;
            self.skip_committed(self.state.batches_in_epoch)?;

            loop {
                if self.max_steps_reached() {
                    return Ok(Finish::Completed);
                }
                // Only between groups, never mid-accumulation.
                if self.stop.is_stopped() && self.accumulator.is_empty() {
                    log::warn!("stop requested, leaving at step {}", self.state.global_step);
                    return Ok(Finish::Cancelled);
                }

                let examples = match fetch_with_retry(self.provider.as_mut(), Split::Train, &self.trainer.provider_retry)? {
                    Batch::Examples(examples) => examples,
                    Batch::EndOfSplit => break,
                };
                self.epoch_batches += 1;

                match self.micro_step(examples) {
                    Ok(true) => {
                        self.commit()?;
                        consecutive_discards = 0;
                    }
                    Ok(false) => {}
                    Err(err) if err.is_group_scoped() => match self.trainer.non_finite_policy {
                        NonFinitePolicy::Halt => return Err(err),
                        NonFinitePolicy::RetryGroup { max_retries } => {
                            consecutive_discards += 1;
                            if consecutive_discards > max_retries {
                                return Err(err);
                            }
                            let dropped = self.accumulator.discard(&mut self.backbone);
                            self.discarded_groups += 1;
                            log::warn!(
                                "{err}: discarded accumulation group ({} micro-batch(es)), retry {consecutive_discards}/{max_retries}",
                                dropped + 1
                            );
                        }
                    },
                    Err(err) if err.is_fatal_for_run() => return Err(err),
                    Err(err) => {
                        // Nothing reached the gradients; only this micro-batch is lost.
                        log::warn!("dropping micro-batch: {err}");
                    }
                }
            }

            if !self.accumulator.is_empty() {
                log::debug!(
                    "flushing partial group of {} micro-batch(es) at end of epoch",
                    self.accumulator.count()
                );
                self.commit()?;
            }
            self.state.epoch = epoch + 1;
            self.state.batches_in_epoch = 0;
        }

        Ok(Finish::Completed)
    }

    /// Fast-forwards the training split past micro-batches that earlier
    /// committed steps already consumed. The order is fixed by seed and
    /// epoch, so these are exactly the batches trained before.
    fn skip_committed(&mut self, count: usize) -> Result<()> {
        while self.epoch_batches < count {
            match fetch_with_retry(self.provider.as_mut(), Split::Train, &self.trainer.provider_retry)? {
                Batch::Examples(_) => self.epoch_batches += 1,
                Batch::EndOfSplit => break,
            }
        }
        if count > 0 {
            log::info!("skipped {} already-trained micro-batch(es)", self.epoch_batches);
        }
        Ok(())
    }

    /// Labels, forwards and accumulates one micro-batch. Returns true when
    /// the accumulation group is complete.
    fn micro_step(&mut self, examples: Vec<Example>) -> Result<bool> {
        let requirements = self.model.requirements();
        let mut kept = Vec::with_capacity(examples.len());
        let mut labels = Vec::with_capacity(examples.len());
        for example in examples {
            let label = self
                .labels
                .produce_label(&example)
                .and_then(|label| requirements.check(&example, label));
            match label {
                Ok(label) => {
                    kept.push(example);
                    labels.push(label);
                }
                Err(err) if err.is_example_scoped() => {
                    log::warn!("skipping example: {err}");
                    self.skipped_examples += 1;
                }
                Err(err) => return Err(err),
            }
        }
        if kept.is_empty() {
            log::debug!("micro-batch had no labelled examples");
            return Ok(false);
        }

        let out = self.model.forward(&mut self.backbone, &kept, &labels)?;
        if log::log_enabled!(log::Level::Debug) {
            let parts: Vec<String> = out.parts.iter().map(|(name, v)| format!("{name}={v:.4}")).collect();
            log::debug!("micro-batch of {}: {}", kept.len(), parts.join(" "));
            for (example, prediction) in kept.iter().zip(&out.predictions) {
                log::debug!("example {} predicted {:?}", example.id, prediction);
            }
        }
        self.accumulator.consume(&mut self.backbone, &out.loss)
    }

    fn commit(&mut self) -> Result<()> {
        let Some(group) = self.accumulator.take_group(&mut self.backbone)? else {
            return Ok(());
        };
        let step = self.state.global_step + 1;
        let lr = self.trainer.learning_rate_at(step);
        self.backbone.set_learning_rate(lr);
        self.backbone.step()?;
        self.backbone.zero_grad();

        self.state.global_step = step;
        self.state.last_loss = Some(group.mean_loss);
        self.state.batches_in_epoch = self.epoch_batches;
        self.steps += 1;

        if step == 1 || step % 10 == 0 {
            log::info!(
                "step {step} | epoch {} | loss {:.4} | lr {lr:.2e} | micro-batches {}",
                self.state.epoch,
                group.mean_loss,
                group.micro_batches
            );
        } else {
            log::debug!("step {step} | loss {:.4}", group.mean_loss);
        }

        if self.trainer.save_steps.is_some_and(|every| step % every == 0) {
            self.checkpoint()?;
        }
        if step % self.run.eval_steps == 0 {
            self.evaluate()?;
        }
        Ok(())
    }

    fn evaluate(&mut self) -> Result<()> {
        self.phase = Phase::EvaluatingAside;
        let report = self.evaluator.evaluate(
            self.state.global_step,
            &self.backbone,
            self.model.as_ref(),
            self.provider.as_mut(),
        )?;
        for sink in &mut self.metrics {
            sink.record(report.global_step, &report.metrics)?;
        }
        self.evaluations.push(report);
        self.phase = Phase::Running;
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        let Some(sink) = self.checkpoints.as_mut() else {
            return Ok(());
        };
        let record = CheckpointRecord {
            train_state: self.state.clone(),
            phase: self.phase.to_string(),
            run_config: self.run.clone(),
            trainer_config: self.trainer.clone(),
        };
        let backbone = &self.backbone;
        sink.save(&record, &|dir| backbone.save(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelType, ModelType, RetryPolicy};
    use crate::label::{GroundTruth, LabelRequirements};
    use crate::mock::MockBackbone;
    use crate::model::{Standard, TaskPrefix};
    use crate::sinks::Metrics;
    use crate::provider::InMemoryProvider;
    use std::cell::RefCell;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;

    fn run_config(batch_size: usize, grad_steps: usize, eval_steps: u64) -> RunConfig {
        RunConfig {
            from_pretrained: PathBuf::from("mock"),
            dataset: "svamp".to_string(),
            model_type: ModelType::Standard,
            label_type: LabelType::GroundTruth,
            eval_steps,
            batch_size,
            grad_steps,
        }
    }

    fn trainer_config() -> TrainerConfig {
        TrainerConfig {
            learning_rate: 0.1,
            ..TrainerConfig::default()
        }
    }

    fn examples(n: usize) -> Vec<Example> {
        (0..n).map(|i| Example::new(i, format!("q{i}"), format!("a{i}"))).collect()
    }

    fn provider(train: Vec<Example>, batch_size: usize) -> Box<dyn DatasetProvider> {
        Box::new(InMemoryProvider::new(
            [(Split::Train, train), (Split::Test, examples(1))],
            batch_size,
            4,
            0,
        ))
    }

    fn orchestrator(
        run: RunConfig,
        trainer: TrainerConfig,
        backbone: MockBackbone,
        train: Vec<Example>,
    ) -> Orchestrator<MockBackbone> {
        let provider = provider(train, run.batch_size);
        Orchestrator::new(
            run,
            trainer,
            backbone,
            Box::new(Standard),
            Box::new(GroundTruth::new(LabelRequirements::default())),
            provider,
            Evaluator::new(Split::Test, 8, false, RetryPolicy::default()),
        )
        .unwrap()
    }

    #[derive(Clone, Default)]
    struct Saved(Rc<RefCell<Vec<(u64, String)>>>);

    impl CheckpointSink for Saved {
        fn save(&mut self, record: &CheckpointRecord, _write: &dyn Fn(&Path) -> Result<()>) -> Result<()> {
            self.0.borrow_mut().push((record.train_state.global_step, record.phase.clone()));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Recorded(Rc<RefCell<Vec<(u64, Metrics)>>>);

    impl MetricsSink for Recorded {
        fn record(&mut self, global_step: u64, metrics: &Metrics) -> Result<()> {
            self.0.borrow_mut().push((global_step, metrics.clone()));
            Ok(())
        }
    }

    /// Flips the stop signal once `after` training batches have been served.
    struct StopAfter {
        inner: InMemoryProvider,
        stop: StopSignal,
        after: usize,
        served: usize,
    }

    impl DatasetProvider for StopAfter {
        fn next_batch(&mut self, split: Split) -> Result<Batch> {
            if split == Split::Train {
                self.served += 1;
                if self.served == self.after {
                    self.stop.stop();
                }
            }
            self.inner.next_batch(split)
        }

        fn reset(&mut self, split: Split, epoch: usize) -> Result<()> {
            self.inner.reset(split, epoch)
        }

        fn has_split(&self, split: Split) -> bool {
            self.inner.has_split(split)
        }
    }

    #[test]
    fn invalid_config_fails_before_running() {
        let result = Orchestrator::new(
            run_config(0, 1, 1),
            trainer_config(),
            MockBackbone::new(),
            Box::new(Standard),
            Box::new(GroundTruth::new(LabelRequirements::default())),
            provider(examples(1), 1),
            Evaluator::new(Split::Test, 8, false, RetryPolicy::default()),
        );
        assert!(matches!(result.err(), Some(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn each_step_averages_grad_steps_micro_batches() {
        let backbone = MockBackbone::with_losses((1..=12).map(f64::from));
        let mut run = orchestrator(run_config(1, 3, 100), trainer_config(), backbone, examples(12));
        let report = run.run();

        assert_eq!(report.final_state, Phase::Completed);
        assert_eq!(report.steps, 4);
        assert_eq!(report.train_state.global_step, 4);
        let applied = &run.backbone().applied;
        assert_eq!(applied.len(), 4);
        for (got, want) in applied.iter().zip([2.0, 5.0, 8.0, 11.0]) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
        assert_eq!(run.backbone().forwards.len(), 12);
    }

    #[test]
    fn evaluates_exactly_on_cadence() {
        let mut run = orchestrator(run_config(1, 1, 1000), trainer_config(), MockBackbone::new(), examples(5000));
        let report = run.run();
        let steps: Vec<u64> = report.evaluations.iter().map(|e| e.global_step).collect();
        assert_eq!(steps, vec![1000, 2000, 3000, 4000, 5000]);
    }

    #[test]
    fn partial_final_group_is_flushed_as_one_step() {
        let backbone = MockBackbone::with_losses([2.0, 4.0, 6.0]);
        let mut run = orchestrator(run_config(1, 16, 100), trainer_config(), backbone, examples(3));
        let report = run.run();
        assert_eq!(report.final_state, Phase::Completed);
        assert_eq!(report.steps, 1);
        assert!((run.backbone().applied[0] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn every_epoch_flushes_its_tail() {
        let trainer = TrainerConfig {
            epochs: 2,
            ..trainer_config()
        };
        let mut run = orchestrator(run_config(2, 2, 100), trainer, MockBackbone::new(), examples(6));
        let report = run.run();
        // 3 micro-batches per epoch: one full group plus a flushed single.
        assert_eq!(report.steps, 4);
        assert_eq!(report.train_state.epoch, 2);
    }

    #[test]
    fn resume_continues_the_step_count() {
        let mut run = orchestrator(run_config(1, 1, 3), trainer_config(), MockBackbone::new(), examples(4)).resume(
            TrainState {
                global_step: 4,
                epoch: 0,
                last_loss: Some(1.0),
                batches_in_epoch: 0,
            },
        );
        let report = run.run();
        assert_eq!(report.train_state.global_step, 8);
        assert_eq!(report.steps, 4);
        let steps: Vec<u64> = report.evaluations.iter().map(|e| e.global_step).collect();
        assert_eq!(steps, vec![6]);
    }

    #[test]
    fn non_finite_loss_halts_without_touching_parameters() {
        let saved = Saved::default();
        let backbone = MockBackbone::with_losses([1.0, 1.0, 3.0, f64::NAN]);
        let mut run = orchestrator(run_config(1, 2, 100), trainer_config(), backbone, examples(8))
            .with_checkpoint_sink(Box::new(saved.clone()));
        let report = run.run();

        assert_eq!(report.final_state, Phase::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.train_state.global_step, 1);
        assert!(report.last_error.unwrap().contains("non-finite"));
        // Only the first group reached the parameters; the poisoned one was dropped.
        let backbone = run.backbone();
        assert_eq!(backbone.applied, vec![1.0]);
        assert!((backbone.param - -0.1).abs() < 1e-12);
        assert_eq!(backbone.grad, 0.0);
        assert_eq!(*saved.0.borrow(), vec![(1, "failed".to_string())]);
    }

    #[test]
    fn retry_policy_discards_the_group_and_continues() {
        let trainer = TrainerConfig {
            non_finite_policy: NonFinitePolicy::RetryGroup { max_retries: 1 },
            ..trainer_config()
        };
        let backbone = MockBackbone::with_losses([5.0, f64::INFINITY, 2.0, 4.0]);
        let mut run = orchestrator(run_config(1, 2, 100), trainer, backbone, examples(4));
        let report = run.run();

        assert_eq!(report.final_state, Phase::Completed);
        assert_eq!(report.discarded_groups, 1);
        assert_eq!(report.steps, 1);
        assert_eq!(run.backbone().applied, vec![3.0]);
    }

    #[test]
    fn too_many_consecutive_discards_fail_the_run() {
        let trainer = TrainerConfig {
            non_finite_policy: NonFinitePolicy::RetryGroup { max_retries: 1 },
            ..trainer_config()
        };
        let backbone = MockBackbone::with_losses([f64::NAN, f64::NAN]);
        let mut run = orchestrator(run_config(1, 1, 100), trainer, backbone, examples(4));
        let report = run.run();
        assert_eq!(report.final_state, Phase::Failed);
        assert_eq!(report.discarded_groups, 1);
        assert_eq!(run.backbone().steps, 0);
    }

    #[test]
    fn unlabelled_examples_are_skipped() {
        let mut train = examples(4);
        train[1].label = None;
        train[2].label = Some("  ".to_string());
        let mut run = orchestrator(run_config(1, 1, 100), trainer_config(), MockBackbone::new(), train);
        let report = run.run();
        assert_eq!(report.final_state, Phase::Completed);
        assert_eq!(report.skipped_examples, 2);
        assert_eq!(report.steps, 2);
    }

    #[test]
    fn stop_waits_for_the_group_to_complete() {
        let stop = StopSignal::new();
        let inner = InMemoryProvider::new([(Split::Train, examples(10)), (Split::Test, examples(1))], 1, 1, 0);
        let provider = StopAfter {
            inner,
            stop: stop.clone(),
            after: 2,
            served: 0,
        };
        let mut run = Orchestrator::new(
            run_config(1, 3, 100),
            trainer_config(),
            MockBackbone::new(),
            Box::new(Standard),
            Box::new(GroundTruth::new(LabelRequirements::default())),
            Box::new(provider),
            Evaluator::new(Split::Test, 8, false, RetryPolicy::default()),
        )
        .unwrap()
        .with_stop_signal(stop);

        let report = run.run();
        assert_eq!(report.final_state, Phase::Cancelled);
        assert_eq!(report.exit_code(), 130);
        assert_eq!(report.steps, 1);
        assert_eq!(run.backbone().forwards.len(), 3);
    }

    #[test]
    fn resuming_an_interrupted_run_matches_a_straight_run() {
        let mut straight = orchestrator(run_config(1, 2, 1), trainer_config(), MockBackbone::new(), examples(7));
        let full = straight.run();
        assert_eq!(full.steps, 4);

        let stop = StopSignal::new();
        let inner = InMemoryProvider::new([(Split::Train, examples(7)), (Split::Test, examples(1))], 1, 4, 0);
        let provider = StopAfter {
            inner,
            stop: stop.clone(),
            after: 3,
            served: 0,
        };
        let mut first = Orchestrator::new(
            run_config(1, 2, 1),
            trainer_config(),
            MockBackbone::new(),
            Box::new(Standard),
            Box::new(GroundTruth::new(LabelRequirements::default())),
            Box::new(provider),
            Evaluator::new(Split::Test, 8, false, RetryPolicy::default()),
        )
        .unwrap()
        .with_stop_signal(stop);
        let interrupted = first.run();
        assert_eq!(interrupted.final_state, Phase::Cancelled);
        assert_eq!(interrupted.train_state.global_step, 2);
        assert_eq!(interrupted.train_state.batches_in_epoch, 4);

        let mut second = orchestrator(run_config(1, 2, 1), trainer_config(), MockBackbone::new(), examples(7))
            .resume(interrupted.train_state.clone());
        let resumed = second.run();

        assert_eq!(resumed.final_state, Phase::Completed);
        assert_eq!(resumed.train_state.global_step, full.train_state.global_step);
        assert_eq!(interrupted.steps + resumed.steps, full.steps);
        let mut forwards = first.backbone().forwards.clone();
        forwards.extend(second.backbone().forwards.iter().cloned());
        assert_eq!(forwards, straight.backbone().forwards);
        let eval_steps: Vec<u64> = interrupted
            .evaluations
            .iter()
            .chain(&resumed.evaluations)
            .map(|e| e.global_step)
            .collect();
        assert_eq!(eval_steps, vec![1, 2, 3, 4]);
    }

    #[test]
    fn metrics_sinks_receive_every_evaluation() {
        let recorded = Recorded::default();
        let mut run = orchestrator(run_config(1, 1, 2), trainer_config(), MockBackbone::new(), examples(5))
            .with_metrics_sink(Box::new(recorded.clone()));
        run.run();

        let records = recorded.0.borrow();
        let steps: Vec<u64> = records.iter().map(|(step, _)| *step).collect();
        assert_eq!(steps, vec![2, 4]);
        for (_, metrics) in records.iter() {
            assert_eq!(metrics["evaluated"], 1.0);
            assert_eq!(metrics["failed"], 0.0);
            // the mock echoes "q0", the reference is "a0"
            assert_eq!(metrics["accuracy"], 0.0);
        }
    }

    #[test]
    fn examples_without_a_required_rationale_are_skipped() {
        let mut train = examples(3);
        train[0].llm_rationale = Some("because".to_string());
        train[2].llm_rationale = Some("since".to_string());
        let mut run = Orchestrator::new(
            run_config(1, 1, 100),
            trainer_config(),
            MockBackbone::new(),
            Box::new(TaskPrefix {
                alpha: 0.5,
                output_rationale: false,
            }),
            Box::new(GroundTruth::new(LabelRequirements::default())),
            provider(train, 1),
            Evaluator::new(Split::Test, 8, false, RetryPolicy::default()),
        )
        .unwrap();
        let report = run.run();

        assert_eq!(report.final_state, Phase::Completed);
        assert_eq!(report.skipped_examples, 1);
        assert_eq!(report.steps, 2);
    }

    #[test]
    fn max_steps_ends_the_run_early() {
        let trainer = TrainerConfig {
            max_steps: Some(3),
            ..trainer_config()
        };
        let mut run = orchestrator(run_config(1, 1, 100), trainer, MockBackbone::new(), examples(10));
        let report = run.run();
        assert_eq!(report.final_state, Phase::Completed);
        assert_eq!(report.train_state.global_step, 3);
    }

    #[test]
    fn checkpoints_follow_save_steps_and_run_end() {
        let saved = Saved::default();
        let trainer = TrainerConfig {
            save_steps: Some(2),
            ..trainer_config()
        };
        let mut run = orchestrator(run_config(1, 1, 100), trainer, MockBackbone::new(), examples(5))
            .with_checkpoint_sink(Box::new(saved.clone()));
        run.run();
        let steps: Vec<u64> = saved.0.borrow().iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![2, 4, 5]);
        assert_eq!(saved.0.borrow().last().unwrap().1, "completed");
    }

    #[test]
    fn same_seed_same_training_order() {
        let order = || {
            let mut run = orchestrator(run_config(2, 1, 100), trainer_config(), MockBackbone::new(), examples(9));
            run.run();
            run.backbone().forwards.clone()
        };
        assert_eq!(order(), order());
    }

    #[test]
    fn evaluation_leaves_accumulation_untouched() {
        // eval after every step while groups span two micro-batches.
        let mut run = orchestrator(run_config(1, 2, 1), trainer_config(), MockBackbone::new(), examples(6));
        let report = run.run();
        assert_eq!(report.steps, 3);
        assert_eq!(report.evaluations.len(), 3);
        assert_eq!(run.backbone().applied, vec![1.0, 1.0, 1.0]);
        assert_eq!(run.phase(), Phase::Completed);
    }
}
