use crate::backbone::{Backbone, LossTerm};
use crate::config::ModelType;
use crate::error::{Result, TrainError};
use crate::example::Example;
use crate::label::{Label, LabelRequirements};

pub const LABEL_PREFIX: &str = "[label] ";
pub const RATIONALE_PREFIX: &str = "[rationale] ";

/// Loss and predictions for one micro-batch.
pub struct StepOutput<L> {
    pub loss: L,
    pub predictions: Vec<String>,
    /// Per-task loss values for logging.
    pub parts: Vec<(&'static str, f64)>,
}

/// Evaluation-time output for one example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub answer: String,
    pub rationale: Option<String>,
}

/// How predictions and losses are computed from (example, label).
pub trait ModelStrategy<B: Backbone> {
    fn name(&self) -> &'static str;

    fn requirements(&self) -> LabelRequirements;

    /// Teacher-forced pass over a labelled micro-batch. Gradients are not
    /// touched here; the accumulator runs backward on the returned loss.
    fn forward(&self, backbone: &mut B, examples: &[Example], labels: &[Label]) -> Result<StepOutput<B::Loss>>;

    /// Inference-mode predictions.
    fn predict(&self, backbone: &B, examples: &[Example], max_len: usize) -> Result<Vec<Prediction>>;
}

fn ensure_finite(value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(TrainError::NonFiniteLoss { value })
    }
}

fn inputs(examples: &[Example], prefix: &str) -> Vec<String> {
    examples.iter().map(|e| format!("{prefix}{}", e.input)).collect()
}

/// Input to answer.
pub struct Standard;

impl<B: Backbone> ModelStrategy<B> for Standard {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn requirements(&self) -> LabelRequirements {
        LabelRequirements { rationale: false }
    }

    fn forward(&self, backbone: &mut B, examples: &[Example], labels: &[Label]) -> Result<StepOutput<B::Loss>> {
        let targets: Vec<String> = labels.iter().map(|l| l.answer.clone()).collect();
        let out = backbone.forward(&inputs(examples, ""), &targets)?;
        let value = out.loss.value();
        ensure_finite(value)?;
        Ok(StepOutput {
            loss: out.loss,
            predictions: out.predictions,
            parts: vec![("label", value)],
        })
    }

    fn predict(&self, backbone: &B, examples: &[Example], max_len: usize) -> Result<Vec<Prediction>> {
        Ok(backbone
            .generate(&inputs(examples, ""), max_len)?
            .into_iter()
            .map(|answer| Prediction { answer, rationale: None })
            .collect())
    }
}

/// Multi-task distillation: one pass predicts the answer, a second pass
/// (same weights, different task prefix) predicts the rationale.
pub struct TaskPrefix {
    pub alpha: f64,
    pub output_rationale: bool,
}

impl<B: Backbone> ModelStrategy<B> for TaskPrefix {
    fn name(&self) -> &'static str {
        "task_prefix"
    }

    fn requirements(&self) -> LabelRequirements {
        LabelRequirements { rationale: true }
    }

    fn forward(&self, backbone: &mut B, examples: &[Example], labels: &[Label]) -> Result<StepOutput<B::Loss>> {
        let mut answers = Vec::with_capacity(labels.len());
        let mut rationales = Vec::with_capacity(labels.len());
        for (example, label) in examples.iter().zip(labels) {
            let rationale = label
                .rationale
                .clone()
                .ok_or_else(|| TrainError::label_unavailable(example.id, "task_prefix needs a rationale"))?;
            answers.push(label.answer.clone());
            rationales.push(rationale);
        }

        let label_out = backbone.forward(&inputs(examples, LABEL_PREFIX), &answers)?;
        let label_value = label_out.loss.value();
        ensure_finite(label_value)?;

        let rationale_out = backbone.forward(&inputs(examples, RATIONALE_PREFIX), &rationales)?;
        let rationale_value = rationale_out.loss.value();
        ensure_finite(rationale_value)?;

        let loss = label_out
            .loss
            .scaled(self.alpha)
            .plus(&rationale_out.loss.scaled(1.0 - self.alpha));
        ensure_finite(loss.value())?;

        Ok(StepOutput {
            loss,
            predictions: label_out.predictions,
            parts: vec![("label", label_value), ("rationale", rationale_value)],
        })
    }

    fn predict(&self, backbone: &B, examples: &[Example], max_len: usize) -> Result<Vec<Prediction>> {
        let answers = backbone.generate(&inputs(examples, LABEL_PREFIX), max_len)?;
        let rationales = if self.output_rationale {
            backbone
                .generate(&inputs(examples, RATIONALE_PREFIX), max_len)?
                .into_iter()
                .map(Some)
                .collect()
        } else {
            vec![None; answers.len()]
        };
        Ok(answers
            .into_iter()
            .zip(rationales)
            .map(|(answer, rationale)| Prediction { answer, rationale })
            .collect())
    }
}

pub fn model_strategy<B: Backbone>(model_type: ModelType, alpha: f64, output_rationale: bool) -> Box<dyn ModelStrategy<B>> {
    match model_type {
        ModelType::Standard => Box::new(Standard),
        ModelType::TaskPrefix => Box::new(TaskPrefix { alpha, output_rationale }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackbone;

    fn labelled() -> (Vec<Example>, Vec<Label>) {
        let examples = vec![Example::new(0, "1+1", "2"), Example::new(1, "2+2", "4")];
        let labels = vec![
            Label { answer: "2".into(), rationale: Some("one and one".into()) },
            Label { answer: "4".into(), rationale: Some("two and two".into()) },
        ];
        (examples, labels)
    }

    #[test]
    fn standard_trains_input_to_answer() {
        let mut backbone = MockBackbone::with_losses([0.7]);
        let (examples, labels) = labelled();
        let out = ModelStrategy::forward(&Standard, &mut backbone, &examples, &labels).unwrap();
        assert_eq!(out.loss.0, 0.7);
        assert_eq!(out.predictions, vec!["2", "4"]);
        assert_eq!(backbone.forwards[0].0, vec!["1+1", "2+2"]);
    }

    #[test]
    fn task_prefix_mixes_both_losses_with_alpha() {
        let mut backbone = MockBackbone::with_losses([1.0, 3.0]);
        let (examples, labels) = labelled();
        let strategy = TaskPrefix { alpha: 0.25, output_rationale: false };
        let out = ModelStrategy::forward(&strategy, &mut backbone, &examples, &labels).unwrap();

        assert!((out.loss.0 - (0.25 * 1.0 + 0.75 * 3.0)).abs() < 1e-12);
        assert_eq!(backbone.forwards[0].0[0], "[label] 1+1");
        assert_eq!(backbone.forwards[1].0[1], "[rationale] 2+2");
        assert_eq!(backbone.forwards[1].1[0], "one and one");
        assert_eq!(out.parts.len(), 2);
    }

    #[test]
    fn non_finite_component_is_rejected() {
        let mut backbone = MockBackbone::with_losses([0.5, f64::INFINITY]);
        let (examples, labels) = labelled();
        let strategy = TaskPrefix { alpha: 0.5, output_rationale: false };
        let err = ModelStrategy::forward(&strategy, &mut backbone, &examples, &labels).err().unwrap();
        assert!(matches!(err, TrainError::NonFiniteLoss { .. }));

        let mut backbone = MockBackbone::with_losses([f64::NAN]);
        assert!(ModelStrategy::forward(&Standard, &mut backbone, &examples, &labels).is_err());
    }

    #[test]
    fn task_prefix_predicts_with_label_prefix() {
        let mut backbone = MockBackbone::new();
        backbone.answers.insert("[label] 1+1".into(), "2".into());
        let (examples, _) = labelled();
        let strategy = TaskPrefix { alpha: 0.5, output_rationale: true };
        let predictions = strategy.predict(&backbone, &examples[..1], 8).unwrap();
        assert_eq!(predictions[0].answer, "2");
        assert_eq!(predictions[0].rationale.as_deref(), Some("[rationale] 1+1"));
    }
}
