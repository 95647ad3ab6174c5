use crate::backbone::Backbone;
use crate::config::RetryPolicy;
use crate::error::Result;
use crate::example::{non_blank, Batch, Example, Split};
use crate::metrics::Tally;
use crate::model::{ModelStrategy, Prediction};
use crate::provider::{fetch_with_retry, DatasetProvider};
use crate::sinks::Metrics;

/// An evaluation example that could not be scored.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalFailure {
    pub example_id: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub global_step: u64,
    pub metrics: Metrics,
    pub failures: Vec<EvalFailure>,
}

/// Scores the model strategy's predictions on a held-out split.
///
/// Only `&B` is borrowed, so an evaluation pass can read parameters but
/// cannot step the optimizer or touch accumulated gradients.
pub struct Evaluator {
    split: Split,
    gen_max_len: usize,
    equation_label: bool,
    retry: RetryPolicy,
}

impl Evaluator {
    pub fn new(split: Split, gen_max_len: usize, equation_label: bool, retry: RetryPolicy) -> Self {
        Self {
            split,
            gen_max_len,
            equation_label,
            retry,
        }
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn evaluate<B: Backbone>(
        &self,
        global_step: u64,
        backbone: &B,
        model: &dyn ModelStrategy<B>,
        provider: &mut dyn DatasetProvider,
    ) -> Result<EvalReport> {
        provider.reset(self.split, 0)?;
        let mut tally = Tally::default();
        let mut failures = Vec::new();

        loop {
            let examples = match fetch_with_retry(provider, self.split, &self.retry)? {
                Batch::Examples(examples) => examples,
                Batch::EndOfSplit => break,
            };

            let (scorable, unscorable): (Vec<Example>, Vec<Example>) =
                examples.into_iter().partition(|e| non_blank(&e.label).is_some());
            failures.extend(unscorable.iter().map(|e| EvalFailure {
                example_id: e.id,
                reason: "no reference label".to_string(),
            }));

            for (example, outcome) in scorable.iter().zip(self.predict(backbone, model, &scorable)) {
                match outcome {
                    Ok(prediction) => {
                        let reference = non_blank(&example.label).unwrap_or_default();
                        tally.record(&prediction.answer, reference);
                        if let Some(rationale) = &prediction.rationale {
                            log::debug!("example {} rationale: {}", example.id, rationale);
                        }
                    }
                    Err(reason) => failures.push(EvalFailure {
                        example_id: example.id,
                        reason,
                    }),
                }
            }
        }

        if !failures.is_empty() {
            log::warn!("evaluation at step {global_step}: {} example(s) failed", failures.len());
        }

        let mut metrics = Metrics::new();
        metrics.insert("accuracy".to_string(), tally.accuracy());
        if self.equation_label {
            metrics.insert("equation_accuracy".to_string(), tally.equation_accuracy());
        }
        metrics.insert("evaluated".to_string(), tally.evaluated as f64);
        metrics.insert("failed".to_string(), failures.len() as f64);

        Ok(EvalReport {
            global_step,
            metrics,
            failures,
        })
    }

    /// Predicts the whole batch at once; if that fails, falls back to one
    /// example at a time so a single bad input only loses itself.
    fn predict<B: Backbone>(
        &self,
        backbone: &B,
        model: &dyn ModelStrategy<B>,
        examples: &[Example],
    ) -> Vec<std::result::Result<Prediction, String>> {
        if examples.is_empty() {
            return Vec::new();
        }
        match model.predict(backbone, examples, self.gen_max_len) {
            Ok(predictions) if predictions.len() == examples.len() => predictions.into_iter().map(Ok).collect(),
            _ => examples
                .iter()
                .map(|example| {
                    model
                        .predict(backbone, std::slice::from_ref(example), self.gen_max_len)
                        .map_err(|e| e.to_string())
                        .and_then(|mut p| p.pop().ok_or_else(|| "no prediction".to_string()))
                })
                .collect(),
        }
    }
}
