//! Scripted pure-Rust backbone for exercising the training loop without
//! libtorch.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use crate::backbone::{Backbone, ForwardOutput, LossTerm};
use crate::error::{Result, TrainError};

/// A loss that "backpropagates" its value into a single gradient scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockLoss(pub f64);

impl LossTerm for MockLoss {
    fn value(&self) -> f64 {
        self.0
    }

    fn scaled(&self, factor: f64) -> Self {
        MockLoss(self.0 * factor)
    }

    fn plus(&self, other: &Self) -> Self {
        MockLoss(self.0 + other.0)
    }
}

#[derive(Debug, Default)]
pub struct MockBackbone {
    /// Losses returned by successive `forward` calls; 1.0 once exhausted.
    pub losses: VecDeque<f64>,
    pub param: f64,
    pub grad: f64,
    pub lr: f64,
    pub steps: usize,
    /// Gradient applied by each optimizer step.
    pub applied: Vec<f64>,
    pub forwards: Vec<(Vec<String>, Vec<String>)>,
    /// Canned generations keyed by source; other sources are echoed.
    pub answers: HashMap<String, String>,
}

impl MockBackbone {
    pub fn new() -> Self {
        Self {
            lr: 1.0,
            ..Self::default()
        }
    }

    pub fn with_losses(losses: impl IntoIterator<Item = f64>) -> Self {
        Self {
            losses: losses.into_iter().collect(),
            ..Self::new()
        }
    }
}

impl Backbone for MockBackbone {
    type Loss = MockLoss;

    fn forward(&mut self, sources: &[String], targets: &[String]) -> Result<ForwardOutput<MockLoss>> {
        self.forwards.push((sources.to_vec(), targets.to_vec()));
        let loss = self.losses.pop_front().unwrap_or(1.0);
        Ok(ForwardOutput {
            loss: MockLoss(loss),
            predictions: targets.to_vec(),
        })
    }

    fn backward(&mut self, loss: &MockLoss) -> Result<()> {
        self.grad += loss.0;
        Ok(())
    }

    fn scale_gradients(&mut self, factor: f64) -> Result<()> {
        self.grad *= factor;
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self) -> Result<()> {
        self.param -= self.lr * self.grad;
        self.applied.push(self.grad);
        self.steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grad = 0.0;
    }

    fn generate(&self, sources: &[String], _max_len: usize) -> Result<Vec<String>> {
        sources
            .iter()
            .map(|source| {
                if source.contains("<broken>") {
                    return Err(TrainError::Backbone(format!("cannot decode {source:?}")));
                }
                Ok(self.answers.get(source).cloned().unwrap_or_else(|| source.clone()))
            })
            .collect()
    }

    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("mock.json"), serde_json::to_string(&self.param)?)?;
        Ok(())
    }
}
