use crate::backbone::{Backbone, LossTerm};
use crate::error::Result;

/// A completed accumulation group, handed to the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupSummary {
    pub micro_batches: usize,
    /// Mean unscaled loss over the group's micro-batches.
    pub mean_loss: f64,
}

/// Counts micro-batches between optimizer steps. The gradient buffer itself
/// lives in the backbone; this type decides how losses are scaled into it.
#[derive(Debug)]
pub struct BatchAccumulator {
    grad_steps: usize,
    count: usize,
    loss_sum: f64,
}

impl BatchAccumulator {
    pub fn new(grad_steps: usize) -> Self {
        Self {
            grad_steps: grad_steps.max(1),
            count: 0,
            loss_sum: 0.0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Backpropagates `loss / grad_steps` and counts the micro-batch.
    /// Returns true when a full group is ready for [`take_group`].
    ///
    /// [`take_group`]: BatchAccumulator::take_group
    pub fn consume<B: Backbone>(&mut self, backbone: &mut B, loss: &B::Loss) -> Result<bool> {
        let value = loss.value();
        backbone.backward(&loss.scaled(1.0 / self.grad_steps as f64))?;
        self.count += 1;
        self.loss_sum += value;
        log::debug!("accumulated micro-batch {}/{} (loss {:.4})", self.count, self.grad_steps, value);
        Ok(self.count >= self.grad_steps)
    }

    /// Hands off the accumulated group and resets the counter. A partial
    /// group is rescaled so its gradient is the mean over the micro-batches
    /// actually consumed.
    pub fn take_group<B: Backbone>(&mut self, backbone: &mut B) -> Result<Option<GroupSummary>> {
        if self.count == 0 {
            return Ok(None);
        }
        if self.count < self.grad_steps {
            backbone.scale_gradients(self.grad_steps as f64 / self.count as f64)?;
        }
        let summary = GroupSummary {
            micro_batches: self.count,
            mean_loss: self.loss_sum / self.count as f64,
        };
        self.reset();
        Ok(Some(summary))
    }

    /// Drops everything accumulated since the last step.
    pub fn discard<B: Backbone>(&mut self, backbone: &mut B) -> usize {
        let dropped = self.count;
        backbone.zero_grad();
        self.reset();
        dropped
    }

    fn reset(&mut self) {
        self.count = 0;
        self.loss_sum = 0.0;
    }
}
