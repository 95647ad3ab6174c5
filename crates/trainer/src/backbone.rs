use std::path::Path;

use crate::error::Result;

/// A differentiable scalar loss. Scaling and summing must keep the value
/// attached to the backbone's autograd graph.
pub trait LossTerm: Sized {
    fn value(&self) -> f64;
    fn scaled(&self, factor: f64) -> Self;
    fn plus(&self, other: &Self) -> Self;
}

/// One teacher-forced pass over a micro-batch.
pub struct ForwardOutput<L> {
    pub loss: L,
    /// Argmax decode of the forward logits, one per source. A backbone may
    /// leave this empty when nothing will read it.
    pub predictions: Vec<String>,
}

/// The trainable seq2seq model together with its optimizer context.
///
/// Training calls go through `&mut self`; [`Backbone::generate`] takes
/// `&self` so evaluation cannot touch parameters, gradients or optimizer
/// state.
pub trait Backbone {
    type Loss: LossTerm;

    fn forward(&mut self, sources: &[String], targets: &[String]) -> Result<ForwardOutput<Self::Loss>>;

    /// Adds the gradients of `loss` to the gradient buffers.
    fn backward(&mut self, loss: &Self::Loss) -> Result<()>;

    /// Multiplies every accumulated gradient by `factor`.
    fn scale_gradients(&mut self, factor: f64) -> Result<()>;

    fn set_learning_rate(&mut self, lr: f64);

    /// Applies the accumulated gradients. Does not clear them.
    fn step(&mut self) -> Result<()>;

    fn zero_grad(&mut self);

    /// Inference-mode decoding, no dropout, no gradient tracking.
    fn generate(&self, sources: &[String], max_len: usize) -> Result<Vec<String>>;

    /// Writes the current parameters to `dir`.
    fn save(&self, dir: &Path) -> Result<()>;
}
