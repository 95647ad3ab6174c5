use tch::{nn, Kind, Tensor};

/// Scale-only RMS normalisation, as used by T5-family models (no mean
/// subtraction, no bias).
#[derive(Debug)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(vs: &nn::Path, dim: i64, eps: f64) -> Self {
        let weight = vs.var("weight", &[dim], nn::Init::Const(1.0));
        Self { weight, eps }
    }

    /// x: [batch, seq_len, dim]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let variance = x
            .to_kind(Kind::Float)
            .pow_tensor_scalar(2.0)
            .mean_dim(Some(&[-1][..]), true, Kind::Float);
        let normed = x * (variance + self.eps).rsqrt();
        normed.to_kind(x.kind()) * &self.weight
    }
}
