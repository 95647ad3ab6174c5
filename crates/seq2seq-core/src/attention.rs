use tch::{nn, IndexOp, Kind, Tensor};
use crate::config::ModelConfig;

/// Multi-head attention used three ways: bidirectional encoder
/// self-attention, causal decoder self-attention, and decoder-to-encoder
/// cross-attention (when `memory` is given to `forward`).
pub struct MultiHeadAttention {
    q_proj: nn::Linear,
    kv_proj: nn::Linear,
    o_proj: nn::Linear,
    n_head: i64,
    dropout: f64,
    causal_mask: Option<Tensor>,
}

impl MultiHeadAttention {
    pub fn new(vs: &nn::Path, config: &ModelConfig, causal: bool) -> Self {
        let d_model = config.d_model;
        let linear_config = nn::LinearConfig {
            bias: config.use_bias,
            ..Default::default()
        };

        let q_proj = nn::linear(vs / "q", d_model, d_model, linear_config);
        let kv_proj = nn::linear(vs / "kv", d_model, 2 * d_model, linear_config);
        let o_proj = nn::linear(vs / "o", d_model, d_model, linear_config);

        let causal_mask = causal.then(|| {
            Tensor::ones(&[config.max_seq_len, config.max_seq_len], (Kind::Bool, vs.device()))
                .tril(0)
                .reshape(&[1, 1, config.max_seq_len, config.max_seq_len])
        });

        Self {
            q_proj,
            kv_proj,
            o_proj,
            n_head: config.n_head,
            dropout: config.dropout,
            causal_mask,
        }
    }

    /// x: [batch, t, d_model]; memory: [batch, s, d_model] for cross-attention.
    /// key_padding: [batch, s], non-zero where the key is a real token.
    pub fn forward(
        &self,
        x: &Tensor,
        memory: Option<&Tensor>,
        key_padding: Option<&Tensor>,
        train: bool,
    ) -> Tensor {
        let size = x.size();
        let (b, t, c) = (size[0], size[1], size[2]);
        let head_size = c / self.n_head;

        let source = memory.unwrap_or(x);
        let s = source.size()[1];

        let q = x.apply(&self.q_proj).view([b, t, self.n_head, head_size]).transpose(1, 2);
        let kv = source.apply(&self.kv_proj).chunk(2, -1);
        let k = kv[0].view([b, s, self.n_head, head_size]).transpose(1, 2);
        let v = kv[1].view([b, s, self.n_head, head_size]).transpose(1, 2);

        let mut att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_size as f64).sqrt());

        if let Some(mask) = &self.causal_mask {
            let mask = mask.i((.., .., ..t, ..s));
            att = att.masked_fill(&mask.logical_not(), f64::NEG_INFINITY);
        }
        if let Some(padding) = key_padding {
            let blocked = padding.eq(0).view([b, 1, 1, s]);
            att = att.masked_fill(&blocked, f64::NEG_INFINITY);
        }

        let att = att.softmax(-1, Kind::Float).to_kind(v.kind()).dropout(self.dropout, train);
        let y = att.matmul(&v).transpose(1, 2).contiguous().view([b, t, c]);
        y.apply(&self.o_proj)
    }
}
