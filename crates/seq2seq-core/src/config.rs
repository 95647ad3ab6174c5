use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Width of token embeddings and of every hidden state.
    pub d_model: i64,
    /// Number of attention heads (shared by encoder and decoder).
    pub n_head: i64,
    /// Number of encoder blocks.
    pub n_encoder_layer: i64,
    /// Number of decoder blocks.
    pub n_decoder_layer: i64,
    /// Size of the vocabulary (embedding table and LM head are tied to it).
    pub vocab_size: i64,
    /// Longest source or target sequence the position tables cover.
    pub max_seq_len: i64,
    /// Dropout probability, only active in training mode.
    pub dropout: f64,
    /// RMSNorm epsilon value (for numerical stability).
    pub layer_norm_epsilon: f64,
    /// Whether to use bias in attention projections.
    pub use_bias: bool,
    pub pad_token_id: i64,
    pub eos_token_id: i64,
    /// First token fed to the decoder. T5-style checkpoints reuse the pad id.
    pub decoder_start_token_id: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 512, // t5-small equivalent
            n_head: 8,
            n_encoder_layer: 6,
            n_decoder_layer: 6,
            vocab_size: 32128,
            max_seq_len: 1024,
            dropout: 0.1,
            layer_norm_epsilon: 1e-6,
            use_bias: false,
            pad_token_id: 0,
            eos_token_id: 1,
            decoder_start_token_id: 0,
        }
    }
}

impl ModelConfig {
    pub fn head_size(&self) -> i64 {
        self.d_model / self.n_head
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.d_model <= 0 || self.n_head <= 0 || self.d_model % self.n_head != 0 {
            anyhow::bail!(
                "d_model ({}) must be a positive multiple of n_head ({})",
                self.d_model,
                self.n_head
            );
        }
        if self.vocab_size <= 0 || self.max_seq_len <= 0 {
            anyhow::bail!("vocab_size and max_seq_len must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        Ok(())
    }

    /// A very small configuration, handy for smoke runs on CPU.
    pub fn tiny(vocab_size: i64) -> Self {
        Self {
            d_model: 32,
            n_head: 4,
            n_encoder_layer: 1,
            n_decoder_layer: 1,
            vocab_size,
            max_seq_len: 64,
            dropout: 0.0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_size(), 64);
    }

    #[test]
    fn rejects_heads_that_do_not_divide_width() {
        let config = ModelConfig { d_model: 30, n_head: 4, ..ModelConfig::default() };
        assert!(config.validate().is_err());
    }
}
