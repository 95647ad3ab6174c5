use tch::{nn, Device, Kind, Tensor};
use crate::attention::MultiHeadAttention;
use crate::config::ModelConfig;
use crate::layer_norm::RMSNorm;

/// FeedForward block (MLP)
pub struct FeedForward {
    wi: nn::Linear,
    wo: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let d_model = config.d_model;
        let d_ff = 4 * d_model;
        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };

        Self {
            wi: nn::linear(vs / "wi", d_model, d_ff, no_bias),
            wo: nn::linear(vs / "wo", d_ff, d_model, no_bias),
            dropout: config.dropout,
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.wi)
            .gelu("none")
            .dropout(self.dropout, train)
            .apply(&self.wo)
            .dropout(self.dropout, train)
    }
}

pub struct EncoderBlock {
    ln_1: RMSNorm,
    attn: MultiHeadAttention,
    ln_2: RMSNorm,
    ff: FeedForward,
}

impl EncoderBlock {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let eps = config.layer_norm_epsilon;
        Self {
            ln_1: RMSNorm::new(&(vs / "ln_1"), config.d_model, eps),
            attn: MultiHeadAttention::new(&(vs / "attn"), config, false),
            ln_2: RMSNorm::new(&(vs / "ln_2"), config.d_model, eps),
            ff: FeedForward::new(&(vs / "ff"), config),
        }
    }

    pub fn forward(&self, x: &Tensor, padding: &Tensor, train: bool) -> Tensor {
        let x = x + self.attn.forward(&self.ln_1.forward(x), None, Some(padding), train);
        &x + self.ff.forward(&self.ln_2.forward(&x), train)
    }
}

pub struct DecoderBlock {
    ln_1: RMSNorm,
    self_attn: MultiHeadAttention,
    ln_2: RMSNorm,
    cross_attn: MultiHeadAttention,
    ln_3: RMSNorm,
    ff: FeedForward,
}

impl DecoderBlock {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let eps = config.layer_norm_epsilon;
        Self {
            ln_1: RMSNorm::new(&(vs / "ln_1"), config.d_model, eps),
            self_attn: MultiHeadAttention::new(&(vs / "self_attn"), config, true),
            ln_2: RMSNorm::new(&(vs / "ln_2"), config.d_model, eps),
            cross_attn: MultiHeadAttention::new(&(vs / "cross_attn"), config, false),
            ln_3: RMSNorm::new(&(vs / "ln_3"), config.d_model, eps),
            ff: FeedForward::new(&(vs / "ff"), config),
        }
    }

    pub fn forward(&self, x: &Tensor, memory: &Tensor, memory_padding: &Tensor, train: bool) -> Tensor {
        let x = x + self.self_attn.forward(&self.ln_1.forward(x), None, None, train);
        let x = &x
            + self
                .cross_attn
                .forward(&self.ln_2.forward(&x), Some(memory), Some(memory_padding), train);
        &x + self.ff.forward(&self.ln_3.forward(&x), train)
    }
}

/// Encoder-decoder transformer with a shared token embedding.
pub struct Seq2SeqTransformer {
    shared: nn::Embedding,
    enc_pos: nn::Embedding,
    dec_pos: nn::Embedding,
    encoder: Vec<EncoderBlock>,
    enc_norm: RMSNorm,
    decoder: Vec<DecoderBlock>,
    dec_norm: RMSNorm,
    lm_head: nn::Linear,
    dropout: f64,
    device: Device,
    pub config: ModelConfig,
}

impl Seq2SeqTransformer {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let d_model = config.d_model;
        let eps = config.layer_norm_epsilon;

        let shared = nn::embedding(vs / "shared", config.vocab_size, d_model, Default::default());
        let enc_pos = nn::embedding(vs / "enc_pos", config.max_seq_len, d_model, Default::default());
        let dec_pos = nn::embedding(vs / "dec_pos", config.max_seq_len, d_model, Default::default());

        let encoder = (0..config.n_encoder_layer)
            .map(|i| EncoderBlock::new(&(vs / "encoder" / i), config))
            .collect();
        let decoder = (0..config.n_decoder_layer)
            .map(|i| DecoderBlock::new(&(vs / "decoder" / i), config))
            .collect();

        let lm_head = nn::linear(
            vs / "lm_head",
            d_model,
            config.vocab_size,
            nn::LinearConfig { bias: false, ..Default::default() },
        );

        Self {
            shared,
            enc_pos,
            dec_pos,
            encoder,
            enc_norm: RMSNorm::new(&(vs / "enc_norm"), d_model, eps),
            decoder,
            dec_norm: RMSNorm::new(&(vs / "dec_norm"), d_model, eps),
            lm_head,
            dropout: config.dropout,
            device: vs.device(),
            config: config.clone(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn embed(&self, ids: &Tensor, positions: &nn::Embedding, train: bool) -> Tensor {
        let t = ids.size()[1];
        let pos = Tensor::arange(t, (Kind::Int64, ids.device())).apply(positions);
        (ids.apply(&self.shared) + pos).dropout(self.dropout, train)
    }

    /// input_ids, attention_mask: [batch, src_len]. Returns [batch, src_len, d_model].
    pub fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Tensor {
        let mut x = self.embed(input_ids, &self.enc_pos, train);
        for block in &self.encoder {
            x = block.forward(&x, attention_mask, train);
        }
        self.enc_norm.forward(&x)
    }

    /// Returns logits [batch, tgt_len, vocab_size].
    pub fn decode(
        &self,
        decoder_input_ids: &Tensor,
        memory: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Tensor {
        let mut x = self.embed(decoder_input_ids, &self.dec_pos, train);
        for block in &self.decoder {
            x = block.forward(&x, memory, attention_mask, train);
        }
        self.dec_norm.forward(&x).apply(&self.lm_head)
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
        train: bool,
    ) -> Tensor {
        let memory = self.encode(input_ids, attention_mask, train);
        self.decode(decoder_input_ids, &memory, attention_mask, train)
    }

    /// Builds decoder inputs from labels: prepend the start token, drop the
    /// last position, and replace ignored positions (`ignore_index`) with pad.
    pub fn shift_right(&self, labels: &Tensor, ignore_index: i64) -> Tensor {
        let b = labels.size()[0];
        let start = Tensor::full(
            &[b, 1],
            self.config.decoder_start_token_id,
            (Kind::Int64, labels.device()),
        );
        let t = labels.size()[1];
        let shifted = Tensor::cat(&[&start, &labels.narrow(1, 0, t - 1)], 1);
        shifted.masked_fill(&shifted.eq(ignore_index), self.config.pad_token_id)
    }
}
