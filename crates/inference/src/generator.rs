use seq2seq_core::Seq2SeqTransformer;
use tch::{IndexOp, Kind, Tensor};
use tokenizer::BPE;

use crate::batch::encode_sources;
use crate::sampling::{Sampler, SamplingParams};

/// Autoregressive decoding over a borrowed model. The encoder runs once per
/// batch; the decoder is re-run over the growing prefix at every step.
pub struct Generator<'a> {
    model: &'a Seq2SeqTransformer,
    tokenizer: &'a BPE,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a Seq2SeqTransformer, tokenizer: &'a BPE) -> Self {
        Self { model, tokenizer }
    }

    /// Argmax decoding of every source, in order.
    pub fn greedy(&self, sources: &[String], max_input_len: usize, max_new_tokens: usize) -> anyhow::Result<Vec<String>> {
        self.run(sources, max_input_len, max_new_tokens, None)
    }

    /// Sampled decoding; the same sampler seed reproduces the same output.
    pub fn sample(
        &self,
        sources: &[String],
        max_input_len: usize,
        max_new_tokens: usize,
        sampler: &mut Sampler,
        params: &SamplingParams,
    ) -> anyhow::Result<Vec<String>> {
        self.run(sources, max_input_len, max_new_tokens, Some((sampler, params)))
    }

    fn run(
        &self,
        sources: &[String],
        max_input_len: usize,
        max_new_tokens: usize,
        mut sampling: Option<(&mut Sampler, &SamplingParams)>,
    ) -> anyhow::Result<Vec<String>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = tch::no_grad_guard();

        let config = &self.model.config;
        let device = self.model.device();
        let max_input_len = max_input_len.min(config.max_seq_len as usize);
        let max_new_tokens = max_new_tokens.min(config.max_seq_len as usize - 1);

        let (input_ids, mask) = encode_sources(self.tokenizer, sources, max_input_len, device);
        let memory = self.model.encode(&input_ids, &mask, false);

        let batch = sources.len();
        let mut prefixes: Vec<Vec<i64>> = vec![vec![config.decoder_start_token_id]; batch];
        let mut finished = vec![false; batch];

        for _ in 0..max_new_tokens {
            let flat: Vec<i64> = prefixes.iter().flatten().copied().collect();
            let step_len = prefixes[0].len() as i64;
            let decoder_in = Tensor::from_slice(&flat).view([batch as i64, step_len]).to(device);

            let logits = self.model.decode(&decoder_in, &memory, &mask, false);
            let last = logits.i((.., -1, ..));

            let next: Vec<i64> = match sampling.as_mut() {
                None => Vec::<i64>::try_from(&last.argmax(-1, false).to_kind(Kind::Int64).to_device(tch::Device::Cpu))?,
                Some((sampler, params)) => {
                    let mut picked = Vec::with_capacity(batch);
                    for (row, prefix) in prefixes.iter().enumerate() {
                        picked.push(sampler.sample(&last.i(row as i64), params, &prefix[1..])?);
                    }
                    picked
                }
            };

            for (row, token) in next.into_iter().enumerate() {
                // Finished rows keep decoding pad so the batch stays rectangular.
                let token = if finished[row] { config.pad_token_id } else { token };
                if token == config.eos_token_id {
                    finished[row] = true;
                }
                prefixes[row].push(token);
            }

            if finished.iter().all(|&done| done) {
                break;
            }
        }

        Ok(prefixes
            .iter()
            .map(|prefix| {
                let ids: Vec<u32> = prefix[1..].iter().map(|&id| id as u32).collect();
                self.tokenizer.decode(&ids).trim().to_string()
            })
            .collect())
    }
}
