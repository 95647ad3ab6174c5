use std::path::Path;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Reduction, Tensor};

use inference::{encode_sources, encode_targets, Generator, Pretrained, IGNORE_INDEX};
use seq2seq_core::Seq2SeqTransformer;
use tokenizer::BPE;

use crate::backbone::{Backbone, ForwardOutput, LossTerm};
use crate::error::{Result, TrainError};

impl LossTerm for Tensor {
    fn value(&self) -> f64 {
        self.double_value(&[])
    }

    fn scaled(&self, factor: f64) -> Self {
        self * factor
    }

    fn plus(&self, other: &Self) -> Self {
        self + other
    }
}

/// The seq2seq transformer trained with AdamW.
pub struct TchBackbone {
    vs: nn::VarStore,
    model: Seq2SeqTransformer,
    tokenizer: BPE,
    optimizer: nn::Optimizer,
    max_input_length: usize,
    max_target_length: usize,
}

impl TchBackbone {
    pub fn from_pretrained(
        dir: &Path,
        device: Device,
        learning_rate: f64,
        weight_decay: f64,
        max_input_length: usize,
        max_target_length: usize,
    ) -> Result<Self> {
        let pretrained = inference::load_pretrained(dir, device)?;
        Self::new(pretrained, learning_rate, weight_decay, max_input_length, max_target_length)
    }

    pub fn new(
        pretrained: Pretrained,
        learning_rate: f64,
        weight_decay: f64,
        max_input_length: usize,
        max_target_length: usize,
    ) -> Result<Self> {
        let Pretrained { vs, model, tokenizer } = pretrained;
        // Position tables only cover max_seq_len tokens.
        let limit = model.config.max_seq_len as usize;
        if max_input_length > limit || max_target_length > limit {
            log::warn!(
                "clamping max_input_length {max_input_length} / max_target_length {max_target_length} to the model's {limit} positions"
            );
        }
        let optimizer = nn::AdamW {
            wd: weight_decay,
            ..Default::default()
        }
        .build(&vs, learning_rate)?;

        log::info!(
            "backbone: d_model={} layers={}+{} vocab={} on {:?}",
            model.config.d_model,
            model.config.n_encoder_layer,
            model.config.n_decoder_layer,
            model.config.vocab_size,
            model.device()
        );

        Ok(Self {
            vs,
            model,
            tokenizer,
            optimizer,
            max_input_length: max_input_length.min(limit),
            max_target_length: max_target_length.min(limit),
        })
    }

    /// Argmax over the teacher-forced logits, read only where a label exists
    /// and cut at the first EOS.
    fn decode_argmax(&self, logits: &Tensor, labels: &Tensor) -> Result<Vec<String>> {
        let (batch, len) = labels.size2()?;
        let ids = Vec::<i64>::try_from(&logits.argmax(-1, false).to_kind(Kind::Int64).to_device(Device::Cpu).view([-1]))?;
        let gold = Vec::<i64>::try_from(&labels.to_device(Device::Cpu).view([-1]))?;
        let eos = self.tokenizer.eos_id() as i64;

        let mut predictions = Vec::with_capacity(batch as usize);
        for row in 0..batch as usize {
            let span = row * len as usize..(row + 1) * len as usize;
            let tokens: Vec<u32> = ids[span.clone()]
                .iter()
                .zip(&gold[span])
                .filter(|(_, &label)| label != IGNORE_INDEX)
                .map(|(&id, _)| id)
                .take_while(|&id| id != eos)
                .map(|id| id as u32)
                .collect();
            predictions.push(self.tokenizer.decode(&tokens).trim().to_string());
        }
        Ok(predictions)
    }
}

impl Backbone for TchBackbone {
    type Loss = Tensor;

    fn forward(&mut self, sources: &[String], targets: &[String]) -> Result<ForwardOutput<Tensor>> {
        if sources.len() != targets.len() {
            return Err(TrainError::Backbone(format!(
                "{} sources but {} targets",
                sources.len(),
                targets.len()
            )));
        }
        let device = self.model.device();
        let (input_ids, mask) = encode_sources(&self.tokenizer, sources, self.max_input_length, device);
        let labels = encode_targets(&self.tokenizer, targets, self.max_target_length, device);
        let decoder_in = self.model.shift_right(&labels, IGNORE_INDEX);

        let logits = self.model.forward(&input_ids, &mask, &decoder_in, true);
        let (b, t, v) = logits.size3()?;
        let loss = logits.view([b * t, v]).cross_entropy_loss::<Tensor>(
            &labels.view([b * t]),
            None,
            Reduction::Mean,
            IGNORE_INDEX,
            0.0,
        );

        // Training predictions are only ever logged.
        let predictions = if log::log_enabled!(log::Level::Debug) {
            tch::no_grad(|| self.decode_argmax(&logits.detach(), &labels))?
        } else {
            Vec::new()
        };
        Ok(ForwardOutput { loss, predictions })
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        loss.f_backward()?;
        Ok(())
    }

    fn scale_gradients(&mut self, factor: f64) -> Result<()> {
        tch::no_grad(|| {
            for var in self.vs.trainable_variables() {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.f_mul_scalar_(factor)?;
                }
            }
            Ok(())
        })
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_lr(lr);
    }

    fn step(&mut self) -> Result<()> {
        self.optimizer.step();
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.optimizer.zero_grad();
    }

    fn generate(&self, sources: &[String], max_len: usize) -> Result<Vec<String>> {
        Ok(Generator::new(&self.model, &self.tokenizer).greedy(sources, self.max_input_length, max_len)?)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        inference::save_pretrained(dir, &self.vs, &self.model.config, &self.tokenizer)
            .map_err(|e| TrainError::Checkpoint(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq2seq_core::ModelConfig;
    use tokenizer::Trainer;

    fn backbone() -> TchBackbone {
        backbone_with_lengths(32, 16)
    }

    fn backbone_with_lengths(max_input_length: usize, max_target_length: usize) -> TchBackbone {
        tch::manual_seed(7);
        let tokenizer = Trainer::new(300, 1)
            .train_from_texts(&["the answer is four", "two plus two"])
            .unwrap();
        let config = ModelConfig::tiny(tokenizer.vocab_size() as i64);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Seq2SeqTransformer::new(&vs.root(), &config);
        TchBackbone::new(Pretrained { vs, model, tokenizer }, 1e-2, 0.0, max_input_length, max_target_length).unwrap()
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn forward_returns_finite_loss_and_one_prediction_per_source() {
        let mut backbone = backbone();
        let out = backbone
            .forward(&texts(&["two plus two", "two"]), &texts(&["four", "two"]))
            .unwrap();
        assert!(out.loss.value().is_finite());
        assert!(out.predictions.len() <= 2);
    }

    #[test]
    fn inputs_longer_than_the_position_table_are_truncated() {
        let mut backbone = backbone_with_lengths(1024, 256);
        let limit = backbone.model.config.max_seq_len as usize;
        assert_eq!(backbone.max_input_length, limit);
        assert_eq!(backbone.max_target_length, limit);

        let long = "two plus two ".repeat(60);
        assert!(backbone.tokenizer.encode(&long).len() > limit);
        let out = backbone.forward(&texts(&[long.as_str()]), &texts(&[long.as_str()])).unwrap();
        assert!(out.loss.value().is_finite());
        assert_eq!(backbone.generate(&texts(&[long.as_str()]), 4).unwrap().len(), 1);
    }

    #[test]
    fn scaling_gradients_scales_every_trainable_gradient() {
        let mut backbone = backbone();
        let out = backbone.forward(&texts(&["two plus two"]), &texts(&["four"])).unwrap();
        backbone.backward(&out.loss).unwrap();

        let name = "lm_head.weight";
        let before = backbone.vs.variables()[name].grad().copy();
        backbone.scale_gradients(0.5).unwrap();
        let after = backbone.vs.variables()[name].grad();
        assert!(after.allclose(&(before * 0.5), 1e-6, 1e-8, false));
    }

    #[test]
    fn step_changes_parameters_and_generate_does_not() {
        let mut backbone = backbone();
        let name = "lm_head.weight";
        let initial = backbone.vs.variables()[name].copy();

        backbone.generate(&texts(&["two plus two"]), 4).unwrap();
        assert!(backbone.vs.variables()[name].equal(&initial));

        let out = backbone.forward(&texts(&["two plus two"]), &texts(&["four"])).unwrap();
        backbone.backward(&out.loss).unwrap();
        backbone.step().unwrap();
        assert!(!backbone.vs.variables()[name].equal(&initial));
    }
}
