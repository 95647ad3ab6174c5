use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tch::{nn, Device};

use seq2seq_core::{ModelConfig, Seq2SeqTransformer};
use tokenizer::BPE;

pub mod batch;
pub mod generator;
pub mod sampling;

pub use batch::{encode_sources, encode_targets, IGNORE_INDEX};
pub use generator::Generator;
pub use sampling::{Sampler, SamplingParams};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// A backbone as found in a pretrained directory. `vs` owns the weights that
/// `model` reads.
pub struct Pretrained {
    pub vs: nn::VarStore,
    pub model: Seq2SeqTransformer,
    pub tokenizer: BPE,
}

/// Most recent `*.safetensors` file in `dir`, by file name.
pub fn latest_weights(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut weights: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "safetensors"))
        .collect();
    weights.sort();
    weights.pop()
}

/// Loads `config.json`, `tokenizer.json` and the latest weights from `dir`.
/// A directory without weights yields a randomly initialised model.
pub fn load_pretrained(dir: &Path, device: Device) -> Result<Pretrained> {
    let config_path = dir.join(CONFIG_FILE);
    let config_str = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read model config at {:?}", config_path))?;
    let config: ModelConfig = serde_json::from_str(&config_str).context("failed to parse model config.json")?;
    config.validate()?;

    let tokenizer_path = dir.join(TOKENIZER_FILE);
    let tokenizer = BPE::load(&tokenizer_path)
        .with_context(|| format!("failed to load tokenizer at {:?}", tokenizer_path))?;
    if tokenizer.vocab_size() as i64 > config.vocab_size {
        anyhow::bail!(
            "tokenizer has {} tokens but the model vocabulary is {}",
            tokenizer.vocab_size(),
            config.vocab_size
        );
    }

    let mut vs = nn::VarStore::new(device);
    let model = Seq2SeqTransformer::new(&vs.root(), &config);

    match latest_weights(dir) {
        Some(path) => {
            log::info!("loading weights from {:?}", path);
            let report = seq2seq_core::load_safetensors(&mut vs, &path)
                .with_context(|| format!("failed to load weights from {:?}", path))?;
            if !report.missing.is_empty() {
                log::warn!("{} model tensors were not in the checkpoint", report.missing.len());
            }
            if !report.unexpected.is_empty() {
                log::warn!("ignored {} unexpected checkpoint tensors", report.unexpected.len());
            }
        }
        None => log::warn!("no .safetensors weights in {:?}, using random initialisation", dir),
    }

    Ok(Pretrained { vs, model, tokenizer })
}

/// Writes a directory that [`load_pretrained`] can read back.
pub fn save_pretrained(dir: &Path, vs: &nn::VarStore, config: &ModelConfig, tokenizer: &BPE) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(config)?)?;
    tokenizer.save(dir.join(TOKENIZER_FILE)).context("failed to save tokenizer")?;
    seq2seq_core::save_safetensors(vs, dir.join(WEIGHTS_FILE))?;
    Ok(())
}
