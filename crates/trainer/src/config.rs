use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TrainError};

/// How predictions and losses are produced from (example, label).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Standard,
    TaskPrefix,
}

impl FromStr for ModelType {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(Self::Standard),
            "task_prefix" => Ok(Self::TaskPrefix),
            other => Err(TrainError::InvalidConfig(format!(
                "unknown model_type {other:?} (expected standard or task_prefix)"
            ))),
        }
    }
}

/// Where supervision targets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    GroundTruth,
    LlmGenerated,
}

impl FromStr for LabelType {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gt" | "ground_truth" => Ok(Self::GroundTruth),
            "llm" | "llm_generated" => Ok(Self::LlmGenerated),
            other => Err(TrainError::InvalidConfig(format!(
                "unknown label_type {other:?} (expected gt or llm)"
            ))),
        }
    }
}

/// The immutable description of one run, fixed at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub from_pretrained: PathBuf,
    pub dataset: String,
    pub model_type: ModelType,
    pub label_type: LabelType,
    pub eval_steps: u64,
    pub batch_size: usize,
    pub grad_steps: usize,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 1 {
            return Err(TrainError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if self.grad_steps < 1 {
            return Err(TrainError::InvalidConfig("grad_steps must be >= 1".to_string()));
        }
        if self.eval_steps < 1 {
            return Err(TrainError::InvalidConfig("eval_steps must be >= 1".to_string()));
        }
        if self.dataset.trim().is_empty() {
            return Err(TrainError::InvalidConfig("dataset is required".to_string()));
        }
        Ok(())
    }
}

/// What to do when a micro-batch produces a NaN/Inf loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Stop the run in `Failed`.
    Halt,
    /// Discard the accumulation group and carry on with fresh micro-batches,
    /// at most `max_retries` groups in a row.
    RetryGroup { max_retries: u32 },
}

impl Default for NonFinitePolicy {
    fn default() -> Self {
        Self::Halt
    }
}

impl FromStr for NonFinitePolicy {
    type Err = TrainError;

    /// Accepts `halt`, `retry` (3 retries) or `retry:N`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            None if s == "halt" => Ok(Self::Halt),
            None if s == "retry" => Ok(Self::RetryGroup { max_retries: 3 }),
            Some(("retry", n)) => n
                .parse()
                .map(|max_retries| Self::RetryGroup { max_retries })
                .map_err(|_| TrainError::InvalidConfig(format!("bad retry count in {s:?}"))),
            _ => Err(TrainError::InvalidConfig(format!(
                "unknown non-finite policy {s:?} (expected halt, retry or retry:N)"
            ))),
        }
    }
}

/// Bounded exponential backoff for retryable provider failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Which LLM's chain-of-thought outputs supply `llm_generated` labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmSource {
    /// `{root}/{dataset}/llm/{split}_CoT_{i}.json`
    Palm,
    /// `{root}/gpt-neox/{dataset}/{split}.json`
    Gpt,
}

impl FromStr for LlmSource {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "palm" => Ok(Self::Palm),
            "gpt" => Ok(Self::Gpt),
            other => Err(TrainError::InvalidConfig(format!("unknown llm source {other:?}"))),
        }
    }
}

/// Hyperparameters and run plumbing that are not part of [`RunConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_steps: u64,
    pub epochs: usize,
    pub max_steps: Option<u64>,
    /// Weight of the label task in `task_prefix` training.
    pub alpha: f64,
    pub max_input_length: usize,
    pub max_target_length: usize,
    pub gen_max_len: usize,
    pub eval_batch_size: Option<usize>,
    pub seed: u64,
    /// Fraction of the training split to keep.
    pub subsample: f64,
    pub save_steps: Option<u64>,
    pub output_dir: PathBuf,
    pub data_root: PathBuf,
    pub llm: LlmSource,
    pub output_rationale: bool,
    pub non_finite_policy: NonFinitePolicy,
    pub provider_retry: RetryPolicy,
    pub provider_timeout_ms: Option<u64>,
    /// Micro-batches fetched ahead on a worker thread; 0 fetches inline.
    pub prefetch: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-5,
            weight_decay: 0.0,
            warmup_steps: 0,
            epochs: 1,
            max_steps: None,
            alpha: 0.5,
            max_input_length: 1024,
            max_target_length: 256,
            gen_max_len: 64,
            eval_batch_size: None,
            seed: 0,
            subsample: 1.0,
            save_steps: None,
            output_dir: PathBuf::from("./checkpoints"),
            data_root: PathBuf::from("datasets"),
            llm: LlmSource::Palm,
            output_rationale: false,
            non_finite_policy: NonFinitePolicy::Halt,
            provider_retry: RetryPolicy::default(),
            provider_timeout_ms: None,
            prefetch: 0,
        }
    }
}

impl TrainerConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(TrainError::InvalidConfig("alpha must be in [0, 1]".to_string()));
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0) {
            return Err(TrainError::InvalidConfig("subsample must be in (0, 1]".to_string()));
        }
        if self.epochs == 0 {
            return Err(TrainError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if self.max_input_length < 2 || self.max_target_length < 2 {
            return Err(TrainError::InvalidConfig(
                "max_input_length and max_target_length must be >= 2".to_string(),
            ));
        }
        if self.eval_batch_size == Some(0) {
            return Err(TrainError::InvalidConfig("eval_batch_size must be >= 1".to_string()));
        }
        if self.save_steps == Some(0) || self.max_steps == Some(0) {
            return Err(TrainError::InvalidConfig(
                "save_steps and max_steps must be >= 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Option<Duration> {
        self.provider_timeout_ms.map(Duration::from_millis)
    }

    /// Learning rate for the optimizer step that produces `step` (1-based):
    /// linear warmup, then linear decay to zero at `max_steps` if set.
    pub fn learning_rate_at(&self, step: u64) -> f64 {
        let base = self.learning_rate;
        if self.warmup_steps > 0 && step <= self.warmup_steps {
            return base * step as f64 / self.warmup_steps as f64;
        }
        match self.max_steps {
            Some(max) if max > self.warmup_steps => {
                let remaining = max.saturating_sub(step) as f64;
                base * remaining / (max - self.warmup_steps) as f64
            }
            _ => base,
        }
    }
}
