use thiserror::Error;

use crate::example::Split;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("no label available for example {example_id}: {reason}")]
    LabelUnavailable { example_id: usize, reason: String },

    #[error("non-finite loss: {value}")]
    NonFiniteLoss { value: f64 },

    #[error("dataset provider timed out on the {split} split after {attempts} attempt(s)")]
    ProviderTimeout { split: Split, attempts: u32 },

    #[error("dataset provider error: {0}")]
    Provider(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("could not parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("backbone error: {0}")]
    Backbone(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Tch(#[from] tch::TchError),
}

impl TrainError {
    pub fn label_unavailable(example_id: usize, reason: impl Into<String>) -> Self {
        Self::LabelUnavailable {
            example_id,
            reason: reason.into(),
        }
    }

    /// Errors the orchestrator may retry before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTimeout { .. })
    }

    /// Errors scoped to one example: skip it and keep going.
    pub fn is_example_scoped(&self) -> bool {
        matches!(self, Self::LabelUnavailable { .. })
    }

    /// Errors scoped to one accumulation group, handled by the non-finite policy.
    pub fn is_group_scoped(&self) -> bool {
        matches!(self, Self::NonFiniteLoss { .. })
    }

    /// Everything else ends the run in `Failed`.
    pub fn is_fatal_for_run(&self) -> bool {
        !(self.is_retryable() || self.is_example_scoped() || self.is_group_scoped())
    }
}

impl From<anyhow::Error> for TrainError {
    fn from(err: anyhow::Error) -> Self {
        Self::Backbone(format!("{:#}", err))
    }
}

impl From<tokenizer::TokenizerError> for TrainError {
    fn from(err: tokenizer::TokenizerError) -> Self {
        Self::Backbone(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_is_disjoint() {
        let cases = [
            TrainError::InvalidConfig("x".into()),
            TrainError::label_unavailable(3, "missing"),
            TrainError::NonFiniteLoss { value: f64::NAN },
            TrainError::ProviderTimeout { split: Split::Train, attempts: 2 },
            TrainError::Backbone("boom".into()),
        ];
        for err in &cases {
            let classes = [
                err.is_retryable(),
                err.is_example_scoped(),
                err.is_group_scoped(),
                err.is_fatal_for_run(),
            ];
            assert_eq!(classes.iter().filter(|&&c| c).count(), 1, "{err}");
        }
    }
}
