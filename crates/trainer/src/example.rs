use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dataset record. The input is kept as text; the backbone tokenizes it
/// (after any task prefix is applied) at forward time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Position of the record in its split, stable across epochs.
    pub id: usize,
    pub input: String,
    /// Ground-truth answer.
    #[serde(default)]
    pub label: Option<String>,
    /// Rationale parsed from the LLM chain-of-thought output, if any.
    #[serde(default)]
    pub llm_rationale: Option<String>,
    /// Answer parsed from the LLM chain-of-thought output, if any.
    #[serde(default)]
    pub llm_label: Option<String>,
}

impl Example {
    pub fn new(id: usize, input: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id,
            input: input.into(),
            label: Some(label.into()),
            llm_rationale: None,
            llm_label: None,
        }
    }

    pub fn with_llm_output(mut self, rationale: impl Into<String>, label: impl Into<String>) -> Self {
        self.llm_rationale = Some(rationale.into());
        self.llm_label = Some(label.into());
        self
    }
}

/// What a provider hands back for one `next_batch` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Examples(Vec<Example>),
    EndOfSplit,
}

/// Treats blank strings (the parsers' "no answer" sentinel) as absent.
pub(crate) fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
