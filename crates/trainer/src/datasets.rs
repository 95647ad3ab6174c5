//! Loading dataset splits and their LLM chain-of-thought outputs from disk.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::config::LlmSource;
use crate::error::{Result, TrainError};
use crate::example::{Example, Split};
use crate::llm_output::OutputFormat;

/// How raw records become (input, label).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Records already carry `input` and `label`.
    Plain,
    /// `question` + lettered `choices`, label `answer`.
    Cqa,
    /// `Body` + `Question`, label is the first token of `Answer`.
    Asdiv,
    /// `premise` + `hypothesis`, numeric label mapped to its class name.
    Nli,
}

#[derive(Debug)]
pub struct DatasetSpec {
    pub name: &'static str,
    /// Directory under the data root.
    pub dir: &'static str,
    /// Split files are `{stem}_{split}.json`.
    pub file_stem: &'static str,
    pub has_valid: bool,
    pub chunk_size: usize,
    /// CoT chunk files per split as (train, valid, test); `None` reads as
    /// many chunks as the split needs.
    pub chunks: Option<(usize, usize, usize)>,
    pub record: RecordKind,
    pub format: OutputFormat,
    /// Labels are arithmetic expressions, scored by value.
    pub equation_label: bool,
}

impl DatasetSpec {
    pub fn eval_split(&self) -> Split {
        if self.has_valid {
            Split::Valid
        } else {
            Split::Test
        }
    }

    pub fn splits(&self) -> Vec<Split> {
        let mut splits = vec![Split::Train, Split::Test];
        if self.has_valid {
            splits.insert(1, Split::Valid);
        }
        splits
    }

    pub fn split_path(&self, root: &Path, split: Split) -> PathBuf {
        root.join(self.dir).join(format!("{}_{}.json", self.file_stem, split))
    }

    fn chunk_count(&self, split: Split, examples: usize) -> usize {
        match (self.chunks, split) {
            (Some((train, _, _)), Split::Train) => train,
            (Some((_, valid, _)), Split::Valid) => valid,
            (Some((_, _, test)), Split::Test) => test,
            (None, _) => examples.div_ceil(self.chunk_size),
        }
    }

    pub fn llm_paths(&self, root: &Path, split: Split, source: LlmSource, examples: usize) -> Vec<PathBuf> {
        match source {
            LlmSource::Palm => (0..self.chunk_count(split, examples))
                .map(|i| root.join(self.dir).join("llm").join(format!("{split}_CoT_{i}.json")))
                .collect(),
            LlmSource::Gpt => vec![root.join("gpt-neox").join(self.dir).join(format!("{split}.json"))],
        }
    }
}

pub static DATASETS: &[DatasetSpec] = &[
    DatasetSpec {
        name: "cqa",
        dir: "cqa",
        file_stem: "cqa",
        has_valid: false,
        chunk_size: 1000,
        chunks: Some((10, 0, 2)),
        record: RecordKind::Cqa,
        format: OutputFormat::Cqa,
        equation_label: false,
    },
    DatasetSpec {
        name: "svamp",
        dir: "svamp",
        file_stem: "svamp",
        has_valid: false,
        chunk_size: 500,
        chunks: Some((2, 0, 1)),
        record: RecordKind::Plain,
        format: OutputFormat::Equation,
        equation_label: true,
    },
    DatasetSpec {
        name: "asdiv",
        dir: "asdiv",
        file_stem: "asdiv",
        has_valid: false,
        chunk_size: 1000,
        chunks: Some((3, 0, 1)),
        record: RecordKind::Asdiv,
        format: OutputFormat::Equation,
        equation_label: true,
    },
    DatasetSpec {
        name: "esnli",
        dir: "esnli",
        file_stem: "esnli",
        has_valid: true,
        chunk_size: 5500,
        chunks: Some((100, 2, 2)),
        record: RecordKind::Nli,
        format: OutputFormat::Esnli,
        equation_label: false,
    },
    DatasetSpec {
        name: "anli1",
        dir: "anli1",
        file_stem: "anli1",
        has_valid: true,
        chunk_size: 5000,
        chunks: Some((4, 1, 1)),
        record: RecordKind::Nli,
        format: OutputFormat::Anli,
        equation_label: false,
    },
    DatasetSpec {
        name: "hendrycks_math",
        dir: "hendrycks_math",
        file_stem: "algebra",
        has_valid: false,
        chunk_size: 500,
        chunks: Some((15, 0, 10)),
        record: RecordKind::Plain,
        format: OutputFormat::Math,
        equation_label: false,
    },
    DatasetSpec {
        name: "openr1_math",
        dir: "OpenR1-Math-220k",
        file_stem: "OpenR1-Math-220k",
        has_valid: false,
        chunk_size: 500,
        chunks: None,
        record: RecordKind::Plain,
        format: OutputFormat::OpenR1,
        equation_label: false,
    },
];

pub fn lookup(name: &str) -> Result<&'static DatasetSpec> {
    let name = if name == "OpenR1-Math-220k" { "openr1_math" } else { name };
    DATASETS.iter().find(|d| d.name == name).ok_or_else(|| {
        let known: Vec<&str> = DATASETS.iter().map(|d| d.name).collect();
        TrainError::InvalidConfig(format!("unknown dataset {name:?} (known: {})", known.join(", ")))
    })
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Where LLM outputs come from; `None` skips them.
    pub llm: Option<LlmSource>,
    /// Missing training-split LLM outputs are an error rather than a warning.
    pub require_llm: bool,
    pub subsample: f64,
    pub seed: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            llm: Some(LlmSource::Palm),
            require_llm: false,
            subsample: 1.0,
            seed: 0,
        }
    }
}

pub struct LoadedDataset {
    pub spec: &'static DatasetSpec,
    pub splits: Vec<(Split, Vec<Example>)>,
}

impl LoadedDataset {
    pub fn split(&self, split: Split) -> Option<&[Example]> {
        self.splits.iter().find(|(s, _)| *s == split).map(|(_, e)| e.as_slice())
    }
}

pub fn load_dataset(root: &Path, name: &str, options: &LoadOptions) -> Result<LoadedDataset> {
    let spec = lookup(name)?;
    let mut splits = Vec::new();

    for split in spec.splits() {
        let path = spec.split_path(root, split);
        let records = read_records(&path)?;
        let mut examples = records
            .iter()
            .enumerate()
            .map(|(id, record)| to_example(spec.record, id, record))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| TrainError::Dataset(format!("{}: {e}", path.display())))?;

        if let Some(source) = options.llm {
            attach_llm_outputs(root, spec, split, source, options.require_llm && split == Split::Train, &mut examples)?;
        }
        if split == Split::Train && options.subsample < 1.0 {
            examples = subsample(examples, options.subsample, options.seed);
        }

        log::info!("{} {}: {} examples", spec.name, split, examples.len());
        splits.push((split, examples));
    }

    Ok(LoadedDataset { spec, splits })
}

/// Reads a JSON array, or JSON Lines when the file is not an array.
pub fn read_records(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TrainError::Dataset(format!("cannot read {}: {e}", path.display())))?;
    if content.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(&content)?);
    }
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TrainError::from))
        .collect()
}

fn field<'a>(record: &'a Value, key: &str) -> Result<&'a Value> {
    record.get(key).ok_or_else(|| TrainError::Parse {
        what: "dataset record",
        detail: format!("missing field {key:?}"),
    })
}

fn text(record: &Value, key: &str) -> Result<String> {
    Ok(match field(record, key)? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn nli_label(value: &Value) -> Result<String> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok("entailment".to_string()),
            Some(1) => Ok("neutral".to_string()),
            Some(2) => Ok("contradiction".to_string()),
            _ => Err(TrainError::Parse {
                what: "nli label",
                detail: n.to_string(),
            }),
        },
        Value::String(s) => Ok(s.clone()),
        other => Err(TrainError::Parse {
            what: "nli label",
            detail: other.to_string(),
        }),
    }
}

fn to_example(kind: RecordKind, id: usize, record: &Value) -> Result<Example> {
    let (input, label) = match kind {
        RecordKind::Plain => (text(record, "input")?, text(record, "label")?),
        RecordKind::Cqa => {
            let question = text(record, "question")?;
            let choices = field(record, "choices")?.as_array().cloned().unwrap_or_default();
            let mut input = format!("{question}\nAnswer Choices:");
            for (letter, choice) in ('a'..='e').zip(&choices) {
                let choice = choice.as_str().map(str::to_string).unwrap_or_else(|| choice.to_string());
                input.push_str(&format!("\n({letter}) {choice}"));
            }
            (input, text(record, "answer")?)
        }
        RecordKind::Asdiv => {
            let input = format!("{}\n{}", text(record, "Body")?, text(record, "Question")?);
            let answer = text(record, "Answer")?;
            let label = answer.split(' ').next().unwrap_or_default().to_string();
            (input, label)
        }
        RecordKind::Nli => {
            let input = format!("{}\n{}", text(record, "premise")?, text(record, "hypothesis")?);
            (input, nli_label(field(record, "label")?)?)
        }
    };
    Ok(Example::new(id, input, label))
}

/// Reads the raw LLM outputs for `split` and attaches the parsed
/// (rationale, answer) pairs to `examples` in order.
fn attach_llm_outputs(
    root: &Path,
    spec: &DatasetSpec,
    split: Split,
    source: LlmSource,
    required: bool,
    examples: &mut [Example],
) -> Result<()> {
    let mut outputs = Vec::new();
    for path in spec.llm_paths(root, split, source, examples.len()) {
        if !path.exists() {
            if required {
                return Err(TrainError::Dataset(format!("missing llm outputs {}", path.display())));
            }
            log::debug!("no llm outputs at {}", path.display());
            return Ok(());
        }
        outputs.extend(read_records(&path)?);
    }

    if outputs.len() != examples.len() {
        log::warn!(
            "{} {}: {} llm outputs for {} examples",
            spec.name,
            split,
            outputs.len(),
            examples.len()
        );
    }

    let mut unparsed = 0usize;
    for (example, output) in examples.iter_mut().zip(&outputs) {
        let raw = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match spec.format.parse(&raw, source) {
            Ok(parsed) => {
                example.llm_rationale = Some(parsed.rationale);
                example.llm_label = Some(parsed.answer);
            }
            Err(err) => {
                unparsed += 1;
                log::debug!("example {}: {err}", example.id);
            }
        }
    }
    if unparsed > 0 {
        log::warn!("{} {}: {} llm outputs could not be parsed", spec.name, split, unparsed);
    }
    Ok(())
}

/// Keeps `fraction` of the examples, chosen by a seeded shuffle.
pub fn subsample(mut examples: Vec<Example>, fraction: f64, seed: u64) -> Vec<Example> {
    let dropped = ((1.0 - fraction) * examples.len() as f64).ceil() as usize;
    let keep = examples.len().saturating_sub(dropped);
    examples.shuffle(&mut StdRng::seed_from_u64(seed));
    examples.truncate(keep);
    examples
}
