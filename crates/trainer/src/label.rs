use std::collections::HashMap;

use inference::{Generator, Pretrained, Sampler, SamplingParams};

use crate::config::{LabelType, LlmSource};
use crate::error::{Result, TrainError};
use crate::example::{non_blank, Example};
use crate::llm_output::{OutputFormat, ParsedOutput};

/// Supervision target for one example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub answer: String,
    pub rationale: Option<String>,
}

/// What the active model strategy needs from a label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelRequirements {
    pub rationale: bool,
}

impl LabelRequirements {
    pub(crate) fn check(&self, example: &Example, label: Label) -> Result<Label> {
        if self.rationale && label.rationale.is_none() {
            return Err(TrainError::label_unavailable(example.id, "no rationale for a rationale-trained model"));
        }
        Ok(label)
    }
}

pub trait LabelStrategy {
    fn name(&self) -> &'static str;

    /// Fails with `LabelUnavailable` when the example cannot be labelled
    /// under this strategy.
    fn produce_label(&mut self, example: &Example) -> Result<Label>;
}

/// Uses the reference answer stored on the example.
pub struct GroundTruth {
    requirements: LabelRequirements,
}

impl GroundTruth {
    pub fn new(requirements: LabelRequirements) -> Self {
        Self { requirements }
    }
}

impl LabelStrategy for GroundTruth {
    fn name(&self) -> &'static str {
        "ground_truth"
    }

    fn produce_label(&mut self, example: &Example) -> Result<Label> {
        let answer = non_blank(&example.label)
            .ok_or_else(|| TrainError::label_unavailable(example.id, "no ground-truth label"))?;
        let label = Label {
            answer: answer.to_string(),
            rationale: non_blank(&example.llm_rationale).map(str::to_string),
        };
        self.requirements.check(example, label)
    }
}

/// Auxiliary model that writes a chain-of-thought for an input.
pub trait LabelGenerator {
    /// Raw generated text, or `None` when this generator cannot produce one.
    fn generate(&mut self, input: &str, seed: u64) -> Result<Option<String>>;
}

/// Used when only precomputed LLM outputs are available.
pub struct NoGenerator;

impl LabelGenerator for NoGenerator {
    fn generate(&mut self, _input: &str, _seed: u64) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Samples chains-of-thought from a second pretrained seq2seq model.
pub struct SampledTeacherGenerator {
    teacher: Pretrained,
    params: SamplingParams,
    max_input_len: usize,
    max_new_tokens: usize,
}

impl SampledTeacherGenerator {
    pub fn new(teacher: Pretrained, params: SamplingParams, max_input_len: usize, max_new_tokens: usize) -> Self {
        Self {
            teacher,
            params,
            max_input_len,
            max_new_tokens,
        }
    }
}

impl LabelGenerator for SampledTeacherGenerator {
    fn generate(&mut self, input: &str, seed: u64) -> Result<Option<String>> {
        let mut sampler = Sampler::seeded(seed);
        let generator = Generator::new(&self.teacher.model, &self.teacher.tokenizer);
        let mut outputs = generator.sample(
            &[input.to_string()],
            self.max_input_len,
            self.max_new_tokens,
            &mut sampler,
            &self.params,
        )?;
        Ok(outputs.pop())
    }
}

/// Seed for one example's generation, fixed by the run seed and example id.
pub fn example_seed(run_seed: u64, example_id: usize) -> u64 {
    // splitmix64 finaliser
    let mut z = run_seed ^ (example_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Uses answers and rationales written by an LLM: precomputed outputs on the
/// example first, then memoised generations, then the generator.
pub struct LlmGenerated {
    requirements: LabelRequirements,
    seed: u64,
    format: OutputFormat,
    source: LlmSource,
    generator: Box<dyn LabelGenerator>,
    memo: HashMap<usize, ParsedOutput>,
}

impl LlmGenerated {
    pub fn new(
        requirements: LabelRequirements,
        seed: u64,
        format: OutputFormat,
        source: LlmSource,
        generator: Box<dyn LabelGenerator>,
    ) -> Self {
        Self {
            requirements,
            seed,
            format,
            source,
            generator,
            memo: HashMap::new(),
        }
    }

    fn generated(&mut self, example: &Example) -> Result<&ParsedOutput> {
        if !self.memo.contains_key(&example.id) {
            let seed = example_seed(self.seed, example.id);
            let raw = self
                .generator
                .generate(&example.input, seed)?
                .ok_or_else(|| TrainError::label_unavailable(example.id, "no llm output and no generator"))?;
            let parsed = self
                .format
                .parse(&raw, self.source)
                .map_err(|e| TrainError::label_unavailable(example.id, e.to_string()))?;
            log::debug!("generated llm label for example {}", example.id);
            self.memo.insert(example.id, parsed);
        }
        self.memo
            .get(&example.id)
            .ok_or_else(|| TrainError::label_unavailable(example.id, "memo miss"))
    }
}

impl LabelStrategy for LlmGenerated {
    fn name(&self) -> &'static str {
        "llm_generated"
    }

    fn produce_label(&mut self, example: &Example) -> Result<Label> {
        let (answer, rationale) = match non_blank(&example.llm_label) {
            Some(answer) => (
                answer.to_string(),
                non_blank(&example.llm_rationale).map(str::to_string),
            ),
            None => {
                let parsed = self.generated(example)?;
                let rationale = Some(parsed.rationale.trim())
                    .filter(|r| !r.is_empty())
                    .map(str::to_string);
                (parsed.answer.trim().to_string(), rationale)
            }
        };
        if answer.is_empty() {
            return Err(TrainError::label_unavailable(example.id, "llm output has no answer"));
        }
        self.requirements.check(example, Label { answer, rationale })
    }
}

/// Builds the strategy for `label_type`. The generator is only used by
/// `llm_generated`.
pub fn label_strategy(
    label_type: LabelType,
    requirements: LabelRequirements,
    seed: u64,
    format: OutputFormat,
    source: LlmSource,
    generator: Box<dyn LabelGenerator>,
) -> Box<dyn LabelStrategy> {
    match label_type {
        LabelType::GroundTruth => Box::new(GroundTruth::new(requirements)),
        LabelType::LlmGenerated => Box::new(LlmGenerated::new(requirements, seed, format, source, generator)),
    }
}
