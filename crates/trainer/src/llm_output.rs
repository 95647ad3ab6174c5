//! Splitting raw LLM chain-of-thought text into (rationale, answer).
//!
//! Parsers never fail on a malformed answer: they return a blank answer, which
//! label strategies treat as "no label". Only OpenR1 outputs with no
//! recognisable answer marker are a hard parse error.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::config::LlmSource;
use crate::error::{Result, TrainError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub rationale: String,
    pub answer: String,
}

impl ParsedOutput {
    fn new(rationale: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            rationale: rationale.into(),
            answer: answer.into(),
        }
    }

    fn blank() -> Self {
        Self::new(" ", " ")
    }
}

/// The answer conventions of each dataset's few-shot prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// "... So the answer is (b) river."
    Cqa,
    /// "... The answer is (12 - 5)." The equation in parentheses is kept.
    Equation,
    /// "... The answer is 42."
    Math,
    /// "<explanation> Answer: entailment Premise: ..."
    Esnli,
    /// "... So the answer is neutral. Premise: ..."
    Anli,
    /// JSON-wrapped generations with `Answer:` or `\boxed{}` answers.
    OpenR1,
}

type Compiled = OnceLock<std::result::Result<Regex, regex::Error>>;

static CHOICE: Compiled = OnceLock::new();
static EQUATION: Compiled = OnceLock::new();
static ANSWER_LINE: Compiled = OnceLock::new();
static FINAL_BOXED: Compiled = OnceLock::new();
static BOXED: Compiled = OnceLock::new();

/// Compiles `source` on first use and reuses it afterwards.
fn pattern(cell: &'static Compiled, source: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(source))
        .as_ref()
        .map_err(|e| TrainError::Parse {
            what: "llm output pattern",
            detail: e.to_string(),
        })
}

impl OutputFormat {
    pub fn parse(&self, output: &str, source: LlmSource) -> Result<ParsedOutput> {
        let gpt = source == LlmSource::Gpt;
        Ok(match self {
            OutputFormat::Cqa => parse_cqa(output, gpt)?,
            OutputFormat::Equation => parse_equation(output, gpt)?,
            OutputFormat::Math => parse_math(output, gpt),
            OutputFormat::Esnli => parse_esnli(output, gpt),
            OutputFormat::Anli => parse_anli(output, gpt),
            OutputFormat::OpenR1 => return parse_openr1(output),
        })
    }
}

/// Text before the next few-shot question.
fn before_next_question(output: &str, gpt: bool) -> &str {
    let head = output.split("Q:").next().unwrap_or_default().trim_end();
    if gpt {
        head.trim_start()
    } else {
        head
    }
}

/// Splits on `marker` only when it occurs exactly once.
fn split_once_exact<'a>(text: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    if text.matches(marker).count() != 1 {
        return None;
    }
    text.split_once(marker)
}

fn strip_trailing_period(s: &str) -> &str {
    s.strip_suffix('.').unwrap_or(s)
}

fn parse_cqa(output: &str, gpt: bool) -> Result<ParsedOutput> {
    let Some((rationale, tail)) = split_once_exact(before_next_question(output, gpt), "So the answer is") else {
        return Ok(ParsedOutput::blank());
    };
    let choice = pattern(&CHOICE, r"\(.\)")?.split(tail).nth(1).map(str::trim);
    let answer = match choice {
        Some(label) if !label.is_empty() => strip_trailing_period(label),
        _ => " ",
    };
    Ok(ParsedOutput::new(rationale.trim_end(), answer))
}

fn parse_equation(output: &str, gpt: bool) -> Result<ParsedOutput> {
    let Some((rationale, tail)) = split_once_exact(before_next_question(output, gpt), "The answer is") else {
        return Ok(ParsedOutput::blank());
    };
    // Outermost parentheses within one line.
    let answer = pattern(&EQUATION, r"\(.*\)")?.find(tail).map_or(" ", |m| m.as_str());
    Ok(ParsedOutput::new(rationale.trim_end(), answer))
}

fn parse_math(output: &str, gpt: bool) -> ParsedOutput {
    let Some((rationale, tail)) = split_once_exact(before_next_question(output, gpt), "The answer is") else {
        return ParsedOutput::blank();
    };
    let label = tail.trim();
    let answer = if gpt { label } else { strip_trailing_period(label) };
    ParsedOutput::new(rationale.trim_end(), answer)
}

fn parse_esnli(output: &str, gpt: bool) -> ParsedOutput {
    let rationale = output.split("Answer:").next().unwrap_or_default().trim_end();
    let rationale = if gpt { rationale.trim_start() } else { rationale };
    let answer = output
        .split("Answer: ")
        .nth(1)
        .and_then(|rest| rest.split("Premise").next())
        .map(str::trim_end)
        .unwrap_or(" ");
    ParsedOutput::new(rationale, answer)
}

fn parse_anli(output: &str, gpt: bool) -> ParsedOutput {
    let head = output.split("Premise:").next().unwrap_or_default().trim_end();
    let head = if gpt { head.trim_start() } else { head };
    let split = split_once_exact(head, "So the answer is")
        .or_else(|| if gpt { split_once_exact(head, "The answer is") } else { None });
    let Some((rationale, tail)) = split else {
        return ParsedOutput::new("", "");
    };
    // Drops the closing period.
    let mut answer = tail.trim_start().to_string();
    answer.pop();
    ParsedOutput::new(rationale.trim_end(), answer)
}

/// Pulls the generation text out of the JSON wrappers OpenR1 dumps use:
/// `["text"]`, `[["text", ...]]`, `{"content": ...}` or a bare string.
fn unwrap_openr1(output: &str) -> String {
    fn object_text(value: &Value) -> String {
        value
            .get("content")
            .or_else(|| value.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string())
    }

    match serde_json::from_str::<Value>(output) {
        Ok(Value::Array(items)) => match items.first() {
            None => String::new(),
            Some(Value::Array(inner)) => inner.first().and_then(Value::as_str).unwrap_or_default().to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        },
        Ok(Value::String(s)) => s,
        Ok(value @ Value::Object(_)) => object_text(&value),
        Ok(other) => other.to_string(),
        Err(_) => output.to_string(),
    }
}

fn parse_openr1(output: &str) -> Result<ParsedOutput> {
    let raw = unwrap_openr1(output);

    if let Some(caps) = pattern(&ANSWER_LINE, r"Answer:\s*([^\n]+)")?.captures_iter(&raw).last() {
        if let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) {
            log::debug!("openr1 output parsed from an 'Answer:' marker");
            return Ok(ParsedOutput::new(raw[..whole.start()].trim_end(), label.as_str().trim()));
        }
    }

    if let Some(caps) = pattern(&FINAL_BOXED, r"(?si)Final Answer.*?\\boxed\{([^}]*)\}")?.captures(&raw) {
        if let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) {
            return Ok(ParsedOutput::new(raw[..whole.start()].trim_end(), label.as_str().trim()));
        }
    }

    if let Some(caps) = pattern(&BOXED, r"\\boxed\{([^}]*)\}")?.captures_iter(&raw).last() {
        if let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) {
            return Ok(ParsedOutput::new(raw[..whole.start()].trim_end(), label.as_str().trim()));
        }
    }

    Err(TrainError::Parse {
        what: "openr1 llm output",
        detail: format!("no Answer: or \\boxed{{}} in {:.80?}", raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn palm(format: OutputFormat, output: &str) -> ParsedOutput {
        format.parse(output, LlmSource::Palm).unwrap()
    }

    #[test]
    fn cqa_takes_choice_text_without_period() {
        let out = palm(
            OutputFormat::Cqa,
            "Rivers flow to the sea. So the answer is (b) river.\n\nQ: next question",
        );
        assert_eq!(out.rationale, "Rivers flow to the sea.");
        assert_eq!(out.answer, "river");
    }

    #[test]
    fn cqa_without_choice_is_blank() {
        let out = palm(OutputFormat::Cqa, "Hmm. So the answer is river");
        assert_eq!(out.answer, " ");
        assert_eq!(palm(OutputFormat::Cqa, "no marker here").answer, " ");
    }

    #[test]
    fn equation_keeps_outer_parentheses() {
        let out = palm(
            OutputFormat::Equation,
            "He had 12 and gave 5. The answer is ((12 - 5) + 1).",
        );
        assert_eq!(out.answer, "((12 - 5) + 1)");
        assert_eq!(out.rationale, "He had 12 and gave 5.");
    }

    #[test]
    fn equation_stays_on_one_line() {
        let out = palm(
            OutputFormat::Equation,
            "Add them. The answer is (3 + 4).\nThat is (7) apples.",
        );
        assert_eq!(out.answer, "(3 + 4)");

        let out = palm(OutputFormat::Equation, "Hmm. The answer is (3 +\n4).");
        assert_eq!(out.answer, " ");
    }

    #[test]
    fn math_strips_period_for_palm_only() {
        let text = "x = 3 so 2x = 6. The answer is 6.";
        assert_eq!(palm(OutputFormat::Math, text).answer, "6");
        assert_eq!(OutputFormat::Math.parse(text, LlmSource::Gpt).unwrap().answer, "6.");
    }

    #[test]
    fn esnli_reads_between_answer_and_premise() {
        let out = palm(
            OutputFormat::Esnli,
            "A dog is an animal. Answer: entailment\nPremise: another",
        );
        assert_eq!(out.rationale, "A dog is an animal.");
        assert_eq!(out.answer, "entailment");
    }

    #[test]
    fn anli_drops_final_character() {
        let out = palm(
            OutputFormat::Anli,
            "Not stated. So the answer is neutral.\nPremise: x",
        );
        assert_eq!(out.answer, "neutral");
        assert_eq!(out.rationale, "Not stated.");
    }

    #[test]
    fn openr1_prefers_last_answer_marker() {
        let out = OutputFormat::OpenR1
            .parse(r#"["Work it out.\nAnswer: 3\nCheck.\nAnswer: 4"]"#, LlmSource::Palm)
            .unwrap();
        assert_eq!(out.answer, "4");
        assert!(out.rationale.ends_with("Check."));
    }

    #[test]
    fn openr1_falls_back_to_boxed() {
        let out = OutputFormat::OpenR1
            .parse(r"Thus \boxed{7} then \boxed{9}", LlmSource::Palm)
            .unwrap();
        assert_eq!(out.answer, "9");

        let out = OutputFormat::OpenR1
            .parse("Final Answer\n\\boxed{5}. Later \\boxed{6}", LlmSource::Palm)
            .unwrap();
        assert_eq!(out.answer, "5");
    }

    #[test]
    fn openr1_without_marker_is_a_parse_error() {
        let err = OutputFormat::OpenR1.parse("nothing useful", LlmSource::Palm).unwrap_err();
        assert!(matches!(err, TrainError::Parse { .. }));
    }
}
