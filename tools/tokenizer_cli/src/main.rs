use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tokenizer::{Trainer, BPE};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a BPE tokenizer on dataset split files or plain text
    Train {
        /// `.json` split/llm files (every string field is used) or text files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Where to write tokenizer.json
        #[arg(short, long, default_value = "tokenizer.json")]
        output: PathBuf,

        #[arg(short, long, default_value_t = 32000)]
        vocab_size: usize,

        /// Minimum frequency for a pair to be merged
        #[arg(long, default_value_t = 2)]
        min_frequency: u32,
    },
    /// Encode text with a trained tokenizer
    Encode {
        #[arg(long)]
        tokenizer: PathBuf,

        #[arg(short, long)]
        text: String,

        #[arg(long)]
        max_tokens: Option<usize>,
    },
    /// Decode comma separated ids with a trained tokenizer
    Decode {
        #[arg(long)]
        tokenizer: PathBuf,

        #[arg(short, long)]
        ids: String,
    },
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if !s.trim().is_empty() => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Every text a corpus file contributes. JSON files may be one array or
/// one value per line.
fn corpus_texts(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    if path.extension().map_or(true, |ext| ext != "json") {
        return Ok(content.lines().map(str::to_string).collect());
    }

    let mut texts = Vec::new();
    match serde_json::from_str::<Value>(&content) {
        Ok(value) => collect_strings(&value, &mut texts),
        Err(_) => {
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let value: Value =
                    serde_json::from_str(line).with_context(|| format!("{:?} is neither JSON nor JSON lines", path))?;
                collect_strings(&value, &mut texts);
            }
        }
    }
    Ok(texts)
}

fn parse_ids(ids: &str) -> Result<Vec<u32>> {
    ids.split(',')
        .map(|s| s.trim().parse().with_context(|| format!("invalid id {:?}", s.trim())))
        .collect()
}

fn load(path: &Path) -> Result<BPE> {
    BPE::load(path).with_context(|| format!("failed to load tokenizer from {:?}", path))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            files,
            output,
            vocab_size,
            min_frequency,
        } => {
            let mut texts = Vec::new();
            for path in &files {
                let before = texts.len();
                texts.extend(corpus_texts(path)?);
                log::info!("{:?}: {} texts", path, texts.len() - before);
            }
            let bpe = Trainer::new(vocab_size, min_frequency)
                .train_from_texts(&texts)
                .context("tokenizer training failed")?;
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            bpe.save(&output).with_context(|| format!("failed to save {:?}", output))?;
            log::info!("saved {} tokens to {:?}", bpe.vocab_size(), output);
        }
        Commands::Encode {
            tokenizer,
            text,
            max_tokens,
        } => {
            let bpe = load(&tokenizer)?;
            let ids = match max_tokens {
                Some(max) => bpe.encode_with_max_tokens(&text, max),
                None => bpe.encode(&text),
            };
            println!("{:?}", ids);
        }
        Commands::Decode { tokenizer, ids } => {
            let bpe = load(&tokenizer)?;
            println!("{}", bpe.decode(&parse_ids(&ids)?));
        }
    }

    Ok(())
}
