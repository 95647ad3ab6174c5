use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Collapses a per-problem JSON layout into the split files the trainer reads.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dataset directory holding train/ and test/ subdirectories
    #[arg(long, default_value = "datasets/hendrycks_math")]
    base_dir: PathBuf,

    /// File prefix of the merged split files
    #[arg(long, default_value = "algebra")]
    source: String,

    /// Rationales per llm/{split}_CoT_{i}.json chunk
    #[arg(long, default_value_t = 500)]
    chunk_size: usize,
}

const SPLITS: [&str; 2] = ["train", "test"];

#[derive(Debug, Deserialize)]
struct RawRecord {
    input: String,
    #[serde(default)]
    process: Option<String>,
    label: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Record {
    input: String,
    process: String,
    label: Value,
}

#[derive(Debug, Default, PartialEq)]
struct SplitSummary {
    records: usize,
    rationales: usize,
    chunks: usize,
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {:?}", dir))? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            files.push(path);
        }
    }
    // read_dir order is platform dependent
    files.sort();
    Ok(files)
}

fn collect_split(dir: &Path) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for path in json_files(dir)? {
        let text = fs::read_to_string(&path).with_context(|| format!("failed to read {:?}", path))?;
        let raw: Vec<RawRecord> =
            serde_json::from_str(&text).with_context(|| format!("{:?} is not an array of records", path))?;
        records.extend(raw.into_iter().map(|r| Record {
            input: r.input,
            process: r.process.unwrap_or_default(),
            label: r.label,
        }));
    }
    Ok(records)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("failed to write {:?}", path))
}

fn write_chunks(llm_dir: &Path, split: &str, rationales: &[&str], chunk_size: usize) -> Result<usize> {
    let mut written = 0;
    for (i, chunk) in rationales.chunks(chunk_size).enumerate() {
        write_json(&llm_dir.join(format!("{split}_CoT_{i}.json")), chunk)?;
        written += 1;
    }
    Ok(written)
}

fn prepare_split(base_dir: &Path, source: &str, split: &str, chunk_size: usize) -> Result<SplitSummary> {
    let records = collect_split(&base_dir.join(split))?;
    write_json(&base_dir.join(format!("{source}_{split}.json")), &records)?;

    let rationales: Vec<&str> = records
        .iter()
        .map(|r| r.process.as_str())
        .filter(|p| !p.trim().is_empty())
        .collect();
    if rationales.len() != records.len() {
        log::warn!(
            "{split}: {} of {} records have no process text; llm outputs will be shorter than the split",
            records.len() - rationales.len(),
            records.len()
        );
    }

    let llm_dir = base_dir.join("llm");
    fs::create_dir_all(&llm_dir)?;
    let chunks = write_chunks(&llm_dir, split, &rationales, chunk_size)?;
    Ok(SplitSummary {
        records: records.len(),
        rationales: rationales.len(),
        chunks,
    })
}

fn prepare(args: &Args) -> Result<()> {
    if args.chunk_size == 0 {
        bail!("--chunk-size must be at least 1");
    }
    for split in SPLITS {
        let summary = prepare_split(&args.base_dir, &args.source, split, args.chunk_size)?;
        log::info!(
            "{split}: {} records, {} rationales in {} chunks",
            summary.records,
            summary.rationales,
            summary.chunks
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    prepare(&args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(path: &Path, value: Value) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value.to_string()).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(
            &dir.path().join("train/b.json"),
            json!([{"input": "2+3?", "process": "add them", "label": "5"}]),
        );
        write(
            &dir.path().join("train/a.json"),
            json!([
                {"input": "1+1?", "process": "one and one", "label": "2"},
                {"input": "0*9?", "label": 0}
            ]),
        );
        fs::write(dir.path().join("train/notes.txt"), "ignored").unwrap();
        write(
            &dir.path().join("test/x.json"),
            json!([{"input": "3-1?", "process": "subtract", "label": "2"}]),
        );
        dir
    }

    fn args(dir: &TempDir, chunk_size: usize) -> Args {
        Args {
            base_dir: dir.path().to_path_buf(),
            source: "algebra".to_string(),
            chunk_size,
        }
    }

    #[test]
    fn test_merges_files_in_name_order() {
        let dir = fixture();
        prepare(&args(&dir, 500)).unwrap();

        let text = fs::read_to_string(dir.path().join("algebra_train.json")).unwrap();
        let records: Vec<Record> = serde_json::from_str(&text).unwrap();
        let inputs: Vec<&str> = records.iter().map(|r| r.input.as_str()).collect();
        assert_eq!(inputs, vec!["1+1?", "0*9?", "2+3?"]);
        assert_eq!(records[1].process, "");
        assert_eq!(records[1].label, json!(0));
        assert!(dir.path().join("algebra_test.json").exists());
    }

    #[test]
    fn test_rationales_are_chunked() {
        let dir = fixture();
        let summary = prepare_split(dir.path(), "algebra", "train", 1).unwrap();
        assert_eq!(
            summary,
            SplitSummary {
                records: 3,
                rationales: 2,
                chunks: 2
            }
        );

        let first: Vec<String> =
            serde_json::from_str(&fs::read_to_string(dir.path().join("llm/train_CoT_0.json")).unwrap()).unwrap();
        let second: Vec<String> =
            serde_json::from_str(&fs::read_to_string(dir.path().join("llm/train_CoT_1.json")).unwrap()).unwrap();
        assert_eq!(first, vec!["one and one"]);
        assert_eq!(second, vec!["add them"]);
        assert!(!dir.path().join("llm/train_CoT_2.json").exists());
    }

    #[test]
    fn test_missing_split_directory_fails() {
        let dir = TempDir::new().unwrap();
        let err = prepare(&args(&dir, 10)).unwrap_err();
        assert!(format!("{err:#}").contains("train"));
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let dir = fixture();
        assert!(prepare(&args(&dir, 0)).is_err());
    }
}
