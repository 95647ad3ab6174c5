use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::{RunConfig, TrainerConfig};
use crate::error::{Result, TrainError};
use crate::orchestrator::TrainState;

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const METRICS_FILE: &str = "metrics.jsonl";

pub type Metrics = BTreeMap<String, f64>;

/// What gets written next to the weights of a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub train_state: TrainState,
    /// Phase the run was in when the checkpoint was taken.
    pub phase: String,
    pub run_config: RunConfig,
    pub trainer_config: TrainerConfig,
}

/// Receives TrainState snapshots. `write_weights` stores the backbone
/// parameters into the directory the sink picks.
pub trait CheckpointSink {
    fn save(&mut self, record: &CheckpointRecord, write_weights: &dyn Fn(&Path) -> Result<()>) -> Result<()>;
}

/// `{root}/checkpoint-{global_step}/` per snapshot.
pub struct DirCheckpointSink {
    root: PathBuf,
}

impl DirCheckpointSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn checkpoint_dir(&self, global_step: u64) -> PathBuf {
        self.root.join(format!("checkpoint-{global_step}"))
    }
}

impl CheckpointSink for DirCheckpointSink {
    fn save(&mut self, record: &CheckpointRecord, write_weights: &dyn Fn(&Path) -> Result<()>) -> Result<()> {
        let dir = self.checkpoint_dir(record.train_state.global_step);
        std::fs::create_dir_all(&dir)
            .map_err(|e| TrainError::Checkpoint(format!("cannot create {}: {e}", dir.display())))?;
        write_weights(&dir)?;
        std::fs::write(dir.join(TRAINER_STATE_FILE), serde_json::to_string_pretty(record)?)?;
        log::info!("saved checkpoint to {}", dir.display());
        Ok(())
    }
}

/// Reads the record a [`DirCheckpointSink`] wrote into `dir`.
pub fn load_checkpoint_record(dir: &Path) -> Result<CheckpointRecord> {
    let path = dir.join(TRAINER_STATE_FILE);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| TrainError::Checkpoint(format!("cannot read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&content)?)
}

pub trait MetricsSink {
    fn record(&mut self, global_step: u64, metrics: &Metrics) -> Result<()>;
}

pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record(&mut self, global_step: u64, metrics: &Metrics) -> Result<()> {
        let line: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
        log::info!("eval @ step {global_step}: {}", line.join(" "));
        Ok(())
    }
}

/// Appends one JSON object per evaluation to `metrics.jsonl`.
pub struct JsonlMetricsSink {
    writer: BufWriter<File>,
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    step: u64,
    metrics: &'a Metrics,
}

impl JsonlMetricsSink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new().create(true).append(true).open(dir.join(METRICS_FILE))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn record(&mut self, global_step: u64, metrics: &Metrics) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &MetricsLine { step: global_step, metrics })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
