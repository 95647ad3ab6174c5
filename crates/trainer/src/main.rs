use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;

use trainer::{launch, LaunchOptions, RunConfig, StopSignal, TrainError, TrainerConfig};

/// Distills a pretrained seq2seq model on a reasoning dataset.
#[derive(Parser, Debug)]
#[command(name = "distill-train", version, about)]
struct Args {
    /// Pretrained directory (config.json, tokenizer.json, *.safetensors)
    #[arg(long = "from_pretrained")]
    from_pretrained: PathBuf,

    /// cqa | svamp | asdiv | esnli | anli1 | hendrycks_math | openr1_math
    #[arg(long)]
    dataset: String,

    /// standard | task_prefix
    #[arg(long = "model_type")]
    model_type: String,

    /// gt | llm
    #[arg(long = "label_type")]
    label_type: String,

    #[arg(long = "eval_steps")]
    eval_steps: u64,

    #[arg(long = "batch_size")]
    batch_size: usize,

    #[arg(long = "grad_steps")]
    grad_steps: usize,

    /// YAML trainer configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    alpha: Option<f64>,

    #[arg(long = "max_steps")]
    max_steps: Option<u64>,

    #[arg(long = "max_input_length")]
    max_input_length: Option<usize>,

    #[arg(long = "gen_max_len")]
    gen_max_len: Option<usize>,

    /// Random seed
    #[arg(long)]
    run: Option<u64>,

    #[arg(long)]
    subsample: Option<f64>,

    /// palm | gpt
    #[arg(long)]
    llm: Option<String>,

    #[arg(long = "output_dir")]
    output_dir: Option<PathBuf>,

    #[arg(long = "data_root")]
    data_root: Option<PathBuf>,

    #[arg(long = "save_steps")]
    save_steps: Option<u64>,

    #[arg(long)]
    epochs: Option<usize>,

    /// halt | retry | retry:N
    #[arg(long = "non_finite_policy")]
    non_finite_policy: Option<String>,

    #[arg(long)]
    prefetch: Option<usize>,

    #[arg(long = "output_rationale")]
    output_rationale: bool,

    /// Checkpoint directory to resume from
    #[arg(long = "resume_from")]
    resume_from: Option<PathBuf>,

    /// Pretrained model that samples missing llm labels
    #[arg(long = "label_teacher")]
    label_teacher: Option<PathBuf>,
}

impl Args {
    fn into_configs(self) -> trainer::Result<(RunConfig, TrainerConfig, LaunchOptions)> {
        let run = RunConfig {
            from_pretrained: self.from_pretrained,
            dataset: self.dataset,
            model_type: self.model_type.parse()?,
            label_type: self.label_type.parse()?,
            eval_steps: self.eval_steps,
            batch_size: self.batch_size,
            grad_steps: self.grad_steps,
        };

        let mut trainer = match &self.config {
            Some(path) => TrainerConfig::from_yaml_file(path)?,
            None => TrainerConfig::default(),
        };
        if let Some(lr) = self.lr {
            trainer.learning_rate = lr;
        }
        if let Some(alpha) = self.alpha {
            trainer.alpha = alpha;
        }
        if let Some(max_steps) = self.max_steps {
            trainer.max_steps = Some(max_steps);
        }
        if let Some(len) = self.max_input_length {
            trainer.max_input_length = len;
        }
        if let Some(len) = self.gen_max_len {
            trainer.gen_max_len = len;
        }
        if let Some(seed) = self.run {
            trainer.seed = seed;
        }
        if let Some(fraction) = self.subsample {
            trainer.subsample = fraction;
        }
        if let Some(llm) = &self.llm {
            trainer.llm = llm.parse()?;
        }
        if let Some(dir) = self.output_dir {
            trainer.output_dir = dir;
        }
        if let Some(dir) = self.data_root {
            trainer.data_root = dir;
        }
        if let Some(every) = self.save_steps {
            trainer.save_steps = Some(every);
        }
        if let Some(epochs) = self.epochs {
            trainer.epochs = epochs;
        }
        if let Some(policy) = &self.non_finite_policy {
            trainer.non_finite_policy = policy.parse()?;
        }
        if let Some(depth) = self.prefetch {
            trainer.prefetch = depth;
        }
        if self.output_rationale {
            trainer.output_rationale = true;
        }

        let options = LaunchOptions {
            resume_from: self.resume_from,
            label_teacher: self.label_teacher,
        };
        Ok((run, trainer, options))
    }
}

fn failure_code(err: &TrainError) -> ExitCode {
    match err {
        TrainError::InvalidConfig(_) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (run, config, options) = match Args::parse().into_configs() {
        Ok(configs) => configs,
        Err(err) => {
            log::error!("{err}");
            return failure_code(&err);
        }
    };
    if let Err(err) = trainer::launch::validate(&run, &config) {
        log::error!("{err}");
        return failure_code(&err);
    }

    let stop = StopSignal::new();
    let training = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || launch(run, config, options, stop)
    });
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping after the current accumulation group");
            stop.stop();
        }
    });

    let outcome = training.await;
    interrupt.abort();

    match outcome {
        Ok(Ok(report)) => {
            if let Some(err) = &report.last_error {
                log::error!("run failed: {err}");
            }
            ExitCode::from(report.exit_code() as u8)
        }
        Ok(Err(err)) => {
            log::error!("{err}");
            failure_code(&err)
        }
        Err(err) => {
            log::error!("training task panicked: {err}");
            ExitCode::FAILURE
        }
    }
}
