use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use serde_json::{Map, Value};
use training::{DatasetKind, LossKind, Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Progressive GAN training CLI", long_about = None)]
struct Args {
    #[arg(value_name = "PATH", help = "Path of the dataset")]
    path: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Training config file (TOML or JSON); flags are applied on top"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(short = 'd', long, value_parser = ["folder", "lsun"], help = "Dataset layout")]
    data: Option<String>,

    #[arg(long = "n-gpu", alias = "n_gpu", help = "Number of accelerator devices")]
    n_gpu: Option<usize>,

    #[arg(long, help = "Number of samples used for each training phase")]
    phase: Option<usize>,

    #[arg(long, help = "Total iterations")]
    iters: Option<usize>,

    #[arg(long = "batch-size", help = "Batch size of the first step")]
    batch_size: Option<usize>,

    #[arg(long, help = "Learning rate")]
    lr: Option<f64>,

    #[arg(long, help = "Use resolution-dependent learning rate and batch size")]
    sched: bool,

    #[arg(long = "init-size", help = "Initial image size")]
    init_size: Option<usize>,

    #[arg(long = "max-size", help = "Maximum image size")]
    max_size: Option<usize>,

    #[arg(long, help = "Use style mixing regularization")]
    mixing: bool,

    #[arg(long, value_parser = ["wgan-gp", "r1"], help = "Adversarial loss family")]
    loss: Option<String>,

    #[arg(long, help = "Suppress every checkpoint write")]
    debug: bool,
}

/// `section.key=value`; the value is read as JSON and falls back to a plain string.
#[derive(Debug, Clone)]
struct OverrideArg {
    keys: Vec<String>,
    value: Value,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((path, raw)) = s.split_once('=') else {
            return Err(format!("expected KEY=VALUE, got '{s}'"));
        };
        let keys: Vec<String> = path.split('.').map(|key| key.trim().to_string()).collect();
        if keys.iter().any(String::is_empty) {
            return Err(format!("invalid override key '{path}'"));
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Self { keys, value })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = match (&args.config, &args.path) {
        (Some(path), _) => TrainingConfig::load(path)?,
        (None, Some(path)) => TrainingConfig::for_dataset(path.clone(), DatasetKind::Folder),
        (None, None) => {
            return Err(TrainingError::ConfigFormat(
                "either a dataset PATH or --config is required".to_string(),
            ))
        }
    };
    apply_flags(&mut config, &args)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }

    config.validate()?;

    let mut trainer = Trainer::from_config(config)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summary = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    println!(
        "finished {} iteration(s) at {}px; {} checkpoint(s) written, {} data restart(s)",
        summary.iterations,
        summary.state.resolution(),
        summary.checkpoints.len(),
        summary.data_restarts
    );

    Ok(())
}

fn apply_flags(config: &mut TrainingConfig, args: &Args) -> Result<(), TrainingError> {
    if let (Some(path), Some(_)) = (&args.path, &args.config) {
        config.data.path = path.clone();
    }
    if let Some(kind) = args.data.as_deref() {
        config.data.kind = parse_enum::<DatasetKind>(kind)?;
    }
    if let Some(devices) = args.n_gpu {
        config.runtime.devices = devices;
    }
    if let Some(phase) = args.phase {
        config.progressive.phase = phase;
    }
    if let Some(iters) = args.iters {
        config.runtime.iterations = iters;
    }
    if let Some(batch_size) = args.batch_size {
        config.data.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        config.optimizer.learning_rate = lr;
    }
    if let Some(size) = args.init_size {
        config.progressive.init_size = size;
    }
    if let Some(size) = args.max_size {
        config.progressive.max_size = size;
    }
    if let Some(loss) = args.loss.as_deref() {
        config.loss.kind = parse_enum::<LossKind>(loss)?;
    }
    config.progressive.sched |= args.sched;
    config.loss.mixing |= args.mixing;
    config.runtime.debug |= args.debug;
    Ok(())
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, TrainingError> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(TrainingError::from)
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut tree = serde_json::to_value(config)?;
    for item in overrides {
        let (last, parents) = item
            .keys
            .split_last()
            .ok_or_else(|| TrainingError::ConfigFormat("empty override key".to_string()))?;
        let mut node = &mut tree;
        for key in parents {
            if node.is_null() {
                *node = Value::Object(Map::new());
            }
            node = node
                .as_object_mut()
                .ok_or_else(|| {
                    TrainingError::ConfigFormat(format!(
                        "cannot override '{}': '{key}' is not a table",
                        item.keys.join(".")
                    ))
                })?
                .entry(key.clone())
                .or_insert(Value::Null);
        }
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        let Some(table) = node.as_object_mut() else {
            return Err(TrainingError::ConfigFormat(format!(
                "cannot override '{}': parent is not a table",
                item.keys.join(".")
            )));
        };
        table.insert(last.clone(), item.value.clone());
    }
    Ok(serde_json::from_value(tree)?)
}
