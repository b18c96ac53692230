use std::{
    collections::HashMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

use candle_core::{
    safetensors::{load as load_safetensors, save as save_safetensors},
    Device, Tensor,
};
use hex::encode as hex_encode;
use model::{Discriminator, Generator};
use sha2::{Digest, Sha256};

use crate::{
    config::{to_runtime_error, TrainingError},
    optimizer::{OptimizerState, TrainerOptimizer},
};

pub const CHECKPOINT_EXTENSION: &str = "safetensors";

const GENERATOR_PREFIX: &str = "generator/";
const DISCRIMINATOR_PREFIX: &str = "discriminator/";
const G_OPTIMIZER_PREFIX: &str = "g_optimizer/";
const D_OPTIMIZER_PREFIX: &str = "d_optimizer/";

/// Why a checkpoint was written; determines its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    /// Written on entering a new tier, named after the tier just completed.
    TierCompleted { completed_step: usize },
    /// Written every fixed number of iterations, named after the 1-based iteration.
    Periodic { iteration: usize },
}

impl CheckpointTrigger {
    pub fn file_name(&self) -> String {
        match self {
            CheckpointTrigger::TierCompleted { completed_step } => {
                format!("trained_step-{completed_step}.{CHECKPOINT_EXTENSION}")
            }
            CheckpointTrigger::Periodic { iteration } => {
                format!("{iteration:06}.{CHECKPOINT_EXTENSION}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub trigger: CheckpointTrigger,
    pub file: FileRecord,
}

pub struct SaveRequest<'a, G: ?Sized, D: ?Sized> {
    pub directory: &'a Path,
    pub trigger: CheckpointTrigger,
    pub generator: &'a G,
    pub discriminator: &'a D,
    pub g_optimizer: &'a TrainerOptimizer,
    pub d_optimizer: &'a TrainerOptimizer,
    pub device: &'a Device,
}

/// Writes both networks and both optimizer states into one safetensors file.
pub fn save_checkpoint<G, D>(
    request: SaveRequest<'_, G, D>,
) -> Result<CheckpointDescriptor, TrainingError>
where
    G: Generator + ?Sized,
    D: Discriminator + ?Sized,
{
    fs::create_dir_all(request.directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.directory.display()
        ))
    })?;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    let generator_params = request
        .generator
        .parameter_groups()
        .map_err(to_runtime_error)?
        .all();
    insert_prefixed(
        &mut tensors,
        GENERATOR_PREFIX,
        generator_params
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().detach())),
    );
    let discriminator_params = request
        .discriminator
        .parameters()
        .map_err(to_runtime_error)?;
    insert_prefixed(
        &mut tensors,
        DISCRIMINATOR_PREFIX,
        discriminator_params
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().detach())),
    );
    insert_prefixed(
        &mut tensors,
        G_OPTIMIZER_PREFIX,
        request
            .g_optimizer
            .state()
            .to_tensors(request.device)?
            .into_iter(),
    );
    insert_prefixed(
        &mut tensors,
        D_OPTIMIZER_PREFIX,
        request
            .d_optimizer
            .state()
            .to_tensors(request.device)?
            .into_iter(),
    );

    let path = request.directory.join(request.trigger.file_name());
    save_safetensors(&tensors, &path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to write checkpoint {}: {err}",
            path.display()
        ))
    })?;

    Ok(CheckpointDescriptor {
        trigger: request.trigger,
        file: file_record(&path)?,
    })
}

/// The four sub-records of a saved checkpoint.
#[derive(Debug)]
pub struct CheckpointRecord {
    pub generator: HashMap<String, Tensor>,
    pub discriminator: HashMap<String, Tensor>,
    pub g_optimizer: OptimizerState,
    pub d_optimizer: OptimizerState,
}

/// Reads a checkpoint back for inspection. Training never resumes from it.
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<CheckpointRecord, TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint not found at {}",
            path.display()
        )));
    }
    let tensors = load_safetensors(path, device).map_err(to_runtime_error)?;

    let mut generator = HashMap::new();
    let mut discriminator = HashMap::new();
    let mut g_optimizer = HashMap::new();
    let mut d_optimizer = HashMap::new();
    for (key, tensor) in tensors {
        let (target, name) = if let Some(name) = key.strip_prefix(GENERATOR_PREFIX) {
            (&mut generator, name)
        } else if let Some(name) = key.strip_prefix(DISCRIMINATOR_PREFIX) {
            (&mut discriminator, name)
        } else if let Some(name) = key.strip_prefix(G_OPTIMIZER_PREFIX) {
            (&mut g_optimizer, name)
        } else if let Some(name) = key.strip_prefix(D_OPTIMIZER_PREFIX) {
            (&mut d_optimizer, name)
        } else {
            return Err(TrainingError::runtime(format!(
                "checkpoint {} contains unexpected entry '{key}'",
                path.display()
            )));
        };
        target.insert(name.to_string(), tensor);
    }

    Ok(CheckpointRecord {
        generator,
        discriminator,
        g_optimizer: OptimizerState::from_tensors(g_optimizer)?,
        d_optimizer: OptimizerState::from_tensors(d_optimizer)?,
    })
}

/// Checks a checkpoint file against a previously recorded digest.
pub fn validate_file(record: &FileRecord) -> Result<(), TrainingError> {
    let actual = sha256_file(&record.path)?;
    if actual != record.sha256 {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            record.path.display()
        )));
    }
    Ok(())
}

fn insert_prefixed(
    tensors: &mut HashMap<String, Tensor>,
    prefix: &str,
    entries: impl Iterator<Item = (String, Tensor)>,
) {
    for (name, tensor) in entries {
        tensors.insert(format!("{prefix}{name}"), tensor);
    }
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = fs::metadata(path)
        .map_err(|err| {
            TrainingError::runtime(format!("failed to stat {}: {err}", path.display()))
        })?
        .len();
    Ok(FileRecord {
        path: path.to_path_buf(),
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}
