use candle_core::Device;
use model::ModelConfig;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub progressive: ProgressiveConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    /// Defaults for everything except the dataset location.
    pub fn for_dataset(path: impl Into<PathBuf>, kind: DatasetKind) -> Self {
        Self {
            data: DataConfig {
                path: path.into(),
                kind,
                batch_size: default_batch_size(),
                num_workers: default_num_workers(),
                batch_schedule: Vec::new(),
            },
            model: ModelOverrides::default(),
            optimizer: OptimizerConfig::default(),
            progressive: ProgressiveConfig::default(),
            loss: LossConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.path.as_os_str().is_empty() {
            errors.push("data.path must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        for entry in &self.data.batch_schedule {
            if entry.value == 0 {
                errors.push(format!(
                    "data.batch_schedule entry for resolution {} must be greater than 0",
                    entry.resolution
                ));
            }
        }

        if self.model.code_size == 0 {
            errors.push("model.code_size must be greater than 0".to_string());
        }

        if self.model.channels == 0 {
            errors.push("model.channels must be greater than 0".to_string());
        }

        if self.model.mapping_layers == 0 {
            errors.push("model.mapping_layers must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.beta1) {
            errors.push("optimizer.beta1 must be in [0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.style_lr_mult <= 0.0 {
            errors.push("optimizer.style_lr_mult must be greater than 0".to_string());
        }

        for entry in &self.optimizer.lr_schedule {
            if entry.value <= 0.0 {
                errors.push(format!(
                    "optimizer.lr_schedule entry for resolution {} must be greater than 0",
                    entry.resolution
                ));
            }
        }

        if self.progressive.phase == 0 {
            errors.push("progressive.phase must be greater than 0".to_string());
        }

        let sizes = [
            ("progressive.init_size", self.progressive.init_size),
            ("progressive.max_size", self.progressive.max_size),
        ];
        for (label, size) in sizes {
            if size < 4 || !size.is_power_of_two() {
                errors.push(format!(
                    "{} must be a power of two >= 4 (got {})",
                    label, size
                ));
            }
        }

        if self.progressive.init_size > self.progressive.max_size {
            errors.push("progressive.init_size cannot exceed progressive.max_size".to_string());
        }

        if !(0.0..=1.0).contains(&self.loss.mixing_prob) {
            errors.push("loss.mixing_prob must be in [0, 1]".to_string());
        }

        if self.loss.n_critic == 0 {
            errors.push("loss.n_critic must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.loss.ema_decay) {
            errors.push("loss.ema_decay must be in [0, 1]".to_string());
        }

        if self.runtime.iterations == 0 {
            errors.push("runtime.iterations must be greater than 0".to_string());
        }

        if self.runtime.devices == 0 {
            errors.push("runtime.devices must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if self.runtime.checkpoint.every_n_iters == 0 {
            errors.push("runtime.checkpoint.every_n_iters must be greater than 0".to_string());
        }

        if let Some(samples) = &self.runtime.samples {
            if samples.every_n_iters == 0 {
                errors.push("runtime.samples.every_n_iters must be greater than 0".to_string());
            }
            if samples.directory.as_os_str().is_empty() {
                errors.push("runtime.samples.directory must not be empty".to_string());
            }
            for entry in &samples.grid {
                if entry.value[0] == 0 || entry.value[1] == 0 {
                    errors.push(format!(
                        "runtime.samples.grid entry for resolution {} must be non-empty",
                        entry.resolution
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.path, base);
        self.runtime.apply_base_path(base);
    }

    /// First progressive tier, derived from `progressive.init_size`.
    pub fn initial_step(&self) -> usize {
        step_for_size(self.progressive.init_size)
    }

    /// Last progressive tier, derived from `progressive.max_size`.
    pub fn max_step(&self) -> usize {
        step_for_size(self.progressive.max_size)
    }

    pub fn model_config(&self, device: &Device) -> ModelConfig {
        ModelConfig {
            code_size: self.model.code_size,
            channels: self.model.channels,
            mapping_layers: self.model.mapping_layers,
            max_step: self.max_step(),
            device: device.clone(),
        }
    }
}

fn step_for_size(size: usize) -> usize {
    (size.max(4).trailing_zeros() as usize).saturating_sub(2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Folder,
    Lsun,
}

impl Default for DatasetKind {
    fn default() -> Self {
        Self::Folder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    #[serde(rename = "wgan-gp", alias = "wgan_gp")]
    WganGp,
    #[serde(rename = "r1")]
    R1,
}

impl Default for LossKind {
    fn default() -> Self {
        Self::WganGp
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossKind::WganGp => write!(f, "wgan-gp"),
            LossKind::R1 => write!(f, "r1"),
        }
    }
}

/// A value attached to one output resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEntry<T> {
    pub resolution: usize,
    pub value: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub kind: DatasetKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default)]
    pub batch_schedule: Vec<ResolutionEntry<usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default = "default_code_size")]
    pub code_size: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_mapping_layers")]
    pub mapping_layers: usize,
}

impl Default for ModelOverrides {
    fn default() -> Self {
        Self {
            code_size: default_code_size(),
            channels: default_channels(),
            mapping_layers: default_mapping_layers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_style_lr_mult")]
    pub style_lr_mult: f64,
    #[serde(default)]
    pub lr_schedule: Vec<ResolutionEntry<f64>>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            weight_decay: 0.0,
            style_lr_mult: default_style_lr_mult(),
            lr_schedule: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Adam,
    AdamW,
    Sgd,
}

impl Default for OptimizerType {
    fn default() -> Self {
        Self::Adam
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressiveConfig {
    /// Samples per half tier: blending lasts `phase` samples, a tier `2 * phase`.
    #[serde(default = "default_phase")]
    pub phase: usize,
    #[serde(default = "default_init_size")]
    pub init_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Enables the built-in resolution-dependent learning-rate and batch-size tables.
    #[serde(default)]
    pub sched: bool,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            phase: default_phase(),
            init_size: default_init_size(),
            max_size: default_max_size(),
            sched: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub kind: LossKind,
    #[serde(default)]
    pub mixing: bool,
    #[serde(default = "default_mixing_prob")]
    pub mixing_prob: f64,
    #[serde(default = "default_n_critic")]
    pub n_critic: usize,
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::default(),
            mixing: false,
            mixing_prob: default_mixing_prob(),
            n_critic: default_n_critic(),
            ema_decay: default_ema_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_devices")]
    pub devices: usize,
    /// Suppresses every checkpoint write.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub samples: Option<SampleConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            seed: default_seed(),
            devices: default_devices(),
            debug: false,
            checkpoint: CheckpointConfig::default(),
            samples: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        if let Some(samples) = self.samples.as_mut() {
            absolutize_in_place(&mut samples.directory, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub every_n_iters: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            every_n_iters: default_checkpoint_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    #[serde(default = "default_sample_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_sample_every")]
    pub every_n_iters: usize,
    /// `[columns, rows]` of the preview grid per resolution: images per row, then row count.
    #[serde(default = "default_sample_grid")]
    pub grid: Vec<ResolutionEntry<[usize; 2]>>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            directory: default_sample_dir(),
            every_n_iters: default_sample_every(),
            grid: default_sample_grid(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    32
}

fn default_num_workers() -> usize {
    4
}

fn default_code_size() -> usize {
    512
}

fn default_channels() -> usize {
    128
}

fn default_mapping_layers() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.0
}

fn default_beta2() -> f64 {
    0.99
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_style_lr_mult() -> f64 {
    0.01
}

fn default_phase() -> usize {
    320_000
}

fn default_init_size() -> usize {
    8
}

fn default_max_size() -> usize {
    256
}

fn default_mixing_prob() -> f64 {
    0.9
}

fn default_n_critic() -> usize {
    1
}

fn default_ema_decay() -> f64 {
    0.999
}

fn default_iterations() -> usize {
    100_000
}

fn default_seed() -> u64 {
    42
}

fn default_devices() -> usize {
    1
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoint")
}

fn default_checkpoint_every() -> usize {
    10_000
}

fn default_sample_dir() -> PathBuf {
    PathBuf::from("sample")
}

fn default_sample_every() -> usize {
    100
}

fn default_sample_grid() -> Vec<ResolutionEntry<[usize; 2]>> {
    vec![
        ResolutionEntry {
            resolution: 512,
            value: [8, 4],
        },
        ResolutionEntry {
            resolution: 1024,
            value: [4, 2],
        },
    ]
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    50
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    DataExhausted(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn data_exhausted(message: impl Into<String>) -> Self {
        Self::DataExhausted(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::DataExhausted(msg) => write!(f, "data stream exhausted: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_)
            | TrainingError::Runtime(_)
            | TrainingError::DataExhausted(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
