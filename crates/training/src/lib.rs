pub mod averager;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod latent;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod sample;
pub mod scheduler;
pub mod trainer;

pub use averager::ParameterAverager;
pub use checkpoint::{load_checkpoint, CheckpointDescriptor, CheckpointRecord, CheckpointTrigger};
pub use config::{DatasetKind, LossKind, TrainingConfig, TrainingError};
pub use data::{
    BlockingDataLoader, DataLoader, DataProvider, ImageBatch, ImageDataset, ImageFolder,
    InMemoryDataset, LsunClass, ResolutionDataLoader,
};
pub use latent::LatentSampler;
pub use loss::{AdversarialObjective, DiscriminatorTerms, LossFamily, WganGp, R1};
pub use optimizer::{OptimizerConfig, OptimizerState, ParameterGroup, TrainerOptimizer};
pub use scheduler::{
    BatchSizeTable, LearningRateTable, ResolutionScheduler, TierTransition, TrainingState,
};
pub use trainer::{IterationOutcome, Trainer, TrainingPhase, TrainingSummary};

/// candle detaches every gradient during backprop unless this variable is
/// set before the first backward pass on a thread. Gradient penalties need
/// the gradient graph kept so they can be differentiated again.
pub fn enable_higher_order_gradients() {
    std::env::set_var("CANDLE_GRAD_DO_NOT_DETACH", "1");
}
