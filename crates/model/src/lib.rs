pub mod blocks;
pub mod config;
pub mod contract;
pub mod discriminator;
pub mod generator;

pub use config::ModelConfig;
pub use contract::{Discriminator, Generator, LatentInput, ParameterGroups};
pub use discriminator::ProgressiveDiscriminator;
pub use generator::StyledGenerator;

/// Output resolution of a progressive tier.
pub fn resolution_for_step(step: usize) -> usize {
    4usize << step
}
