use candle_core::{Device, Error, Result};

/// Hyperparameters shared by the reference generator and discriminator.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub code_size: usize,
    pub channels: usize,
    pub mapping_layers: usize,
    /// Highest progressive tier the networks are built for (resolution `4 * 2^max_step`).
    pub max_step: usize,
    pub device: Device,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.code_size == 0 {
            return Err(Error::Msg("code_size must be greater than zero".into()));
        }
        if self.channels == 0 {
            return Err(Error::Msg("channels must be greater than zero".into()));
        }
        if self.mapping_layers == 0 {
            return Err(Error::Msg(
                "mapping network needs at least one layer".into(),
            ));
        }
        Ok(())
    }

    pub fn num_tiers(&self) -> usize {
        self.max_step + 1
    }
}
