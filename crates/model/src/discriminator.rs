use candle_core::{DType, Error, Result, Tensor, Var};
use candle_nn::{linear, Conv2d, Linear, Module, VarBuilder, VarMap};

use crate::{
    blocks::{blend, conv1x1, leaky, named_vars, DownBlock},
    config::ModelConfig,
    contract::Discriminator,
};

/// Mirror of the generator: one `from_rgb` entry point per tier, downsampling
/// blocks back to 4x4, then a linear critic head.
pub struct ProgressiveDiscriminator {
    config: ModelConfig,
    varmap: VarMap,
    from_rgb: Vec<Conv2d>,
    blocks: Vec<DownBlock>,
    head: Linear,
}

impl ProgressiveDiscriminator {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.device);

        let mut from_rgb = Vec::with_capacity(config.num_tiers());
        let mut blocks = Vec::with_capacity(config.num_tiers());
        for step in 0..config.num_tiers() {
            from_rgb.push(conv1x1(
                3,
                config.channels,
                vb.pp(format!("from_rgb{step}")),
            )?);
            blocks.push(DownBlock::new(
                config.channels,
                step > 0,
                vb.pp(format!("block{step}")),
            )?);
        }
        let head = linear(config.channels * 16, 1, vb.pp("head"))?;

        Ok(Self {
            config,
            varmap,
            from_rgb,
            blocks,
            head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl Discriminator for ProgressiveDiscriminator {
    fn forward(&self, images: &Tensor, step: usize, alpha: f64) -> Result<Tensor> {
        if step > self.config.max_step {
            return Err(Error::Msg(format!(
                "discriminator built for step <= {} (got {})",
                self.config.max_step, step
            )));
        }
        let (_, _, height, width) = images.dims4()?;
        let expected = crate::resolution_for_step(step);
        if height != expected || width != expected {
            return Err(Error::Msg(format!(
                "discriminator step {step} expects {expected}x{expected} images (got {height}x{width})"
            )));
        }

        let mut hidden = leaky(&self.from_rgb[step].forward(images)?)?;
        for idx in (0..=step).rev() {
            hidden = self.blocks[idx].forward(&hidden)?;
            if idx == step && step > 0 && (0.0..1.0).contains(&alpha) {
                let skip = leaky(&self.from_rgb[step - 1].forward(&images.avg_pool2d(2)?)?)?;
                hidden = blend(&skip, &hidden, alpha)?;
            }
        }

        self.head.forward(&hidden.flatten_from(1)?)
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(&self.varmap)
    }
}
