use candle_core::{DType, Error, Result, Tensor};
use candle_nn::{linear, Conv2d, Init, Linear, Module, VarBuilder, VarMap};

use crate::{
    blocks::{blend, conv1x1, leaky, named_vars, pixel_norm, upscale2x, StyledConvBlock},
    config::ModelConfig,
    contract::{Generator, LatentInput, ParameterGroups},
};

const STYLE_PREFIX: &str = "style.";

/// Style-based progressive generator: a mapping network turns latent codes
/// into styles that modulate a stack of upsampling synthesis blocks.
pub struct StyledGenerator {
    config: ModelConfig,
    varmap: VarMap,
    mapping: Vec<Linear>,
    constant: Tensor,
    blocks: Vec<StyledConvBlock>,
    to_rgb: Vec<Conv2d>,
}

impl StyledGenerator {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.device);

        let style_vb = vb.pp("style");
        let mut mapping = Vec::with_capacity(config.mapping_layers);
        for layer in 0..config.mapping_layers {
            mapping.push(linear(
                config.code_size,
                config.code_size,
                style_vb.pp(layer.to_string()),
            )?);
        }

        let synthesis_vb = vb.pp("synthesis");
        let constant = synthesis_vb.get_with_hints(
            (1, config.channels, 4, 4),
            "constant",
            Init::Const(1.0),
        )?;

        let mut blocks = Vec::with_capacity(config.num_tiers());
        let mut to_rgb = Vec::with_capacity(config.num_tiers());
        for step in 0..config.num_tiers() {
            blocks.push(StyledConvBlock::new(
                config.channels,
                config.code_size,
                step > 0,
                synthesis_vb.pp(format!("block{step}")),
            )?);
            to_rgb.push(conv1x1(
                config.channels,
                3,
                synthesis_vb.pp(format!("to_rgb{step}")),
            )?);
        }

        Ok(Self {
            config,
            varmap,
            mapping,
            constant,
            blocks,
            to_rgb,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn style(&self, code: &Tensor) -> Result<Tensor> {
        let mut xs = pixel_norm(code)?;
        for layer in &self.mapping {
            xs = leaky(&layer.forward(&xs)?)?;
        }
        Ok(xs)
    }

    fn styles_per_block(&self, latent: &LatentInput, step: usize) -> Result<Vec<Tensor>> {
        match latent {
            LatentInput::Single(code) => {
                let style = self.style(code)?;
                Ok(vec![style; step + 1])
            }
            LatentInput::Mixed {
                primary,
                secondary,
                crossover,
            } => {
                let first = self.style(primary)?;
                let second = self.style(secondary)?;
                Ok((0..=step)
                    .map(|idx| {
                        if idx < *crossover {
                            first.clone()
                        } else {
                            second.clone()
                        }
                    })
                    .collect())
            }
        }
    }
}

impl Generator for StyledGenerator {
    fn forward(&self, latent: &LatentInput, step: usize, alpha: f64) -> Result<Tensor> {
        if step > self.config.max_step {
            return Err(Error::Msg(format!(
                "generator built for step <= {} (got {})",
                self.config.max_step, step
            )));
        }
        let batch = latent.batch_size()?;
        let styles = self.styles_per_block(latent, step)?;

        let mut hidden = self
            .constant
            .broadcast_as((batch, self.config.channels, 4, 4))?;
        let mut previous = None;
        for (idx, (block, style)) in self.blocks.iter().zip(styles.iter()).enumerate() {
            if idx == step && step > 0 {
                previous = Some(hidden.clone());
            }
            hidden = block.forward(&hidden, style)?;
        }

        let rgb = self.to_rgb[step].forward(&hidden)?;
        match previous {
            Some(previous) if (0.0..1.0).contains(&alpha) => {
                let skip = upscale2x(&self.to_rgb[step - 1].forward(&previous)?)?;
                blend(&skip, &rgb, alpha)
            }
            _ => Ok(rgb),
        }
    }

    fn parameter_groups(&self) -> Result<ParameterGroups> {
        let mut groups = ParameterGroups::default();
        for (name, var) in named_vars(&self.varmap)? {
            if name.starts_with(STYLE_PREFIX) {
                groups.style.push((name, var));
            } else {
                groups.synthesis.push((name, var));
            }
        }
        Ok(groups)
    }

    fn code_size(&self) -> usize {
        self.config.code_size
    }
}
