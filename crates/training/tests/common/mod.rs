#![allow(dead_code)]

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use image::{DynamicImage, Rgb, RgbImage};
use model::{resolution_for_step, Discriminator, Generator, LatentInput, ParameterGroups};
use training::InMemoryDataset;

fn sorted_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap.data().lock().expect("varmap lock");
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Linear generator: one style layer, one dense projection per tier.
pub struct TinyGenerator {
    varmap: VarMap,
    code_size: usize,
    style: Linear,
    to_rgb: Vec<Linear>,
}

impl TinyGenerator {
    pub fn new(code_size: usize, max_step: usize) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let style = linear(code_size, code_size, vb.pp("style.0")).expect("style layer");
        let to_rgb = (0..=max_step)
            .map(|step| {
                let size = resolution_for_step(step);
                linear(code_size, 3 * size * size, vb.pp(format!("synthesis.to_rgb{step}")))
                    .expect("rgb layer")
            })
            .collect();
        Self {
            varmap,
            code_size,
            style,
            to_rgb,
        }
    }

    pub fn vars(&self) -> Vec<(String, Var)> {
        sorted_vars(&self.varmap)
    }

    fn render(&self, style: &Tensor, step: usize) -> Result<Tensor> {
        let size = resolution_for_step(step);
        let (batch, _) = style.dims2()?;
        self.to_rgb[step]
            .forward(style)?
            .tanh()?
            .reshape((batch, 3, size, size))
    }
}

impl Generator for TinyGenerator {
    fn forward(&self, latent: &LatentInput, step: usize, alpha: f64) -> Result<Tensor> {
        let code = match latent {
            LatentInput::Single(code) => code.clone(),
            LatentInput::Mixed {
                primary, secondary, ..
            } => ((primary + secondary)? * 0.5)?,
        };
        let style = self.style.forward(&code)?;
        let fresh = self.render(&style, step)?;
        if step > 0 && (0.0..1.0).contains(&alpha) {
            let size = resolution_for_step(step);
            let skip = self.render(&style, step - 1)?.upsample_nearest2d(size, size)?;
            return skip.affine(1.0 - alpha, 0.0)? + fresh.affine(alpha, 0.0)?;
        }
        Ok(fresh)
    }

    fn parameter_groups(&self) -> Result<ParameterGroups> {
        let mut groups = ParameterGroups::default();
        for (name, var) in self.vars() {
            if name.starts_with("style.") {
                groups.style.push((name, var));
            } else {
                groups.synthesis.push((name, var));
            }
        }
        Ok(groups)
    }

    fn code_size(&self) -> usize {
        self.code_size
    }
}

/// Linear critic: one dense score head per tier.
pub struct TinyCritic {
    varmap: VarMap,
    heads: Vec<Linear>,
}

impl TinyCritic {
    pub fn new(max_step: usize) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let heads = (0..=max_step)
            .map(|step| {
                let size = resolution_for_step(step);
                linear(3 * size * size, 1, vb.pp(format!("score{step}"))).expect("score head")
            })
            .collect();
        Self { varmap, heads }
    }

    pub fn head_weight(&self, step: usize) -> Tensor {
        self.heads[step].weight().clone()
    }
}

impl Discriminator for TinyCritic {
    fn forward(&self, images: &Tensor, step: usize, _alpha: f64) -> Result<Tensor> {
        self.heads[step].forward(&images.flatten_from(1)?)
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        Ok(sorted_vars(&self.varmap))
    }
}

/// Scores of the wrapped critic with the sign flipped.
pub struct Negated<'a, D>(pub &'a D);

impl<D: Discriminator> Discriminator for Negated<'_, D> {
    fn forward(&self, images: &Tensor, step: usize, alpha: f64) -> Result<Tensor> {
        self.0.forward(images, step, alpha)?.neg()
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        self.0.parameters()
    }
}

pub fn solid_image(width: u32, height: u32, shade: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb([shade, shade / 2, 255 - shade]),
    ))
}

pub fn dataset(count: usize) -> InMemoryDataset {
    InMemoryDataset::new(
        (0..count)
            .map(|idx| (solid_image(12, 10, (idx * 37 % 256) as u8), idx as u32 % 3))
            .collect(),
    )
}

pub fn random_images(batch: usize, size: usize, seed: f32) -> Tensor {
    let values: Vec<f32> = (0..batch * 3 * size * size)
        .map(|idx| ((idx as f32) * 0.61 + seed).sin())
        .collect();
    Tensor::from_vec(values, (batch, 3, size, size), &Device::Cpu).expect("images")
}

pub fn scalar(tensor: &Tensor) -> f64 {
    tensor
        .to_dtype(DType::F64)
        .expect("dtype")
        .to_scalar::<f64>()
        .expect("scalar")
}
