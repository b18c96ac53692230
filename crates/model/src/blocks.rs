use candle_core::{Error, Result, Tensor, Var, D};
use candle_nn::{conv2d, linear, ops, Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};

pub(crate) const LEAKY_SLOPE: f64 = 0.2;
const NORM_EPS: f64 = 1e-8;
const INSTANCE_NORM_EPS: f64 = 1e-5;

pub(crate) fn leaky(xs: &Tensor) -> Result<Tensor> {
    ops::leaky_relu(xs, LEAKY_SLOPE)
}

/// Normalizes each latent vector to unit average square magnitude.
pub fn pixel_norm(xs: &Tensor) -> Result<Tensor> {
    let denom = xs
        .sqr()?
        .mean_keepdim(D::Minus1)?
        .affine(1.0, NORM_EPS)?
        .sqrt()?;
    xs.broadcast_div(&denom)
}

/// Per-sample, per-channel normalization over the spatial dimensions of `[b, c, h, w]`.
pub fn instance_norm(xs: &Tensor) -> Result<Tensor> {
    let mean = xs.mean_keepdim(3)?.mean_keepdim(2)?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(3)?.mean_keepdim(2)?;
    centered.broadcast_div(&var.affine(1.0, INSTANCE_NORM_EPS)?.sqrt()?)
}

/// Linear cross-fade `(1 - alpha) * skip + alpha * fresh`.
pub fn blend(skip: &Tensor, fresh: &Tensor, alpha: f64) -> Result<Tensor> {
    skip.affine(1.0 - alpha, 0.0)? + fresh.affine(alpha, 0.0)?
}

pub(crate) fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

pub(crate) fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)
}

pub(crate) fn upscale2x(xs: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    xs.upsample_nearest2d(h * 2, w * 2)
}

/// Convolution whose output is modulated by a style vector (adaptive instance norm).
#[derive(Debug)]
pub struct StyledConvBlock {
    conv: Conv2d,
    affine: Linear,
    channels: usize,
    upsample: bool,
}

impl StyledConvBlock {
    pub fn new(
        channels: usize,
        code_size: usize,
        upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = conv3x3(channels, channels, vb.pp("conv"))?;
        let affine = linear(code_size, channels * 2, vb.pp("style_affine"))?;
        Ok(Self {
            conv,
            affine,
            channels,
            upsample,
        })
    }

    pub fn forward(&self, xs: &Tensor, style: &Tensor) -> Result<Tensor> {
        let xs = if self.upsample {
            upscale2x(xs)?
        } else {
            xs.clone()
        };
        let xs = instance_norm(&leaky(&self.conv.forward(&xs)?)?)?;

        let (batch, _) = style.dims2()?;
        let modulation = self.affine.forward(style)?;
        let gain = modulation
            .narrow(1, 0, self.channels)?
            .affine(1.0, 1.0)?
            .reshape((batch, self.channels, 1, 1))?;
        let bias = modulation
            .narrow(1, self.channels, self.channels)?
            .reshape((batch, self.channels, 1, 1))?;
        xs.broadcast_mul(&gain)?.broadcast_add(&bias)
    }
}

/// Two convolutions followed by an optional 2x average-pool downsample.
#[derive(Debug)]
pub struct DownBlock {
    first: Conv2d,
    second: Conv2d,
    downsample: bool,
}

impl DownBlock {
    pub fn new(channels: usize, downsample: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            first: conv3x3(channels, channels, vb.pp("conv1"))?,
            second: conv3x3(channels, channels, vb.pp("conv2"))?,
            downsample,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = leaky(&self.first.forward(xs)?)?;
        let xs = leaky(&self.second.forward(&xs)?)?;
        if self.downsample {
            xs.avg_pool2d(2)
        } else {
            Ok(xs)
        }
    }
}

/// Snapshot of every variable registered in `varmap`, sorted by name.
pub(crate) fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|err| Error::Msg(format!("parameter store poisoned: {err}")))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}
