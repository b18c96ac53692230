use candle_core::{Tensor, Var};
use model::Discriminator;
use rand::{rngs::StdRng, Rng};

use crate::config::{to_runtime_error, LossKind, TrainingError};

const WGAN_DRIFT: f64 = 0.001;
const WGAN_PENALTY_WEIGHT: f64 = 10.0;
const R1_PENALTY_WEIGHT: f64 = 5.0;
const NORM_EPS: f64 = 1e-12;

/// The three independently differentiable discriminator loss terms.
#[derive(Debug, Clone)]
pub struct DiscriminatorTerms {
    pub real: Tensor,
    pub fake: Tensor,
    pub penalty: Tensor,
}

impl DiscriminatorTerms {
    pub fn as_losses(&self) -> [&Tensor; 3] {
        [&self.real, &self.fake, &self.penalty]
    }

    /// `real + fake`, the adversarial part of the minimised loss. For WGAN-GP
    /// this is roughly `fake_score - real_score`: the negated critic margin,
    /// opposite in sign to a `real - fake` readout.
    pub fn loss_value(&self) -> Result<f64, TrainingError> {
        Ok(scalar(&self.real)? + scalar(&self.fake)?)
    }

    pub fn penalty_value(&self) -> Result<f64, TrainingError> {
        scalar(&self.penalty)
    }
}

/// Shared interface of the two adversarial loss families.
pub trait LossFamily {
    /// `real` and `fake` must already be detached from the generator.
    fn discriminator_terms<D: Discriminator + ?Sized>(
        &self,
        critic: &D,
        real: &Tensor,
        fake: &Tensor,
        step: usize,
        alpha: f64,
        rng: &mut StdRng,
    ) -> Result<DiscriminatorTerms, TrainingError>;

    fn generator_loss(&self, fake_scores: &Tensor) -> Result<Tensor, TrainingError>;
}

/// Wasserstein loss with drift term and interpolated gradient penalty.
#[derive(Debug, Clone, Copy, Default)]
pub struct WganGp;

impl LossFamily for WganGp {
    fn discriminator_terms<D: Discriminator + ?Sized>(
        &self,
        critic: &D,
        real: &Tensor,
        fake: &Tensor,
        step: usize,
        alpha: f64,
        rng: &mut StdRng,
    ) -> Result<DiscriminatorTerms, TrainingError> {
        let real_scores = critic.forward(real, step, alpha).map_err(to_runtime_error)?;
        let drift = real_scores
            .sqr()
            .and_then(|sq| sq.mean_all())
            .and_then(|mean| mean.affine(WGAN_DRIFT, 0.0))
            .map_err(to_runtime_error)?;
        let real_term = real_scores
            .mean_all()
            .and_then(|mean| mean.neg())
            .and_then(|neg| neg + drift)
            .map_err(to_runtime_error)?;

        let fake_term = critic
            .forward(fake, step, alpha)
            .and_then(|scores| scores.mean_all())
            .map_err(to_runtime_error)?;

        let interpolated = interpolate(real, fake, rng)?;
        let (_, grad) = input_gradient(critic, &interpolated, step, alpha)?;
        let penalty = grad_norm(&grad)?
            .affine(1.0, -1.0)
            .and_then(|dev| dev.sqr())
            .and_then(|sq| sq.mean_all())
            .and_then(|mean| mean.affine(WGAN_PENALTY_WEIGHT, 0.0))
            .map_err(to_runtime_error)?;

        Ok(DiscriminatorTerms {
            real: real_term,
            fake: fake_term,
            penalty,
        })
    }

    fn generator_loss(&self, fake_scores: &Tensor) -> Result<Tensor, TrainingError> {
        fake_scores
            .mean_all()
            .and_then(|mean| mean.neg())
            .map_err(to_runtime_error)
    }
}

/// Non-saturating logistic loss with R1 penalty on real samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct R1;

impl LossFamily for R1 {
    fn discriminator_terms<D: Discriminator + ?Sized>(
        &self,
        critic: &D,
        real: &Tensor,
        fake: &Tensor,
        step: usize,
        alpha: f64,
        _rng: &mut StdRng,
    ) -> Result<DiscriminatorTerms, TrainingError> {
        let real_input = Var::from_tensor(&real.detach()).map_err(to_runtime_error)?;
        let (real_scores, grad) = input_gradient(critic, &real_input, step, alpha)?;

        let real_term = real_scores
            .neg()
            .and_then(|neg| softplus(&neg))
            .and_then(|sp| sp.mean_all())
            .map_err(to_runtime_error)?;
        let fake_term = critic
            .forward(fake, step, alpha)
            .and_then(|scores| softplus(&scores))
            .and_then(|sp| sp.mean_all())
            .map_err(to_runtime_error)?;

        let penalty = grad
            .flatten_from(1)
            .and_then(|flat| flat.sqr())
            .and_then(|sq| sq.sum(1))
            .and_then(|norms| norms.mean_all())
            .and_then(|mean| mean.affine(R1_PENALTY_WEIGHT, 0.0))
            .map_err(to_runtime_error)?;

        Ok(DiscriminatorTerms {
            real: real_term,
            fake: fake_term,
            penalty,
        })
    }

    fn generator_loss(&self, fake_scores: &Tensor) -> Result<Tensor, TrainingError> {
        fake_scores
            .neg()
            .and_then(|neg| softplus(&neg))
            .and_then(|sp| sp.mean_all())
            .map_err(to_runtime_error)
    }
}

/// Loss family chosen at configuration time.
#[derive(Debug, Clone, Copy)]
pub enum AdversarialObjective {
    WganGp(WganGp),
    R1(R1),
}

impl AdversarialObjective {
    pub fn kind(&self) -> LossKind {
        match self {
            AdversarialObjective::WganGp(_) => LossKind::WganGp,
            AdversarialObjective::R1(_) => LossKind::R1,
        }
    }
}

impl From<LossKind> for AdversarialObjective {
    fn from(kind: LossKind) -> Self {
        match kind {
            LossKind::WganGp => AdversarialObjective::WganGp(WganGp),
            LossKind::R1 => AdversarialObjective::R1(R1),
        }
    }
}

impl LossFamily for AdversarialObjective {
    fn discriminator_terms<D: Discriminator + ?Sized>(
        &self,
        critic: &D,
        real: &Tensor,
        fake: &Tensor,
        step: usize,
        alpha: f64,
        rng: &mut StdRng,
    ) -> Result<DiscriminatorTerms, TrainingError> {
        match self {
            AdversarialObjective::WganGp(loss) => {
                loss.discriminator_terms(critic, real, fake, step, alpha, rng)
            }
            AdversarialObjective::R1(loss) => {
                loss.discriminator_terms(critic, real, fake, step, alpha, rng)
            }
        }
    }

    fn generator_loss(&self, fake_scores: &Tensor) -> Result<Tensor, TrainingError> {
        match self {
            AdversarialObjective::WganGp(loss) => loss.generator_loss(fake_scores),
            AdversarialObjective::R1(loss) => loss.generator_loss(fake_scores),
        }
    }
}

/// `log(1 + exp(x))` without overflow for large `x`.
pub fn softplus(xs: &Tensor) -> candle_core::Result<Tensor> {
    let tail = xs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    xs.relu()? + tail
}

/// `eps * real + (1 - eps) * fake` with one `eps ~ U[0, 1)` per sample.
fn interpolate(real: &Tensor, fake: &Tensor, rng: &mut StdRng) -> Result<Var, TrainingError> {
    let batch = real.dim(0).map_err(to_runtime_error)?;
    let weights: Vec<f32> = (0..batch).map(|_| rng.gen::<f32>()).collect();
    let mut shape = vec![1usize; real.rank()];
    shape[0] = batch;
    let eps = Tensor::from_vec(weights, shape, real.device()).map_err(to_runtime_error)?;
    let complement = eps.affine(-1.0, 1.0).map_err(to_runtime_error)?;

    let mixed = real
        .detach()
        .broadcast_mul(&eps)
        .and_then(|lhs| {
            fake.detach()
                .broadcast_mul(&complement)
                .and_then(|rhs| lhs + rhs)
        })
        .map_err(to_runtime_error)?;
    Var::from_tensor(&mixed).map_err(to_runtime_error)
}

/// Scores `input` and differentiates their sum with respect to it, keeping
/// the gradient graph so penalties on it reach the critic parameters.
pub fn input_gradient<D: Discriminator + ?Sized>(
    critic: &D,
    input: &Var,
    step: usize,
    alpha: f64,
) -> Result<(Tensor, Tensor), TrainingError> {
    let scores = critic
        .forward(input.as_tensor(), step, alpha)
        .map_err(to_runtime_error)?;
    let grads = scores
        .sum_all()
        .and_then(|total| total.backward())
        .map_err(to_runtime_error)?;
    let grad = grads
        .get(input.as_tensor())
        .cloned()
        .ok_or_else(|| TrainingError::runtime("critic score does not depend on its input"))?;
    if !grad.track_op() {
        return Err(TrainingError::runtime(
            "input gradient was detached from the graph; call \
             enable_higher_order_gradients before the first backward pass",
        ));
    }
    Ok((scores, grad))
}

fn grad_norm(grad: &Tensor) -> Result<Tensor, TrainingError> {
    grad.flatten_from(1)
        .and_then(|flat| flat.sqr())
        .and_then(|sq| sq.sum(1))
        .and_then(|sum| sum.affine(1.0, NORM_EPS))
        .and_then(|sum| sum.sqrt())
        .map_err(to_runtime_error)
}

pub(crate) fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .to_dtype(candle_core::DType::F64)
        .and_then(|t| t.to_scalar::<f64>())
        .map_err(to_runtime_error)
}
