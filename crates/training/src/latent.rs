use candle_core::{Device, Tensor};
use model::LatentInput;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::config::{to_runtime_error, TrainingError};

/// Seeded source of generator latent codes, with optional style mixing.
#[derive(Debug)]
pub struct LatentSampler {
    code_size: usize,
    mixing_prob: Option<f64>,
    device: Device,
    rng: StdRng,
}

impl LatentSampler {
    /// `mixing_prob` of `None` disables style mixing.
    pub fn new(
        code_size: usize,
        mixing_prob: Option<f64>,
        device: Device,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if code_size == 0 {
            return Err(TrainingError::initialization(
                "latent code size must be greater than zero",
            ));
        }
        if let Some(prob) = mixing_prob {
            if !(0.0..=1.0).contains(&prob) {
                return Err(TrainingError::initialization(format!(
                    "style mixing probability must be in [0, 1] (got {prob})"
                )));
            }
        }
        Ok(Self {
            code_size,
            mixing_prob,
            device,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn mixing_enabled(&self) -> bool {
        self.mixing_prob.is_some()
    }

    /// One `[batch, code_size]` block of standard-normal codes.
    pub fn codes(&mut self, batch: usize) -> Result<Tensor, TrainingError> {
        let values: Vec<f32> = (0..batch * self.code_size)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_vec(values, (batch, self.code_size), &self.device).map_err(to_runtime_error)
    }

    /// Fresh latent input for a forward pass at `step`. Each call makes its
    /// own mixing draw.
    pub fn sample(&mut self, batch: usize, step: usize) -> Result<LatentInput, TrainingError> {
        let mix = match self.mixing_prob {
            Some(prob) => self.rng.gen_bool(prob),
            None => false,
        };

        if !mix {
            return Ok(LatentInput::Single(self.codes(batch)?));
        }

        let primary = self.codes(batch)?;
        let secondary = self.codes(batch)?;
        let crossover = self.rng.gen_range(1..=step.max(1));
        Ok(LatentInput::Mixed {
            primary,
            secondary,
            crossover,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixing_disabled_yields_single_codes() {
        let mut sampler = LatentSampler::new(4, None, Device::Cpu, 1).unwrap();
        for _ in 0..8 {
            let latent = sampler.sample(3, 2).unwrap();
            assert!(!latent.is_mixed());
            assert_eq!(latent.batch_size().unwrap(), 3);
        }
    }

    #[test]
    fn certain_mixing_routes_two_codes() {
        let mut sampler = LatentSampler::new(4, Some(1.0), Device::Cpu, 1).unwrap();
        for _ in 0..8 {
            match sampler.sample(2, 3).unwrap() {
                LatentInput::Mixed { crossover, .. } => assert!((1..=3).contains(&crossover)),
                LatentInput::Single(_) => panic!("expected mixed latent"),
            }
        }
    }

    #[test]
    fn consecutive_draws_are_independent() {
        let mut sampler = LatentSampler::new(6, None, Device::Cpu, 7).unwrap();
        let first = sampler.codes(2).unwrap();
        let second = sampler.codes(2).unwrap();
        let diff = (first - second)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff > 0.0);
    }
}
