use std::collections::HashMap;

use model::Generator;

use crate::config::{to_runtime_error, TrainingError};

pub const DEFAULT_DECAY: f64 = 0.999;

/// Exponential moving average of a generator's parameters, held in a second
/// generator instance that never receives gradients.
pub struct ParameterAverager<G: Generator> {
    shadow: G,
}

impl<G: Generator> ParameterAverager<G> {
    /// Takes ownership of `shadow` and overwrites it with an exact copy of `source`.
    pub fn new(shadow: G, source: &G) -> Result<Self, TrainingError> {
        let averager = Self { shadow };
        averager.accumulate(source, 0.0)?;
        Ok(averager)
    }

    /// `shadow = decay * shadow + (1 - decay) * source`, parameter by name.
    pub fn accumulate(&self, source: &G, decay: f64) -> Result<(), TrainingError> {
        if !(0.0..=1.0).contains(&decay) {
            return Err(TrainingError::runtime(format!(
                "averaging decay must be in [0, 1] (got {decay})"
            )));
        }

        let source_params: HashMap<String, _> = source
            .parameter_groups()
            .map_err(to_runtime_error)?
            .all()
            .into_iter()
            .collect();
        let shadow_params = self
            .shadow
            .parameter_groups()
            .map_err(to_runtime_error)?
            .all();
        if shadow_params.len() != source_params.len() {
            return Err(TrainingError::runtime(format!(
                "shadow generator has {} parameters, source has {}",
                shadow_params.len(),
                source_params.len()
            )));
        }

        for (name, shadow_var) in shadow_params {
            let source_var = source_params.get(&name).ok_or_else(|| {
                TrainingError::runtime(format!("source generator has no parameter '{name}'"))
            })?;
            let source_value = source_var.as_tensor().detach();
            let next = if decay == 0.0 {
                source_value.copy().map_err(to_runtime_error)?
            } else {
                let kept = shadow_var
                    .as_tensor()
                    .detach()
                    .affine(decay, 0.0)
                    .map_err(to_runtime_error)?;
                let fresh = source_value
                    .affine(1.0 - decay, 0.0)
                    .map_err(to_runtime_error)?;
                (kept + fresh).map_err(to_runtime_error)?
            };
            shadow_var.set(&next).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    pub fn shadow(&self) -> &G {
        &self.shadow
    }

    pub fn into_inner(self) -> G {
        self.shadow
    }
}
