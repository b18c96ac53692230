use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};

use crate::config::{self, to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone)]
pub enum OptimizerConfig {
    Adam(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        match value.algorithm {
            config::OptimizerType::Adam | config::OptimizerType::AdamW => {
                Ok(OptimizerConfig::Adam(AdamConfig {
                    learning_rate: value.learning_rate,
                    beta1: value.beta1,
                    beta2: value.beta2,
                    epsilon: value.epsilon,
                    weight_decay: value.weight_decay,
                }))
            }
            other => Err(TrainingError::initialization(format!(
                "unsupported optimizer algorithm {:?}",
                other
            ))),
        }
    }
}

/// Parameters sharing one learning-rate multiplier.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    pub name: String,
    pub lr_mult: f64,
    pub parameters: Vec<(String, Var)>,
}

impl ParameterGroup {
    pub fn new(name: impl Into<String>, lr_mult: f64, parameters: Vec<(String, Var)>) -> Self {
        Self {
            name: name.into(),
            lr_mult,
            parameters,
        }
    }
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    groups: Vec<GroupSlot>,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct GroupSlot {
    name: String,
    lr_mult: f64,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    group: usize,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        groups: Vec<ParameterGroup>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        let total: usize = groups.iter().map(|group| group.parameters.len()).sum();
        if total == 0 {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut group_slots = Vec::with_capacity(groups.len());
        let mut params = Vec::with_capacity(total);
        for (group_idx, group) in groups.into_iter().enumerate() {
            if group.lr_mult <= 0.0 {
                return Err(TrainingError::initialization(format!(
                    "parameter group '{}' needs a positive learning-rate multiplier",
                    group.name
                )));
            }
            for (name, var) in group.parameters {
                let tensor = var.as_tensor();
                if tensor.dtype() != DType::F32 {
                    return Err(TrainingError::initialization(format!(
                        "optimizer expects f32 parameters ('{}' is {:?})",
                        name,
                        tensor.dtype()
                    )));
                }
                let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
                let second_moment = tensor.zeros_like().map_err(to_runtime_error)?;
                params.push(ParameterSlot {
                    name,
                    group: group_idx,
                    param: var,
                    first_moment,
                    second_moment,
                });
            }
            group_slots.push(GroupSlot {
                name: group.name,
                lr_mult: group.lr_mult,
            });
        }

        Ok(Self {
            config,
            groups: group_slots,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Adam(cfg) => cfg.learning_rate,
        }
    }

    /// Sets the base rate; each group trains at `lr * lr_mult`.
    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Adam(cfg) => cfg.learning_rate = lr,
        }
    }

    pub fn group_learning_rates(&self) -> Vec<(String, f64)> {
        let base = self.learning_rate();
        self.groups
            .iter()
            .map(|group| (group.name.clone(), base * group.lr_mult))
            .collect()
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    /// Applies one update from the gradients of this optimizer's parameters,
    /// consuming them from `grads`. Gradients of other networks are left in place.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad
                .detach()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            processed.push((idx, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Adam(cfg) => self.step_adam(cfg, processed),
        }
    }

    fn step_adam(
        &mut self,
        cfg: AdamConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (idx, grad) in processed {
            let lr = cfg.learning_rate * self.groups[self.params[idx].group].lr_mult;
            let slot = &mut self.params[idx];

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + grad_sq.affine(1.0 - cfg.beta2, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(lr, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot.param.as_tensor().detach();
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - lr * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any gradients this optimizer would have consumed.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            learning_rate: self.learning_rate(),
            groups: self
                .groups
                .iter()
                .map(|group| (group.name.clone(), group.lr_mult))
                .collect(),
            moments: self
                .params
                .iter()
                .map(|slot| ParameterMoments {
                    name: slot.name.clone(),
                    first_moment: slot.first_moment.clone(),
                    second_moment: slot.second_moment.clone(),
                })
                .collect(),
        }
    }
}

/// Full optimizer state, flattenable to named tensors for checkpointing.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub groups: Vec<(String, f64)>,
    pub moments: Vec<ParameterMoments>,
}

#[derive(Debug, Clone)]
pub struct ParameterMoments {
    pub name: String,
    pub first_moment: Tensor,
    pub second_moment: Tensor,
}

const STEP_KEY: &str = "step";
const LR_KEY: &str = "learning_rate";
const GROUP_PREFIX: &str = "group_lr_mult/";
const FIRST_MOMENT_SUFFIX: &str = "/exp_avg";
const SECOND_MOMENT_SUFFIX: &str = "/exp_avg_sq";

impl OptimizerState {
    pub fn to_tensors(&self, device: &Device) -> Result<HashMap<String, Tensor>, TrainingError> {
        let mut tensors = HashMap::with_capacity(self.moments.len() * 2 + self.groups.len() + 2);
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step as u32], device).map_err(to_runtime_error)?,
        );
        tensors.insert(
            LR_KEY.to_string(),
            Tensor::new(&[self.learning_rate], device).map_err(to_runtime_error)?,
        );
        for (name, mult) in &self.groups {
            tensors.insert(
                format!("{GROUP_PREFIX}{name}"),
                Tensor::new(&[*mult], device).map_err(to_runtime_error)?,
            );
        }
        for moments in &self.moments {
            tensors.insert(
                format!("{}{FIRST_MOMENT_SUFFIX}", moments.name),
                moments.first_moment.clone(),
            );
            tensors.insert(
                format!("{}{SECOND_MOMENT_SUFFIX}", moments.name),
                moments.second_moment.clone(),
            );
        }
        Ok(tensors)
    }

    pub fn from_tensors(mut tensors: HashMap<String, Tensor>) -> Result<Self, TrainingError> {
        let step = take_scalar(&mut tensors, STEP_KEY)?
            .to_vec1::<u32>()
            .map_err(to_runtime_error)?
            .first()
            .copied()
            .ok_or_else(|| TrainingError::runtime("optimizer record has an empty step"))?
            as usize;
        let learning_rate = first_f64(&take_scalar(&mut tensors, LR_KEY)?)?;

        let group_names: Vec<String> = tensors
            .keys()
            .filter(|key| key.starts_with(GROUP_PREFIX))
            .cloned()
            .collect();
        let mut groups = Vec::with_capacity(group_names.len());
        for key in group_names {
            let tensor = take_scalar(&mut tensors, &key)?;
            groups.push((key[GROUP_PREFIX.len()..].to_string(), first_f64(&tensor)?));
        }
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        let mut names: Vec<String> = tensors
            .keys()
            .filter_map(|key| key.strip_suffix(FIRST_MOMENT_SUFFIX))
            .map(str::to_string)
            .collect();
        names.sort();

        let mut moments = Vec::with_capacity(names.len());
        for name in names {
            let first_moment = take_scalar(&mut tensors, &format!("{name}{FIRST_MOMENT_SUFFIX}"))?;
            let second_moment =
                take_scalar(&mut tensors, &format!("{name}{SECOND_MOMENT_SUFFIX}"))?;
            moments.push(ParameterMoments {
                name,
                first_moment,
                second_moment,
            });
        }

        if !tensors.is_empty() {
            let mut extra: Vec<String> = tensors.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer record contains unexpected entries: {}",
                extra.join(", ")
            )));
        }

        Ok(Self {
            step,
            learning_rate,
            groups,
            moments,
        })
    }
}

fn take_scalar(tensors: &mut HashMap<String, Tensor>, key: &str) -> Result<Tensor, TrainingError> {
    tensors
        .remove(key)
        .ok_or_else(|| TrainingError::runtime(format!("optimizer record missing '{key}'")))
}

fn first_f64(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .to_dtype(DType::F64)
        .map_err(to_runtime_error)?
        .to_vec1::<f64>()
        .map_err(to_runtime_error)?
        .first()
        .copied()
        .ok_or_else(|| TrainingError::runtime("optimizer record holds an empty scalar"))
}

/// Accumulates the gradients of several independently backpropagated losses
/// for the given parameters into one store.
pub fn accumulate_gradients(
    losses: &[&Tensor],
    parameters: &[Tensor],
) -> Result<GradStore, TrainingError> {
    let mut accumulated: Option<GradStore> = None;
    for loss in losses {
        let grads = loss.backward().map_err(to_runtime_error)?;
        match accumulated.as_mut() {
            Some(existing) => merge_gradient_store(existing, grads, parameters)?,
            None => accumulated = Some(grads),
        }
    }
    accumulated.ok_or_else(|| TrainingError::runtime("no losses to backpropagate"))
}

fn merge_gradient_store(
    accum: &mut GradStore,
    mut new_grads: GradStore,
    parameters: &[Tensor],
) -> Result<(), TrainingError> {
    for tensor in parameters {
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = if let Some(existing) = accum.remove(tensor) {
                existing.add(&grad).map_err(to_runtime_error)?
            } else {
                grad
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}
