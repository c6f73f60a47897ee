//! SGD with momentum and the polynomial learning-rate schedule.

use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ShapeMismatchError};
use crate::tensor::{Gradients, ParamTensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    pub momentum: f32,
    pub nesterov: bool,
    pub weight_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            nesterov: true,
            weight_decay: 1e-4,
        }
    }
}

/// Serializable optimizer state: one momentum buffer per parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerState {
    pub step_count: u64,
    pub momentum_buffers: BTreeMap<String, ParamTensor>,
}

/// Stochastic gradient descent.
///
/// Weight decay is added to the gradient, the momentum buffer starts as the
/// first gradient, and Nesterov uses `g + momentum * buf` as the update.
#[derive(Debug, Clone)]
pub struct Sgd {
    config: OptimizerConfig,
    velocity: BTreeMap<String, ArrayD<f32>>,
    step_count: u64,
}

impl Sgd {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            velocity: BTreeMap::new(),
            step_count: 0,
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Update `params` in place. Parameters without a gradient are left alone.
    pub fn step<'a, I>(
        &mut self,
        params: I,
        grads: &Gradients,
        lr: f32,
    ) -> Result<(), ShapeMismatchError>
    where
        I: IntoIterator<Item = (String, ArrayViewMutD<'a, f32>)>,
    {
        let OptimizerConfig {
            momentum,
            nesterov,
            weight_decay,
        } = self.config;

        for (name, mut param) in params {
            let Some(grad) = grads.get(&name) else {
                continue;
            };
            if grad.shape() != param.shape() {
                return Err(ShapeMismatchError::Parameter {
                    name,
                    expected: param.shape().to_vec(),
                    found: grad.shape().to_vec(),
                });
            }

            let mut update = grad.clone();
            if weight_decay != 0.0 {
                update.scaled_add(weight_decay, &param);
            }
            if momentum != 0.0 {
                let buf = self
                    .velocity
                    .entry(name.clone())
                    .or_insert_with(|| ArrayD::zeros(update.raw_dim()));
                if buf.shape() != update.shape() {
                    *buf = ArrayD::zeros(update.raw_dim());
                }
                Zip::from(&mut *buf)
                    .and(&update)
                    .for_each(|b, &u| *b = momentum * *b + u);
                if nesterov {
                    update.scaled_add(momentum, &*buf);
                } else {
                    update.assign(&*buf);
                }
            }
            param.scaled_add(-lr, &update);
        }
        self.step_count += 1;
        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step_count: self.step_count,
            momentum_buffers: self
                .velocity
                .iter()
                .map(|(name, buf)| (name.clone(), ParamTensor::from_array(buf)))
                .collect(),
        }
    }

    pub fn load(&mut self, state: &OptimizerState) -> Result<(), ShapeMismatchError> {
        let mut velocity = BTreeMap::new();
        for (name, tensor) in &state.momentum_buffers {
            let buf = tensor.to_array().map_err(|_| ShapeMismatchError::Parameter {
                name: name.clone(),
                expected: tensor.shape.clone(),
                found: vec![tensor.numel()],
            })?;
            velocity.insert(name.clone(), buf);
        }
        self.velocity = velocity;
        self.step_count = state.step_count;
        Ok(())
    }
}

/// Per-task learning-rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub max_epochs: usize,
    pub learning_rate: f32,
    pub min_learning_rate: f32,
    pub power: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 30,
            learning_rate: 0.01,
            min_learning_rate: 0.0,
            power: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerState {
    pub cur_iter: usize,
    pub cur_epoch: usize,
    pub max_iters: usize,
    pub max_epochs: usize,
    pub iters_per_epoch: usize,
}

/// `lr = (base - min) * (1 - iter / max_iters)^power + min`.
#[derive(Debug, Clone)]
pub struct PolyScheduler {
    config: SchedulerConfig,
    iters_per_epoch: usize,
    cur_iter: usize,
    cur_epoch: usize,
}

impl PolyScheduler {
    pub fn new(config: SchedulerConfig, iters_per_epoch: usize) -> Self {
        Self {
            config,
            iters_per_epoch,
            cur_iter: 0,
            cur_epoch: 0,
        }
    }

    pub fn max_epochs(&self) -> usize {
        self.config.max_epochs
    }

    pub fn max_iters(&self) -> usize {
        self.config.max_epochs * self.iters_per_epoch
    }

    pub fn iters_per_epoch(&self) -> usize {
        self.iters_per_epoch
    }

    pub fn cur_iter(&self) -> usize {
        self.cur_iter
    }

    pub fn cur_epoch(&self) -> usize {
        self.cur_epoch
    }

    pub fn lr(&self) -> f32 {
        let SchedulerConfig {
            learning_rate,
            min_learning_rate,
            power,
            ..
        } = self.config;
        let max_iters = self.max_iters().max(1);
        let progress = self.cur_iter.min(max_iters) as f32 / max_iters as f32;
        (learning_rate - min_learning_rate) * (1.0 - progress).powf(power) + min_learning_rate
    }

    pub fn step(&mut self) {
        self.cur_iter += 1;
    }

    pub fn finish_epoch(&mut self) {
        self.cur_epoch += 1;
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            cur_iter: self.cur_iter,
            cur_epoch: self.cur_epoch,
            max_iters: self.max_iters(),
            max_epochs: self.config.max_epochs,
            iters_per_epoch: self.iters_per_epoch,
        }
    }

    /// Restore counters. The schedule itself must match the current setup.
    pub fn load(&mut self, state: &SchedulerState) -> Result<(), ConfigError> {
        if state.iters_per_epoch != self.iters_per_epoch {
            return Err(ConfigError::Invalid {
                message: format!(
                    "checkpoint was trained with {} iterations per epoch, current loader yields {}",
                    state.iters_per_epoch, self.iters_per_epoch
                ),
            });
        }
        if state.max_epochs != self.config.max_epochs {
            return Err(ConfigError::Invalid {
                message: format!(
                    "checkpoint schedule has {} epochs, configuration has {}",
                    state.max_epochs, self.config.max_epochs
                ),
            });
        }
        self.cur_iter = state.cur_iter;
        self.cur_epoch = state.cur_epoch;
        Ok(())
    }
}
