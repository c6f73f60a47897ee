//! Training objectives.
//!
//! Each [`Criterion`] contributes a scalar and its gradients w.r.t. the
//! model's logits and/or distillation features. [`CompositeLoss`] sums them.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShapeMismatchError, TrainingError};
use crate::tensor::{FeatureMap, LabelMap};

/// Everything a criterion may look at for one batch.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    pub logits: &'a FeatureMap,
    pub targets: &'a LabelMap,
    pub distillation: &'a [FeatureMap],
    /// Frozen history features; `None` on the first task.
    pub history_distillation: Option<&'a [FeatureMap]>,
}

/// One criterion's value and gradients.
#[derive(Debug, Clone)]
pub struct LossTerm {
    pub value: f32,
    pub grad_logits: Option<FeatureMap>,
    pub grad_distillation: Option<Vec<FeatureMap>>,
}

pub trait Criterion: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// `Ok(None)` when the criterion does not apply to this batch.
    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Option<LossTerm>>;
}

/// Cross-entropy over classes, averaged over pixels whose target is not `ignore_index`.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    pub scale_factor: f32,
    pub ignore_index: u16,
}

impl Criterion for CrossEntropyLoss {
    fn name(&self) -> &str {
        "loss_seg"
    }

    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Option<LossTerm>> {
        let logits = inputs.logits;
        let targets = inputs.targets;
        let (batch, classes, height, width) = logits.dim();
        if targets.dim() != (batch, height, width) {
            return Err(ShapeMismatchError::Labels {
                targets: targets.shape().to_vec(),
                predictions: vec![batch, height, width],
            }
            .into());
        }

        let mut grad = FeatureMap::zeros(logits.raw_dim());
        let mut total = 0.0f64;
        let mut valid = 0usize;
        let mut probs = vec![0.0f32; classes];
        for ((b, y, x), &target) in targets.indexed_iter() {
            if target == self.ignore_index {
                continue;
            }
            let t = usize::from(target);
            if t >= classes {
                return Err(TrainingError::InvalidLabel {
                    label: target,
                    num_classes: classes,
                }
                .into());
            }
            let max = (0..classes)
                .map(|c| logits[[b, c, y, x]])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0f32;
            for (c, p) in probs.iter_mut().enumerate() {
                *p = (logits[[b, c, y, x]] - max).exp();
                denom += *p;
            }
            total += f64::from(denom.ln() - (logits[[b, t, y, x]] - max));
            for (c, p) in probs.iter().enumerate() {
                grad[[b, c, y, x]] = p / denom;
            }
            grad[[b, t, y, x]] -= 1.0;
            valid += 1;
        }

        if valid == 0 {
            return Ok(Some(LossTerm {
                value: 0.0,
                grad_logits: Some(grad),
                grad_distillation: None,
            }));
        }
        let norm = self.scale_factor / valid as f32;
        grad.mapv_inplace(|g| g * norm);
        Ok(Some(LossTerm {
            value: (total / valid as f64) as f32 * self.scale_factor,
            grad_logits: Some(grad),
            grad_distillation: None,
        }))
    }
}

/// Mean squared error between current and frozen distillation features,
/// summed over blocks.
#[derive(Debug, Clone)]
pub struct FeatureDistillationLoss {
    pub scale_factor: f32,
}

impl Criterion for FeatureDistillationLoss {
    fn name(&self) -> &str {
        "loss_distillation"
    }

    fn compute(&self, inputs: &LossInputs<'_>) -> Result<Option<LossTerm>> {
        let Some(history) = inputs.history_distillation else {
            return Ok(None);
        };
        if history.len() != inputs.distillation.len() {
            return Err(ShapeMismatchError::ClassCount {
                expected: inputs.distillation.len(),
                found: history.len(),
            }
            .into());
        }

        let mut value = 0.0f32;
        let mut grads = Vec::with_capacity(history.len());
        for (current, frozen) in inputs.distillation.iter().zip(history) {
            if current.dim() != frozen.dim() {
                return Err(ShapeMismatchError::Labels {
                    targets: frozen.shape().to_vec(),
                    predictions: current.shape().to_vec(),
                }
                .into());
            }
            let n = current.len().max(1) as f32;
            let diff = current - frozen;
            value += self.scale_factor * diff.mapv(|d| d * d).sum() / n;
            let scale = 2.0 * self.scale_factor / n;
            grads.push(diff.mapv(|d| d * scale));
        }
        Ok(Some(LossTerm {
            value,
            grad_logits: None,
            grad_distillation: Some(grads),
        }))
    }
}

/// Sum of criteria with per-term bookkeeping for logging.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub total: f32,
    pub terms: BTreeMap<String, f32>,
    pub grad_logits: FeatureMap,
    pub grad_distillation: Option<Vec<FeatureMap>>,
}

#[derive(Debug, Default)]
pub struct CompositeLoss {
    criteria: Vec<Box<dyn Criterion>>,
}

impl CompositeLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, criterion: impl Criterion + 'static) -> Self {
        self.criteria.push(Box::new(criterion));
        self
    }

    pub fn from_config(config: &LossesConfig, ignore_index: u16) -> Self {
        Self::new()
            .with(CrossEntropyLoss {
                scale_factor: config.segmentation.scale_factor,
                ignore_index,
            })
            .with(FeatureDistillationLoss {
                scale_factor: config.distillation.scale_factor,
            })
    }

    pub fn compute(&self, inputs: &LossInputs<'_>) -> Result<LossOutput> {
        let mut output = LossOutput {
            total: 0.0,
            terms: BTreeMap::new(),
            grad_logits: FeatureMap::zeros(inputs.logits.raw_dim()),
            grad_distillation: None,
        };
        for criterion in &self.criteria {
            let Some(term) = criterion.compute(inputs)? else {
                continue;
            };
            output.total += term.value;
            output.terms.insert(criterion.name().to_string(), term.value);
            if let Some(grad) = term.grad_logits {
                output.grad_logits += &grad;
            }
            if let Some(grads) = term.grad_distillation {
                match output.grad_distillation.as_mut() {
                    Some(acc) => {
                        for (a, g) in acc.iter_mut().zip(&grads) {
                            Zip::from(a).and(g).for_each(|a, &g| *a += g);
                        }
                    }
                    None => output.grad_distillation = Some(grads),
                }
            }
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScaleConfig {
    pub scale_factor: f32,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self { scale_factor: 1.0 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LossesConfig {
    pub segmentation: ScaleConfig,
    pub distillation: ScaleConfig,
}
