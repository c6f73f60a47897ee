//! Confusion-matrix evaluation.

use ndarray::{Array2, ArrayView, Dimension, Zip};
use serde::{Deserialize, Serialize};

use crate::distributed::ProcessGroup;
use crate::error::{ConfigError, CssegError, DistributedError, ShapeMismatchError, TrainingError};

/// Metric names accepted as the best-model criterion.
pub const METRIC_NAMES: [&str; 3] = ["mean_iou", "pixel_accuracy", "mean_accuracy"];

/// Accumulates a `C × C` confusion matrix, rows = target, columns = prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationEvaluator {
    num_classes: usize,
    ignore_index: u16,
    confusion: Array2<u64>,
}

impl SegmentationEvaluator {
    pub fn new(num_classes: usize, ignore_index: u16) -> Self {
        Self {
            num_classes,
            ignore_index,
            confusion: Array2::zeros((num_classes, num_classes)),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn confusion(&self) -> &Array2<u64> {
        &self.confusion
    }

    pub fn reset(&mut self) {
        self.confusion.fill(0);
    }

    /// Accumulate one batch. Pixels whose target is the ignore value are skipped.
    pub fn update<D: Dimension>(
        &mut self,
        targets: ArrayView<'_, u16, D>,
        predictions: ArrayView<'_, u16, D>,
    ) -> Result<(), CssegError> {
        if targets.shape() != predictions.shape() {
            return Err(ShapeMismatchError::Labels {
                targets: targets.shape().to_vec(),
                predictions: predictions.shape().to_vec(),
            }
            .into());
        }
        // Validate first so a bad batch leaves the matrix untouched.
        for (&t, &p) in targets.iter().zip(predictions.iter()) {
            if t == self.ignore_index {
                continue;
            }
            for label in [t, p] {
                if usize::from(label) >= self.num_classes {
                    return Err(TrainingError::InvalidLabel {
                        label,
                        num_classes: self.num_classes,
                    }
                    .into());
                }
            }
        }
        let ignore = self.ignore_index;
        let confusion = &mut self.confusion;
        Zip::from(&targets).and(&predictions).for_each(|&t, &p| {
            if t != ignore {
                confusion[[usize::from(t), usize::from(p)]] += 1;
            }
        });
        Ok(())
    }

    /// Element-wise sum with another evaluator's counts.
    pub fn merge(&mut self, other: &SegmentationEvaluator) -> Result<(), ShapeMismatchError> {
        if other.num_classes != self.num_classes {
            return Err(ShapeMismatchError::ClassCount {
                expected: self.num_classes,
                found: other.num_classes,
            });
        }
        self.confusion += &other.confusion;
        Ok(())
    }

    /// Replace local counts with the sum over all ranks.
    pub fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<(), DistributedError> {
        if group.world_size() <= 1 {
            return Ok(());
        }
        let mut flat: Vec<u64> = self.confusion.iter().copied().collect();
        group.allreduce_sum_u64(&mut flat)?;
        for (dst, src) in self.confusion.iter_mut().zip(flat) {
            *dst = src;
        }
        Ok(())
    }

    pub fn evaluate(&self) -> EvaluationResults {
        let c = self.num_classes;
        let total: u64 = self.confusion.sum();
        let correct: u64 = (0..c).map(|i| self.confusion[[i, i]]).sum();

        let mut per_class_iou = Vec::with_capacity(c);
        let mut per_class_accuracy = Vec::with_capacity(c);
        for i in 0..c {
            let tp = self.confusion[[i, i]];
            let row: u64 = self.confusion.row(i).sum();
            let col: u64 = self.confusion.column(i).sum();
            let union = row + col - tp;
            per_class_iou.push((union > 0).then(|| tp as f64 / union as f64));
            per_class_accuracy.push((row > 0).then(|| tp as f64 / row as f64));
        }

        EvaluationResults {
            mean_iou: mean(&per_class_iou),
            pixel_accuracy: if total > 0 { correct as f64 / total as f64 } else { 0.0 },
            mean_accuracy: mean(&per_class_accuracy),
            per_class_iou,
            total_pixels: total,
        }
    }
}

fn mean(values: &[Option<f64>]) -> f64 {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    }
}

/// Metrics derived from a confusion matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    /// `None` for classes with no support (TP + FP + FN = 0).
    pub per_class_iou: Vec<Option<f64>>,
    pub mean_iou: f64,
    pub pixel_accuracy: f64,
    pub mean_accuracy: f64,
    pub total_pixels: u64,
}

impl EvaluationResults {
    /// Look up a scalar metric by name.
    pub fn metric(&self, name: &str) -> Result<f64, ConfigError> {
        match name {
            "mean_iou" => Ok(self.mean_iou),
            "pixel_accuracy" => Ok(self.pixel_accuracy),
            "mean_accuracy" => Ok(self.mean_accuracy),
            other => Err(ConfigError::Invalid {
                message: format!("unknown metric '{other}', expected one of {METRIC_NAMES:?}"),
            }),
        }
    }
}
