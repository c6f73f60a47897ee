//! Frozen snapshot of the previous task's best model.

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::checkpoint::CheckpointRecord;
use crate::error::ShapeMismatchError;
use crate::model::{LoadMode, Segmentor, SegmentorConfig, SegmentorOutput};
use crate::tensor::FeatureMap;

/// Inference-only model used as the distillation teacher.
///
/// Built once per task and never mutated; exposes no `&mut self` methods and
/// never hands out its parameters.
#[derive(Debug, Clone)]
pub struct HistoryModel {
    model: Segmentor,
    source_task: usize,
    source_epoch: usize,
}

impl HistoryModel {
    /// Build a model for `classes_per_task` and strictly load `record` into it.
    pub fn load(
        record: &CheckpointRecord,
        config: &SegmentorConfig,
        classes_per_task: &[usize],
    ) -> Result<Self, ShapeMismatchError> {
        // Every parameter is overwritten by the strict load, so the seed is irrelevant.
        let mut model =
            Segmentor::new(config.clone(), classes_per_task, &mut StdRng::seed_from_u64(0));
        model.load_state_dict(&record.model_parameters, LoadMode::Strict)?;
        tracing::debug!(
            task_id = record.task_id,
            epoch = record.epoch,
            num_classes = model.num_classes(),
            "History model loaded"
        );
        Ok(Self {
            model,
            source_task: record.task_id,
            source_epoch: record.epoch,
        })
    }

    pub fn infer(&self, input: &FeatureMap) -> SegmentorOutput {
        self.model.infer(input)
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    pub fn source_task(&self) -> usize {
        self.source_task
    }

    pub fn source_epoch(&self) -> usize {
        self.source_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{OptimizerState, SchedulerState};
    use chrono::Utc;

    fn config() -> SegmentorConfig {
        SegmentorConfig {
            in_channels: 2,
            feature_channels: 4,
            num_blocks: 1,
            ..SegmentorConfig::default()
        }
    }

    fn record_of(model: &Segmentor) -> CheckpointRecord {
        CheckpointRecord {
            task_id: 0,
            epoch: 4,
            best_score: 0.5,
            iterations_per_epoch: 2,
            model_parameters: model.state_dict(),
            optimizer_state: OptimizerState::default(),
            scheduler_state: SchedulerState {
                cur_iter: 8,
                cur_epoch: 4,
                max_iters: 8,
                max_epochs: 4,
                iters_per_epoch: 2,
            },
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_history_reproduces_source_model() {
        let source = Segmentor::new(config(), &[3], &mut StdRng::seed_from_u64(8));
        let history = HistoryModel::load(&record_of(&source), &config(), &[3]).unwrap();
        let input = FeatureMap::from_elem((1, 2, 2, 2), 0.3);
        assert_eq!(history.infer(&input), source.infer(&input));
        assert_eq!(history.num_classes(), 3);
        assert_eq!(history.source_epoch(), 4);
    }

    #[test]
    fn test_history_rejects_more_classes_than_checkpoint() {
        let source = Segmentor::new(config(), &[3], &mut StdRng::seed_from_u64(8));
        let err = HistoryModel::load(&record_of(&source), &config(), &[3, 2]).unwrap_err();
        assert!(matches!(err, ShapeMismatchError::MissingParameter { .. }));
    }
}
