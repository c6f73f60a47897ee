//! Property-based tests for core components using proptest.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use chrono::{TimeZone, Utc};
use ndarray::Array1;
use proptest::prelude::*;

use csseg_core::checkpoint::{CheckpointRecord, CheckpointStore};
use csseg_core::data::{LoaderConfig, Mode, ShardedLoader, SyntheticDataset, SyntheticDatasetConfig};
use csseg_core::distributed::ThreadGroup;
use csseg_core::evaluator::SegmentationEvaluator;
use csseg_core::optim::{OptimizerState, SchedulerState};
use csseg_core::task::TaskSplit;
use csseg_core::tensor::{ParamTensor, StateDict};

const CLASSES: usize = 4;
const IGNORE: u16 = 255;

fn label() -> impl Strategy<Value = u16> {
    prop_oneof![9 => 0u16..CLASSES as u16, 1 => Just(IGNORE)]
}

// --- Evaluator properties ---

const RANKS: usize = 3;

/// One evaluator over every sample, and one per rank over the samples assigned to it.
fn partition(
    samples: &[(u16, u16, usize)],
) -> (SegmentationEvaluator, Vec<SegmentationEvaluator>) {
    let targets = Array1::from_iter(samples.iter().map(|&(t, _, _)| t));
    let preds = Array1::from_iter(samples.iter().map(|&(_, p, _)| p));
    let mut whole = SegmentationEvaluator::new(CLASSES, IGNORE);
    whole.update(targets.view(), preds.view()).unwrap();

    let parts = (0..RANKS)
        .map(|rank| {
            let mine = samples.iter().filter(|&&(_, _, r)| r == rank);
            let targets = Array1::from_iter(mine.clone().map(|&(t, _, _)| t));
            let preds = Array1::from_iter(mine.map(|&(_, p, _)| p));
            let mut part = SegmentationEvaluator::new(CLASSES, IGNORE);
            part.update(targets.view(), preds.view()).unwrap();
            part
        })
        .collect();
    (whole, parts)
}

fn assigned_sample() -> impl Strategy<Value = (u16, u16, usize)> {
    (label(), 0u16..CLASSES as u16, 0..RANKS)
}

proptest! {
    #[test]
    fn evaluator_merge_ignores_sample_grouping(
        samples in prop::collection::vec(assigned_sample(), 1..200),
    ) {
        let (whole, parts) = partition(&samples);
        let mut merged = SegmentationEvaluator::new(CLASSES, IGNORE);
        for part in parts.iter().rev() {
            merged.merge(part).unwrap();
        }
        prop_assert_eq!(merged.confusion(), whole.confusion());
        prop_assert_eq!(merged.evaluate(), whole.evaluate());
    }

    #[test]
    fn evaluator_metrics_are_bounded(
        pairs in prop::collection::vec((label(), 0u16..CLASSES as u16), 0..100),
    ) {
        let targets = Array1::from_iter(pairs.iter().map(|&(t, _)| t));
        let preds = Array1::from_iter(pairs.iter().map(|&(_, p)| p));
        let mut eval = SegmentationEvaluator::new(CLASSES, IGNORE);
        eval.update(targets.view(), preds.view()).unwrap();
        let results = eval.evaluate();
        for value in [results.mean_iou, results.pixel_accuracy, results.mean_accuracy] {
            prop_assert!((0.0..=1.0).contains(&value));
        }
        let counted = pairs.iter().filter(|&&(t, _)| t != IGNORE).count() as u64;
        prop_assert_eq!(results.total_pixels, counted);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn evaluator_synchronize_ignores_sample_grouping(
        samples in prop::collection::vec(assigned_sample(), 0..120),
    ) {
        let (whole, parts) = partition(&samples);
        let handles: Vec<_> = ThreadGroup::new_group(RANKS)
            .into_iter()
            .zip(parts)
            .map(|(group, mut part)| {
                thread::spawn(move || {
                    part.synchronize(&group).unwrap();
                    part
                })
            })
            .collect();
        let synced: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for part in &synced {
            prop_assert_eq!(part.confusion(), whole.confusion());
            prop_assert_eq!(part.evaluate(), whole.evaluate());
        }
    }
}

// --- Checkpoint properties ---

fn param_tensor() -> impl Strategy<Value = ParamTensor> {
    (1usize..4, 1usize..4).prop_flat_map(|(rows, cols)| {
        prop::collection::vec(-1.0e3f32..1.0e3f32, rows * cols).prop_map(move |data| ParamTensor {
            shape: vec![rows, cols],
            data,
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn checkpoint_roundtrip_preserves_record(
        task_id in 0usize..5,
        epoch in 1usize..50,
        best_score in 0.0f64..1.0,
        params in prop::collection::btree_map("[a-z]{1,8}\\.weight", param_tensor(), 1..5),
        momentum in prop::collection::btree_map("[a-z]{1,8}\\.weight", param_tensor(), 0..3),
        step_count in 0u64..10_000,
        seconds in 0i64..2_000_000_000,
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let record = CheckpointRecord {
            task_id,
            epoch,
            best_score,
            iterations_per_epoch: 7,
            model_parameters: params.into_iter().collect::<StateDict>(),
            optimizer_state: OptimizerState {
                step_count,
                momentum_buffers: momentum,
            },
            scheduler_state: SchedulerState {
                cur_iter: 7 * epoch,
                cur_epoch: epoch,
                max_iters: 7 * 50,
                max_epochs: 50,
                iters_per_epoch: 7,
            },
            saved_at: Utc.timestamp_opt(seconds, 0).unwrap(),
        };
        let path = store.save(&record).unwrap();
        prop_assert_eq!(store.load(&path).unwrap(), record);
    }
}

// --- Task split properties ---

proptest! {
    #[test]
    fn known_classes_accumulate(sizes in prop::collection::vec(1usize..5, 1..6)) {
        let mut next = 0u16;
        let tasks: Vec<Vec<u16>> = sizes
            .iter()
            .map(|&n| {
                let labels = (next..next + n as u16).collect();
                next += n as u16;
                labels
            })
            .collect();
        let split = TaskSplit::new("generated", tasks).unwrap();
        prop_assert_eq!(split.num_classes(), sizes.iter().sum::<usize>());
        for t in 1..split.num_tasks() {
            prop_assert_eq!(
                split.known_classes(t).unwrap(),
                split.known_classes(t - 1).unwrap() + sizes[t]
            );
            prop_assert_eq!(split.classes_per_task(t).unwrap(), sizes[..=t].to_vec());
        }
    }
}

// --- Sharded loader properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn shards_cover_dataset_with_equal_sizes(
        train_size in 1usize..20,
        world_size in 1usize..5,
        epoch in 0u64..4,
        shuffle in any::<bool>(),
    ) {
        let split = TaskSplit::new("2-1", vec![vec![0, 1], vec![2]]).unwrap();
        let config = SyntheticDatasetConfig {
            train_size,
            ..SyntheticDatasetConfig::default()
        };
        let dataset =
            Arc::new(SyntheticDataset::new(Mode::Train, split, 0, config, IGNORE).unwrap());
        let loader_config = LoaderConfig {
            batch_size: 3,
            shuffle,
            drop_last: false,
        };

        let mut covered = BTreeSet::new();
        for rank in 0..world_size {
            let mut loader =
                ShardedLoader::new(dataset.clone(), loader_config.clone(), rank, world_size, 42);
            loader.set_epoch(epoch);
            let indices = loader.indices();
            prop_assert_eq!(indices.len(), train_size.div_ceil(world_size));
            covered.extend(indices);
        }
        prop_assert_eq!(covered, (0..train_size).collect::<BTreeSet<_>>());
    }
}
