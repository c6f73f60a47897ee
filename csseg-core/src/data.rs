//! Dataset contract, a deterministic synthetic dataset, and the sharded
//! loader every rank iterates.

use std::sync::Arc;

use ndarray::{Array2, Array3, Axis, stack};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result, TrainingError};
use crate::task::TaskSplit;
use crate::tensor::{FeatureMap, LabelMap, normal_matrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Train,
    Test,
}

/// One image `[channels, height, width]` and its label map `[height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Array3<f32>,
    pub label: Array2<u16>,
}

/// A collated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: FeatureMap,
    pub labels: LabelMap,
}

pub trait SegmentationDataset: Send + Sync {
    fn mode(&self) -> Mode;

    /// Total classes over the whole task sequence.
    fn num_classes(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample>;

    /// Class counts of tasks `0..=task_id` under the named split.
    fn num_classes_per_task(&self, task_name: &str, task_id: usize) -> Result<Vec<usize>>;
}

/// Builds the dataset a task trains or evaluates on.
pub trait DatasetFactory: Send + Sync {
    fn build(&self, mode: Mode, task_id: usize) -> Result<Arc<dyn SegmentationDataset>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticDatasetConfig {
    pub train_size: usize,
    pub test_size: usize,
    pub image_size: [usize; 2],
    pub channels: usize,
    /// Standard deviation of per-pixel noise around the class prototype.
    pub noise: f32,
    pub seed: u64,
}

impl Default for SyntheticDatasetConfig {
    fn default() -> Self {
        Self {
            train_size: 32,
            test_size: 16,
            image_size: [8, 8],
            channels: 3,
            noise: 0.1,
            seed: 7,
        }
    }
}

/// Images made of class-coloured rectangles on background.
///
/// Each class has a prototype colour; pixels are the prototype plus Gaussian
/// noise. In `Train` mode labels outside the task's new classes become
/// background 0. In `Test` mode labels of classes not yet known become the
/// ignore index.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    mode: Mode,
    split: TaskSplit,
    task_id: usize,
    config: SyntheticDatasetConfig,
    prototypes: Array2<f32>,
    ignore_index: u16,
}

impl SyntheticDataset {
    pub fn new(
        mode: Mode,
        split: TaskSplit,
        task_id: usize,
        config: SyntheticDatasetConfig,
        ignore_index: u16,
    ) -> Result<Self> {
        if task_id >= split.num_tasks() {
            return Err(ConfigError::Invalid {
                message: format!("task {task_id} is out of range for split '{}'", split.name()),
            }
            .into());
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let prototypes = normal_matrix(split.num_classes(), config.channels, 1.0, &mut rng);
        Ok(Self {
            mode,
            split,
            task_id,
            config,
            prototypes,
            ignore_index,
        })
    }

    fn sample_seed(&self, index: usize) -> u64 {
        let salt = match self.mode {
            Mode::Train => 0x9e37_79b9,
            Mode::Test => 0x85eb_ca6b,
        };
        self.config
            .seed
            .wrapping_mul(1_000_003)
            .wrapping_add(salt)
            .wrapping_add(index as u64)
    }

    /// Raw label map before the mode-specific remapping.
    fn raw_labels(&self, rng: &mut StdRng) -> Array2<u16> {
        let [height, width] = self.config.image_size;
        let mut labels = Array2::<u16>::zeros((height, width));
        let num_classes = self.split.num_classes() as u16;

        let new_classes: Vec<u16> = self
            .split
            .new_classes(self.task_id)
            .map(|c| c.iter().copied().filter(|&c| c != 0).collect())
            .unwrap_or_default();
        let first = match self.mode {
            Mode::Train if !new_classes.is_empty() => {
                new_classes[rng.gen_range(0..new_classes.len())]
            }
            _ => rng.gen_range(1..num_classes.max(2)),
        };
        let second = rng.gen_range(1..num_classes.max(2));

        for class in [first, second] {
            let h = rng.gen_range(1..=height.div_ceil(2).max(1));
            let w = rng.gen_range(1..=width.div_ceil(2).max(1));
            let top = rng.gen_range(0..=height - h);
            let left = rng.gen_range(0..=width - w);
            labels
                .slice_mut(ndarray::s![top..top + h, left..left + w])
                .fill(class.min(num_classes - 1));
        }
        labels
    }

    fn remap(&self, raw: u16) -> u16 {
        match self.mode {
            Mode::Train => {
                let new = self.split.new_classes(self.task_id).unwrap_or_default();
                if new.contains(&raw) { raw } else { 0 }
            }
            Mode::Test => {
                let known = self.split.known_classes(self.task_id).unwrap_or(0);
                if usize::from(raw) < known { raw } else { self.ignore_index }
            }
        }
    }
}

impl SegmentationDataset for SyntheticDataset {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn num_classes(&self) -> usize {
        self.split.num_classes()
    }

    fn len(&self) -> usize {
        match self.mode {
            Mode::Train => self.config.train_size,
            Mode::Test => self.config.test_size,
        }
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len() {
            return Err(TrainingError::Data {
                message: format!("index {index} out of range for dataset of {}", self.len()),
            }
            .into());
        }
        let mut rng = StdRng::seed_from_u64(self.sample_seed(index));
        let raw = self.raw_labels(&mut rng);
        let [height, width] = self.config.image_size;
        let noise = self.config.noise;
        let image = Array3::from_shape_fn((self.config.channels, height, width), |(c, y, x)| {
            let z: f32 = rng.sample(StandardNormal);
            self.prototypes[[usize::from(raw[[y, x]]), c]] + noise * z
        });
        let label = raw.mapv(|l| self.remap(l));
        Ok(Sample { image, label })
    }

    fn num_classes_per_task(&self, task_name: &str, task_id: usize) -> Result<Vec<usize>> {
        if task_name != self.split.name() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "dataset is built for split '{}', not '{task_name}'",
                    self.split.name()
                ),
            }
            .into());
        }
        Ok(self.split.classes_per_task(task_id)?)
    }
}

/// Builds [`SyntheticDataset`]s for a fixed split.
#[derive(Debug, Clone)]
pub struct SyntheticDatasetFactory {
    split: TaskSplit,
    config: SyntheticDatasetConfig,
    ignore_index: u16,
}

impl SyntheticDatasetFactory {
    pub fn new(split: TaskSplit, config: SyntheticDatasetConfig, ignore_index: u16) -> Self {
        Self {
            split,
            config,
            ignore_index,
        }
    }
}

impl DatasetFactory for SyntheticDatasetFactory {
    fn build(&self, mode: Mode, task_id: usize) -> Result<Arc<dyn SegmentationDataset>> {
        let dataset = SyntheticDataset::new(
            mode,
            self.split.clone(),
            task_id,
            self.config.clone(),
            self.ignore_index,
        )?;
        Ok(Arc::new(dataset))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            shuffle: true,
            drop_last: false,
        }
    }
}

/// Iterates one rank's shard of a dataset.
///
/// Indices are padded by wrapping to a multiple of the world size, then rank
/// `r` takes every `world_size`-th index starting at `r`. Shuffling is seeded
/// by `seed + epoch`, so every rank agrees on the permutation.
pub struct ShardedLoader {
    dataset: Arc<dyn SegmentationDataset>,
    config: LoaderConfig,
    rank: usize,
    world_size: usize,
    seed: u64,
    epoch: u64,
}

impl ShardedLoader {
    pub fn new(
        dataset: Arc<dyn SegmentationDataset>,
        config: LoaderConfig,
        rank: usize,
        world_size: usize,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            config,
            rank,
            world_size: world_size.max(1),
            seed,
            epoch: 0,
        }
    }

    pub fn dataset(&self) -> &Arc<dyn SegmentationDataset> {
        &self.dataset
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Samples this rank sees per epoch.
    pub fn num_samples(&self) -> usize {
        self.dataset.len().div_ceil(self.world_size)
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        let batch = self.config.batch_size.max(1);
        if self.config.drop_last {
            self.num_samples() / batch
        } else {
            self.num_samples().div_ceil(batch)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This rank's sample indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        let n = self.dataset.len();
        if n == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..n).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        let total = self.num_samples() * self.world_size;
        (0..total)
            .map(|i| order[i % n])
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    pub fn batches(&self) -> impl Iterator<Item = Result<Batch>> + '_ {
        let indices = self.indices();
        let batch = self.config.batch_size.max(1);
        let num_batches = self.len();
        let chunks: Vec<Vec<usize>> = indices
            .chunks(batch)
            .take(num_batches)
            .map(<[usize]>::to_vec)
            .collect();
        chunks.into_iter().map(move |chunk| self.collate(&chunk))
    }

    fn collate(&self, indices: &[usize]) -> Result<Batch> {
        let samples = indices
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Result<Vec<_>>>()?;
        let images: Vec<_> = samples.iter().map(|s| s.image.view()).collect();
        let labels: Vec<_> = samples.iter().map(|s| s.label.view()).collect();
        let data_error = |e: ndarray::ShapeError| TrainingError::Data {
            message: format!("cannot collate samples of different sizes: {e}"),
        };
        Ok(Batch {
            images: stack(Axis(0), &images).map_err(data_error)?,
            labels: stack(Axis(0), &labels).map_err(data_error)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn split() -> TaskSplit {
        TaskSplit::new("3-2", vec![vec![0, 1, 2], vec![3, 4]]).unwrap()
    }

    fn dataset(mode: Mode, task_id: usize) -> SyntheticDataset {
        SyntheticDataset::new(
            mode,
            split(),
            task_id,
            SyntheticDatasetConfig::default(),
            255,
        )
        .unwrap()
    }

    #[test]
    fn test_samples_are_deterministic() {
        let ds = dataset(Mode::Train, 0);
        assert_eq!(ds.get(3).unwrap(), ds.get(3).unwrap());
        assert_ne!(ds.get(3).unwrap(), ds.get(4).unwrap());
        assert_eq!(ds.get(0).unwrap().image.dim(), (3, 8, 8));
    }

    #[test]
    fn test_train_labels_limited_to_new_classes() {
        let ds = dataset(Mode::Train, 1);
        for i in 0..ds.len() {
            let sample = ds.get(i).unwrap();
            assert!(sample.label.iter().all(|&l| l == 0 || l == 3 || l == 4));
        }
    }

    #[test]
    fn test_test_labels_mask_unknown_classes() {
        let ds = dataset(Mode::Test, 0);
        let seen: BTreeSet<u16> = (0..ds.len())
            .flat_map(|i| ds.get(i).unwrap().label.iter().copied().collect::<Vec<_>>())
            .collect();
        assert!(seen.iter().all(|&l| l < 3 || l == 255));
    }

    #[test]
    fn test_out_of_range_index() {
        let ds = dataset(Mode::Test, 0);
        assert!(ds.get(ds.len()).is_err());
    }

    #[test]
    fn test_num_classes_per_task() {
        let ds = dataset(Mode::Train, 1);
        assert_eq!(ds.num_classes(), 5);
        assert_eq!(ds.num_classes_per_task("3-2", 1).unwrap(), vec![3, 2]);
        assert!(ds.num_classes_per_task("15-5", 1).is_err());
    }

    #[test]
    fn test_shards_partition_padded_dataset() {
        let ds: Arc<dyn SegmentationDataset> = Arc::new(dataset(Mode::Test, 0));
        let config = LoaderConfig {
            batch_size: 3,
            shuffle: true,
            drop_last: false,
        };
        let world = 3;
        let mut all = Vec::new();
        for rank in 0..world {
            let mut loader = ShardedLoader::new(ds.clone(), config.clone(), rank, world, 11);
            loader.set_epoch(2);
            let indices = loader.indices();
            assert_eq!(indices.len(), loader.num_samples());
            all.extend(indices);
        }
        // 16 samples padded to 18
        assert_eq!(all.len(), 18);
        let unique: BTreeSet<usize> = all.into_iter().collect();
        assert_eq!(unique.len(), 16);
    }

    #[test]
    fn test_shuffle_depends_on_epoch() {
        let ds: Arc<dyn SegmentationDataset> = Arc::new(dataset(Mode::Train, 0));
        let mut loader = ShardedLoader::new(ds, LoaderConfig::default(), 0, 1, 5);
        let first = loader.indices();
        assert_eq!(first, loader.indices());
        loader.set_epoch(1);
        assert_ne!(first, loader.indices());
    }

    #[test]
    fn test_batches_collate() {
        let ds: Arc<dyn SegmentationDataset> = Arc::new(dataset(Mode::Train, 0));
        let loader = ShardedLoader::new(ds, LoaderConfig::default(), 1, 2, 0);
        let batches: Vec<Batch> = loader.batches().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), loader.len());
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].images.dim(), (4, 3, 8, 8));
        assert_eq!(batches[0].labels.dim(), (4, 8, 8));
    }
}
