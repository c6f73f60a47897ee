//! Configuration for a continual-segmentation run.
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. The configuration file (`.toml`, or `.json` by extension)
//! 3. Environment variables (`CSSEG_` prefix, `__` for nesting, e.g.
//!    `CSSEG_SEGMENTOR__NUM_BLOCKS=4`)

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::data::{LoaderConfig, SyntheticDatasetConfig};
use crate::distributed::{Backend, ParallelConfig};
use crate::error::ConfigError;
use crate::evaluator::METRIC_NAMES;
use crate::loss::LossesConfig;
use crate::model::SegmentorConfig;
use crate::optim::{OptimizerConfig, SchedulerConfig};
use crate::task::TaskSplit;

/// Top-level run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub algorithm: String,
    /// Name of the task split, e.g. `15-5s`.
    pub task_name: String,
    pub num_tasks: usize,
    pub num_total_classes: usize,
    pub work_dir: PathBuf,
    /// JSON log file written by the leader. Defaults to `<work_dir>/train.log`.
    pub logfilepath: Option<PathBuf>,
    pub save_interval_epochs: usize,
    pub eval_interval_epochs: usize,
    pub log_interval_iterations: usize,
    pub choose_best_segmentor_by_metric: String,
    pub random_seed: u64,
    pub ignore_index: u16,
    pub dataset: DatasetConfig,
    pub dataloader: DataloaderConfig,
    pub segmentor: SegmentorConfig,
    pub losses: LossesConfig,
    pub optimizer: OptimizerConfig,
    /// One schedule per task, indexed by task id.
    pub schedulers: Vec<SchedulerConfig>,
    pub parallel: ParallelConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            algorithm: "RCIL".into(),
            task_name: "15-5".into(),
            num_tasks: 2,
            num_total_classes: 21,
            work_dir: PathBuf::from("work_dirs/csseg"),
            logfilepath: None,
            save_interval_epochs: 10,
            eval_interval_epochs: 10,
            log_interval_iterations: 10,
            choose_best_segmentor_by_metric: "mean_iou".into(),
            random_seed: 42,
            ignore_index: 255,
            dataset: DatasetConfig::default(),
            dataloader: DataloaderConfig::default(),
            segmentor: SegmentorConfig::default(),
            losses: LossesConfig::default(),
            optimizer: OptimizerConfig::default(),
            schedulers: vec![SchedulerConfig::default(); 2],
            parallel: ParallelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub kind: DatasetKind,
    /// Explicit per-task label sets; when absent `task_name` must be a built-in split.
    pub tasks: Option<Vec<Vec<u16>>>,
    pub synthetic: SyntheticDatasetConfig,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            kind: DatasetKind::Synthetic,
            tasks: None,
            synthetic: SyntheticDatasetConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataloaderConfig {
    pub train: LoaderConfig,
    pub test: LoaderConfig,
}

impl Default for DataloaderConfig {
    fn default() -> Self {
        Self {
            train: LoaderConfig::default(),
            test: LoaderConfig {
                shuffle: false,
                ..LoaderConfig::default()
            },
        }
    }
}

impl RunnerConfig {
    /// Resolve the task split named by `task_name`.
    pub fn task_split(&self) -> Result<TaskSplit, ConfigError> {
        match &self.dataset.tasks {
            Some(tasks) => TaskSplit::new(self.task_name.clone(), tasks.clone()),
            None => TaskSplit::builtin(&self.task_name).ok_or_else(|| ConfigError::Invalid {
                message: format!(
                    "unknown task split '{}' and no dataset.tasks given",
                    self.task_name
                ),
            }),
        }
    }

    /// Schedule for `task_id`.
    pub fn scheduler(&self, task_id: usize) -> Result<&SchedulerConfig, ConfigError> {
        self.schedulers.get(task_id).ok_or_else(|| ConfigError::MissingField {
            field: format!("schedulers[{task_id}]"),
        })
    }

    pub fn log_file(&self) -> PathBuf {
        self.logfilepath
            .clone()
            .unwrap_or_else(|| self.work_dir.join("train.log"))
    }

    /// Consistency checks that do not need a dataset.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        let split = self.task_split()?;
        if split.num_tasks() != self.num_tasks {
            return invalid(format!(
                "num_tasks is {} but split '{}' has {} tasks",
                self.num_tasks,
                split.name(),
                split.num_tasks()
            ));
        }
        if split.num_classes() != self.num_total_classes {
            return invalid(format!(
                "num_total_classes is {} but split '{}' covers {} classes",
                self.num_total_classes,
                split.name(),
                split.num_classes()
            ));
        }
        if usize::from(self.ignore_index) < self.num_total_classes {
            return invalid(format!(
                "ignore_index {} collides with a class label",
                self.ignore_index
            ));
        }
        for task_id in 0..self.num_tasks {
            if self.scheduler(task_id)?.max_epochs == 0 {
                return invalid(format!("schedulers[{task_id}].max_epochs must be positive"));
            }
        }
        for (name, value) in [
            ("save_interval_epochs", self.save_interval_epochs),
            ("eval_interval_epochs", self.eval_interval_epochs),
            ("log_interval_iterations", self.log_interval_iterations),
            ("dataloader.train.batch_size", self.dataloader.train.batch_size),
            ("dataloader.test.batch_size", self.dataloader.test.batch_size),
            ("dataset.synthetic.image_size[0]", self.dataset.synthetic.image_size[0]),
            ("dataset.synthetic.image_size[1]", self.dataset.synthetic.image_size[1]),
            ("dataset.synthetic.channels", self.dataset.synthetic.channels),
            ("parallel.max_frame_bytes", self.parallel.max_frame_bytes),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }
        if !METRIC_NAMES.contains(&self.choose_best_segmentor_by_metric.as_str()) {
            return invalid(format!(
                "choose_best_segmentor_by_metric '{}' is not one of {METRIC_NAMES:?}",
                self.choose_best_segmentor_by_metric
            ));
        }
        if self.segmentor.in_channels != self.dataset.synthetic.channels {
            return invalid(format!(
                "segmentor.in_channels is {} but the dataset has {} channels",
                self.segmentor.in_channels, self.dataset.synthetic.channels
            ));
        }
        if self.parallel.backend == Backend::Tcp
            && !self.parallel.init_method.starts_with("tcp://")
        {
            return invalid(format!(
                "parallel.init_method '{}' must look like tcp://host:port",
                self.parallel.init_method
            ));
        }
        Ok(())
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<RunnerConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut figment = Figment::from(Serialized::defaults(RunnerConfig::default()));
    figment = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    };
    figment = figment.merge(Env::prefixed("CSSEG_").split("__"));

    let config: RunnerConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
