//! # csseg core
//!
//! Continual semantic segmentation training core.
//! Provides the per-task training state machine, the stochastic dual-path
//! block, checkpoint storage with resume, the frozen history model used for
//! distillation, confusion-matrix evaluation, and the process-group layer for
//! data-parallel runs.

pub mod block;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod evaluator;
pub mod history;
pub mod loss;
pub mod model;
pub mod optim;
pub mod persistence;
pub mod runner;
pub mod sequence;
pub mod task;
pub mod tensor;

// Re-export commonly used types at the crate root.
pub use block::{
    Block, BlockKind, BranchWeight, MergeStrategy, StochasticDualPathBlock, TriModalMerge,
};
pub use checkpoint::{CheckpointRecord, CheckpointStore, Pointer};
pub use config::{RunnerConfig, load_config};
pub use data::{DatasetFactory, Mode, SegmentationDataset, ShardedLoader, SyntheticDatasetFactory};
pub use distributed::{
    Backend, DistributedCoordinator, DistributedModel, ParallelConfig, ProcessGroup,
    SingleProcessGroup, TcpProcessGroup, ThreadGroup,
};
pub use error::{
    CheckpointError, ConfigError, CssegError, DistributedError, Result, ShapeMismatchError,
    TrainingError,
};
pub use evaluator::{EvaluationResults, SegmentationEvaluator};
pub use history::HistoryModel;
pub use model::{LoadMode, Segmentor, SegmentorConfig};
pub use runner::{RunnerPhase, TaskRunner, TaskSummary, TrainingState};
pub use sequence::TaskSequenceController;
pub use task::{Task, TaskSplit};
