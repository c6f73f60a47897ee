//! One task of the continual sequence, as a state machine.
//!
//! ```text
//! INIT -> RESUMING? -> { TRAIN_EPOCH -> CHECKPOINT? -> EVALUATE? -> barrier }* -> DONE
//! ```
//!
//! Every rank runs the same machine in lockstep. Only the leader writes
//! checkpoints, pointers and results; the end-of-epoch barrier keeps the other
//! ranks from racing ahead of those writes.

use std::fmt;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointRecord, CheckpointStore, Pointer};
use crate::config::RunnerConfig;
use crate::data::{DatasetFactory, Mode, SegmentationDataset, ShardedLoader};
use crate::distributed::{DistributedCoordinator, DistributedModel};
use crate::error::{CheckpointError, ConfigError, Result, TrainingError};
use crate::evaluator::{EvaluationResults, SegmentationEvaluator};
use crate::history::HistoryModel;
use crate::loss::{CompositeLoss, LossInputs};
use crate::model::{LoadMode, Segmentor};
use crate::optim::{PolyScheduler, Sgd};
use crate::task::{Task, TaskSplit};
use crate::tensor::{argmax_channels, resize_bilinear};

/// Observable state of a [`TaskRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerPhase {
    Init,
    Resuming,
    TrainEpoch,
    Checkpoint,
    Evaluate,
    Done,
}

impl fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerPhase::Init => "init",
            RunnerPhase::Resuming => "resuming",
            RunnerPhase::TrainEpoch => "train_epoch",
            RunnerPhase::Checkpoint => "checkpoint",
            RunnerPhase::Evaluate => "evaluate",
            RunnerPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Progress counters owned by one runner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch; 0 before the first one.
    pub epoch: usize,
    pub best_score: f64,
    pub iteration: usize,
}

/// What a finished task reports back to the sequence controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: usize,
    pub known_classes: usize,
    /// Epochs trained by this invocation, excluding those restored on resume.
    pub epochs_run: usize,
    pub best_score: f64,
    /// Checkpoint files written by this rank.
    pub checkpoints_written: usize,
    pub best_promotions: usize,
    pub last_results: Option<EvaluationResults>,
    /// Epoch of the in-task checkpoint training resumed from.
    pub resumed_from: Option<usize>,
}

pub struct TaskRunner {
    config: RunnerConfig,
    task: Task,
    coordinator: DistributedCoordinator,
    store: CheckpointStore,
    model: DistributedModel,
    history: Option<HistoryModel>,
    optimizer: Sgd,
    scheduler: PolyScheduler,
    criterion: CompositeLoss,
    train_loader: ShardedLoader,
    test_loader: ShardedLoader,
    rng: StdRng,
    phase: RunnerPhase,
    state: TrainingState,
    resumed_from: Option<usize>,
}

impl TaskRunner {
    /// Run INIT and, when there is state to restore, RESUMING.
    pub fn new(
        config: &RunnerConfig,
        task_id: usize,
        coordinator: DistributedCoordinator,
        factory: &dyn DatasetFactory,
    ) -> Result<Self> {
        let split = config.task_split()?;
        let task = split.task(task_id)?;
        let classes_per_task = split.classes_per_task(task_id)?;
        let scheduler_config = config.scheduler(task_id)?.clone();

        let train_dataset = factory.build(Mode::Train, task_id)?;
        let test_dataset = factory.build(Mode::Test, task_id)?;
        for dataset in [&train_dataset, &test_dataset] {
            check_dataset(&**dataset, config, &split, task_id, &classes_per_task)?;
        }

        let rank = coordinator.rank();
        let world_size = coordinator.world_size();
        let train_loader = ShardedLoader::new(
            train_dataset,
            config.dataloader.train.clone(),
            rank,
            world_size,
            config.random_seed,
        );
        let test_loader = ShardedLoader::new(
            test_dataset,
            config.dataloader.test.clone(),
            rank,
            world_size,
            config.random_seed,
        );
        let iters_per_epoch = train_loader.len();
        if iters_per_epoch == 0 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "task {task_id}: training loader yields no batches on rank {rank}"
                ),
            }
            .into());
        }

        // Same seed on every rank so all replicas start from identical weights.
        let mut init_rng = StdRng::seed_from_u64(config.random_seed.wrapping_add(task_id as u64));
        let model = Segmentor::new(config.segmentor.clone(), &classes_per_task, &mut init_rng);

        let mut runner = Self {
            config: config.clone(),
            task,
            store: CheckpointStore::new(&config.work_dir),
            model: coordinator.wrap_for_gradient_sync(model),
            coordinator,
            history: None,
            optimizer: Sgd::new(config.optimizer.clone()),
            scheduler: PolyScheduler::new(scheduler_config, iters_per_epoch),
            criterion: CompositeLoss::from_config(&config.losses, config.ignore_index),
            train_loader,
            test_loader,
            rng: StdRng::seed_from_u64(config.random_seed.wrapping_add(1 + rank as u64)),
            phase: RunnerPhase::Init,
            state: TrainingState {
                epoch: 0,
                best_score: 0.0,
                iteration: 0,
            },
            resumed_from: None,
        };
        if runner.is_leader() {
            info!(
                task_id,
                known_classes = runner.task.known_classes,
                new_classes = ?runner.task.new_classes,
                iters_per_epoch,
                max_epochs = runner.scheduler.max_epochs(),
                "Task initialized"
            );
        }
        runner.resume(&split)?;
        Ok(runner)
    }

    fn resume(&mut self, split: &TaskSplit) -> Result<()> {
        let task_id = self.task.id;
        let latest = self.store.load_pointer(task_id, Pointer::Latest)?;

        if task_id > 0 {
            self.phase = RunnerPhase::Resuming;
            let previous = task_id - 1;
            let record = self
                .store
                .load_pointer(previous, Pointer::Best)?
                .ok_or_else(|| CheckpointError::Missing {
                    path: self.store.pointer_path(previous, Pointer::Best),
                })?;
            if latest.is_none() {
                let report = self
                    .model
                    .module_mut()
                    .load_state_dict(&record.model_parameters, LoadMode::Partial)?;
                if self.is_leader() {
                    info!(
                        task_id,
                        source_task = previous,
                        source_epoch = record.epoch,
                        loaded = report.loaded.len(),
                        fresh = ?report.missing,
                        "Initialized from previous task"
                    );
                }
            }
            let classes_per_task = split.classes_per_task(previous)?;
            let history = HistoryModel::load(&record, &self.config.segmentor, &classes_per_task)?;
            self.history = Some(history);
        }

        if let Some(record) = latest {
            self.phase = RunnerPhase::Resuming;
            self.restore(&record)?;
        }
        Ok(())
    }

    /// Strict restore of an in-task checkpoint.
    fn restore(&mut self, record: &CheckpointRecord) -> Result<()> {
        let task_id = self.task.id;
        if record.task_id != task_id {
            return Err(CheckpointError::Malformed {
                path: self.store.pointer_path(task_id, Pointer::Latest),
                message: format!("latest checkpoint belongs to task {}", record.task_id),
            }
            .into());
        }
        if record.iterations_per_epoch != self.scheduler.iters_per_epoch() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "checkpoint was trained with {} iterations per epoch, current loader yields {}",
                    record.iterations_per_epoch,
                    self.scheduler.iters_per_epoch()
                ),
            }
            .into());
        }
        self.model
            .module_mut()
            .load_state_dict(&record.model_parameters, LoadMode::Strict)?;
        self.optimizer.load(&record.optimizer_state)?;
        self.scheduler.load(&record.scheduler_state)?;

        let mut best_score = record.best_score;
        if let Some(results) = self.store.load_results(task_id)? {
            let saved = results.metric(&self.config.choose_best_segmentor_by_metric)?;
            best_score = best_score.max(saved);
        }
        self.state = TrainingState {
            epoch: record.epoch,
            best_score,
            iteration: self.scheduler.cur_iter(),
        };
        self.resumed_from = Some(record.epoch);
        if self.is_leader() {
            info!(
                task_id,
                epoch = record.epoch,
                iteration = self.state.iteration,
                best_score,
                "Resumed from checkpoint"
            );
        }
        Ok(())
    }

    pub fn phase(&self) -> RunnerPhase {
        self.phase
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn training_state(&self) -> TrainingState {
        self.state
    }

    pub fn model(&self) -> &Segmentor {
        self.model.module()
    }

    pub fn history(&self) -> Option<&HistoryModel> {
        self.history.as_ref()
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &PolyScheduler {
        &self.scheduler
    }

    /// Gradient synchronizations performed by this runner's model.
    pub fn sync_count(&self) -> usize {
        self.model.sync_count()
    }

    fn is_leader(&self) -> bool {
        self.coordinator.is_leader()
    }

    /// Train the remaining epochs of the task.
    pub fn start(&mut self) -> Result<TaskSummary> {
        let task_id = self.task.id;
        let max_epochs = self.scheduler.max_epochs();
        let mut summary = TaskSummary {
            task_id,
            known_classes: self.task.known_classes,
            epochs_run: 0,
            best_score: self.state.best_score,
            checkpoints_written: 0,
            best_promotions: 0,
            last_results: None,
            resumed_from: self.resumed_from,
        };

        for epoch in self.state.epoch + 1..=max_epochs {
            let is_final = epoch == max_epochs;

            self.phase = RunnerPhase::TrainEpoch;
            self.train_epoch(epoch)?;
            summary.epochs_run += 1;

            // Files left by an earlier, abandoned run of this epoch never count.
            let mut saved_this_epoch = false;
            if epoch % self.config.save_interval_epochs == 0 || is_final {
                self.phase = RunnerPhase::Checkpoint;
                if self.is_leader() {
                    self.save_checkpoint(epoch)?;
                    self.store.repoint(task_id, Pointer::Latest, epoch)?;
                    summary.checkpoints_written += 1;
                    saved_this_epoch = true;
                }
            }

            if epoch % self.config.eval_interval_epochs == 0 || is_final {
                self.phase = RunnerPhase::Evaluate;
                let results = self.evaluate()?;
                let score = results.metric(&self.config.choose_best_segmentor_by_metric)?;
                if self.is_leader() {
                    info!(
                        task_id,
                        epoch,
                        mean_iou = results.mean_iou,
                        pixel_accuracy = results.pixel_accuracy,
                        score,
                        best_score = self.state.best_score,
                        "Evaluation finished"
                    );
                }
                if score >= self.state.best_score {
                    self.state.best_score = score;
                    summary.best_promotions += 1;
                    if self.is_leader() {
                        if !saved_this_epoch {
                            self.save_checkpoint(epoch)?;
                            summary.checkpoints_written += 1;
                        }
                        self.store.repoint(task_id, Pointer::Best, epoch)?;
                        self.store.save_results(task_id, &results)?;
                        info!(task_id, epoch, score, "New best segmentor");
                    }
                }
                summary.last_results = Some(results);
            }

            self.coordinator.barrier()?;
        }

        self.phase = RunnerPhase::Done;
        summary.best_score = self.state.best_score;
        if self.is_leader() {
            info!(
                task_id,
                epochs_run = summary.epochs_run,
                best_score = summary.best_score,
                "Task finished"
            );
        }
        Ok(summary)
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<()> {
        let task_id = self.task.id;
        let leader = self.is_leader();
        self.train_loader.set_epoch(epoch as u64);
        for batch in self.train_loader.batches() {
            let batch = batch?;
            let (output, cache) = self.model.forward_train(&batch.images, &mut self.rng);
            let history_output = self.history.as_ref().map(|history| history.infer(&batch.images));
            let loss = self.criterion.compute(&LossInputs {
                logits: &output.logits,
                targets: &batch.labels,
                distillation: &output.distillation,
                history_distillation: history_output.as_ref().map(|h| h.distillation.as_slice()),
            })?;
            if !loss.total.is_finite() {
                return Err(TrainingError::NonFiniteLoss {
                    loss: loss.total,
                    iteration: self.scheduler.cur_iter(),
                }
                .into());
            }

            let grads = self
                .model
                .backward(&cache, &loss.grad_logits, loss.grad_distillation.as_deref())?;
            let lr = self.scheduler.lr();
            self.optimizer
                .step(self.model.module_mut().parameters_mut(), &grads, lr)?;
            self.scheduler.step();

            let iteration = self.scheduler.cur_iter();
            if leader && iteration % self.config.log_interval_iterations == 0 {
                info!(
                    task_id,
                    epoch,
                    iteration,
                    max_iters = self.scheduler.max_iters(),
                    lr,
                    loss = loss.total,
                    terms = ?loss.terms,
                    "Training progress"
                );
            }
        }

        self.scheduler.finish_epoch();
        self.state.epoch = epoch;
        self.state.iteration = self.scheduler.cur_iter();
        Ok(())
    }

    fn checkpoint_record(&self, epoch: usize) -> CheckpointRecord {
        CheckpointRecord {
            task_id: self.task.id,
            epoch,
            best_score: self.state.best_score,
            iterations_per_epoch: self.scheduler.iters_per_epoch(),
            model_parameters: self.model.module().state_dict(),
            optimizer_state: self.optimizer.state(),
            scheduler_state: self.scheduler.state(),
            saved_at: Utc::now(),
        }
    }

    fn save_checkpoint(&self, epoch: usize) -> Result<()> {
        let path = self.store.save(&self.checkpoint_record(epoch))?;
        debug!(task_id = self.task.id, epoch, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    /// Evaluate the current model on this rank's test shard, then merge all ranks.
    fn evaluate(&self) -> Result<EvaluationResults> {
        let align_corners = self.model.module().align_corners();
        let mut evaluator =
            SegmentationEvaluator::new(self.task.known_classes, self.config.ignore_index);
        for batch in self.test_loader.batches() {
            let batch = batch?;
            let output = self.model.module().infer(&batch.images);
            let (_, height, width) = batch.labels.dim();
            let logits = resize_bilinear(&output.logits, (height, width), align_corners);
            let predictions = argmax_channels(&logits);
            evaluator.update(batch.labels.view(), predictions.view())?;
        }
        evaluator.synchronize(self.coordinator.group())?;
        Ok(evaluator.evaluate())
    }
}

fn check_dataset(
    dataset: &dyn SegmentationDataset,
    config: &RunnerConfig,
    split: &TaskSplit,
    task_id: usize,
    expected: &[usize],
) -> Result<()> {
    if dataset.num_classes() != config.num_total_classes {
        return Err(ConfigError::Invalid {
            message: format!(
                "{:?} dataset reports {} classes, configuration expects {}",
                dataset.mode(),
                dataset.num_classes(),
                config.num_total_classes
            ),
        }
        .into());
    }
    let reported = dataset.num_classes_per_task(split.name(), task_id)?;
    if reported != expected {
        return Err(ConfigError::Invalid {
            message: format!(
                "{:?} dataset reports classes per task {reported:?} for task {task_id}, \
                 split '{}' has {expected:?}",
                dataset.mode(),
                split.name()
            ),
        }
        .into());
    }
    Ok(())
}
