//! Drives the task sequence from task 0 to the last task.

use std::sync::Arc;

use tracing::info;

use crate::config::RunnerConfig;
use crate::data::{DatasetFactory, SyntheticDatasetFactory};
use crate::distributed::DistributedCoordinator;
use crate::error::Result;
use crate::runner::{TaskRunner, TaskSummary};

pub struct TaskSequenceController {
    config: RunnerConfig,
    coordinator: DistributedCoordinator,
    factory: Arc<dyn DatasetFactory>,
}

impl TaskSequenceController {
    pub fn new(
        config: RunnerConfig,
        coordinator: DistributedCoordinator,
        factory: Arc<dyn DatasetFactory>,
    ) -> Self {
        Self {
            config,
            coordinator,
            factory,
        }
    }

    /// Controller over the configured synthetic dataset.
    pub fn from_config(config: RunnerConfig, coordinator: DistributedCoordinator) -> Result<Self> {
        let factory = SyntheticDatasetFactory::new(
            config.task_split()?,
            config.dataset.synthetic.clone(),
            config.ignore_index,
        );
        Ok(Self::new(config, coordinator, Arc::new(factory)))
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run every task in order, stopping at the first error.
    ///
    /// Tasks whose final checkpoint already exists resume at their end and
    /// train no further epochs, so re-running a finished or interrupted
    /// sequence picks up where it stopped.
    pub fn run(&self) -> Result<Vec<TaskSummary>> {
        let mut summaries = Vec::with_capacity(self.config.num_tasks);
        for task_id in 0..self.config.num_tasks {
            let mut runner = TaskRunner::new(
                &self.config,
                task_id,
                self.coordinator.clone(),
                self.factory.as_ref(),
            )?;
            summaries.push(runner.start()?);
        }
        if self.coordinator.is_leader() {
            info!(
                algorithm = %self.config.algorithm,
                task_name = %self.config.task_name,
                num_tasks = summaries.len(),
                final_score = summaries.last().map(|s| s.best_score),
                "Task sequence finished"
            );
        }
        Ok(summaries)
    }
}
