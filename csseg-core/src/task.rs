//! Tasks and task splits.
//!
//! A split is an ordered list of label sets; task `t` introduces the labels of
//! its set and the model then knows every label introduced by tasks `0..=t`.
//! Labels double as output-channel indices, so a valid split enumerates
//! `0..num_classes` in order with no label assigned twice.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One stage of the continual-learning sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: usize,
    /// Labels introduced at this task, in channel order.
    pub new_classes: Vec<u16>,
    /// Cumulative class count through this task.
    pub known_classes: usize,
}

/// A named, validated sequence of per-task label sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSplit {
    name: String,
    tasks: Vec<Vec<u16>>,
}

impl TaskSplit {
    pub fn new(name: impl Into<String>, tasks: Vec<Vec<u16>>) -> Result<Self, ConfigError> {
        let name = name.into();
        if tasks.is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("task split '{name}' has no tasks"),
            });
        }

        let mut seen = BTreeSet::new();
        for (id, labels) in tasks.iter().enumerate() {
            if labels.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("task {id} of split '{name}' introduces no classes"),
                });
            }
            for &label in labels {
                if !seen.insert(label) {
                    return Err(ConfigError::Invalid {
                        message: format!(
                            "class {label} is assigned to more than one task in split '{name}'"
                        ),
                    });
                }
            }
        }

        let contiguous = tasks
            .iter()
            .flatten()
            .enumerate()
            .all(|(index, &label)| usize::from(label) == index);
        if !contiguous {
            return Err(ConfigError::Invalid {
                message: format!("split '{name}' must enumerate classes 0..N in task order"),
            });
        }

        Ok(Self { name, tasks })
    }

    /// Pascal VOC protocols (21 classes including background).
    pub fn builtin(name: &str) -> Option<Self> {
        let tasks = match name {
            "19-1" => vec![range(0, 19), range(20, 20)],
            "15-5" => vec![range(0, 15), range(16, 20)],
            "15-5s" | "15-1" => {
                let mut tasks = vec![range(0, 15)];
                tasks.extend((16..=20).map(|c| vec![c]));
                tasks
            }
            "10-1" => {
                let mut tasks = vec![range(0, 10)];
                tasks.extend((11..=20).map(|c| vec![c]));
                tasks
            }
            _ => return None,
        };
        Self::new(name, tasks).ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn num_classes(&self) -> usize {
        self.tasks.iter().map(Vec::len).sum()
    }

    pub fn new_classes(&self, task_id: usize) -> Option<&[u16]> {
        self.tasks.get(task_id).map(Vec::as_slice)
    }

    /// Per-task class counts for tasks `0..=task_id`.
    pub fn classes_per_task(&self, task_id: usize) -> Result<Vec<usize>, ConfigError> {
        if task_id >= self.tasks.len() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "task {task_id} is out of range for split '{}' with {} tasks",
                    self.name,
                    self.tasks.len()
                ),
            });
        }
        Ok(self.tasks[..=task_id].iter().map(Vec::len).collect())
    }

    pub fn known_classes(&self, task_id: usize) -> Result<usize, ConfigError> {
        Ok(self.classes_per_task(task_id)?.iter().sum())
    }

    pub fn task(&self, task_id: usize) -> Result<Task, ConfigError> {
        let known_classes = self.known_classes(task_id)?;
        Ok(Task {
            id: task_id,
            new_classes: self.tasks[task_id].clone(),
            known_classes,
        })
    }

    /// Which task introduces `label`, if any.
    pub fn task_of(&self, label: u16) -> Option<usize> {
        self.tasks.iter().position(|labels| labels.contains(&label))
    }
}

fn range(first: u16, last: u16) -> Vec<u16> {
    (first..=last).collect()
}
