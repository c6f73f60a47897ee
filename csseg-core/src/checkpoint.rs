//! On-disk training state.
//!
//! Layout under the work directory:
//!
//! ```text
//! task_<id>/epoch_<n>.ckpt     full training state after epoch n
//! task_<id>/latest             file name of the most recent saved epoch
//! task_<id>/best               file name of the best evaluated epoch
//! task_<id>/best_results.json  metrics of the best evaluated epoch
//! ```
//!
//! A checkpoint file is one header line `CSSEG-CKPT/1 <sha256 of body>`
//! followed by the JSON body. Every file is written through
//! [`atomic_write`], so an interrupted save leaves the previous state intact.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CheckpointError, Result};
use crate::evaluator::EvaluationResults;
use crate::optim::{OptimizerState, SchedulerState};
use crate::persistence::{atomic_write, atomic_write_json, load_json};
use crate::tensor::StateDict;

pub const CHECKPOINT_MAGIC: &str = "CSSEG-CKPT/1";

/// Everything needed to resume a task mid-sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointRecord {
    pub task_id: usize,
    /// Last completed epoch; training resumes at `epoch + 1`.
    pub epoch: usize,
    pub best_score: f64,
    pub iterations_per_epoch: usize,
    pub model_parameters: StateDict,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    pub saved_at: DateTime<Utc>,
}

/// Named per-task pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    Latest,
    Best,
}

impl Pointer {
    pub fn file_name(self) -> &'static str {
        match self {
            Pointer::Latest => "latest",
            Pointer::Best => "best",
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

fn body_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Checkpoint files and pointers under one work directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: usize) -> PathBuf {
        self.root.join(format!("task_{task_id}"))
    }

    pub fn epoch_file_name(epoch: usize) -> String {
        format!("epoch_{epoch}.ckpt")
    }

    pub fn epoch_path(&self, task_id: usize, epoch: usize) -> PathBuf {
        self.task_dir(task_id).join(Self::epoch_file_name(epoch))
    }

    pub fn pointer_path(&self, task_id: usize, pointer: Pointer) -> PathBuf {
        self.task_dir(task_id).join(pointer.file_name())
    }

    pub fn results_path(&self, task_id: usize) -> PathBuf {
        self.task_dir(task_id).join("best_results.json")
    }

    /// Write `record` to its epoch file and return the path.
    pub fn save(&self, record: &CheckpointRecord) -> Result<PathBuf> {
        let path = self.epoch_path(record.task_id, record.epoch);
        self.save_to(&path, record)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path, record: &CheckpointRecord) -> Result<()> {
        let body = serde_json::to_vec(record)?;
        let mut bytes = format!("{CHECKPOINT_MAGIC} {}\n", body_digest(&body)).into_bytes();
        bytes.extend_from_slice(&body);
        atomic_write(path, &bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Checkpoint written");
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<CheckpointRecord> {
        if !path.exists() {
            return Err(CheckpointError::Missing {
                path: path.to_path_buf(),
            }
            .into());
        }
        let bytes = std::fs::read(path)?;
        let malformed = |message: &str| CheckpointError::Malformed {
            path: path.to_path_buf(),
            message: message.to_string(),
        };

        let newline = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| malformed("missing header line"))?;
        let header = std::str::from_utf8(&bytes[..newline])
            .map_err(|_| malformed("header is not UTF-8"))?;
        let digest = header
            .strip_prefix(CHECKPOINT_MAGIC)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or_else(|| malformed("unrecognized header"))?;

        let body = &bytes[newline + 1..];
        if body_digest(body) != digest {
            return Err(CheckpointError::Integrity {
                path: path.to_path_buf(),
            }
            .into());
        }
        serde_json::from_slice(body).map_err(|e| malformed(&e.to_string()).into())
    }

    /// Point `pointer` at an existing epoch file of `task_id`.
    pub fn repoint(&self, task_id: usize, pointer: Pointer, epoch: usize) -> Result<()> {
        let target = self.epoch_path(task_id, epoch);
        if !target.exists() {
            return Err(CheckpointError::DanglingPointer {
                pointer: pointer.to_string(),
                target,
            }
            .into());
        }
        atomic_write(
            &self.pointer_path(task_id, pointer),
            Self::epoch_file_name(epoch).as_bytes(),
        )?;
        tracing::debug!(task_id, %pointer, epoch, "Pointer updated");
        Ok(())
    }

    /// The file a pointer names. `Ok(None)` when the pointer was never written.
    pub fn resolve(&self, task_id: usize, pointer: Pointer) -> Result<Option<PathBuf>> {
        let pointer_path = self.pointer_path(task_id, pointer);
        if !pointer_path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&pointer_path)?;
        let name = contents.trim();
        if name.is_empty() || name.contains(&['/', '\\'][..]) {
            return Err(CheckpointError::Malformed {
                path: pointer_path,
                message: format!("pointer holds invalid file name '{name}'"),
            }
            .into());
        }
        let target = self.task_dir(task_id).join(name);
        if !target.exists() {
            return Err(CheckpointError::DanglingPointer {
                pointer: pointer.to_string(),
                target,
            }
            .into());
        }
        Ok(Some(target))
    }

    pub fn load_pointer(
        &self,
        task_id: usize,
        pointer: Pointer,
    ) -> Result<Option<CheckpointRecord>> {
        match self.resolve(task_id, pointer)? {
            Some(path) => self.load(&path).map(Some),
            None => Ok(None),
        }
    }

    pub fn save_results(&self, task_id: usize, results: &EvaluationResults) -> Result<()> {
        atomic_write_json(&self.results_path(task_id), results)?;
        Ok(())
    }

    pub fn load_results(&self, task_id: usize) -> Result<Option<EvaluationResults>> {
        let path = self.results_path(task_id);
        load_json(&path).map_err(|e| {
            CheckpointError::Malformed {
                path,
                message: e.to_string(),
            }
            .into()
        })
    }
}
