//! Error types for the csseg training core.
//!
//! Uses `thiserror` for public API error types. Every variant is fatal for a
//! training run: errors propagate to the binary, which logs them on the leader
//! and exits with a non-zero status. Nothing is retried automatically.

use std::path::PathBuf;

/// Top-level error type for the csseg core library.
#[derive(Debug, thiserror::Error)]
pub enum CssegError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(#[from] ShapeMismatchError),

    #[error("Checkpoint corruption: {0}")]
    CheckpointCorruption(#[from] CheckpointError),

    #[error("Distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the configuration system and from setup consistency checks.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Disagreement between declared and observed tensor shapes.
#[derive(Debug, thiserror::Error)]
pub enum ShapeMismatchError {
    #[error("parameter '{name}' expects shape {expected:?}, checkpoint has {found:?}")]
    Parameter {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("parameter '{name}' is missing from the checkpoint")]
    MissingParameter { name: String },

    #[error("checkpoint has unexpected parameter '{name}'")]
    UnexpectedParameter { name: String },

    #[error("targets have shape {targets:?} but predictions have shape {predictions:?}")]
    Labels {
        targets: Vec<usize>,
        predictions: Vec<usize>,
    },

    #[error("expected {expected} classes, found {found}")]
    ClassCount { expected: usize, found: usize },
}

/// A checkpoint or pointer artifact that cannot be trusted.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {path}")]
    Missing { path: PathBuf },

    #[error("checkpoint {path} failed its integrity check (truncated or modified)")]
    Integrity { path: PathBuf },

    #[error("checkpoint {path} is malformed: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("pointer '{pointer}' refers to missing artifact {target}")]
    DanglingPointer { pointer: String, target: PathBuf },
}

/// Errors from process-group formation and collective operations.
#[derive(Debug, thiserror::Error)]
pub enum DistributedError {
    #[error("process group initialization failed: {message}")]
    Init { message: String },

    #[error("collective operation failed: {message}")]
    Collective { message: String },
}

/// Errors raised while iterating data or stepping the model.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("non-finite loss {loss} at iteration {iteration}")]
    NonFiniteLoss { loss: f32, iteration: usize },

    #[error("label {label} is outside the {num_classes} known classes")]
    InvalidLabel { label: u16, num_classes: usize },

    #[error("data error: {message}")]
    Data { message: String },
}

/// A type alias for results using the top-level `CssegError`.
pub type Result<T> = std::result::Result<T, CssegError>;
