//! Error type shared by every module of the crate.
//!
//! Collaborator failures (I/O, CSV parsing, JSON) pass through unchanged via
//! `#[error(transparent)]`, so a missing dataset or checkpoint file surfaces
//! as the original `std::io::Error`.

use std::path::PathBuf;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid learning rate: {0} - should be >= 0.0")]
    InvalidLearningRate(f32),

    #[error("Invalid beta parameter at index {index}: {value} - should be in [0.0, 1.0)")]
    InvalidBeta { index: usize, value: f32 },

    #[error("Invalid epsilon value: {0} - should be >= 0.0")]
    InvalidEpsilon(f32),

    #[error("AdamW does not support sparse gradients (parameter `{param}`)")]
    SparseGradient { param: String },

    #[error("invalid argument `{name}`: {message}")]
    InvalidArgument { name: &'static str, message: String },

    #[error("a compute accelerator was requested but this build only supports the CPU")]
    AcceleratorUnavailable,

    #[error("{path}: row {row}: {message}")]
    InvalidRecord {
        path: PathBuf,
        row: usize,
        message: String,
    },

    #[error("{task} batch has no labels; only labelled splits can be trained on")]
    MissingLabels { task: &'static str },

    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
