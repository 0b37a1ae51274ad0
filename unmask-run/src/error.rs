use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading configs and checkpoints.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Model(#[from] unmask::Error),

    /// File does not start with the checkpoint magic.
    #[error("not a checkpoint file")]
    BadMagic,

    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),

    /// File ended before the named field could be read.
    #[error("checkpoint truncated while reading {0}")]
    Truncated(&'static str),

    /// Tensor header is inconsistent.
    #[error("malformed tensor {name}: {reason}")]
    Malformed { name: String, reason: String },

    #[error("no checkpoint found in {0}")]
    NoCheckpoint(PathBuf),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
