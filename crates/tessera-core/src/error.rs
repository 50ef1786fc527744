//! Error type shared by every tile operation.

use tessera_compute::ComputeError;
use thiserror::Error;

/// Errors that can occur in the tile runtime and its algorithms.
#[derive(Debug, Error)]
pub enum TileError {
    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("Tile ({i}, {j}) is not local to rank {rank}")]
    NotLocal { i: usize, j: usize, rank: usize },

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("Communication failure: {0}")]
    CommunicationFailure(String),

    /// The leading minor of this (1-based) order is not positive definite.
    #[error("Factorization failed: leading minor {index} is not positive definite")]
    FactorizationFailure { index: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Compute backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<ComputeError> for TileError {
    fn from(e: ComputeError) -> Self {
        match e {
            ComputeError::OutOfMemory { .. } => TileError::AllocationFailure(e.to_string()),
            ComputeError::Communication(msg) => TileError::CommunicationFailure(msg),
            other => TileError::Backend(other.to_string()),
        }
    }
}

/// Jobs report tile errors through the backend's error type.
impl From<TileError> for ComputeError {
    fn from(e: TileError) -> Self {
        ComputeError::JobFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TileError>;
