//! Sync error types.

use kestrel_stream::{ErrorCode, RequestKind, StreamError};
use thiserror::Error;

/// Errors from the chain collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Requested entity is not in the chain.
    #[error("not found: {0}")]
    NotFound(String),

    /// A block failed validation during insert.
    #[error("invalid block {number}: {reason}")]
    InvalidBlock { number: u64, reason: String },

    /// Underlying storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Stream subsystem error.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Chain collaborator error.
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// The serving peer replied with a typed error.
    #[error("remote error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// The response kind does not match the request.
    #[error("unexpected response for {expected}")]
    UnexpectedResponse { expected: RequestKind },

    /// A client-side request exceeds its per-call cap.
    #[error("request of {requested} items exceeds cap of {cap}")]
    CapExceeded { requested: usize, cap: usize },

    /// Adding to the result queue would exceed its hard cap.
    #[error("result queue full: {size}/{max}")]
    QueueFull { size: usize, max: usize },

    /// Malformed block payload from a peer.
    #[error("invalid block data: {0}")]
    InvalidBlockData(String),

    /// Sync made no progress.
    #[error("sync stalled: {0}")]
    Stalled(String),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
