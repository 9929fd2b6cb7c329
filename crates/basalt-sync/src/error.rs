//! Sync error types.

use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network error.
    #[error("network error: {0}")]
    Network(#[from] basalt_network::NetworkError),

    /// Chain error.
    #[error("chain error: {0}")]
    Chain(#[from] basalt_types::ChainError),

    /// A sync round is already running.
    #[error("sync already in progress")]
    Busy,

    /// No usable peer for the operation.
    #[error("no peers available for sync")]
    NoPeers,

    /// A request was not answered in time.
    #[error("sync request timed out")]
    Timeout,

    /// The round was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A peer delivered a chain that fails basic checks.
    #[error("invalid chain: {0}")]
    InvalidChain(String),

    /// The sync made no progress.
    #[error("sync stalled: {0}")]
    Stalled(String),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
