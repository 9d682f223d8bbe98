//! Broadcast error types.

use aircast_store::StoreError;
use aircast_types::{DescriptorError, NameError, QueueName};
use thiserror::Error;

/// Result type for broadcast operations.
pub type BroadcastResult<T> = Result<T, BroadcastError>;

/// Errors that can occur in the dispatch subsystem.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue descriptor failed to parse or validate.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// Invalid queue name.
    #[error(transparent)]
    Name(#[from] NameError),

    /// I/O failure on a publish target (UDP feed).
    #[error("feed i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The dispatcher did not acknowledge a handshake in time.
    #[error("queue '{queue}': dispatcher did not acknowledge {operation}")]
    HandshakeTimeout {
        queue: QueueName,
        operation: &'static str,
    },

    /// Could not spawn a worker thread.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}
