//! Store error types.

use aircast_types::DescriptorError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur when talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport or server error from the backend.
    #[error("store i/o error: {0}")]
    Backend(#[from] redis::RedisError),

    /// Connecting failed even after backoff.
    #[error("could not connect to store after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        source: redis::RedisError,
    },

    /// The server cannot deliver keyspace notifications and they could not
    /// be enabled. The supervisor cannot run without them.
    #[error("store does not deliver keyspace notifications (notify-keyspace-events is '{found}')")]
    NotificationsUnavailable { found: String },

    /// A stored descriptor failed to parse or validate.
    #[error("descriptor '{name}': {source}")]
    Descriptor {
        name: String,
        #[source]
        source: DescriptorError,
    },

    /// A subscription's forwarding thread died.
    #[error("subscription closed")]
    SubscriptionClosed,
}

impl StoreError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Backend(e) => e.is_timeout() || e.is_connection_dropped(),
            StoreError::Connect { .. }
            | StoreError::NotificationsUnavailable { .. }
            | StoreError::Descriptor { .. }
            | StoreError::SubscriptionClosed => false,
        }
    }
}
