//! # aircast-store: store adapter
//!
//! Typed wrapper over the external store the broadcast subsystem relies on.
//! The store must provide ordered sets (the queues proper), plain sets (the
//! per-movement enqueue indexes), string keys (descriptors, the shutdown
//! sentinel), pub/sub channels, and keyspace notifications announcing key
//! mutations.
//!
//! Two implementations ship:
//! - [`RedisStore`] — the production backend, one connection per worker
//!   thread (cloned via [`Store::try_clone`]).
//! - [`MemoryStore`] — a deterministic in-process twin with the same
//!   blocking and notification semantics, used by tests and local
//!   development without a server.
//!
//! All multi-key mutations are single pipelines, atomic relative to other
//! writers; the in-memory twin holds one lock for the same effect.

use std::time::Duration;

use aircast_types::{Entry, QueueDescriptor, QueueName};

mod error;
mod memory;
mod redis_store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// A key mutation observed through a keyspace subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// The mutated key, without the notification channel prefix.
    pub key: String,
    /// The operation, as named by the store (`set`, `del`, `zadd`, ...).
    pub op: String,
}

/// Blocking iterator over keyspace notifications for one pattern.
pub trait KeyspaceWatch: Send {
    /// Waits up to `timeout` for the next mutation event.
    ///
    /// Returns `Ok(None)` on timeout so callers can re-check shutdown flags.
    fn next_event(&mut self, timeout: Duration) -> StoreResult<Option<KeyEvent>>;
}

/// Blocking iterator over messages published on one channel.
pub trait MessageWatch: Send {
    /// Waits up to `timeout` for the next published payload.
    fn next_message(&mut self, timeout: Duration) -> StoreResult<Option<String>>;
}

/// The store operations the broadcast subsystem needs.
///
/// Every worker thread owns its own boxed handle; blocking calls
/// ([`Store::pop_min_blocking`], the watches) therefore never stall another
/// worker.
pub trait Store: Send {
    /// Opens an independent handle sharing the same backing store.
    fn try_clone(&self) -> StoreResult<Box<dyn Store>>;

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    /// Writes a queue descriptor (creating or replacing it).
    fn put_descriptor(&mut self, desc: &QueueDescriptor) -> StoreResult<()>;

    /// Reads and validates a queue descriptor.
    fn get_descriptor(&mut self, name: &QueueName) -> StoreResult<Option<QueueDescriptor>>;

    /// Deletes a queue descriptor key.
    fn delete_descriptor(&mut self, name: &QueueName) -> StoreResult<()>;

    /// Loads all valid descriptors. Malformed ones are logged and skipped.
    fn list_descriptors(&mut self) -> StoreResult<Vec<QueueDescriptor>>;

    // ------------------------------------------------------------------
    // The queue proper (sorted set)
    // ------------------------------------------------------------------

    /// The replace-and-insert pipeline: removes `old_members` from the
    /// queue and drops the old enqueue set, then records the new member
    /// strings under `enqueue_key` and inserts `entries` into the queue.
    /// One atomic pipeline.
    fn enqueue_entries(
        &mut self,
        queue: &QueueName,
        enqueue_key: &str,
        old_members: &[String],
        entries: &[Entry],
    ) -> StoreResult<()>;

    /// Removes a movement's members from the queue and deletes its enqueue
    /// set. Returns the number of members removed from the queue.
    fn dequeue_movement(&mut self, queue: &QueueName, enqueue_key: &str) -> StoreResult<usize>;

    /// Blocking pop of the entry with the least score.
    ///
    /// Returns `Ok(None)` on timeout.
    fn pop_min_blocking(
        &mut self,
        queue: &QueueName,
        timeout: Duration,
    ) -> StoreResult<Option<Entry>>;

    /// Members with score in `[0, max_score]`, ascending.
    fn members_up_to(&mut self, queue: &QueueName, max_score: f64) -> StoreResult<Vec<String>>;

    /// Removes the given members from the queue. Returns how many existed.
    fn remove_members(&mut self, queue: &QueueName, members: &[String]) -> StoreResult<usize>;

    /// Re-inserts a popped entry without racing a concurrent sweep: the
    /// entry lands on a scratch key which is then merged into the queue
    /// and deleted, in one pipeline.
    fn push_back(&mut self, queue: &QueueName, entry: &Entry) -> StoreResult<()>;

    /// Number of entries currently in the queue.
    fn queue_len(&mut self, queue: &QueueName) -> StoreResult<usize>;

    // ------------------------------------------------------------------
    // Sets and strings
    // ------------------------------------------------------------------

    /// Members of a plain set (an enqueue index).
    fn set_members(&mut self, key: &str) -> StoreResult<Vec<String>>;

    /// Deletes any key.
    fn delete_key(&mut self, key: &str) -> StoreResult<()>;

    /// Writes a plain string key (used for the shutdown sentinel).
    fn write_key(&mut self, key: &str, value: &str) -> StoreResult<()>;

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publishes a payload; returns the number of receivers.
    fn publish(&mut self, channel: &str, payload: &str) -> StoreResult<usize>;

    /// Subscribes to keyspace notifications for keys matching `pattern`
    /// (exact key, or a prefix ending in `*`).
    fn subscribe_keyspace(&mut self, pattern: &str) -> StoreResult<Box<dyn KeyspaceWatch>>;

    /// Subscribes to payloads published on `channel`.
    fn subscribe_channel(&mut self, channel: &str) -> StoreResult<Box<dyn MessageWatch>>;
}

/// Matches a subscription pattern against a key.
///
/// Patterns are either exact keys or a prefix followed by `*`, which is the
/// only glob form the subsystem uses.
pub(crate) fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
