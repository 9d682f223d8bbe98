//! # aircast-types: Core types for aircast
//!
//! This crate contains the shared vocabulary of the broadcast subsystem:
//! - Identifiers ([`QueueName`], [`Movement`], [`MovementKind`])
//! - Queue records ([`QueueDescriptor`], [`QueueStatus`], [`Entry`])
//! - The store key layout ([`keys`])
//! - Timing constants shared by dispatchers, trimmers, and the supervisor
//!
//! Everything here is plain data; no I/O happens in this crate.

use std::fmt::{self, Display};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod descriptor;
pub mod keys;

pub use descriptor::{DescriptorError, QueueDescriptor, QueueStatus};

// ============================================================================
// Timing constants
// ============================================================================
//
// Delicate parameters. They bound shutdown latency and late-event tolerance
// for every queue in the process, so they are deliberately not configurable.

/// Maximum time a dispatcher blocks on a pop before re-checking its flags.
pub const ZPOPMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum time a keyspace subscriber blocks waiting for a notification.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

/// The most negative queue-time lateness (in seconds) still worth publishing.
/// Entries later than this at pop time are dropped and a sweep is triggered.
/// MUST be <= 0.
pub const MAX_BACKLOG_SECS: f64 = -20.0;

/// Time shifts smaller than this are clamped to zero, so a queue created
/// "now" does not accumulate jitter from the instants between descriptor
/// creation and clock instantiation.
pub const TIMESHIFT_CLAMP_SECS: i64 = 10;

/// Reserved queue name used as the supervisor shutdown sentinel.
pub const QUIT: &str = "quit";

/// Reserved queue name for the flight-simulator live feed.
pub const LIVETRAFFIC_QUEUE: &str = "lt";

// ============================================================================
// Identifiers
// ============================================================================

/// Errors produced when constructing identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    /// Empty queue name.
    #[error("queue name must not be empty")]
    Empty,

    /// The name is reserved for internal use.
    #[error("queue name '{0}' is reserved")]
    Reserved(String),

    /// The name would break the store key layout.
    #[error("queue name '{0}' contains ':'")]
    Separator(String),
}

/// A validated queue name.
///
/// Queue names are store-key fragments, so they must be non-empty, must not
/// contain the key separator, and must not collide with reserved names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name == QUIT {
            return Err(NameError::Reserved(name));
        }
        if name.contains(keys::ID_SEP) {
            return Err(NameError::Separator(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the reserved live-feed queue.
    pub fn is_livetraffic(&self) -> bool {
        self.0 == LIVETRAFFIC_QUEUE
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

/// The kind of movement a producer schedules events for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    Flight,
    Service,
    Mission,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Flight => "flight",
            MovementKind::Service => "service",
            MovementKind::Mission => "mission",
        }
    }
}

impl Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical producer: one flight, ground service run, or mission.
///
/// Each movement owns an enqueue set in the store tracking the members it
/// contributed, so that a re-plan replaces exactly its own entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Movement {
    pub kind: MovementKind,
    pub id: String,
}

impl Movement {
    pub fn new(kind: MovementKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// The store key of this movement's enqueue set.
    pub fn enqueue_key(&self) -> String {
        keys::enqueue_set_key(self.kind.as_str(), &self.id)
    }
}

impl Display for Movement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind, keys::ID_SEP, self.id)
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One scheduled emission: an opaque payload due at a queue-time instant.
///
/// `score` is seconds since the Unix epoch in queue-time. Members are unique
/// within a queue (sorted-set semantics); re-adding a member updates its
/// score.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub member: String,
    pub score: f64,
}

impl Entry {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("wire"; "plain name")]
    #[test_case("lt"; "livetraffic")]
    #[test_case("raw-adsb"; "dashed")]
    fn queue_name_accepts(name: &str) {
        assert!(QueueName::new(name).is_ok());
    }

    #[test]
    fn queue_name_rejects_empty() {
        assert_eq!(QueueName::new(""), Err(NameError::Empty));
    }

    #[test]
    fn queue_name_rejects_reserved() {
        assert!(matches!(QueueName::new("quit"), Err(NameError::Reserved(_))));
    }

    #[test]
    fn queue_name_rejects_separator() {
        assert!(matches!(
            QueueName::new("queues:data"),
            Err(NameError::Separator(_))
        ));
    }

    #[test]
    fn queue_name_serde_round_trip() {
        let name = QueueName::new("wire").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"wire\"");
        let back: QueueName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn queue_name_serde_rejects_reserved() {
        assert!(serde_json::from_str::<QueueName>("\"quit\"").is_err());
    }

    #[test]
    fn movement_enqueue_key() {
        let m = Movement::new(MovementKind::Flight, "QR123-20260801");
        assert_eq!(m.enqueue_key(), "flight:QR123-20260801:Q");
    }

    #[test]
    fn backlog_constant_is_negative() {
        assert!(MAX_BACKLOG_SECS <= 0.0);
    }
}
