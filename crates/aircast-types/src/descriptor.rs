//! Queue descriptors.
//!
//! The descriptor is the source of truth for a queue's configuration. It is
//! stored as a JSON blob under `queues:<name>`; the supervisor reacts to
//! writes and deletes of that key. Field names are wire-compatible with the
//! historical format, so descriptors written by older tooling keep loading.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{NameError, QueueName};

/// Errors when loading or validating a descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The JSON blob does not parse.
    #[error("malformed descriptor: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The queue name is invalid.
    #[error(transparent)]
    Name(#[from] NameError),

    /// Speed must be a positive, finite multiplier.
    #[error("invalid speed {0} (must be finite and > 0)")]
    Speed(f64),

    /// The start time does not parse as an ISO-8601 timestamp.
    #[error("unparseable start time '{value}': {source}")]
    StartTime {
        value: String,
        source: chrono::ParseError,
    },
}

/// Whether a queue's broadcaster should be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Run,
    Stop,
}

impl QueueStatus {
    pub fn is_running(self) -> bool {
        matches!(self, QueueStatus::Run)
    }
}

/// A named, persisted queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: QueueName,
    /// Identifier of the formatter producers used for this queue's payloads.
    /// Opaque to the broadcaster; consumers use it to pick a parser.
    pub formatter_name: String,
    /// Queue-time origin as an ISO-8601 timestamp, or `None` for "now".
    #[serde(default)]
    pub starttime: Option<String>,
    /// Clock speed multiplier. 1.0 = real time, 2.0 = twice as fast.
    pub speed: f64,
    pub status: QueueStatus,
}

impl QueueDescriptor {
    pub fn new(name: QueueName, formatter_name: impl Into<String>) -> Self {
        Self {
            name,
            formatter_name: formatter_name.into(),
            starttime: None,
            speed: 1.0,
            status: QueueStatus::Run,
        }
    }

    /// Parses a descriptor from its stored JSON blob and validates it.
    pub fn from_json(blob: &str) -> Result<Self, DescriptorError> {
        let desc: QueueDescriptor = serde_json::from_str(blob)?;
        desc.validate()?;
        Ok(desc)
    }

    /// Serializes the descriptor to its stored JSON form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Checks invariants that the type system cannot express.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(DescriptorError::Speed(self.speed));
        }
        self.start_datetime()?;
        Ok(())
    }

    /// The parsed queue-time origin, if one is set.
    ///
    /// A future start time is legal and makes queue-time run ahead of
    /// wall-clock.
    pub fn start_datetime(&self) -> Result<Option<DateTime<FixedOffset>>, DescriptorError> {
        match &self.starttime {
            None => Ok(None),
            Some(value) => DateTime::parse_from_rfc3339(value).map(Some).map_err(|e| {
                DescriptorError::StartTime {
                    value: value.clone(),
                    source: e,
                }
            }),
        }
    }
}
