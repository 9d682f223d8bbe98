//! Store key layout.
//!
//! All state lives in an external key-value store under a fixed namespace:
//!
//! ```text
//! queues:<name>          queue descriptor (JSON)
//! queues:data:<name>     sorted set of (score, payload) entries
//! queues:quit            supervisor shutdown sentinel
//! <kind>:<id>:Q          per-movement enqueue set
//! emitpy:<name>          pub/sub channel for queue <name>
//! ```
//!
//! The `emitpy:` channel prefix is the historical wire contract with
//! downstream consumers and is kept verbatim.

use crate::QueueName;

/// Separator between key path components.
pub const ID_SEP: &str = ":";

/// Prefix of descriptor keys.
pub const QUEUE_PREFIX: &str = "queues";

/// Prefix of sorted-set data keys.
pub const QUEUE_DATA_PREFIX: &str = "queues:data";

/// Prefix of pub/sub channels.
pub const CHANNEL_PREFIX: &str = "emitpy";

/// Suffix of per-movement enqueue sets.
pub const ENQUEUE_SUFFIX: &str = "Q";

/// Key under which a queue's descriptor is stored.
pub fn descriptor_key(name: &QueueName) -> String {
    format!("{QUEUE_PREFIX}{ID_SEP}{name}")
}

/// Key of a queue's sorted set of entries.
pub fn data_key(name: &QueueName) -> String {
    format!("{QUEUE_DATA_PREFIX}{ID_SEP}{name}")
}

/// Scratch key used by the push-back pipeline.
pub fn scratch_key(name: &QueueName) -> String {
    format!("{}-TMP", data_key(name))
}

/// Pub/sub channel on which a queue's broadcaster publishes.
pub fn channel(name: &QueueName) -> String {
    format!("{CHANNEL_PREFIX}{ID_SEP}{name}")
}

/// The supervisor shutdown sentinel key.
pub fn quit_key() -> String {
    format!("{QUEUE_PREFIX}{ID_SEP}{}", crate::QUIT)
}

/// Key of the enqueue set tracking a movement's contributed members.
pub fn enqueue_set_key(kind: &str, id: &str) -> String {
    format!("{kind}{ID_SEP}{id}{ID_SEP}{ENQUEUE_SUFFIX}")
}

/// Returns true if `key` addresses a queue's sorted set rather than its
/// descriptor.
pub fn is_data_key(key: &str) -> bool {
    key.strip_prefix(QUEUE_DATA_PREFIX)
        .is_some_and(|rest| rest.starts_with(ID_SEP))
}

/// Extracts the trailing queue name from any namespaced key.
pub fn leaf(key: &str) -> &str {
    key.rsplit(ID_SEP).next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(name: &str) -> QueueName {
        QueueName::new(name).unwrap()
    }

    #[test]
    fn layout() {
        let name = q("wire");
        assert_eq!(descriptor_key(&name), "queues:wire");
        assert_eq!(data_key(&name), "queues:data:wire");
        assert_eq!(scratch_key(&name), "queues:data:wire-TMP");
        assert_eq!(channel(&name), "emitpy:wire");
        assert_eq!(quit_key(), "queues:quit");
    }

    #[test]
    fn data_key_detection() {
        assert!(is_data_key("queues:data:wire"));
        assert!(!is_data_key("queues:wire"));
        assert!(!is_data_key("queues:datawire"));
        assert!(!is_data_key("flight:QR123:Q"));
    }

    #[test]
    fn leaf_extraction() {
        assert_eq!(leaf("queues:data:wire"), "wire");
        assert_eq!(leaf("queues:wire"), "wire");
        assert_eq!(leaf("wire"), "wire");
    }
}
