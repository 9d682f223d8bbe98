//! Producer-facing enqueue protocol.
//!
//! A movement's scheduled payloads are tracked twice: in the queue's sorted
//! set (keyed by emission time) and in the movement's enqueue set (so a
//! re-plan can replace exactly its own contribution). Both are kept
//! consistent by a single store pipeline: old members leave both before new
//! members enter both.

use tracing::{debug, warn};

use aircast_store::Store;
use aircast_types::{Entry, Movement, QueueName};

use crate::error::BroadcastResult;

/// Replaces a movement's scheduled payloads with `points`.
///
/// `points` maps each payload to its emission instant (queue-time epoch
/// seconds). Any payloads the movement enqueued earlier — on this or a
/// previous plan — are removed first, atomically with the insert.
/// Returns the number of entries enqueued.
pub fn enqueue(
    store: &mut dyn Store,
    queue: &QueueName,
    movement: &Movement,
    points: &[(String, f64)],
) -> BroadcastResult<usize> {
    if points.is_empty() {
        warn!(%movement, "no emission points, nothing to enqueue");
        return Ok(0);
    }
    let enqueue_key = movement.enqueue_key();
    let old_members = store.set_members(&enqueue_key)?;

    let entries: Vec<Entry> = points
        .iter()
        .map(|(payload, ts)| Entry::new(payload.clone(), *ts))
        .collect();
    let (min, max) = score_span(&entries);
    store.enqueue_entries(queue, &enqueue_key, &old_members, &entries)?;

    debug!(
        %queue,
        %movement,
        replaced = old_members.len(),
        enqueued = entries.len(),
        from = min,
        to = max,
        "enqueued"
    );
    Ok(entries.len())
}

/// Removes everything a movement has enqueued. Returns how many entries
/// left the queue.
pub fn dequeue(
    store: &mut dyn Store,
    queue: &QueueName,
    movement: &Movement,
) -> BroadcastResult<usize> {
    let removed = store.dequeue_movement(queue, &movement.enqueue_key())?;
    debug!(%queue, %movement, removed, "dequeued");
    Ok(removed)
}

/// Re-enqueues a movement's existing payloads at their original emission
/// times, parsed from the payloads themselves.
///
/// This restarts an already-scheduled stream without recomputing it.
/// Payloads without a recognizable timestamp are dropped with a warning.
/// Returns the number of entries re-enqueued.
pub fn replay(
    store: &mut dyn Store,
    queue: &QueueName,
    movement: &Movement,
) -> BroadcastResult<usize> {
    let enqueue_key = movement.enqueue_key();
    let old_members = store.set_members(&enqueue_key)?;
    if old_members.is_empty() {
        warn!(%movement, "nothing enqueued, nothing to replay");
        return Ok(0);
    }

    let mut entries = Vec::with_capacity(old_members.len());
    let mut skipped = 0usize;
    for member in &old_members {
        match payload_timestamp(member) {
            Some(ts) => entries.push(Entry::new(member.clone(), ts)),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(%movement, skipped, "payloads without a timestamp dropped from replay");
    }
    if entries.is_empty() {
        warn!(%movement, "no replayable payloads, queue untouched");
        return Ok(0);
    }

    store.enqueue_entries(queue, &enqueue_key, &old_members, &entries)?;
    debug!(%queue, %movement, count = entries.len(), "replayed");
    Ok(entries.len())
}

/// Extracts the absolute emission timestamp a payload carries.
///
/// JSON payloads store it under `properties."emit-absolute-time"`; bare
/// wire lines carry it as the trailing comma-separated field.
pub fn payload_timestamp(payload: &str) -> Option<f64> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        return value.get("properties")?.get("emit-absolute-time")?.as_f64();
    }
    payload.rsplit(',').next()?.trim().parse().ok()
}

fn score_span(entries: &[Entry]) -> (f64, f64) {
    entries.iter().fold((f64::MAX, f64::MIN), |(min, max), e| {
        (min.min(e.score), max.max(e.score))
    })
}
