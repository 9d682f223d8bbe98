//! End-to-end dispatch behavior against the in-memory store.
//!
//! These drive real dispatcher and trimmer threads with sub-second
//! schedules. Ordering assertions are strict; timing assertions leave slack
//! for scheduler jitter.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use aircast_broadcast::{Broadcaster, BroadcasterHandle, ChannelPublisher, SimClock, enqueue};
use aircast_store::{MemoryStore, MessageWatch, Store};
use aircast_types::{Entry, Movement, MovementKind, QueueName, keys};

fn q(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

fn flight(id: &str) -> Movement {
    Movement::new(MovementKind::Flight, id)
}

fn now_epoch() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1e3
}

fn spawn(store: &MemoryStore, queue: &QueueName, speed: f64) -> BroadcasterHandle {
    let publisher = Box::new(ChannelPublisher::new(Box::new(store.clone()), queue));
    let mut factory: Box<dyn Store> = Box::new(store.clone());
    Broadcaster::spawn(
        queue.clone(),
        SimClock::new(None, speed),
        factory.as_mut(),
        publisher,
        false,
    )
    .unwrap()
}

fn subscribe(store: &MemoryStore, queue: &QueueName) -> Box<dyn MessageWatch> {
    let mut handle = store.clone();
    handle.subscribe_channel(&keys::channel(queue)).unwrap()
}

fn produce(store: &MemoryStore, queue: &QueueName, movement: &Movement, points: &[(&str, f64)]) {
    let mut handle = store.clone();
    let owned: Vec<(String, f64)> = points
        .iter()
        .map(|(payload, ts)| ((*payload).to_string(), *ts))
        .collect();
    enqueue::enqueue(&mut handle, queue, movement, &owned).unwrap();
}

/// Collects up to `want` publications, tagging each with its arrival offset.
fn collect(
    watch: &mut Box<dyn MessageWatch>,
    want: usize,
    deadline: Duration,
) -> Vec<(String, Duration)> {
    let started = Instant::now();
    let mut got = Vec::new();
    while got.len() < want && started.elapsed() < deadline {
        if let Some(payload) = watch.next_message(Duration::from_millis(100)).unwrap() {
            got.push((payload, started.elapsed()));
        }
    }
    got
}

fn payloads(got: &[(String, Duration)]) -> Vec<&str> {
    got.iter().map(|(p, _)| p.as_str()).collect()
}

#[test]
fn publishes_in_score_order_at_deadlines() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let mut watch = subscribe(&store, &queue);
    let handle = spawn(&store, &queue, 1.0);

    let base = now_epoch();
    produce(
        &store,
        &queue,
        &flight("QR1"),
        &[("A", base + 0.3), ("B", base + 0.7), ("C", base + 1.1)],
    );

    let got = collect(&mut watch, 3, Duration::from_secs(5));
    handle.stop();

    assert_eq!(payloads(&got), vec!["A", "B", "C"]);
    assert!(
        got[0].1 >= Duration::from_millis(150),
        "A published too early: {:?}",
        got[0].1
    );
    assert!(
        got[2].1 <= Duration::from_millis(2500),
        "C published too late: {:?}",
        got[2].1
    );
    assert!(store.entries(&queue).is_empty());
}

#[test]
fn close_deadlines_keep_their_order() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let mut watch = subscribe(&store, &queue);
    let handle = spawn(&store, &queue, 1.0);

    // A burst a few milliseconds apart; the later ones have negative wait
    // by the time they are popped and must still go out in score order.
    let base = now_epoch();
    produce(
        &store,
        &queue,
        &flight("QR1"),
        &[
            ("P1", base + 0.200),
            ("P2", base + 0.205),
            ("P3", base + 0.210),
            ("P4", base + 0.215),
        ],
    );

    let got = collect(&mut watch, 4, Duration::from_secs(3));
    handle.stop();

    assert_eq!(payloads(&got), vec!["P1", "P2", "P3", "P4"]);
}

#[test]
fn warp_speed_compresses_the_schedule() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let mut watch = subscribe(&store, &queue);
    let handle = spawn(&store, &queue, 4.0);

    let base = now_epoch();
    produce(
        &store,
        &queue,
        &flight("QR1"),
        &[("A", base + 1.2), ("B", base + 2.4)],
    );

    // At 4x, queue offsets of 1.2 s and 2.4 s are 0.3 s and 0.6 s real.
    let got = collect(&mut watch, 2, Duration::from_secs(3));
    handle.stop();

    assert_eq!(payloads(&got), vec!["A", "B"]);
    assert!(
        got[1].1 <= Duration::from_millis(1800),
        "warp did not compress: B at {:?}",
        got[1].1
    );
    assert!(
        got[0].1 >= Duration::from_millis(150),
        "A published too early: {:?}",
        got[0].1
    );
}

#[test]
fn hopelessly_late_entries_are_dropped() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let mut watch = subscribe(&store, &queue);
    let handle = spawn(&store, &queue, 1.0);

    let base = now_epoch();
    produce(
        &store,
        &queue,
        &flight("QR1"),
        &[("LATE", base - 30.0), ("FRESH", base + 0.4)],
    );

    let got = collect(&mut watch, 2, Duration::from_secs(2));
    handle.stop();

    assert_eq!(payloads(&got), vec!["FRESH"], "late entry must never publish");
    assert!(store.entries(&queue).is_empty());
}

#[test]
fn producer_insert_triggers_stale_sweep() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let mut watch = subscribe(&store, &queue);
    let handle = spawn(&store, &queue, 1.0);

    let base = now_epoch();
    produce(&store, &queue, &flight("QR1"), &[("KEEP", base + 1.0)]);
    // Let the dispatcher pop KEEP and start sleeping on its deadline.
    thread::sleep(Duration::from_millis(200));
    // A back-dated insert: the trimmer must sweep it without disturbing
    // the in-flight entry.
    produce(&store, &queue, &flight("QR2"), &[("STALE", base - 5.0)]);

    let got = collect(&mut watch, 2, Duration::from_secs(3));
    handle.stop();

    assert_eq!(payloads(&got), vec!["KEEP"]);
    assert!(store.entries(&queue).is_empty());
}

#[test]
fn reenqueue_replaces_members_before_dispatch() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let movement = flight("QR1");

    let base = now_epoch();
    produce(
        &store,
        &queue,
        &movement,
        &[("X", base + 0.4), ("Y", base + 0.5)],
    );
    produce(&store, &queue, &movement, &[("Z", base + 0.45)]);

    let mut watch = subscribe(&store, &queue);
    let handle = spawn(&store, &queue, 1.0);
    let got = collect(&mut watch, 2, Duration::from_secs(2));
    handle.stop();

    assert_eq!(payloads(&got), vec!["Z"], "replaced members must not publish");
}

#[test]
fn reset_changes_the_clock_for_pending_entries() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let mut watch = subscribe(&store, &queue);
    let handle = spawn(&store, &queue, 1.0);

    let base = now_epoch();
    produce(
        &store,
        &queue,
        &flight("QR1"),
        &[("A", base + 0.25), ("B", base + 1.0)],
    );

    let first = collect(&mut watch, 1, Duration::from_secs(2));
    assert_eq!(payloads(&first), vec!["A"]);

    // Halve the clock speed while B is pending; its remaining queue-time
    // distance now takes twice as long in real time.
    handle.reset(0.5, None).unwrap();

    let second = collect(&mut watch, 1, Duration::from_secs(4));
    handle.stop();

    assert_eq!(payloads(&second), vec!["B"]);
    let b_offset = first[0].1 + second[0].1;
    assert!(
        b_offset >= Duration::from_millis(1300),
        "B ignored the slower clock: {b_offset:?}"
    );
}

#[test]
fn shutdown_pushes_back_the_inflight_entry() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let handle = spawn(&store, &queue, 1.0);

    let base = now_epoch();
    produce(&store, &queue, &flight("QR1"), &[("FUTURE", base + 30.0)]);
    // Let the dispatcher pop the entry and start its deadline sleep.
    thread::sleep(Duration::from_millis(300));

    handle.stop();

    let entries = store.entries(&queue);
    assert_eq!(entries.len(), 1, "popped entry must be pushed back");
    assert_eq!(entries[0].member, "FUTURE");
    assert!((entries[0].score - (base + 30.0)).abs() < 1e-6);
    assert!(store.published().is_empty());
}

#[test]
fn push_back_survives_concurrent_removal_of_other_entries() {
    let store = MemoryStore::new();
    let queue = q("wire");
    let base = now_epoch();
    produce(
        &store,
        &queue,
        &flight("QR1"),
        &[("other-1", base + 50.0), ("other-2", base + 60.0)],
    );

    let pusher = {
        let store = store.clone();
        let queue = queue.clone();
        thread::spawn(move || {
            let mut handle = store.clone();
            for i in 0..50 {
                let entry = Entry::new(format!("held-{i}"), base + 100.0 + f64::from(i));
                handle.push_back(&queue, &entry).unwrap();
            }
        })
    };
    let remover = {
        let store = store.clone();
        let queue = queue.clone();
        thread::spawn(move || {
            let mut handle = store.clone();
            handle
                .remove_members(&queue, &["other-1".to_string(), "other-2".to_string()])
                .unwrap();
        })
    };
    pusher.join().unwrap();
    remover.join().unwrap();

    let members: Vec<String> = store.entries(&queue).into_iter().map(|e| e.member).collect();
    assert_eq!(members.len(), 50, "no pushed-back entry may be lost");
    assert!(members.iter().all(|m| m.starts_with("held-")));
}
