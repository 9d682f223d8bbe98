//! Hypercaster lifecycle against the in-memory store.
//!
//! The control plane is the store: these tests create, reconfigure, and
//! delete queues purely by writing descriptor keys, and watch the
//! supervisor react through keyspace notifications.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use aircast_broadcast::{Hypercaster, HypercasterHandle, HypercasterOptions, enqueue};
use aircast_store::{MemoryStore, MessageWatch, Store};
use aircast_types::{
    Movement, MovementKind, QueueDescriptor, QueueName, QueueStatus, keys,
};

fn q(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

fn now_epoch() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1e3
}

fn start(store: &MemoryStore, options: HypercasterOptions) -> HypercasterHandle {
    Hypercaster::start(Box::new(store.clone()), options).unwrap()
}

fn declare(store: &MemoryStore, name: &QueueName) {
    let mut handle = store.clone();
    handle
        .put_descriptor(&QueueDescriptor::new(name.clone(), "wire"))
        .unwrap();
}

fn produce(store: &MemoryStore, queue: &QueueName, points: &[(&str, f64)]) {
    let mut handle = store.clone();
    let movement = Movement::new(MovementKind::Service, "fuel-07");
    let owned: Vec<(String, f64)> = points
        .iter()
        .map(|(payload, ts)| ((*payload).to_string(), *ts))
        .collect();
    enqueue::enqueue(&mut handle, queue, &movement, &owned).unwrap();
}

fn subscribe(store: &MemoryStore, queue: &QueueName) -> Box<dyn MessageWatch> {
    let mut handle = store.clone();
    handle.subscribe_channel(&keys::channel(queue)).unwrap()
}

fn collect(watch: &mut Box<dyn MessageWatch>, want: usize, deadline: Duration) -> Vec<String> {
    let started = Instant::now();
    let mut got = Vec::new();
    while got.len() < want && started.elapsed() < deadline {
        if let Some(payload) = watch.next_message(Duration::from_millis(100)).unwrap() {
            got.push(payload);
        }
    }
    got
}

#[test]
fn starts_declared_queues_and_dispatches() {
    let store = MemoryStore::new();
    let queue = q("wire");
    declare(&store, &queue);

    let mut watch = subscribe(&store, &queue);
    let handle = start(&store, HypercasterOptions::default());

    let base = now_epoch();
    produce(&store, &queue, &[("HELLO", base + 0.3)]);

    let got = collect(&mut watch, 1, Duration::from_secs(3));
    handle.stop();

    assert_eq!(got, vec!["HELLO"]);
}

#[test]
fn creates_missing_default_queues() {
    let store = MemoryStore::new();
    let options = HypercasterOptions {
        default_queues: vec![(q("wire"), "wire".to_string()), (q("raw"), "flat".to_string())],
        ..Default::default()
    };

    let handle = start(&store, options);

    let mut reader = store.clone();
    let wire = reader.get_descriptor(&q("wire")).unwrap().unwrap();
    assert_eq!(wire.formatter_name, "wire");
    assert_eq!(wire.status, QueueStatus::Run);
    assert!(reader.get_descriptor(&q("raw")).unwrap().is_some());

    handle.stop();
}

#[test]
fn descriptor_write_creates_queue_at_runtime() {
    let store = MemoryStore::new();
    let queue = q("arrivals");
    let mut watch = subscribe(&store, &queue);

    let handle = start(&store, HypercasterOptions::default());

    // No queue yet; declaring one through the store is all it takes.
    declare(&store, &queue);
    thread::sleep(Duration::from_millis(200));

    let base = now_epoch();
    produce(&store, &queue, &[("NEW", base + 0.4)]);

    let got = collect(&mut watch, 1, Duration::from_secs(3));
    handle.stop();

    assert_eq!(got, vec!["NEW"]);
}

#[test]
fn delete_cascades_and_recreate_resumes() {
    let store = MemoryStore::new();
    let queue = q("wire");
    declare(&store, &queue);

    let mut watch = subscribe(&store, &queue);
    let handle = start(&store, HypercasterOptions::default());

    let base = now_epoch();
    produce(&store, &queue, &[("BEFORE", base + 0.2)]);
    assert_eq!(
        collect(&mut watch, 1, Duration::from_secs(3)),
        vec!["BEFORE"]
    );

    // Deleting the descriptor stops the broadcaster.
    {
        let mut admin = store.clone();
        admin.delete_descriptor(&queue).unwrap();
    }
    thread::sleep(Duration::from_millis(300));

    // Enqueues keep accumulating, but nothing is published.
    let base = now_epoch();
    produce(&store, &queue, &[("PENDING", base + 2.0)]);
    let silent = collect(&mut watch, 1, Duration::from_millis(700));
    assert!(silent.is_empty(), "published while deleted: {silent:?}");
    assert_eq!(store.entries(&queue).len(), 1);

    // Deleting again is a no-op.
    {
        let mut admin = store.clone();
        admin.delete_descriptor(&queue).unwrap();
    }

    // Re-creating the descriptor resumes dispatch of pending entries.
    declare(&store, &queue);
    let got = collect(&mut watch, 1, Duration::from_secs(4));
    handle.stop();

    assert_eq!(got, vec!["PENDING"]);
}

#[test]
fn stop_status_parks_the_queue_until_run() {
    let store = MemoryStore::new();
    let queue = q("wire");
    declare(&store, &queue);

    let mut watch = subscribe(&store, &queue);
    let handle = start(&store, HypercasterOptions::default());

    // Park the queue.
    {
        let mut admin = store.clone();
        let mut descriptor = admin.get_descriptor(&queue).unwrap().unwrap();
        descriptor.status = QueueStatus::Stop;
        admin.put_descriptor(&descriptor).unwrap();
    }
    thread::sleep(Duration::from_millis(300));

    let base = now_epoch();
    produce(&store, &queue, &[("HELD", base + 2.0)]);
    let silent = collect(&mut watch, 1, Duration::from_millis(700));
    assert!(silent.is_empty(), "published while stopped: {silent:?}");

    // Resume it.
    {
        let mut admin = store.clone();
        let mut descriptor = admin.get_descriptor(&queue).unwrap().unwrap();
        descriptor.status = QueueStatus::Run;
        admin.put_descriptor(&descriptor).unwrap();
    }

    let got = collect(&mut watch, 1, Duration::from_secs(4));
    handle.stop();

    assert_eq!(got, vec!["HELD"]);
}

#[test]
fn descriptor_rewrite_resets_the_clock() {
    let store = MemoryStore::new();
    let queue = q("wire");
    declare(&store, &queue);

    let mut watch = subscribe(&store, &queue);
    let handle = start(&store, HypercasterOptions::default());

    let base = now_epoch();
    produce(&store, &queue, &[("A", base + 0.25), ("B", base + 1.0)]);

    let started = Instant::now();
    assert_eq!(collect(&mut watch, 1, Duration::from_secs(2)), vec!["A"]);

    // Rewriting the descriptor with a new speed resets the live clock;
    // at half speed B's remaining distance doubles in real time.
    {
        let mut admin = store.clone();
        let mut descriptor = admin.get_descriptor(&queue).unwrap().unwrap();
        descriptor.speed = 0.5;
        admin.put_descriptor(&descriptor).unwrap();
    }

    let got = collect(&mut watch, 1, Duration::from_secs(5));
    let elapsed = started.elapsed();
    handle.stop();

    assert_eq!(got, vec!["B"]);
    assert!(
        elapsed >= Duration::from_millis(1300),
        "B ignored the reset clock: {elapsed:?}"
    );
}

#[test]
fn quit_sentinel_stops_the_admin_thread() {
    let store = MemoryStore::new();
    declare(&store, &q("wire"));
    let handle = start(&store, HypercasterOptions::default());
    assert!(handle.is_running());

    {
        let mut admin = store.clone();
        admin.write_key(&keys::quit_key(), "quit").unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while handle.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(!handle.is_running(), "admin thread did not exit on sentinel");
    assert!(!store.contains_key(&keys::quit_key()), "sentinel not cleaned up");
    handle.join();
}

#[test]
fn livetraffic_queue_is_skipped_without_feed_config() {
    let store = MemoryStore::new();
    let queue = q("lt");
    declare(&store, &queue);

    let mut watch = subscribe(&store, &queue);
    let handle = start(&store, HypercasterOptions::default());

    let base = now_epoch();
    produce(&store, &queue, &[("TRAFFIC", base + 0.2)]);
    let silent = collect(&mut watch, 1, Duration::from_millis(700));
    handle.stop();

    assert!(silent.is_empty(), "feed queue must not publish when disabled");
}
