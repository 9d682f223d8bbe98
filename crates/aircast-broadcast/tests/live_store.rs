//! End-to-end scenarios against a real redis server.
//!
//! Ignored by default; run with a server available:
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379/ cargo test -p aircast-broadcast -- --ignored
//! ```
//!
//! Each test works in its own queue namespace so runs do not interfere.

use std::time::{Duration, Instant};

use chrono::Utc;

use aircast_broadcast::{Broadcaster, ChannelPublisher, SimClock, enqueue};
use aircast_store::{MessageWatch, RedisStore, Store};
use aircast_types::{Movement, MovementKind, QueueName, keys};

fn connect() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
    RedisStore::connect(&url).expect("redis server required for live tests")
}

fn now_epoch() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1e3
}

fn unique_queue(tag: &str) -> QueueName {
    QueueName::new(format!("livetest-{tag}-{}", std::process::id())).unwrap()
}

fn cleanup(store: &mut RedisStore, queue: &QueueName) {
    let _ = store.delete_descriptor(queue);
    let _ = store.delete_key(&keys::data_key(queue));
}

fn collect(watch: &mut Box<dyn MessageWatch>, want: usize, deadline: Duration) -> Vec<String> {
    let started = Instant::now();
    let mut got = Vec::new();
    while got.len() < want && started.elapsed() < deadline {
        if let Some(payload) = watch.next_message(Duration::from_millis(200)).unwrap() {
            got.push(payload);
        }
    }
    got
}

#[test]
#[ignore = "requires a running redis server"]
fn dispatches_in_order_over_redis() {
    let mut store = connect();
    let queue = unique_queue("order");
    cleanup(&mut store, &queue);

    let mut watch = store.subscribe_channel(&keys::channel(&queue)).unwrap();
    let publisher = Box::new(ChannelPublisher::new(
        store.try_clone().unwrap(),
        &queue,
    ));
    let handle = Broadcaster::spawn(
        queue.clone(),
        SimClock::new(None, 1.0),
        &mut store,
        publisher,
        false,
    )
    .unwrap();

    let base = now_epoch();
    let movement = Movement::new(MovementKind::Flight, format!("LIVE-{}", std::process::id()));
    enqueue::enqueue(
        &mut store,
        &queue,
        &movement,
        &[
            ("A".to_string(), base + 0.4),
            ("B".to_string(), base + 0.8),
            ("C".to_string(), base + 1.2),
        ],
    )
    .unwrap();

    let got = collect(&mut watch, 3, Duration::from_secs(6));
    handle.stop();

    assert_eq!(got, vec!["A", "B", "C"]);

    enqueue::dequeue(&mut store, &queue, &movement).unwrap();
    cleanup(&mut store, &queue);
}

#[test]
#[ignore = "requires a running redis server"]
fn upsert_replaces_members_over_redis() {
    let mut store = connect();
    let queue = unique_queue("upsert");
    cleanup(&mut store, &queue);

    let base = now_epoch();
    let movement = Movement::new(MovementKind::Flight, format!("UP-{}", std::process::id()));
    enqueue::enqueue(
        &mut store,
        &queue,
        &movement,
        &[("X".to_string(), base + 5.0), ("Y".to_string(), base + 6.0)],
    )
    .unwrap();
    enqueue::enqueue(&mut store, &queue, &movement, &[("Z".to_string(), base + 7.0)]).unwrap();

    let members = store.set_members(&movement.enqueue_key()).unwrap();
    assert_eq!(members, vec!["Z"]);
    let popped = store
        .pop_min_blocking(&queue, Duration::from_secs(1))
        .unwrap()
        .expect("one entry expected");
    assert_eq!(popped.member, "Z");
    assert!(
        store
            .pop_min_blocking(&queue, Duration::from_millis(200))
            .unwrap()
            .is_none()
    );

    enqueue::dequeue(&mut store, &queue, &movement).unwrap();
    cleanup(&mut store, &queue);
}

#[test]
#[ignore = "requires a running redis server"]
fn push_back_restores_the_entry_over_redis() {
    let mut store = connect();
    let queue = unique_queue("pushback");
    cleanup(&mut store, &queue);

    let base = now_epoch();
    let movement = Movement::new(MovementKind::Mission, format!("PB-{}", std::process::id()));
    enqueue::enqueue(
        &mut store,
        &queue,
        &movement,
        &[("HELD".to_string(), base + 120.0)],
    )
    .unwrap();

    let popped = store
        .pop_min_blocking(&queue, Duration::from_secs(1))
        .unwrap()
        .expect("entry expected");
    assert_eq!(store.queue_len(&queue).unwrap(), 0);

    store.push_back(&queue, &popped).unwrap();
    assert_eq!(store.queue_len(&queue).unwrap(), 1);
    let again = store
        .pop_min_blocking(&queue, Duration::from_secs(1))
        .unwrap()
        .expect("restored entry expected");
    assert_eq!(again.member, "HELD");
    assert!((again.score - (base + 120.0)).abs() < 1e-3);

    enqueue::dequeue(&mut store, &queue, &movement).unwrap();
    cleanup(&mut store, &queue);
}
