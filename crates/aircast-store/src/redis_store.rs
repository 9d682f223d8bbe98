//! Redis-backed store.
//!
//! One [`RedisStore`] per worker thread: blocking pops and subscriptions
//! hold the connection for seconds at a time, so handles are never shared.
//! [`Store::try_clone`] opens a fresh connection from the same client.
//!
//! Subscriptions run on a dedicated forwarding thread per watch, because
//! the sync client ties the pub/sub state to a connection borrow. The
//! thread applies the read timeout and exits when the watch is dropped or
//! the subscriber side disconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use redis::{Client, Commands, Connection, Msg};
use tracing::{debug, warn};

use aircast_types::{Entry, LISTEN_TIMEOUT, QueueDescriptor, QueueName, keys};

use crate::error::{StoreError, StoreResult};
use crate::{KeyEvent, KeyspaceWatch, MessageWatch, Store};

/// Connection attempts before giving up at init.
const CONNECT_ATTEMPTS: u32 = 10;

/// First backoff delay; doubles per attempt, capped at [`BACKOFF_CAP`].
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Keyspace notification classes the subsystem needs: generic (`del`),
/// string (`set`), and sorted-set (`zadd`) commands.
const NOTIFY_FLAGS: &str = "Kg$z";

/// Store backed by a redis server.
pub struct RedisStore {
    client: Client,
    con: Connection,
}

impl RedisStore {
    /// Connects with exponential backoff and makes sure keyspace
    /// notifications are enabled.
    ///
    /// Fails if the server stays unreachable for [`CONNECT_ATTEMPTS`]
    /// attempts, or if notifications cannot be enabled nor are already
    /// configured.
    pub fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let mut con = connect_with_backoff(&client)?;
        enable_notifications(&mut con)?;
        Ok(Self { client, con })
    }

    fn data_key(queue: &QueueName) -> String {
        keys::data_key(queue)
    }
}

fn connect_with_backoff(client: &Client) -> StoreResult<Connection> {
    let mut delay = BACKOFF_START;
    let mut attempt = 1;
    loop {
        match client.get_connection() {
            Ok(con) => return Ok(con),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "store unreachable, retrying");
                thread::sleep(delay);
                delay = (delay * 2).min(BACKOFF_CAP);
                attempt += 1;
            }
            Err(e) => {
                return Err(StoreError::Connect {
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}

/// Turns on the notification classes we need, or verifies the operator
/// already did (managed servers often refuse CONFIG SET).
fn enable_notifications(con: &mut Connection) -> StoreResult<()> {
    let set: redis::RedisResult<()> = redis::cmd("CONFIG")
        .arg("SET")
        .arg("notify-keyspace-events")
        .arg(NOTIFY_FLAGS)
        .query(con);
    if set.is_ok() {
        debug!(flags = NOTIFY_FLAGS, "keyspace notifications enabled");
        return Ok(());
    }

    let current: Vec<String> = redis::cmd("CONFIG")
        .arg("GET")
        .arg("notify-keyspace-events")
        .query(con)?;
    let value = current.get(1).cloned().unwrap_or_default();
    let classes_ok =
        value.contains('A') || (value.contains('g') && value.contains('$') && value.contains('z'));
    if value.contains('K') && classes_ok {
        debug!(flags = %value, "keyspace notifications already configured");
        Ok(())
    } else {
        Err(StoreError::NotificationsUnavailable { found: value })
    }
}

impl Store for RedisStore {
    fn try_clone(&self) -> StoreResult<Box<dyn Store>> {
        let con = self.client.get_connection()?;
        Ok(Box::new(RedisStore {
            client: self.client.clone(),
            con,
        }))
    }

    fn put_descriptor(&mut self, desc: &QueueDescriptor) -> StoreResult<()> {
        desc.validate().map_err(|e| StoreError::Descriptor {
            name: desc.name.to_string(),
            source: e,
        })?;
        let () = self
            .con
            .set(keys::descriptor_key(&desc.name), desc.to_json())?;
        Ok(())
    }

    fn get_descriptor(&mut self, name: &QueueName) -> StoreResult<Option<QueueDescriptor>> {
        let blob: Option<String> = self.con.get(keys::descriptor_key(name))?;
        match blob {
            None => Ok(None),
            Some(blob) => QueueDescriptor::from_json(&blob)
                .map(Some)
                .map_err(|e| StoreError::Descriptor {
                    name: name.to_string(),
                    source: e,
                }),
        }
    }

    fn delete_descriptor(&mut self, name: &QueueName) -> StoreResult<()> {
        let _: usize = self.con.del(keys::descriptor_key(name))?;
        Ok(())
    }

    fn list_descriptors(&mut self) -> StoreResult<Vec<QueueDescriptor>> {
        let pattern = format!("{}{}*", keys::QUEUE_PREFIX, keys::ID_SEP);
        let found: Vec<String> = self.con.keys(pattern)?;
        let mut descriptors = Vec::new();
        for key in found {
            if keys::is_data_key(&key) || key == keys::quit_key() {
                continue;
            }
            let blob: Option<String> = self.con.get(&key)?;
            let Some(blob) = blob else { continue };
            match QueueDescriptor::from_json(&blob) {
                Ok(desc) => descriptors.push(desc),
                Err(e) => warn!(key = %key, error = %e, "skipping malformed descriptor"),
            }
        }
        Ok(descriptors)
    }

    fn enqueue_entries(
        &mut self,
        queue: &QueueName,
        enqueue_key: &str,
        old_members: &[String],
        entries: &[Entry],
    ) -> StoreResult<()> {
        if old_members.is_empty() && entries.is_empty() {
            return Ok(());
        }
        let data = Self::data_key(queue);
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !old_members.is_empty() {
            pipe.zrem(&data, old_members).ignore();
            pipe.del(enqueue_key).ignore();
        }
        if !entries.is_empty() {
            let members: Vec<&str> = entries.iter().map(|e| e.member.as_str()).collect();
            let scored: Vec<(f64, &str)> =
                entries.iter().map(|e| (e.score, e.member.as_str())).collect();
            pipe.sadd(enqueue_key, members).ignore();
            pipe.zadd_multiple(&data, &scored).ignore();
        }
        let () = pipe.query(&mut self.con)?;
        Ok(())
    }

    fn dequeue_movement(&mut self, queue: &QueueName, enqueue_key: &str) -> StoreResult<usize> {
        let members: Vec<String> = self.con.smembers(enqueue_key)?;
        if members.is_empty() {
            let _: usize = self.con.del(enqueue_key)?;
            return Ok(0);
        }
        let data = Self::data_key(queue);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(&data, &members);
        pipe.del(enqueue_key).ignore();
        let (removed,): (usize,) = pipe.query(&mut self.con)?;
        Ok(removed)
    }

    fn pop_min_blocking(
        &mut self,
        queue: &QueueName,
        timeout: Duration,
    ) -> StoreResult<Option<Entry>> {
        let popped: Option<(String, String, f64)> = self
            .con
            .bzpopmin(Self::data_key(queue), timeout.as_secs_f64())?;
        Ok(popped.map(|(_key, member, score)| Entry { member, score }))
    }

    fn members_up_to(&mut self, queue: &QueueName, max_score: f64) -> StoreResult<Vec<String>> {
        let members: Vec<String> = self
            .con
            .zrangebyscore(Self::data_key(queue), 0f64, max_score)?;
        Ok(members)
    }

    fn remove_members(&mut self, queue: &QueueName, members: &[String]) -> StoreResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let removed: usize = self.con.zrem(Self::data_key(queue), members)?;
        Ok(removed)
    }

    fn push_back(&mut self, queue: &QueueName, entry: &Entry) -> StoreResult<()> {
        let data = Self::data_key(queue);
        let scratch = keys::scratch_key(queue);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zadd(&scratch, &entry.member, entry.score).ignore();
        pipe.zunionstore(&data, &[data.as_str(), scratch.as_str()])
            .ignore();
        pipe.del(&scratch).ignore();
        let () = pipe.query(&mut self.con)?;
        Ok(())
    }

    fn queue_len(&mut self, queue: &QueueName) -> StoreResult<usize> {
        let len: usize = self.con.zcard(Self::data_key(queue))?;
        Ok(len)
    }

    fn set_members(&mut self, key: &str) -> StoreResult<Vec<String>> {
        let members: Vec<String> = self.con.smembers(key)?;
        Ok(members)
    }

    fn delete_key(&mut self, key: &str) -> StoreResult<()> {
        let _: usize = self.con.del(key)?;
        Ok(())
    }

    fn write_key(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let () = self.con.set(key, value)?;
        Ok(())
    }

    fn publish(&mut self, channel: &str, payload: &str) -> StoreResult<usize> {
        let receivers: usize = self.con.publish(channel, payload)?;
        Ok(receivers)
    }

    fn subscribe_keyspace(&mut self, pattern: &str) -> StoreResult<Box<dyn KeyspaceWatch>> {
        let db = self.client.get_connection_info().redis.db;
        let channel = format!("__keyspace@{db}__:{pattern}");
        let sub = Subscription::spawn(&self.client, channel, |msg| {
            let chan = msg.get_channel_name().to_string();
            let op: String = msg.get_payload().ok()?;
            let key = chan.split_once(':')?.1.to_string();
            Some(KeyEvent { key, op })
        })?;
        Ok(Box::new(sub))
    }

    fn subscribe_channel(&mut self, channel: &str) -> StoreResult<Box<dyn MessageWatch>> {
        let sub = Subscription::spawn(&self.client, channel.to_string(), |msg| {
            msg.get_payload::<String>().ok()
        })?;
        Ok(Box::new(sub))
    }
}

/// A pub/sub subscription serviced by a forwarding thread.
struct Subscription<T> {
    rx: Receiver<T>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Subscription<T> {
    /// Opens a dedicated connection, subscribes (psubscribe when the target
    /// contains a glob), and forwards mapped messages until dropped.
    ///
    /// Subscription errors surface here, not on the first `recv`.
    fn spawn(
        client: &Client,
        target: String,
        map: impl Fn(&Msg) -> Option<T> + Send + 'static,
    ) -> StoreResult<Self> {
        let mut con = client.get_connection()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name(format!("aircast-sub-{}", keys::leaf(&target)))
            .spawn(move || {
                let mut pubsub = con.as_pubsub();
                let setup = if target.contains('*') {
                    pubsub.psubscribe(&target)
                } else {
                    pubsub.subscribe(&target)
                }
                .and_then(|()| pubsub.set_read_timeout(Some(LISTEN_TIMEOUT)));
                let ok = setup.is_ok();
                let _ = ready_tx.send(setup);
                if !ok {
                    return;
                }
                while !stop_flag.load(Ordering::Relaxed) {
                    match pubsub.get_message() {
                        Ok(msg) => {
                            if let Some(item) = map(&msg)
                                && tx.send(item).is_err()
                            {
                                break;
                            }
                        }
                        Err(e) if e.is_timeout() => {}
                        Err(e) => {
                            warn!(target = %target, error = %e, "subscription lost");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| StoreError::Backend(redis::RedisError::from(e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                rx,
                stop,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(StoreError::Backend(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(StoreError::SubscriptionClosed)
            }
        }
    }

    fn recv(&mut self, timeout: Duration) -> StoreResult<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::SubscriptionClosed),
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl KeyspaceWatch for Subscription<KeyEvent> {
    fn next_event(&mut self, timeout: Duration) -> StoreResult<Option<KeyEvent>> {
        self.recv(timeout)
    }
}

impl MessageWatch for Subscription<String> {
    fn next_message(&mut self, timeout: Duration) -> StoreResult<Option<String>> {
        self.recv(timeout)
    }
}
