//! Deterministic in-process store.
//!
//! [`MemoryStore`] mirrors the backend semantics the broadcast subsystem
//! depends on — sorted sets with blocking pop-min, plain sets, string keys,
//! pub/sub, and keyspace notifications synthesized on every mutation — so
//! the whole dispatch pipeline runs in tests and local development without
//! a server. Handles cloned with [`Store::try_clone`] share one state
//! behind a single lock, which stands in for the server's linearization of
//! concurrent writers.

use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use aircast_types::{Entry, QueueDescriptor, QueueName, keys};
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::{KeyEvent, KeyspaceWatch, MessageWatch, Store, pattern_matches};

/// In-memory store sharing state across cloned handles.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    /// Signaled whenever a sorted set gains an entry.
    arrivals: Condvar,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    key_watchers: Vec<Watcher<KeyEvent>>,
    msg_watchers: Vec<Watcher<String>>,
    published: Vec<(String, String)>,
}

struct Watcher<T> {
    pattern: String,
    tx: Sender<T>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Test observation helpers (not part of the Store contract)
    // ------------------------------------------------------------------

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    /// Snapshot of a queue's entries, ascending by (score, member).
    pub fn entries(&self, queue: &QueueName) -> Vec<Entry> {
        let state = self.lock();
        let mut entries: Vec<Entry> = state
            .zsets
            .get(&keys::data_key(queue))
            .map(|zset| {
                zset.iter()
                    .map(|(member, score)| Entry::new(member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.member.cmp(&b.member))
        });
        entries
    }

    /// Returns true if any key (string, set, or sorted set) exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let state = self.lock();
        state.strings.contains_key(key)
            || state.sets.contains_key(key)
            || state.zsets.contains_key(key)
    }
}

impl State {
    fn notify(&mut self, key: &str, op: &str) {
        self.key_watchers.retain(|w| {
            if !pattern_matches(&w.pattern, key) {
                return true;
            }
            w.tx.send(KeyEvent {
                key: key.to_string(),
                op: op.to_string(),
            })
            .is_ok()
        });
    }

    /// Removes and returns the entry with the least (score, member).
    fn take_min(&mut self, data_key: &str) -> Option<Entry> {
        let zset = self.zsets.get_mut(data_key)?;
        let (member, score) = zset
            .iter()
            .min_by(|(ma, sa), (mb, sb)| sa.total_cmp(sb).then_with(|| ma.cmp(mb)))
            .map(|(m, s)| (m.clone(), *s))?;
        zset.remove(&member);
        let emptied = zset.is_empty();
        self.notify(data_key, "zpopmin");
        if emptied {
            self.zsets.remove(data_key);
            self.notify(data_key, "del");
        }
        Some(Entry { member, score })
    }

    fn zadd(&mut self, data_key: &str, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }
        let zset = self.zsets.entry(data_key.to_string()).or_default();
        for entry in entries {
            zset.insert(entry.member.clone(), entry.score);
        }
        self.notify(data_key, "zadd");
    }

    fn zrem(&mut self, data_key: &str, members: &[String]) -> usize {
        let Some(zset) = self.zsets.get_mut(data_key) else {
            return 0;
        };
        let removed = members.iter().filter(|m| zset.remove(*m).is_some()).count();
        let emptied = zset.is_empty();
        if removed > 0 {
            self.notify(data_key, "zrem");
        }
        if emptied {
            self.zsets.remove(data_key);
            self.notify(data_key, "del");
        }
        removed
    }

    fn del(&mut self, key: &str) {
        let existed = self.strings.remove(key).is_some()
            | self.sets.remove(key).is_some()
            | self.zsets.remove(key).is_some();
        if existed {
            self.notify(key, "del");
        }
    }
}

impl Store for MemoryStore {
    fn try_clone(&self) -> StoreResult<Box<dyn Store>> {
        Ok(Box::new(self.clone()))
    }

    fn put_descriptor(&mut self, desc: &QueueDescriptor) -> StoreResult<()> {
        desc.validate().map_err(|e| StoreError::Descriptor {
            name: desc.name.to_string(),
            source: e,
        })?;
        self.write_key(&keys::descriptor_key(&desc.name), &desc.to_json())
    }

    fn get_descriptor(&mut self, name: &QueueName) -> StoreResult<Option<QueueDescriptor>> {
        let blob = self.lock().strings.get(&keys::descriptor_key(name)).cloned();
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
        self.lock().del(&keys::descriptor_key(name));
        Ok(())
    }

    fn list_descriptors(&mut self) -> StoreResult<Vec<QueueDescriptor>> {
        let prefix = format!("{}{}", keys::QUEUE_PREFIX, keys::ID_SEP);
        let blobs: Vec<(String, String)> = {
            let state = self.lock();
            state
                .strings
                .iter()
                .filter(|(key, _)| {
                    key.starts_with(&prefix) && !keys::is_data_key(key) && **key != keys::quit_key()
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut descriptors = Vec::new();
        for (key, blob) in blobs {
            match QueueDescriptor::from_json(&blob) {
                Ok(desc) => descriptors.push(desc),
                Err(e) => warn!(key = %key, error = %e, "skipping malformed descriptor"),
            }
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    fn enqueue_entries(
        &mut self,
        queue: &QueueName,
        enqueue_key: &str,
        old_members: &[String],
        entries: &[Entry],
    ) -> StoreResult<()> {
        let data = keys::data_key(queue);
        let mut state = self.lock();
        if !old_members.is_empty() {
            state.zrem(&data, old_members);
            state.del(enqueue_key);
        }
        if !entries.is_empty() {
            let set = state.sets.entry(enqueue_key.to_string()).or_default();
            for entry in entries {
                set.insert(entry.member.clone());
            }
            state.notify(enqueue_key, "sadd");
            state.zadd(&data, entries);
        }
        drop(state);
        self.inner.arrivals.notify_all();
        Ok(())
    }

    fn dequeue_movement(&mut self, queue: &QueueName, enqueue_key: &str) -> StoreResult<usize> {
        let data = keys::data_key(queue);
        let mut state = self.lock();
        let members: Vec<String> = state
            .sets
            .get(enqueue_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let removed = state.zrem(&data, &members);
        state.del(enqueue_key);
        Ok(removed)
    }

    fn pop_min_blocking(
        &mut self,
        queue: &QueueName,
        timeout: Duration,
    ) -> StoreResult<Option<Entry>> {
        let data = keys::data_key(queue);
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(entry) = state.take_min(&data) {
                return Ok(Some(entry));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _timed_out) = self
                .inner
                .arrivals
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn members_up_to(&mut self, queue: &QueueName, max_score: f64) -> StoreResult<Vec<String>> {
        let data = keys::data_key(queue);
        let state = self.lock();
        let mut due: Vec<(f64, String)> = state
            .zsets
            .get(&data)
            .map(|zset| {
                zset.iter()
                    .filter(|(_, score)| **score >= 0.0 && **score <= max_score)
                    .map(|(m, s)| (*s, m.clone()))
                    .collect()
            })
            .unwrap_or_default();
        due.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(due.into_iter().map(|(_, m)| m).collect())
    }

    fn remove_members(&mut self, queue: &QueueName, members: &[String]) -> StoreResult<usize> {
        let data = keys::data_key(queue);
        Ok(self.lock().zrem(&data, members))
    }

    fn push_back(&mut self, queue: &QueueName, entry: &Entry) -> StoreResult<()> {
        let data = keys::data_key(queue);
        let scratch = keys::scratch_key(queue);
        let mut state = self.lock();
        state.notify(&scratch, "zadd");
        state
            .zsets
            .entry(data.clone())
            .or_default()
            .insert(entry.member.clone(), entry.score);
        state.notify(&data, "zunionstore");
        state.notify(&scratch, "del");
        drop(state);
        self.inner.arrivals.notify_all();
        Ok(())
    }

    fn queue_len(&mut self, queue: &QueueName) -> StoreResult<usize> {
        let data = keys::data_key(queue);
        Ok(self.lock().zsets.get(&data).map_or(0, HashMap::len))
    }

    fn set_members(&mut self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_key(&mut self, key: &str) -> StoreResult<()> {
        self.lock().del(key);
        Ok(())
    }

    fn write_key(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.strings.insert(key.to_string(), value.to_string());
        state.notify(key, "set");
        Ok(())
    }

    fn publish(&mut self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut state = self.lock();
        state
            .published
            .push((channel.to_string(), payload.to_string()));
        let mut delivered = 0;
        state.msg_watchers.retain(|w| {
            if !pattern_matches(&w.pattern, channel) {
                return true;
            }
            let ok = w.tx.send(payload.to_string()).is_ok();
            if ok {
                delivered += 1;
            }
            ok
        });
        Ok(delivered)
    }

    fn subscribe_keyspace(&mut self, pattern: &str) -> StoreResult<Box<dyn KeyspaceWatch>> {
        let (tx, rx) = mpsc::channel();
        self.lock().key_watchers.push(Watcher {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Box::new(MemoryWatch { rx }))
    }

    fn subscribe_channel(&mut self, channel: &str) -> StoreResult<Box<dyn MessageWatch>> {
        let (tx, rx) = mpsc::channel();
        self.lock().msg_watchers.push(Watcher {
            pattern: channel.to_string(),
            tx,
        });
        Ok(Box::new(MemoryWatch { rx }))
    }
}

struct MemoryWatch<T> {
    rx: Receiver<T>,
}

impl<T> MemoryWatch<T> {
    fn recv(&mut self, timeout: Duration) -> StoreResult<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::SubscriptionClosed),
        }
    }
}

impl KeyspaceWatch for MemoryWatch<KeyEvent> {
    fn next_event(&mut self, timeout: Duration) -> StoreResult<Option<KeyEvent>> {
        self.recv(timeout)
    }
}

impl MessageWatch for MemoryWatch<String> {
    fn next_message(&mut self, timeout: Duration) -> StoreResult<Option<String>> {
        self.recv(timeout)
    }
}
