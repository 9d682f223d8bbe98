//! The hypercaster: process-wide supervisor of broadcasters.
//!
//! Owns the `{queue name -> runtime}` map and all lifecycle transitions.
//! The control plane is the store itself: writing a descriptor creates or
//! reconfigures a queue, deleting it tears the queue down, and the admin
//! thread learns about both through keyspace notifications on the
//! descriptor key pattern. Setting the reserved `queues:quit` key asks the
//! admin thread to exit.
//!
//! All map mutations happen on the admin thread; broadcasters are
//! free-running and are reached only through their handles (shutdown flag,
//! reset handshake). Each broadcaster holds its descriptor's parameters by
//! value — on reset the descriptor is re-read from the store, never
//! mutated through a back-pointer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use aircast_store::{KeyspaceWatch, Store};
use aircast_types::{LISTEN_TIMEOUT, QUIT, QueueDescriptor, QueueName, keys};

use crate::broadcaster::{Broadcaster, BroadcasterHandle};
use crate::clock::SimClock;
use crate::error::{BroadcastError, BroadcastResult};
use crate::publisher::{ChannelPublisher, Publisher, UdpForwarder};

/// UDP target of the flight-simulator live feed.
#[derive(Debug, Clone)]
pub struct LiveFeedTarget {
    pub host: String,
    pub port: u16,
}

/// Runtime options for the supervisor.
#[derive(Debug, Clone, Default)]
pub struct HypercasterOptions {
    /// Emit periodic debug lines from dispatchers, trimmers, and the admin
    /// thread.
    pub heartbeat: bool,
    /// When set, the reserved live-feed queue forwards UDP datagrams to
    /// this target instead of publishing on pub/sub. When absent, that
    /// queue is not started.
    pub live_feed: Option<LiveFeedTarget>,
    /// Queues created at startup when missing: (name, formatter).
    pub default_queues: Vec<(QueueName, String)>,
}

/// Everything the supervisor knows about one queue.
struct QueueRuntime {
    descriptor: QueueDescriptor,
    handle: Option<BroadcasterHandle>,
    /// Tombstone: the descriptor was deleted; a later write resurrects it.
    deleted: bool,
}

/// The supervisor state, owned by the admin thread after startup.
pub struct Hypercaster {
    store: Box<dyn Store>,
    options: HypercasterOptions,
    queues: HashMap<QueueName, QueueRuntime>,
    shutdown: Arc<AtomicBool>,
}

impl Hypercaster {
    /// Loads all declared queues, spawns broadcasters for the running
    /// ones, and starts the admin thread.
    ///
    /// There must be at most one hypercaster per store namespace; this is
    /// the root object `main` owns.
    pub fn start(
        mut store: Box<dyn Store>,
        options: HypercasterOptions,
    ) -> BroadcastResult<HypercasterHandle> {
        // A sentinel left over from an earlier run must not kill us now.
        store.delete_key(&keys::quit_key())?;

        for (name, formatter) in &options.default_queues {
            match store.get_descriptor(name) {
                Ok(None) => {
                    debug!(%name, "creating missing default queue");
                    store.put_descriptor(&QueueDescriptor::new(name.clone(), formatter.clone()))?;
                }
                Ok(Some(_)) => {}
                Err(e) => warn!(%name, error = %e, "default queue check failed"),
            }
        }

        let watch =
            store.subscribe_keyspace(&format!("{}{}*", keys::QUEUE_PREFIX, keys::ID_SEP))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut supervisor = Hypercaster {
            store: store.try_clone()?,
            options,
            queues: HashMap::new(),
            shutdown: Arc::clone(&shutdown),
        };
        supervisor.load_existing()?;

        let started: Vec<String> = supervisor
            .queues
            .values()
            .filter(|rt| rt.handle.is_some())
            .map(|rt| rt.descriptor.name.to_string())
            .collect();
        info!(queues = ?started, "hypercaster started");

        let admin = thread::Builder::new()
            .name("aircast-admin".to_string())
            .spawn(move || supervisor.run_admin(watch))
            .map_err(|e| BroadcastError::Spawn {
                name: "aircast-admin".to_string(),
                source: e,
            })?;

        Ok(HypercasterHandle {
            shutdown,
            store: Mutex::new(store),
            admin: Some(admin),
        })
    }

    fn load_existing(&mut self) -> BroadcastResult<()> {
        let descriptors = self.store.list_descriptors()?;
        let Self {
            store,
            options,
            queues,
            ..
        } = self;
        for descriptor in descriptors {
            let handle = spawn_queue(store.as_mut(), options, &descriptor);
            queues.insert(
                descriptor.name.clone(),
                QueueRuntime {
                    descriptor,
                    handle,
                    deleted: false,
                },
            );
        }
        Ok(())
    }

    fn run_admin(mut self, mut watch: Box<dyn KeyspaceWatch>) {
        info!("admin starting");

        while !self.shutdown.load(Ordering::Relaxed) {
            if self.options.heartbeat {
                debug!("listening");
            }
            let event = match watch.next_event(LISTEN_TIMEOUT) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "admin subscription lost, shutting down");
                    break;
                }
            };
            let Some(event) = event else { continue };
            if event.op != "set" && event.op != "del" {
                continue;
            }

            // `queues:data:<name>` mutations are the broadcasters' own
            // churn; an empty sorted set disappearing is not a delete.
            if keys::is_data_key(&event.key) {
                if event.op == "del" {
                    debug!(key = %event.key, "queue has no more data");
                }
                continue;
            }
            if event.key == keys::quit_key() {
                if event.op == "set" {
                    warn!("instructed to quit");
                    self.shutdown.store(true, Ordering::Relaxed);
                }
                continue;
            }

            let name = match QueueName::new(keys::leaf(&event.key)) {
                Ok(name) => name,
                Err(e) => {
                    warn!(key = %event.key, error = %e, "ignoring key");
                    continue;
                }
            };
            match event.op.as_str() {
                "set" => self.descriptor_written(&name),
                "del" => self.descriptor_deleted(&name),
                _ => {}
            }
        }

        self.terminate_all();
        let _ = self.store.delete_key(&keys::quit_key());
        info!("admin bye");
    }

    /// A descriptor key was written: create, resurrect, start, stop, or
    /// reset the queue, depending on what changed.
    fn descriptor_written(&mut self, name: &QueueName) {
        let descriptor = match self.store.get_descriptor(name) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                debug!(%name, "descriptor vanished before it could be read");
                return;
            }
            Err(e) => {
                warn!(%name, error = %e, "unreadable descriptor, queue skipped");
                return;
            }
        };

        let Self {
            store,
            options,
            queues,
            ..
        } = self;
        match queues.get_mut(name) {
            None => {
                info!(%name, "new queue declared");
                let handle = spawn_queue(store.as_mut(), options, &descriptor);
                queues.insert(
                    name.clone(),
                    QueueRuntime {
                        descriptor,
                        handle,
                        deleted: false,
                    },
                );
            }
            Some(runtime) if runtime.deleted => {
                info!(%name, "queue was deleted, restarting");
                runtime.deleted = false;
                runtime.handle = spawn_queue(store.as_mut(), options, &descriptor);
                runtime.descriptor = descriptor;
            }
            Some(runtime) => {
                let was_running = runtime.handle.is_some();
                let previous = std::mem::replace(&mut runtime.descriptor, descriptor.clone());
                match (was_running, descriptor.status.is_running()) {
                    (true, false) => {
                        if let Some(handle) = runtime.handle.take() {
                            handle.stop();
                        }
                        debug!(%name, "queue stopped");
                    }
                    (false, true) => {
                        runtime.handle = spawn_queue(store.as_mut(), options, &descriptor);
                    }
                    (false, false) => {
                        debug!(%name, "queue updated but not started");
                    }
                    (true, true) => {
                        let starttime = match descriptor.start_datetime() {
                            Ok(starttime) => starttime,
                            Err(e) => {
                                warn!(%name, error = %e, "reset skipped");
                                return;
                            }
                        };
                        if let Some(handle) = runtime.handle.as_ref() {
                            match handle.reset(descriptor.speed, starttime) {
                                Ok(()) => debug!(
                                    %name,
                                    speed = descriptor.speed,
                                    was = previous.speed,
                                    "queue reset"
                                ),
                                Err(e) => warn!(%name, error = %e, "reset failed"),
                            }
                        }
                    }
                }
            }
        }
    }

    /// The descriptor key was deleted: terminate the broadcaster and leave
    /// a tombstone. Repeat deletes are a no-op.
    fn descriptor_deleted(&mut self, name: &QueueName) {
        match self.queues.get_mut(name) {
            Some(runtime) if !runtime.deleted => {
                if let Some(handle) = runtime.handle.take() {
                    handle.stop();
                }
                runtime.deleted = true;
                info!(%name, "queue terminated");
            }
            Some(_) => debug!(%name, "queue already deleted"),
            None => debug!(%name, "delete of unknown queue ignored"),
        }
    }

    fn terminate_all(&mut self) {
        debug!("notifying queues");
        let handles: Vec<BroadcasterHandle> = self
            .queues
            .values_mut()
            .filter_map(|runtime| runtime.handle.take())
            .collect();
        // Flag everyone first so the joins overlap the shutdowns.
        for handle in &handles {
            debug!(queue = %handle.queue(), "notifying");
            handle.shutdown();
        }
        for handle in handles {
            handle.join();
        }
    }
}

/// Spawns a broadcaster for a runnable descriptor, picking the publish
/// path. Returns `None` (with a log) when the queue should not or cannot
/// start; the supervisor keeps running either way.
fn spawn_queue(
    store: &mut dyn Store,
    options: &HypercasterOptions,
    descriptor: &QueueDescriptor,
) -> Option<BroadcasterHandle> {
    let name = &descriptor.name;
    if !descriptor.status.is_running() {
        warn!(%name, "queue is stopped");
        return None;
    }
    let starttime = match descriptor.start_datetime() {
        Ok(starttime) => starttime,
        Err(e) => {
            warn!(%name, error = %e, "queue skipped");
            return None;
        }
    };
    let clock = SimClock::new(starttime, descriptor.speed);

    let publisher: Box<dyn Publisher> = if name.is_livetraffic() {
        let Some(target) = &options.live_feed else {
            debug!(%name, "live feed disabled, queue not started");
            return None;
        };
        match UdpForwarder::new(target.host.clone(), target.port) {
            Ok(forwarder) => {
                debug!(%name, host = %target.host, port = target.port, "live feed forwarder ready");
                Box::new(forwarder)
            }
            Err(e) => {
                warn!(%name, error = %e, "live feed socket failed, queue not started");
                return None;
            }
        }
    } else {
        match store.try_clone() {
            Ok(publish_store) => Box::new(ChannelPublisher::new(publish_store, name)),
            Err(e) => {
                warn!(%name, error = %e, "publisher connection failed, queue not started");
                return None;
            }
        }
    };

    match Broadcaster::spawn(
        name.clone(),
        clock,
        store,
        publisher,
        options.heartbeat,
    ) {
        Ok(handle) => {
            info!(%name, speed = descriptor.speed, "queue started");
            Some(handle)
        }
        Err(e) => {
            warn!(%name, error = %e, "failed to start queue");
            None
        }
    }
}

/// Handle to a running hypercaster.
pub struct HypercasterHandle {
    shutdown: Arc<AtomicBool>,
    store: Mutex<Box<dyn Store>>,
    admin: Option<JoinHandle<()>>,
}

impl HypercasterHandle {
    /// Initiates shutdown: flips the flag and writes the quit sentinel so
    /// the admin thread unblocks promptly. The admin thread then stops
    /// every broadcaster before exiting.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = store.write_key(&keys::quit_key(), QUIT) {
            warn!(error = %e, "could not write quit sentinel");
        }
    }

    /// Waits for the admin thread (and with it every broadcaster) to exit.
    pub fn join(mut self) {
        self.join_inner();
    }

    /// Shutdown and join in one step.
    pub fn stop(self) {
        self.shutdown();
        self.join();
    }

    pub fn is_running(&self) -> bool {
        self.admin.as_ref().is_some_and(|admin| !admin.is_finished())
    }

    fn join_inner(&mut self) {
        if let Some(admin) = self.admin.take() {
            let _ = admin.join();
        }
    }
}

impl Drop for HypercasterHandle {
    fn drop(&mut self) {
        if self.admin.is_some() {
            self.shutdown();
            self.join_inner();
        }
    }
}
