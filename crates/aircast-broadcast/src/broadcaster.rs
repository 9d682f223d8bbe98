//! Per-queue dispatcher.
//!
//! One broadcaster per queue, two threads: the dispatcher pops the earliest
//! entry, sleeps until its deadline in queue-time, and hands the payload to
//! its [`Publisher`]; the trimmer (see [`crate::trimmer`]) expires stale
//! entries whenever a producer inserts. Dispatcher, trimmer, and supervisor
//! rendezvous through one-shot latches held in the [`Shared`] state:
//!
//! - the *wake* latch interrupts the dispatcher's deadline sleep;
//! - a pending [`TrimRequest`] parks the dispatcher while the trimmer
//!   sweeps;
//! - a pending [`ResetRequest`] makes the dispatcher swap in a new clock
//!   between publishes.
//!
//! A popped entry is never lost: if the sleep is interrupted — trim, reset,
//! or shutdown — the entry goes back into the sorted set before the request
//! is serviced. The push-back routes through a scratch key merged with
//! ZUNIONSTORE so it cannot race the trimmer's removal of the same member.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, error, info, warn};

use aircast_store::Store;
use aircast_types::{Entry, LISTEN_TIMEOUT, MAX_BACKLOG_SECS, QueueName, ZPOPMIN_TIMEOUT, keys};

use crate::clock::SimClock;
use crate::error::{BroadcastError, BroadcastResult};
use crate::latch::Latch;
use crate::publisher::Publisher;
use crate::trimmer::{self, trim_sweep};

/// Push-back attempts before an entry is declared lost.
const PUSH_BACK_ATTEMPTS: u32 = 3;

/// State shared between a queue's dispatcher, trimmer, and the supervisor.
pub(crate) struct Shared {
    pub(crate) queue: QueueName,
    shutdown: AtomicBool,
    /// The latch the dispatcher's deadline sleep blocks on. Replaced by
    /// whichever party completes a handshake.
    wake: Mutex<Arc<Latch>>,
    trim: Mutex<Option<TrimRequest>>,
    reset: Mutex<Option<ResetRequest>>,
    clock: RwLock<SimClock>,
    total_sent: AtomicU64,
}

/// Trimmer asks the dispatcher to stop popping.
pub(crate) struct TrimRequest {
    /// Set by the dispatcher once it has parked.
    pub(crate) paused: Arc<Latch>,
    /// Set by the trimmer once the sweep is done and a fresh wake latch is
    /// in place.
    pub(crate) resume: Arc<Latch>,
}

/// Supervisor asks the dispatcher to adopt new clock parameters.
struct ResetRequest {
    speed: f64,
    starttime: Option<DateTime<FixedOffset>>,
    /// Set by the dispatcher once the new clock is live.
    done: Arc<Latch>,
}

impl Shared {
    fn new(queue: QueueName, clock: SimClock) -> Self {
        Self {
            queue,
            shutdown: AtomicBool::new(false),
            wake: Mutex::new(Latch::new()),
            trim: Mutex::new(None),
            reset: Mutex::new(None),
            clock: RwLock::new(clock),
            total_sent: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake();
    }

    /// Sets the current wake latch, interrupting a deadline sleep.
    pub(crate) fn wake(&self) {
        self.wake_latch().set();
    }

    fn wake_latch(&self) -> Arc<Latch> {
        Arc::clone(&self.wake.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs a fresh wake latch. Called by the party completing a
    /// handshake, before it releases the dispatcher.
    pub(crate) fn replace_wake(&self) {
        *self.wake.lock().unwrap_or_else(PoisonError::into_inner) = Latch::new();
    }

    pub(crate) fn deposit_trim(&self, request: TrimRequest) {
        *self.trim.lock().unwrap_or_else(PoisonError::into_inner) = Some(request);
    }

    fn take_trim(&self) -> Option<TrimRequest> {
        self.trim.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn deposit_reset(&self, request: ResetRequest) {
        *self.reset.lock().unwrap_or_else(PoisonError::into_inner) = Some(request);
    }

    fn take_reset(&self) -> Option<ResetRequest> {
        self.reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn install_clock(&self, clock: SimClock) {
        *self.clock.write().unwrap_or_else(PoisonError::into_inner) = clock;
    }

    pub(crate) fn queue_now(&self) -> f64 {
        self.clock
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .queue_now()
    }

    pub(crate) fn queue_now_iso(&self) -> String {
        self.clock
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .queue_now_iso()
    }

    fn speed(&self) -> f64 {
        self.clock
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .speed()
    }
}

/// Spawns the dispatcher and trimmer threads for one queue.
pub struct Broadcaster;

impl Broadcaster {
    /// Starts broadcasting `queue` with the given clock and publish target.
    ///
    /// `store` acts as a connection factory: the dispatcher and trimmer
    /// each get their own handle, and the trimmer's keyspace subscription
    /// is opened here so startup failures surface to the caller.
    pub fn spawn(
        queue: QueueName,
        clock: SimClock,
        store: &mut dyn Store,
        publisher: Box<dyn Publisher>,
        heartbeat: bool,
    ) -> BroadcastResult<BroadcasterHandle> {
        let shared = Arc::new(Shared::new(queue.clone(), clock));
        let dispatcher_store = store.try_clone()?;
        let trimmer_store = store.try_clone()?;
        let watch = store.subscribe_keyspace(&keys::data_key(&queue))?;

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("cast-{queue}"))
                .spawn(move || run_dispatcher(dispatcher_store, publisher, &shared, heartbeat))
                .map_err(|e| BroadcastError::Spawn {
                    name: format!("cast-{queue}"),
                    source: e,
                })?
        };
        let trimmer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("trim-{queue}"))
                .spawn(move || trimmer::run_trimmer(trimmer_store, watch, &shared, heartbeat))
                .map_err(|e| BroadcastError::Spawn {
                    name: format!("trim-{queue}"),
                    source: e,
                })?
        };

        Ok(BroadcasterHandle {
            shared,
            dispatcher: Some(dispatcher),
            trimmer: Some(trimmer),
        })
    }
}

/// Handle to a running broadcaster, owned by the supervisor.
pub struct BroadcasterHandle {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
    trimmer: Option<JoinHandle<()>>,
}

impl BroadcasterHandle {
    pub fn queue(&self) -> &QueueName {
        &self.shared.queue
    }

    /// Payloads published since start.
    pub fn total_sent(&self) -> u64 {
        self.shared.total_sent.load(Ordering::Relaxed)
    }

    /// Flags both threads to exit and interrupts any deadline sleep.
    /// Returns without waiting; pair with [`BroadcasterHandle::join`].
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Waits for both threads to exit.
    pub fn join(mut self) {
        self.join_inner();
    }

    /// Shutdown and join in one step.
    pub fn stop(self) {
        self.shutdown();
        self.join();
    }

    /// Hands the dispatcher new clock parameters and waits until they are
    /// live. Queue contents survive; the next publication uses the new
    /// clock.
    pub fn reset(
        &self,
        speed: f64,
        starttime: Option<DateTime<FixedOffset>>,
    ) -> BroadcastResult<()> {
        debug!(queue = %self.shared.queue, speed, "requesting reset");
        let done = Latch::new();
        self.shared.deposit_reset(ResetRequest {
            speed,
            starttime,
            done: Arc::clone(&done),
        });
        self.shared.wake();

        // The dispatcher notices within one pop timeout; allow a few in
        // case it is mid-handshake with the trimmer.
        for _ in 0..3 {
            if done.wait_timeout(ZPOPMIN_TIMEOUT + Duration::from_secs(1)) {
                return Ok(());
            }
            if self.dispatcher.as_ref().is_none_or(JoinHandle::is_finished) {
                break;
            }
        }
        Err(BroadcastError::HandshakeTimeout {
            queue: self.shared.queue.clone(),
            operation: "reset",
        })
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.trimmer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BroadcasterHandle {
    fn drop(&mut self) {
        self.shared.request_shutdown();
        self.join_inner();
    }
}

fn run_dispatcher(
    mut store: Box<dyn Store>,
    mut publisher: Box<dyn Publisher>,
    shared: &Shared,
    heartbeat: bool,
) {
    let queue = shared.queue.clone();

    // Entries inserted while no broadcaster was running may already be
    // stale in queue-time.
    debug!(%queue, "pre-start trimming");
    trim_sweep(store.as_mut(), shared, "init");

    info!(%queue, "broadcast starting");
    let mut error_streak = 0u32;

    while !shared.is_shutdown() {
        if service_trim(shared) || service_reset(shared) {
            continue;
        }

        let popped = match store.pop_min_blocking(&queue, ZPOPMIN_TIMEOUT) {
            Ok(popped) => {
                error_streak = 0;
                popped
            }
            Err(e) => {
                error_streak += 1;
                let delay = backoff_delay(error_streak);
                warn!(%queue, error = %e, delay_ms = delay.as_millis() as u64, "pop failed, backing off");
                thread::sleep(delay);
                continue;
            }
        };
        let Some(entry) = popped else {
            // The heartbeat of an idle queue.
            if heartbeat {
                debug!(%queue, queue_time = %shared.queue_now_iso(), "nothing to send, pop timed out");
            }
            continue;
        };

        let wait_queue = entry.score - shared.queue_now();
        let wait_real = wait_queue / shared.speed();

        if wait_queue < MAX_BACKLOG_SECS {
            // Hopelessly late; its siblings likely are too. Not pushed
            // back, not published.
            debug!(%queue, score = entry.score, behind_secs = -wait_queue, "popped stale event, sweeping");
            trim_sweep(store.as_mut(), shared, "older");
            continue;
        }
        if wait_queue < 0.0 {
            // Slightly behind, e.g. two events a few millis apart.
            debug!(%queue, behind_secs = -wait_queue, "older event, catching up");
        }

        let wake = shared.wake_latch();
        let interrupted = if wait_real > 0.0 {
            wake.wait_timeout(Duration::from_secs_f64(wait_real))
        } else {
            wake.is_set()
        };

        if !interrupted {
            match publisher.publish(&entry.member) {
                Ok(()) => {
                    shared.total_sent.fetch_add(1, Ordering::Relaxed);
                }
                // Payloads are time-valued; freshness beats delivery.
                Err(e) => warn!(%queue, error = %e, "publish failed, entry dropped"),
            }
            continue;
        }

        // Interrupted: put the entry back before serving whoever woke us.
        push_back_with_retry(store.as_mut(), &queue, &entry);
        if shared.is_shutdown() {
            break;
        }
        if service_trim(shared) || service_reset(shared) {
            continue;
        }
        warn!(%queue, "woken with no pending request");
        shared.replace_wake();
    }

    info!(%queue, total_sent = shared.total_sent.load(Ordering::Relaxed), "broadcast bye");
}

/// Serves a pending trim request: park, and stay parked until the trimmer
/// has swept and re-armed the wake latch.
fn service_trim(shared: &Shared) -> bool {
    let Some(request) = shared.take_trim() else {
        return false;
    };
    debug!(queue = %shared.queue, "parked for trim");
    request.paused.set();
    while !request.resume.wait_timeout(LISTEN_TIMEOUT) {
        if shared.is_shutdown() {
            return true;
        }
    }
    debug!(queue = %shared.queue, "trim completed, restarting");
    true
}

/// Serves a pending reset request: swap the clock, re-arm the wake latch,
/// release the supervisor.
fn service_reset(shared: &Shared) -> bool {
    let Some(request) = shared.take_reset() else {
        return false;
    };
    let clock = SimClock::new(request.starttime, request.speed);
    shared.install_clock(clock);
    shared.replace_wake();
    info!(queue = %shared.queue, speed = request.speed, "reset completed");
    request.done.set();
    true
}

fn push_back_with_retry(store: &mut dyn Store, queue: &QueueName, entry: &Entry) {
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=PUSH_BACK_ATTEMPTS {
        match store.push_back(queue, entry) {
            Ok(()) => {
                debug!(%queue, "popped event pushed back");
                return;
            }
            Err(e) if attempt < PUSH_BACK_ATTEMPTS => {
                warn!(%queue, attempt, error = %e, "push back failed, retrying");
                thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => {
                error!(%queue, member = %entry.member, score = entry.score, error = %e, "push back failed, event lost");
            }
        }
    }
}

fn backoff_delay(streak: u32) -> Duration {
    let exp = streak.min(6);
    Duration::from_millis(100 * (1 << exp))
}
