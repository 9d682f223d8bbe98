//! Queue trimming.
//!
//! Producers are free to insert events dated in the past — back-dated
//! replays, late-arriving plans. Publishing those is nonsense, so each
//! broadcaster runs a trimmer thread that watches the queue's sorted-set
//! key for inserts and discards every entry already due in queue-time.
//!
//! The sweep must not race the dispatcher's blocking pop (the pop would
//! invalidate the range scan), so the trimmer first parks the dispatcher
//! through the [`TrimRequest`] handshake, sweeps, re-arms the wake latch,
//! and releases it.

use tracing::{debug, info, warn};

use aircast_store::{KeyspaceWatch, Store};
use aircast_types::LISTEN_TIMEOUT;

use crate::broadcaster::{Shared, TrimRequest};
use crate::latch::Latch;

/// The insert-class operation that triggers a sweep.
const INSERT_OP: &str = "zadd";

pub(crate) fn run_trimmer(
    mut store: Box<dyn Store>,
    mut watch: Box<dyn KeyspaceWatch>,
    shared: &Shared,
    heartbeat: bool,
) {
    let queue = shared.queue.clone();
    info!(%queue, "trim starting");

    while !shared.is_shutdown() {
        if heartbeat {
            debug!(%queue, queue_time = %shared.queue_now_iso(), "listening");
        }
        let event = match watch.next_event(LISTEN_TIMEOUT) {
            Ok(event) => event,
            Err(e) => {
                warn!(%queue, error = %e, "keyspace subscription lost, trimmer exiting");
                break;
            }
        };
        let Some(event) = event else { continue };
        if event.op != INSERT_OP {
            continue;
        }

        debug!(%queue, "insert observed, asking dispatcher to pause");
        let paused = Latch::new();
        let resume = Latch::new();
        shared.deposit_trim(TrimRequest {
            paused: paused.clone(),
            resume: resume.clone(),
        });
        shared.wake();

        let mut parked = false;
        loop {
            if paused.wait_timeout(LISTEN_TIMEOUT) {
                parked = true;
                break;
            }
            if shared.is_shutdown() {
                break;
            }
        }
        if !parked {
            // Shutting down mid-handshake; the dispatcher is exiting too.
            break;
        }

        trim_sweep(store.as_mut(), shared, INSERT_OP);
        shared.replace_wake();
        resume.set();
        debug!(%queue, "dispatcher released, listening again");
    }

    info!(%queue, "trim bye");
}

/// Removes every entry already due at the current queue-time.
///
/// Also called by the dispatcher directly: once before its first pop
/// (entries may have gone stale while no broadcaster ran) and after
/// popping a hopelessly late entry (its siblings likely expired with it).
pub(crate) fn trim_sweep(store: &mut dyn Store, shared: &Shared, ident: &str) {
    let queue = &shared.queue;
    let now = shared.queue_now();
    debug!(%queue, ident, queue_time = now, "trimming");
    let stale = match store.members_up_to(queue, now) {
        Ok(stale) => stale,
        Err(e) => {
            warn!(%queue, error = %e, "trim scan failed");
            return;
        }
    };
    if stale.is_empty() {
        debug!(%queue, "nothing to remove");
        return;
    }
    match store.remove_members(queue, &stale) {
        Ok(removed) => debug!(%queue, removed, "removed stale events"),
        Err(e) => warn!(%queue, error = %e, "trim removal failed"),
    }
}
