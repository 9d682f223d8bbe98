//! One-shot rendezvous latch.
//!
//! Dispatcher, trimmer, and supervisor hand off with single-shot latches:
//! once set, a latch stays set, and the party that completes a handshake
//! installs a fresh one. This keeps each rendezvous unambiguous — a latch
//! observed set always refers to the handshake it was created for.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A one-shot latch. Starts unset; [`Latch::set`] is sticky.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets the latch, waking all waiters. Idempotent.
    pub fn set(&self) {
        let mut set = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *set = true;
        drop(set);
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout` for the latch to be set.
    ///
    /// Returns `true` if it was set (possibly before the call), `false` on
    /// timeout. Callers that must wait indefinitely loop on this with a
    /// bounded timeout and re-check their shutdown flag between rounds.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let set = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (set, _result) = self
            .cond
            .wait_timeout_while(set, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *set
    }
}
