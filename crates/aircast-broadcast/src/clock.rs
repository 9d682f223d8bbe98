//! Queue-time arithmetic.
//!
//! A [`SimClock`] maps wall-clock instants to the logical clock a queue's
//! events live in, parameterized by a start time and a speed multiplier.
//! Instants are seconds since the Unix epoch; the mapping is
//!
//! ```text
//! queue_now = T0 + speed * (now - T0 - shift)        shift = t_init - T0
//! ```
//!
//! which reduces to `now` for `speed = 1` and `shift = 0`. A start time in
//! the past replays history from `T0`; a start time in the future makes
//! queue-time run ahead of wall-clock (negative shift). Shifts smaller
//! than [`TIMESHIFT_CLAMP_SECS`] collapse to zero so a queue created "now"
//! does not drift by the moments spent writing its descriptor.
//!
//! The clock does no I/O; the dispatcher derives all its sleep durations
//! from it.

use chrono::{DateTime, FixedOffset, Utc};
use tracing::debug;

use aircast_types::TIMESHIFT_CLAMP_SECS;

/// Pure wall-clock to queue-time mapping.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    /// Queue-time origin, epoch seconds.
    start: f64,
    /// Speed multiplier, > 0.
    speed: f64,
    /// Wall-clock minus origin at instantiation, epoch seconds.
    shift: f64,
}

impl SimClock {
    /// Creates a clock anchored at `start_time` (or "now" when absent)
    /// flowing at `speed`.
    pub fn new(start_time: Option<DateTime<FixedOffset>>, speed: f64) -> Self {
        Self::at(start_time, speed, epoch_now())
    }

    fn at(start_time: Option<DateTime<FixedOffset>>, speed: f64, now: f64) -> Self {
        let start = start_time.map_or(now, epoch_secs);
        let mut shift = now - start;
        if shift.abs() < TIMESHIFT_CLAMP_SECS as f64 {
            shift = 0.0;
        }
        debug!(start, speed, shift, "clock anchored");
        Self {
            start,
            speed,
            shift,
        }
    }

    /// Current queue-time, epoch seconds.
    pub fn queue_now(&self) -> f64 {
        self.queue_now_at(epoch_now())
    }

    fn queue_now_at(&self, now: f64) -> f64 {
        self.start + self.speed * (now - self.start - self.shift)
    }

    /// Real-time seconds to sleep until `deadline` (queue-time epoch
    /// seconds). Negative means the deadline has already passed.
    pub fn wait_for(&self, deadline: f64) -> f64 {
        self.wait_for_at(deadline, epoch_now())
    }

    fn wait_for_at(&self, deadline: f64, now: f64) -> f64 {
        (deadline - self.queue_now_at(now)) / self.speed
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Queue-time origin, epoch seconds.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Current queue-time as an ISO timestamp, for heartbeat lines.
    pub fn queue_now_iso(&self) -> String {
        let secs = self.queue_now();
        DateTime::<Utc>::from_timestamp(secs as i64, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| format!("ts={secs:.1}"))
    }
}

fn epoch_now() -> f64 {
    epoch_secs(Utc::now().fixed_offset())
}

fn epoch_secs(dt: DateTime<FixedOffset>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_millis()) / 1e3
}
