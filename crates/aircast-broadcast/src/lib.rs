//! # aircast-broadcast: timed event dispatch
//!
//! The runtime heart of aircast: delivers pre-computed, timestamped
//! payloads to consumers at wall-clock instants governed by a per-queue
//! simulation clock (speed warp, time shift).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Hypercaster                          │
//! │   admin thread ⇆ keyspace notifications on queues:*         │
//! │        │ spawn / reset / stop                               │
//! │        ▼                                                    │
//! │  ┌───────────────── Broadcaster (per queue) ─────────────┐  │
//! │  │ dispatcher: pop-min → sleep(SimClock) → Publisher     │  │
//! │  │ trimmer:    zadd events → pause handshake → sweep     │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producers schedule payloads through [`enqueue`]; consumers subscribe to
//! the queue's pub/sub channel (or receive UDP datagrams on the live-feed
//! queue). The store linearizes all sorted-set mutations; the in-process
//! latches only serialize the trimmer's range sweep against the
//! dispatcher's blocking pop.

mod broadcaster;
mod clock;
pub mod enqueue;
mod error;
mod hypercaster;
mod latch;
mod publisher;
mod trimmer;

pub use broadcaster::{Broadcaster, BroadcasterHandle};
pub use clock::SimClock;
pub use error::{BroadcastError, BroadcastResult};
pub use hypercaster::{Hypercaster, HypercasterHandle, HypercasterOptions, LiveFeedTarget};
pub use publisher::{ChannelPublisher, Publisher, UdpForwarder};
