//! Publish seam.
//!
//! Scheduling does not care where payloads go. The default target is the
//! store's pub/sub channel named after the queue; the live-feed variant
//! sends UDP datagrams to a flight-simulator plugin instead. Everything
//! upstream of [`Publisher::publish`] is shared.

use std::net::UdpSocket;

use tracing::{debug, warn};

use aircast_store::Store;
use aircast_types::{QueueName, keys};

use crate::error::BroadcastResult;

/// Number of comma-separated fields in a live-feed wire line.
const WIRE_FIELD_COUNT: usize = 15;

/// Destination of a broadcaster's publications.
pub trait Publisher: Send {
    /// Delivers one payload. Delivery failures are the caller's to log;
    /// payloads are time-valued and are never retried.
    fn publish(&mut self, payload: &str) -> BroadcastResult<()>;
}

/// Publishes on the store pub/sub channel of a queue.
pub struct ChannelPublisher {
    store: Box<dyn Store>,
    channel: String,
}

impl ChannelPublisher {
    pub fn new(store: Box<dyn Store>, queue: &QueueName) -> Self {
        Self {
            store,
            channel: keys::channel(queue),
        }
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&mut self, payload: &str) -> BroadcastResult<()> {
        let receivers = self.store.publish(&self.channel, payload)?;
        debug!(channel = %self.channel, receivers, "published");
        Ok(())
    }
}

/// Forwards payloads as UDP datagrams to a flight-simulator traffic feed.
pub struct UdpForwarder {
    socket: UdpSocket,
    target: (String, u16),
}

impl UdpForwarder {
    pub fn new(host: impl Into<String>, port: u16) -> BroadcastResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Self {
            socket,
            target: (host.into(), port),
        })
    }
}

impl Publisher for UdpForwarder {
    fn publish(&mut self, payload: &str) -> BroadcastResult<()> {
        let fields = payload.split(',').count();
        if fields != WIRE_FIELD_COUNT {
            warn!(
                fields,
                expected = WIRE_FIELD_COUNT,
                "not a traffic wire line, not forwarding"
            );
            return Ok(());
        }
        self.socket
            .send_to(payload.as_bytes(), (self.target.0.as_str(), self.target.1))?;
        Ok(())
    }
}
