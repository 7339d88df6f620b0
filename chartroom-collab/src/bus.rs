//! Named-channel fan-out bus replicating events across gateway instances.
//!
//! The bus moves opaque payloads; it knows nothing of rooms, presence, or
//! documents. Delivery is at-most-once and best-effort: a subscriber that
//! falls behind its channel's buffer loses the oldest messages (and is told
//! so), and a publisher never blocks on slow subscribers. Publish order is
//! preserved within a single channel from a single publisher, which is all
//! the presence and chat paths need; the document engine tolerates
//! arbitrary reordering on its own.
//!
//! Every gateway instance that should see each other's events shares one
//! `Arc<FanoutBus>`. A broker-backed deployment implements this same
//! surface; nothing above it changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Payloads are shared, not copied, on the way to N subscribers.
pub type BusPayload = Arc<Vec<u8>>;

/// Bus failures. Ephemeral publishers treat these as degraded service, not
/// fatal errors.
#[derive(Debug, Clone)]
pub enum BusError {
    /// The underlying transport is down. Already-connected local members
    /// keep working; cross-instance visibility is degraded until recovery.
    Unavailable,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "Fan-out bus unavailable"),
        }
    }
}

impl std::error::Error for BusError {}

/// Snapshot of bus counters for monitoring.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub channels: usize,
}

/// Publish/subscribe fan-out over named channels.
///
/// Each channel is a broadcast ring of `capacity` messages per subscriber;
/// stats are atomics so publishing never takes the channel-map lock on a
/// hot path longer than the lookup.
pub struct FanoutBus {
    channels: RwLock<HashMap<String, broadcast::Sender<BusPayload>>>,
    capacity: usize,
    connected: AtomicBool,
    published: AtomicU64,
}

impl FanoutBus {
    /// `capacity` is the per-subscriber buffer before a laggard starts
    /// losing the oldest messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
            connected: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Publish a payload on a channel. Returns the number of subscribers
    /// that will observe it (zero is not an error).
    pub fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, BusError> {
        if !self.healthy() {
            return Err(BusError::Unavailable);
        }
        let sender = self.sender_for(channel);
        let delivered = sender.send(Arc::new(payload)).unwrap_or(0);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Subscribe to a channel. The receiver observes everything published
    /// after this call, in publish order per publisher.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusPayload> {
        self.sender_for(channel).subscribe()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<BusPayload> {
        {
            let channels = self.channels.read().expect("bus channel map poisoned");
            if let Some(sender) = channels.get(channel) {
                return sender.clone();
            }
        }
        let mut channels = self.channels.write().expect("bus channel map poisoned");
        // Double-check after acquiring the write lock.
        if let Some(sender) = channels.get(channel) {
            return sender.clone();
        }
        let (sender, _) = broadcast::channel(self.capacity);
        channels.insert(channel.to_string(), sender.clone());
        sender
    }

    /// Drop a channel once nothing is subscribed to it.
    pub fn prune(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().expect("bus channel map poisoned");
        if let Some(sender) = channels.get(channel) {
            if sender.receiver_count() == 0 {
                channels.remove(channel);
                return true;
            }
        }
        false
    }

    /// Whether the bus is currently able to move events. Surfaced through
    /// the health endpoint.
    pub fn healthy(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Flip the transport state. Broker bridges call this on disconnect
    /// and recovery; tests use it to simulate an outage.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            channels: self.channels.read().expect("bus channel map poisoned").len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
