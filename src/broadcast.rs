//! Fan-out of document updates to a room's peers.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! frames; lagging receivers drop oldest frames and the lag is logged by
//! the consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub receivers: usize,
}

/// A broadcast group for a single room.
///
/// All connections in the same room share one broadcast channel. When a
/// peer sends an update, it is fanned out to the other N-1 peers; the
/// sender filters out its own frames by peer id.
pub struct BroadcastGroup {
    /// Broadcast channel sender
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Channel capacity (frames buffered per receiver)
    capacity: usize,
    /// Lock-free send counter
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Subscribe a new receiver for one connection.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Broadcast a message to all subscribed connections.
    ///
    /// The message is encoded once and shared; returns the number of
    /// receivers it reached (0 when the room has no other listeners).
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Get broadcast statistics.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
