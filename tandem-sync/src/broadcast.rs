//! Fan-out of encoded frames to the peers of one document room.
//!
//! One tokio broadcast channel per room; each peer holds its own receiver
//! that buffers up to `capacity` frames. A frame carries its sender so the
//! sender's connection can skip it. Membership lives with the room; the
//! group only knows how many receivers are attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerFrame};

/// An encoded frame on its way to the room.
#[derive(Debug, Clone)]
pub struct Relayed {
    /// Sending session; `None` reaches everyone.
    pub from: Option<Uuid>,
    pub text: Arc<str>,
}

impl Relayed {
    pub fn is_for(&self, session: Uuid) -> bool {
        self.from != Some(session)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters shared by every sender of the room.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Relayed>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// A receiver for a new peer. Dropping it detaches the peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Relayed> {
        self.sender.subscribe()
    }

    /// Send `frame` to every peer except `from`. Returns the receiver count.
    pub fn broadcast(&self, from: Option<Uuid>, frame: &ServerFrame) -> Result<usize, ProtocolError> {
        let text: Arc<str> = frame.encode()?.into();
        Ok(self.broadcast_raw(Relayed { from, text }))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, relayed: Relayed) -> usize {
        let count = self.sender.send(relayed).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// A receiver fell behind by `n` frames.
    pub fn record_lag(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
