//! Per-document snapshot fan-out.
//!
//! Uses tokio broadcast channels for O(1) publish to every subscriber of a
//! document. Each subscriber owns an independent receiver buffering up to
//! `capacity` events; a subscriber that falls behind loses the oldest events
//! and nobody else notices.
//!
//! ```text
//! HistoryEngine ── publish(doc, snapshot) ──► EventBus
//!                                               │  rooms: doc_id → BroadcastGroup
//!                               ┌───────────────┼───────────────┐
//!                               ▼               ▼               ▼
//!                          Subscription    Subscription     Listener(fn)
//! ```
//!
//! Delivery is best-effort and in-process: no replay for late subscribers,
//! nothing survives a restart. Subscribers read the authoritative snapshot
//! first and treat events as change notifications.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;

use labsync_core::Snapshot;

/// One accepted change of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEvent {
    pub doc_id: String,
    pub snapshot: Snapshot,
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub events_lagged: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters shared by a group and its subscriptions.
struct AtomicBroadcastStats {
    events_published: AtomicU64,
    events_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_lagged: AtomicU64::new(0),
        }
    }
}

/// Broadcast channel for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<SnapshotEvent>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the per-subscriber buffer before lagging starts.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    fn receiver(&self) -> broadcast::Receiver<Arc<SnapshotEvent>> {
        self.sender.subscribe()
    }

    /// Send to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: Arc<SnapshotEvent>) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.atomic_stats.events_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.atomic_stats.events_published.load(Ordering::Relaxed),
            events_lagged: self.atomic_stats.events_lagged.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

type Rooms = Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>;

/// Registry of per-document broadcast groups.
///
/// Rooms are created on first subscribe and removed when the last
/// subscription is dropped.
pub struct EventBus {
    rooms: Rooms,
    default_capacity: usize,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Start receiving every snapshot published for `doc_id` from now on.
    pub fn subscribe(&self, doc_id: &str) -> Subscription {
        // Fast path: subscribe under the read lock so a concurrent
        // last-unsubscribe cannot remove the room in between.
        {
            let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(room) = rooms.get(doc_id) {
                return Subscription::new(doc_id, room, self.rooms.clone());
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)));
        Subscription::new(doc_id, room, self.rooms.clone())
    }

    /// Register a callback for `doc_id`. Dropping the handle unsubscribes.
    ///
    /// A callback returning `Err` is logged and keeps receiving; it never
    /// affects other subscribers or the publisher.
    pub fn listen<F, E>(&self, doc_id: &str, mut callback: F) -> ListenerHandle
    where
        F: FnMut(&SnapshotEvent) -> Result<(), E> + Send + 'static,
        E: Display + 'static,
    {
        let mut subscription = self.subscribe(doc_id);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(e) = callback(&event) {
                    log::warn!(
                        "Listener for doc {} failed at revision {}: {e}",
                        event.doc_id,
                        event.snapshot.revision
                    );
                }
            }
        });
        ListenerHandle { task }
    }

    /// Fan a snapshot out to the current subscribers of `doc_id`.
    ///
    /// Never blocks and never fails; returns the number of receivers.
    pub fn publish(&self, doc_id: &str, snapshot: Snapshot) -> usize {
        let room = {
            let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
            rooms.get(doc_id).cloned()
        };
        let Some(room) = room else {
            return 0;
        };
        let event = Arc::new(SnapshotEvent {
            doc_id: doc_id.to_string(),
            snapshot,
        });
        let delivered = room.publish(event);
        log::trace!("Published doc {doc_id} to {delivered} subscribers");
        delivered
    }

    pub fn subscriber_count(&self, doc_id: &str) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms.get(doc_id).map_or(0, |r| r.subscriber_count())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn active_documents(&self) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms.keys().cloned().collect()
    }

    pub fn stats(&self, doc_id: &str) -> Option<BroadcastStats> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms.get(doc_id).map(|r| r.stats())
    }
}

/// A live subscription to one document. Drop to unsubscribe.
pub struct Subscription {
    doc_id: String,
    receiver: Option<broadcast::Receiver<Arc<SnapshotEvent>>>,
    stats: Arc<AtomicBroadcastStats>,
    rooms: Rooms,
}

impl Subscription {
    fn new(doc_id: &str, room: &BroadcastGroup, rooms: Rooms) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            receiver: Some(room.receiver()),
            stats: room.atomic_stats.clone(),
            rooms,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Next event. Skips over lag gaps; `None` once the room is gone.
    pub async fn recv(&mut self) -> Option<Arc<SnapshotEvent>> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.stats.events_lagged.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Subscriber of doc {} lagged by {n} events", self.doc_id);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<SnapshotEvent>> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    self.stats.events_lagged.fetch_add(n, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms
            .get(&self.doc_id)
            .is_some_and(|room| room.subscriber_count() == 0)
        {
            rooms.remove(&self.doc_id);
            log::debug!("Room {} removed (no subscribers)", self.doc_id);
        }
    }
}

/// Handle for a callback registered with [`EventBus::listen`].
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop delivering to the callback.
    pub fn unsubscribe(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
