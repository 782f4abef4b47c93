//! In-process event bus.
//!
//! The store publishes one [`Event`] per committed write; the engine
//! subscribes and turns events into background work. Delivery is
//! best-effort and in-memory only: nothing survives a restart, and a
//! subscriber that falls too far behind skips what it missed.

use tokio::sync::broadcast;
use tracing::warn;

use crate::identity::FriendId;

/// Events buffered per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What changed in a friend record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendChange {
    /// A new friend id entered the list
    Added,
    /// An existing friend record was overwritten by `insert_or_update_friend`
    Replaced,
    /// Only last-sent / last-received bookkeeping moved
    Timestamps,
}

/// Notifications published after a durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Self identity replaced
    IdentityUpdated,
    /// Self status replaced
    StatusUpdated,
    FriendUpdated { id: FriendId, change: FriendChange },
    FriendRemoved { id: FriendId },
    FriendStatusUpdated { id: FriendId },
}

/// Process-wide publish/subscribe channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to every live subscriber. Never blocks; no subscribers is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Register a subscriber. Events published after this call are delivered.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered subscriber. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    ///
    /// Lag is logged and skipped rather than surfaced.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
