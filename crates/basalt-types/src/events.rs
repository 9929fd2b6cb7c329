//! Typed event bus.
//!
//! Subscribers get a bounded channel; publishing never blocks the
//! producer. A subscription ends either by dropping it or through
//! [`Subscription::unsubscribe`], after which the receiver drains and
//! then reports closure.

use crate::{Block, Transaction};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// New transactions entered the pool.
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    /// The transactions.
    pub txs: Vec<Transaction>,
}

/// A block was mined locally.
#[derive(Debug, Clone)]
pub struct NewMinedBlockEvent {
    /// The mined block.
    pub block: Block,
}

struct Slot<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

/// Fan-out bus for one event type.
pub struct EventBus<T> {
    slots: Mutex<Vec<Slot<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone> EventBus<T> {
    /// Create an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Subscribe with the given channel capacity.
    pub fn subscribe(self: &Arc<Self>, capacity: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push(Slot { id, tx });
        Subscription {
            id,
            rx,
            bus: Arc::clone(self),
        }
    }

    /// Publish an event to every live subscriber.
    ///
    /// Subscribers whose channel is full miss the event; subscribers
    /// whose receiver is gone are dropped from the bus.
    pub fn publish(&self, event: T) {
        self.slots.lock().retain(|slot| {
            use mpsc::error::TrySendError;
            match slot.tx.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<T> EventBus<T> {
    fn remove(&self, id: u64) {
        self.slots.lock().retain(|slot| slot.id != id);
    }
}

/// A handle to one subscription.
pub struct Subscription<T> {
    id: u64,
    /// Receiving side of the subscription.
    pub rx: mpsc::Receiver<T>,
    bus: Arc<EventBus<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Receive the next event; `None` after unsubscribing.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Detach from the bus. The receiver closes once drained.
    pub fn unsubscribe(&mut self) {
        self.bus.remove(self.id);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.bus.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus: Arc<EventBus<u32>> = EventBus::new();
        let mut sub = bus.subscribe(4);

        bus.publish(7);
        assert_eq!(sub.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let bus: Arc<EventBus<u32>> = EventBus::new();
        let mut sub = bus.subscribe(4);

        sub.unsubscribe();
        bus.publish(1);
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_misses_event() {
        let bus: Arc<EventBus<u32>> = EventBus::new();
        let mut sub = bus.subscribe(1);

        bus.publish(1);
        bus.publish(2);
        assert_eq!(sub.recv().await, Some(1));
        // The second publish found the channel full and was dropped;
        // the subscription itself stays live.
        bus.publish(3);
        assert_eq!(sub.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus: Arc<EventBus<u32>> = EventBus::new();
        let sub = bus.subscribe(1);
        drop(sub);
        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
