use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use jobscope_types::{StreamEvent, StreamKey};

/// Events are shared between subscribers, never copied
pub type SharedEvent = Arc<StreamEvent>;

/// Queue depth used when callers don't pick one
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Handle identifying one registration on the bus
pub type SubscriptionId = u64;

/// A bounded delivery queue registered under one stream key
///
/// `recv()` returning `None` means the bus closed the queue.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub key: StreamKey,
    pub receiver: mpsc::Receiver<SharedEvent>,
}

impl Subscription {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<SharedEvent> {
        self.receiver.recv().await
    }

    /// Take an event if one is queued
    pub fn try_recv(&mut self) -> Option<SharedEvent> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<SharedEvent>,
}

/// Topic-keyed publish/subscribe hub with best-effort, non-blocking delivery
#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<StreamKey, Vec<Subscriber>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new bounded queue for `key`
    pub fn subscribe(&self, key: &StreamKey, capacity: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        self.topics
            .write()
            .entry(key.clone())
            .or_default()
            .push(Subscriber { id, sender });

        Subscription {
            id,
            key: key.clone(),
            receiver,
        }
    }

    /// Deliver `event` to every queue under its key without waiting
    ///
    /// Returns how many queues accepted the event. Full queues lose this one
    /// event; closed queues are pruned.
    pub fn publish(&self, event: SharedEvent) -> usize {
        let mut delivered = 0;
        let mut saw_closed = false;

        {
            let topics = self.topics.read();
            let Some(subscribers) = topics.get(&event.key) else {
                return 0;
            };

            for sub in subscribers {
                match sub.sender.try_send(Arc::clone(&event)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(key = %event.key, subscriber = sub.id, "queue full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }

        if saw_closed {
            self.prune_closed(&event.key);
        }

        delivered
    }

    /// Remove one registration; its queue closes
    pub fn unsubscribe(&self, key: &StreamKey, id: SubscriptionId) -> bool {
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(key) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            topics.remove(key);
        }
        removed
    }

    /// Close and remove every queue under `key`; returns how many were removed
    pub fn unsubscribe_all(&self, key: &StreamKey) -> usize {
        self.topics
            .write()
            .remove(key)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Close every queue on the bus
    pub fn clear(&self) {
        self.topics.write().clear();
    }

    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.topics.read().get(key).map(Vec::len).unwrap_or(0)
    }

    /// Number of keys with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Deliveries lost to full queues over the bus lifetime
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn prune_closed(&self, key: &StreamKey) {
        let mut topics = self.topics.write();
        if let Some(subscribers) = topics.get_mut(key) {
            subscribers.retain(|s| !s.sender.is_closed());
            if subscribers.is_empty() {
                topics.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobscope_types::OutputKind;

    fn key() -> StreamKey {
        StreamKey::new("42", OutputKind::Stdout)
    }

    fn output(n: usize) -> SharedEvent {
        Arc::new(StreamEvent::output(key(), format!("{n}\n"), vec![n.to_string()]))
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(output(1)), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event_in_order() {
        let bus = EventBus::new();
        let mut subs: Vec<_> = (0..3).map(|_| bus.subscribe(&key(), 16)).collect();

        for n in 0..5 {
            assert_eq!(bus.publish(output(n)), 3);
        }

        for sub in &mut subs {
            for n in 0..5 {
                let event = sub.recv().await.unwrap();
                assert_eq!(event.lines().unwrap(), &[n.to_string()]);
            }
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe(&key(), 1);
        let mut fast = bus.subscribe(&key(), 8);

        assert_eq!(bus.publish(output(1)), 2);
        assert_eq!(bus.publish(output(2)), 1);
        assert_eq!(bus.dropped_count(), 1);

        assert!(slow.try_recv().is_some());
        assert!(slow.try_recv().is_none());
        assert!(fast.try_recv().is_some());
        assert!(fast.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_one() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(&key(), 4);
        let mut b = bus.subscribe(&key(), 4);

        assert!(bus.unsubscribe(&key(), a.id));
        assert!(!bus.unsubscribe(&key(), a.id));
        assert_eq!(bus.subscriber_count(&key()), 1);

        bus.publish(output(1));
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_closes_queues() {
        let bus = EventBus::new();
        let mut subs: Vec<_> = (0..3).map(|_| bus.subscribe(&key(), 4)).collect();

        assert_eq!(bus.unsubscribe_all(&key()), 3);
        assert_eq!(bus.subscriber_count(&key()), 0);
        for sub in &mut subs {
            assert!(sub.recv().await.is_none());
        }
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let gone = bus.subscribe(&key(), 4);
        let _kept = bus.subscribe(&key(), 4);
        drop(gone);

        assert_eq!(bus.publish(output(1)), 1);
        assert_eq!(bus.subscriber_count(&key()), 1);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let other = StreamKey::new("42", OutputKind::Stderr);
        let mut sub = bus.subscribe(&other, 4);

        bus.publish(output(1));
        assert!(sub.try_recv().is_none());

        bus.clear();
        assert_eq!(bus.topic_count(), 0);
    }
}
