//! Topic-keyed broadcast over std channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

/// Identity of one subscription. Ids are unique per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Slot<T> {
    id: SubscriberId,
    sender: Sender<T>,
}

/// Topic-keyed broadcast bus.
///
/// Every publish clones the value into each live subscriber's channel, in
/// subscription order; per subscriber, values arrive in publish order.
/// Dropping a [`Subscriber`] ends the subscription; its slot is pruned on
/// the next publish to that topic.
pub struct MessageBus<T> {
    topics: Mutex<HashMap<String, Vec<Slot<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone> MessageBus<T> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a subscription to `topic`.
    pub fn subscribe(&self, topic: &str) -> Subscriber<T> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::channel();
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(Slot { id, sender });
        Subscriber { id, receiver }
    }

    /// Publishes `value` to every subscriber of `topic`. Returns the number
    /// of subscribers that received it.
    pub fn publish(&self, topic: &str, value: T) -> usize {
        let mut topics = self.topics.lock().unwrap();
        let Some(slots) = topics.get_mut(topic) else {
            return 0;
        };
        slots.retain(|slot| slot.sender.send(value.clone()).is_ok());
        let delivered = slots.len();
        if delivered == 0 {
            topics.remove(topic);
        }
        delivered
    }

    /// Number of live subscriptions to `topic`, counting subscribers
    /// dropped since the last publish.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}

impl<T: Clone> Default for MessageBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of one subscription.
pub struct Subscriber<T> {
    id: SubscriberId,
    receiver: Receiver<T>,
}

impl<T> Subscriber<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Takes the next value without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for the next value.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }
}
