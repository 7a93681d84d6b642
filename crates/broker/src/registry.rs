//! Subscription registry.

use crate::handler::Delivery;
use crate::pattern::TopicPattern;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use trustgate_core::{AgentId, SubscriptionId};

pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber_id: AgentId,
    pub pattern: TopicPattern,
    /// Receives decrypted payloads
    pub authorized: bool,
    active: Arc<AtomicBool>,
    sender: mpsc::Sender<Delivery>,
    overflow: mpsc::UnboundedSender<Delivery>,
    /// Deliveries handed to the overflow forwarder and not yet resolved
    spilled: Arc<AtomicUsize>,
    overflow_limit: usize,
}

/// Receiving ends owned by a subscription's worker and forwarder tasks.
pub struct SubscriptionChannels {
    pub deliveries: mpsc::Receiver<Delivery>,
    pub overflow: mpsc::UnboundedReceiver<Delivery>,
}

/// Where a delivery went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Straight into the worker's buffer
    Buffered,
    /// Buffer full; the forwarder keeps retrying in order
    Spilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    /// Buffer and overflow are both full
    Full,
    /// The worker is gone
    Closed,
}

impl Subscription {
    /// A subscription whose worker buffers up to `buffer` deliveries, with
    /// as many again waiting in overflow.
    pub fn new(
        id: SubscriptionId,
        subscriber_id: AgentId,
        pattern: TopicPattern,
        authorized: bool,
        buffer: usize,
    ) -> (Self, SubscriptionChannels) {
        let buffer = buffer.max(1);
        let (sender, deliveries) = mpsc::channel(buffer);
        let (overflow, overflow_rx) = mpsc::unbounded_channel();
        let subscription = Self {
            id,
            subscriber_id,
            pattern,
            authorized,
            active: Arc::new(AtomicBool::new(true)),
            sender,
            overflow,
            spilled: Arc::new(AtomicUsize::new(0)),
            overflow_limit: buffer,
        };
        let channels = SubscriptionChannels {
            deliveries,
            overflow: overflow_rx,
        };
        (subscription, channels)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flag shared with the delivery worker.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// Worker-side sender and spill counter for the overflow forwarder.
    pub fn forwarder_parts(&self) -> (mpsc::Sender<Delivery>, Arc<AtomicUsize>) {
        (self.sender.clone(), self.spilled.clone())
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Hand a delivery to the worker without waiting.
    ///
    /// Once anything has spilled, later deliveries follow it through the
    /// overflow so the subscriber still sees publication order. Must be
    /// called from a single dispatcher.
    pub fn hand_off(&self, delivery: Delivery) -> Result<Handoff, HandoffError> {
        let delivery = if self.spilled.load(Ordering::Acquire) == 0 {
            match self.sender.try_send(delivery) {
                Ok(()) => return Ok(Handoff::Buffered),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(HandoffError::Closed),
                Err(mpsc::error::TrySendError::Full(delivery)) => delivery,
            }
        } else {
            delivery
        };

        if self.spilled.load(Ordering::Acquire) >= self.overflow_limit {
            return Err(HandoffError::Full);
        }
        self.spilled.fetch_add(1, Ordering::AcqRel);
        if self.overflow.send(delivery).is_err() {
            self.spilled.fetch_sub(1, Ordering::AcqRel);
            return Err(HandoffError::Closed);
        }
        Ok(Handoff::Spilled)
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<BTreeMap<SubscriptionId, Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert(&self, subscription: Arc<Subscription>) {
        self.subscriptions.write().insert(subscription.id, subscription);
    }

    /// Remove and deactivate. Returns false if the id was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.write().remove(&id) {
            Some(subscription) => {
                subscription.deactivate();
                true
            }
            None => false,
        }
    }

    /// Active subscriptions whose pattern matches `topic`, in id order.
    ///
    /// Returned handles are clones; callers never hold the registry lock
    /// while delivering.
    pub fn matching(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .values()
            .filter(|s| s.is_active() && s.pattern.matches(topic))
            .cloned()
            .collect()
    }

    /// Drop every subscription without deactivating it, letting workers
    /// drain what they already hold.
    pub fn clear(&self) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let count = subscriptions.len();
        subscriptions.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Delivery;
    use trustgate_crypto::SealedPayload;

    fn subscription_with(
        registry: &SubscriptionRegistry,
        pattern: &str,
        buffer: usize,
    ) -> (Arc<Subscription>, SubscriptionChannels) {
        let (sub, channels) = Subscription::new(
            registry.next_id(),
            "agent-s".to_string(),
            TopicPattern::parse(pattern).unwrap(),
            false,
            buffer,
        );
        let sub = Arc::new(sub);
        registry.insert(sub.clone());
        (sub, channels)
    }

    fn subscription(registry: &SubscriptionRegistry, pattern: &str) -> Arc<Subscription> {
        subscription_with(registry, pattern, 1).0
    }

    fn delivery(id: &str) -> Delivery {
        Delivery {
            message_id: id.to_string(),
            topic: "agents.status".to_string(),
            sender_id: "agent-p".to_string(),
            priority: trustgate_core::Priority::Normal,
            created_at: 0,
            subscription_id: SubscriptionId(1),
            sealed: Arc::new(SealedPayload {
                key_id: "k".to_string(),
                nonce: vec![0; 12],
                ciphertext: Vec::new(),
            }),
            plaintext: None,
            attempt: 0,
        }
    }

    #[test]
    fn test_matching_and_removal() {
        let registry = SubscriptionRegistry::new();
        let all = subscription(&registry, "agents.#");
        let status = subscription(&registry, "agents.status");
        let _tasks = subscription(&registry, "tasks.*");

        let ids: Vec<_> = registry
            .matching("agents.status")
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![all.id, status.id]);

        assert!(registry.remove(status.id));
        assert!(!registry.remove(status.id));
        assert!(!status.is_active());
        assert_eq!(registry.matching("agents.status").len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SubscriptionRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
        assert_eq!(a, SubscriptionId(1));
    }

    #[test]
    fn test_full_buffer_spills_in_order_then_refuses() {
        let registry = SubscriptionRegistry::new();
        let (sub, mut channels) = subscription_with(&registry, "agents.#", 2);

        assert_eq!(sub.hand_off(delivery("m1")), Ok(Handoff::Buffered));
        assert_eq!(sub.hand_off(delivery("m2")), Ok(Handoff::Buffered));
        assert_eq!(sub.hand_off(delivery("m3")), Ok(Handoff::Spilled));

        // Room in the buffer does not let a later delivery overtake m3
        assert_eq!(channels.deliveries.try_recv().unwrap().message_id, "m1");
        assert_eq!(sub.hand_off(delivery("m4")), Ok(Handoff::Spilled));
        assert_eq!(sub.hand_off(delivery("m5")), Err(HandoffError::Full));

        let spilled: Vec<_> = std::iter::from_fn(|| channels.overflow.try_recv().ok())
            .map(|d| d.message_id)
            .collect();
        assert_eq!(spilled, vec!["m3", "m4"]);
    }

    #[test]
    fn test_closed_worker_is_reported() {
        let registry = SubscriptionRegistry::new();
        let (sub, channels) = subscription_with(&registry, "agents.#", 1);
        drop(channels);
        assert_eq!(sub.hand_off(delivery("m1")), Err(HandoffError::Closed));
    }
}
