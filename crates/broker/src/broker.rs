//! SecureBroker: verified, trust-gated, rate-limited pub/sub.
//!
//! # Message lifecycle
//!
//! ```text
//! Submitted -> Verified -> Queued -> Delivered
//!     |            |          |-----> Expired
//!     |            |          '-----> Cancelled
//!     '------------'----------------> Rejected(reason)
//! ```
//!
//! `publish` only returns an error for malformed messages. Signature
//! failures, trust and rate policy rejections, backpressure and expiry are
//! reported through alerts and the message status.

use crate::audit::{AuditEntry, AuditTrail, DeliveryState, MessageState, MessageStatus};
use crate::error::{BrokerError, BrokerResult};
use crate::handler::{Delivery, MessageHandler};
use crate::pattern::{validate_topic, TopicPattern};
use crate::queue::{PriorityQueue, QueuedMessage};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::registry::{Handoff, HandoffError, Subscription, SubscriptionRegistry};
use crate::sealer::MessageSealer;
use crate::worker::{DeliveryContext, DeliveryWorker, OverflowForwarder};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use trustgate_core::config::{BrokerConfig, LowTrustPolicy, RateLimitPolicy};
use trustgate_core::{
    AgentId, AlertBuilder, AlertChannel, AlertKind, AlertSink, MessageId, PersistenceGateway,
    Priority, RejectReason, SecureMessage, SharedClock, SubscriptionId, SystemClock,
    TransactionRecord,
};
use trustgate_crypto::{CryptoProtocol, SealedPayload, NONCE_SIZE};
use trustgate_trust_mesh::TrustScorer;

/// Builder for [`SecureBroker`].
pub struct SecureBrokerBuilder {
    crypto: Arc<CryptoProtocol>,
    trust: Arc<TrustScorer>,
    config: BrokerConfig,
    clock: Option<SharedClock>,
    alerts: Option<Arc<dyn AlertSink>>,
    gateway: Option<Arc<dyn PersistenceGateway>>,
}

impl SecureBrokerBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    /// Gateway for the audit trail. Without one, status is kept in memory only.
    pub fn gateway(mut self, gateway: Arc<dyn PersistenceGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn build(self) -> SecureBroker {
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let alerts = self
            .alerts
            .unwrap_or_else(|| Arc::new(AlertChannel::new()) as Arc<dyn AlertSink>);
        let config = Arc::new(self.config);

        let audit = Arc::new(AuditTrail::new(
            self.crypto.clone(),
            self.gateway,
            clock.clone(),
            Duration::from_secs(config.audit_ttl_secs),
        ));
        let ctx = Arc::new(DeliveryContext {
            config: config.clone(),
            audit: audit.clone(),
            alerts: alerts.clone(),
            trust: self.trust.clone(),
            clock: clock.clone(),
        });

        SecureBroker {
            inner: Arc::new(BrokerInner {
                queue: Mutex::new(PriorityQueue::new(
                    config.max_queue_depth,
                    config.aging_interval_ms,
                )),
                limiter: RateLimiter::new(&config, clock.clone()),
                registry: SubscriptionRegistry::new(),
                workers: Mutex::new(Vec::new()),
                notify: Notify::new(),
                dispatcher: Mutex::new(None),
                crypto: self.crypto,
                trust: self.trust,
                config,
                clock,
                alerts,
                audit,
                ctx,
            }),
        }
    }
}

struct Dispatcher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct BrokerInner {
    config: Arc<BrokerConfig>,
    crypto: Arc<CryptoProtocol>,
    trust: Arc<TrustScorer>,
    clock: SharedClock,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditTrail>,
    queue: Mutex<PriorityQueue>,
    limiter: RateLimiter,
    registry: SubscriptionRegistry,
    ctx: Arc<DeliveryContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    notify: Notify,
    dispatcher: Mutex<Option<Dispatcher>>,
}

#[derive(Clone)]
pub struct SecureBroker {
    inner: Arc<BrokerInner>,
}

impl SecureBroker {
    pub fn builder(crypto: Arc<CryptoProtocol>, trust: Arc<TrustScorer>) -> SecureBrokerBuilder {
        SecureBrokerBuilder {
            crypto,
            trust,
            config: BrokerConfig::default(),
            clock: None,
            alerts: None,
            gateway: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Submit a message for delivery.
    ///
    /// Returns the message id once the message has been admitted to the
    /// state machine; the outcome is observable through [`Self::status`]
    /// and alerts. Only malformed messages fail here.
    pub fn publish(&self, message: SecureMessage) -> BrokerResult<MessageId> {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        inner.validate(&message, now)?;
        inner.audit.begin(&message)?;
        let message_id = message.message_id.clone();

        if !inner
            .crypto
            .verify_from(&message.sender_id, &message.signing_bytes(), &message.signature)
        {
            inner.reject(&message, RejectReason::BadSignature, "signature did not verify");
            return Ok(message_id);
        }
        inner.audit.transition(&message_id, MessageState::Verified);

        let mut priority = message.priority;
        let low_trust = inner.trust.is_low_trust(&message.sender_id);
        if low_trust {
            match inner.config.low_trust_policy {
                LowTrustPolicy::Reject => {
                    inner.reject(&message, RejectReason::LowTrust, "publisher below trust threshold");
                    return Ok(message_id);
                }
                LowTrustPolicy::Deprioritize => {
                    debug!(message_id = %message_id, sender = %message.sender_id, "Low-trust publisher deprioritized");
                    priority = Priority::Low;
                }
            }
        }

        if let RateDecision::Limited { retry_after_ms } =
            inner.limiter.check(&message.sender_id, low_trust)
        {
            match inner.config.rate_limit_policy {
                RateLimitPolicy::Reject => {
                    inner.reject(
                        &message,
                        RejectReason::RateLimited { retry_after_ms },
                        &format!("retry after {}ms", retry_after_ms),
                    );
                    return Ok(message_id);
                }
                RateLimitPolicy::Demote => priority = priority.demoted(),
            }
        }

        if message.is_expired(now) {
            inner.expire(&message);
            return Ok(message_id);
        }

        let (expired, pushed) = {
            let mut queue = inner.queue.lock();
            let expired = queue.sweep_expired(now);
            (expired, queue.push(message.clone(), priority, now))
        };
        inner.expire_all(expired);

        match pushed {
            Ok(seq) => {
                inner.audit.transition_from(
                    &message_id,
                    &MessageState::Verified,
                    MessageState::Queued,
                );
                debug!(message_id = %message_id, seq, ?priority, topic = %message.topic, "Message queued");
                inner.notify.notify_one();
            }
            Err(_) => inner.reject(&message, RejectReason::QueueFull, "queue depth bound reached"),
        }
        Ok(message_id)
    }

    /// Subscribe without access to plaintext.
    pub fn subscribe(
        &self,
        pattern: &str,
        subscriber: impl Into<AgentId>,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<SubscriptionId> {
        self.add_subscription(pattern, subscriber.into(), handler, false)
    }

    /// Subscribe and receive decrypted payloads.
    pub fn subscribe_authorized(
        &self,
        pattern: &str,
        subscriber: impl Into<AgentId>,
        handler: Arc<dyn MessageHandler>,
    ) -> BrokerResult<SubscriptionId> {
        self.add_subscription(pattern, subscriber.into(), handler, true)
    }

    fn add_subscription(
        &self,
        pattern: &str,
        subscriber: AgentId,
        handler: Arc<dyn MessageHandler>,
        authorized: bool,
    ) -> BrokerResult<SubscriptionId> {
        let inner = &self.inner;
        if subscriber.is_empty() {
            return Err(BrokerError::Validation("subscriber id is empty".to_string()));
        }
        let pattern = TopicPattern::parse(pattern)?;
        let runtime = Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;

        let id = inner.registry.next_id();
        let (subscription, channels) = Subscription::new(
            id,
            subscriber.clone(),
            pattern,
            authorized,
            inner.config.subscriber_buffer,
        );
        let subscription = Arc::new(subscription);
        let worker = DeliveryWorker::new(
            id,
            subscriber.clone(),
            subscription.active_flag(),
            handler,
            inner.ctx.clone(),
        );
        let (sender, spilled) = subscription.forwarder_parts();
        let forwarder = OverflowForwarder::new(
            subscriber.clone(),
            subscription.active_flag(),
            sender,
            spilled,
            inner.ctx.clone(),
        );
        {
            let mut workers = inner.workers.lock();
            workers.retain(|handle| !handle.is_finished());
            workers.push(worker.spawn(&runtime, channels.deliveries));
            workers.push(forwarder.spawn(&runtime, channels.overflow));
        }
        inner.registry.insert(subscription.clone());

        info!(
            subscription = %id,
            subscriber = %subscriber,
            pattern = %subscription.pattern,
            authorized,
            "Subscription added"
        );
        Ok(id)
    }

    /// Remove a subscription. An in-flight handler call completes; later
    /// deliveries stop. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.registry.remove(id);
        if removed {
            info!(subscription = %id, "Subscription removed");
        }
        self.inner.prune_workers();
        removed
    }

    /// Withdraw a message that is still waiting in the queue.
    pub fn cancel(&self, message_id: &str) -> bool {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let (expired, cancelled) = {
            let mut queue = inner.queue.lock();
            let expired = queue.sweep_expired(now);
            (expired, queue.cancel(message_id))
        };
        inner.expire_all(expired);

        match cancelled {
            Some(_) => {
                inner.audit.transition(message_id, MessageState::Cancelled);
                info!(message_id, "Message cancelled");
                true
            }
            None => false,
        }
    }

    /// Feed an explicit interaction outcome into the trust engine.
    pub fn report_outcome(&self, record: TransactionRecord) -> BrokerResult<bool> {
        Ok(self.inner.trust.record_transaction(record)?)
    }

    pub fn status(&self, message_id: &str) -> Option<MessageStatus> {
        self.inner.audit.status(message_id)
    }

    /// Signed audit entries for a message, oldest first.
    pub fn audit_entries(&self, message_id: &str) -> BrokerResult<Vec<AuditEntry>> {
        self.inner.audit.entries(message_id)
    }

    /// Sealer for `sender`, registering its signing key if needed.
    pub fn sealer(&self, sender: impl Into<AgentId>) -> MessageSealer {
        MessageSealer::new(self.inner.crypto.clone(), sender, self.inner.clock.clone())
            .with_default_ttl(self.inner.config.default_ttl_secs)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Start the dispatcher on the current Tokio runtime.
    pub fn start(&self) -> BrokerResult<()> {
        let runtime = Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            return Err(BrokerError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = runtime.spawn(async move { inner.run(shutdown_rx).await });
        *dispatcher = Some(Dispatcher {
            shutdown_tx,
            handle,
        });
        info!("Broker dispatcher started");
        Ok(())
    }

    /// Stop dispatching, then let workers finish what they already hold.
    pub async fn shutdown(&self) {
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.shutdown_tx.send(true);
            let _ = dispatcher.handle.await;
        }

        self.inner.registry.clear();
        let workers: Vec<_> = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        info!(queued = self.queue_len(), "Broker stopped");
    }
}

impl BrokerInner {
    fn validate(&self, message: &SecureMessage, now: u64) -> BrokerResult<()> {
        let invalid = |reason: String| -> BrokerResult<()> { Err(BrokerError::Validation(reason)) };

        if message.message_id.is_empty() {
            return invalid("message id is empty".to_string());
        }
        if message.sender_id.is_empty() {
            return invalid("sender id is empty".to_string());
        }
        if message.key_id.is_empty() {
            return invalid("key id is empty".to_string());
        }
        validate_topic(&message.topic)?;
        if message.nonce.len() != NONCE_SIZE {
            return invalid(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                message.nonce.len()
            ));
        }
        if message.ciphertext.len() > self.config.max_payload_bytes {
            return invalid(format!(
                "payload of {} bytes exceeds limit of {}",
                message.ciphertext.len(),
                self.config.max_payload_bytes
            ));
        }
        if message.ttl_seconds > self.config.max_ttl_secs {
            return invalid(format!(
                "ttl {}s exceeds limit of {}s",
                message.ttl_seconds, self.config.max_ttl_secs
            ));
        }
        if message.created_at > now.saturating_add(self.config.max_clock_skew_ms) {
            return invalid(format!(
                "created_at {} is ahead of broker time {}",
                message.created_at, now
            ));
        }
        Ok(())
    }

    fn reject(&self, message: &SecureMessage, reason: RejectReason, detail: &str) {
        self.audit.transition(
            &message.message_id,
            MessageState::Rejected {
                reason: reason.clone(),
            },
        );
        self.alerts.emit(
            AlertBuilder::new(AlertKind::Rejected { reason })
                .timestamp(self.clock.now_ms())
                .message(message.message_id.clone())
                .agent(message.sender_id.clone())
                .detail(detail)
                .metadata("topic", message.topic.clone())
                .build(),
        );
    }

    fn expire(&self, message: &SecureMessage) {
        self.audit.transition(&message.message_id, MessageState::Expired);
        self.alerts.emit(
            AlertBuilder::new(AlertKind::Expired)
                .timestamp(self.clock.now_ms())
                .message(message.message_id.clone())
                .agent(message.sender_id.clone())
                .detail(format!("deadline {} passed", message.deadline_ms()))
                .metadata("topic", message.topic.clone())
                .build(),
        );
    }

    /// Forget tasks of subscriptions that have wound down. Returns how many
    /// are still tracked.
    fn prune_workers(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        workers.len()
    }

    fn expire_all(&self, expired: Vec<QueuedMessage>) {
        for queued in expired {
            self.expire(&queued.message);
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.drain();

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sweep.tick() => self.maintenance(),
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("Broker dispatcher stopped");
    }

    fn drain(&self) {
        loop {
            let now = self.clock.now_ms();
            let (expired, next) = {
                let mut queue = self.queue.lock();
                let expired = queue.sweep_expired(now);
                (expired, queue.pop(now))
            };
            self.expire_all(expired);
            match next {
                Some(queued) => self.dispatch(queued, now),
                None => return,
            }
        }
    }

    fn maintenance(&self) {
        let now = self.clock.now_ms();
        let expired = self.queue.lock().sweep_expired(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "Swept expired messages");
        }
        self.expire_all(expired);
        self.crypto.purge_expired();
        self.audit.prune();
    }

    fn dispatch(&self, queued: QueuedMessage, now: u64) {
        let priority = queued.effective_priority(now, self.config.aging_interval_ms);
        let message = queued.message;
        let subscriptions = self.registry.matching(&message.topic);

        let sealed = Arc::new(SealedPayload {
            key_id: message.key_id.clone(),
            nonce: message.nonce.clone(),
            ciphertext: message.ciphertext.clone(),
        });

        let plaintext: Option<Arc<[u8]>> = if subscriptions.iter().any(|s| s.authorized) {
            match self.crypto.decrypt(&sealed) {
                Ok(plaintext) => Some(plaintext.into()),
                Err(_) => {
                    self.reject(&message, RejectReason::DecryptionFailed, "payload could not be decrypted");
                    return;
                }
            }
        } else {
            None
        };

        for subscription in &subscriptions {
            let delivery = Delivery {
                message_id: message.message_id.clone(),
                topic: message.topic.clone(),
                sender_id: message.sender_id.clone(),
                priority,
                created_at: message.created_at,
                subscription_id: subscription.id,
                sealed: sealed.clone(),
                plaintext: if subscription.authorized {
                    plaintext.clone()
                } else {
                    None
                },
                attempt: 0,
            };

            self.audit
                .subscriber_outcome(&message.message_id, subscription.id, DeliveryState::Pending);
            let refused = match subscription.hand_off(delivery.clone()) {
                Ok(Handoff::Buffered) => None,
                Ok(Handoff::Spilled) => {
                    debug!(
                        message_id = %message.message_id,
                        subscription = %subscription.id,
                        "Subscriber buffer full, delivery spilled"
                    );
                    None
                }
                Err(HandoffError::Full) => Some(RejectReason::QueueFull),
                Err(HandoffError::Closed) => Some(RejectReason::DeliveryFailed),
            };
            if let Some(reason) = refused {
                let detail = format!("subscriber buffer unavailable: {}", reason);
                self.ctx
                    .fail_handoff(&delivery, &subscription.subscriber_id, reason, detail);
            }
        }

        self.audit.transition(&message.message_id, MessageState::Delivered);
        debug!(
            message_id = %message.message_id,
            subscribers = subscriptions.len(),
            ?priority,
            "Message dispatched"
        );
    }
}
