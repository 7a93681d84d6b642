//! Per-subscription delivery workers.
//!
//! Each subscription owns one task that takes deliveries in order from a
//! bounded channel, so a slow subscriber only delays itself. Each handler
//! call runs in its own task: a timeout aborts it and a panic counts as a
//! failed attempt instead of killing the worker.
//!
//! When the channel is full the dispatcher spills to an
//! [`OverflowForwarder`], which waits for room with the same attempt budget
//! and backoff as handler retries. Deliveries that outlive their
//! subscription end as `Failed { DeliveryFailed }`, never stuck `Pending`.

use crate::audit::{AuditTrail, DeliveryState};
use crate::handler::{Delivery, MessageHandler};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trustgate_core::config::BrokerConfig;
use trustgate_core::{
    AgentId, AlertBuilder, AlertKind, AlertSink, Outcome, RejectReason, SharedClock,
    SubscriptionId, TransactionRecord,
};
use trustgate_trust_mesh::TrustScorer;

/// Shared state a worker needs after a delivery has left the broker.
pub struct DeliveryContext {
    pub config: Arc<BrokerConfig>,
    pub audit: Arc<AuditTrail>,
    pub alerts: Arc<dyn AlertSink>,
    pub trust: Arc<TrustScorer>,
    pub clock: SharedClock,
}

impl DeliveryContext {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(factor))
    }

    fn record_outcome(&self, from: &str, to: &str, outcome: Outcome) {
        if !self.config.record_delivery_outcomes || from == to {
            return;
        }
        let record = match TransactionRecord::new(from, to, outcome, self.clock.now_ms()) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Skipping delivery outcome");
                return;
            }
        };
        if let Err(e) = self.trust.record_transaction(record) {
            warn!(error = %e, "Failed to record delivery outcome");
        }
    }

    /// Terminal failure for a delivery that never reached the handler.
    pub(crate) fn fail_handoff(
        &self,
        delivery: &Delivery,
        subscriber_id: &str,
        reason: RejectReason,
        detail: String,
    ) {
        warn!(
            message_id = %delivery.message_id,
            subscription = %delivery.subscription_id,
            reason = %reason,
            "Subscriber could not accept delivery"
        );
        self.audit.subscriber_outcome(
            &delivery.message_id,
            delivery.subscription_id,
            DeliveryState::Failed { reason },
        );
        self.alerts.emit(
            AlertBuilder::new(AlertKind::DeliveryFailed)
                .timestamp(self.clock.now_ms())
                .message(delivery.message_id.clone())
                .agent(subscriber_id.to_string())
                .subscription(delivery.subscription_id)
                .detail(detail)
                .metadata("topic", delivery.topic.clone())
                .metadata("publisher", delivery.sender_id.clone())
                .build(),
        );
    }

    /// Close out a delivery whose subscription was removed.
    fn abandon(&self, delivery: &Delivery) {
        debug!(
            message_id = %delivery.message_id,
            subscription = %delivery.subscription_id,
            "Subscription removed, delivery abandoned"
        );
        self.audit.subscriber_outcome(
            &delivery.message_id,
            delivery.subscription_id,
            DeliveryState::Failed {
                reason: RejectReason::DeliveryFailed,
            },
        );
    }
}

pub struct DeliveryWorker {
    subscription_id: SubscriptionId,
    subscriber_id: AgentId,
    active: Arc<AtomicBool>,
    handler: Arc<dyn MessageHandler>,
    ctx: Arc<DeliveryContext>,
}

impl DeliveryWorker {
    pub fn new(
        subscription_id: SubscriptionId,
        subscriber_id: AgentId,
        active: Arc<AtomicBool>,
        handler: Arc<dyn MessageHandler>,
        ctx: Arc<DeliveryContext>,
    ) -> Self {
        Self {
            subscription_id,
            subscriber_id,
            active,
            handler,
            ctx,
        }
    }

    /// Run until the subscription's sender side is dropped.
    pub fn spawn(self, handle: &tokio::runtime::Handle, mut rx: mpsc::Receiver<Delivery>) -> JoinHandle<()> {
        handle.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if !self.is_active() {
                    self.ctx.abandon(&delivery);
                    continue;
                }
                self.deliver(delivery).await;
            }
            debug!(subscription = %self.subscription_id, "Delivery worker stopped");
        })
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn deliver(&self, delivery: Delivery) {
        let max_attempts = self.ctx.config.max_delivery_attempts.max(1);
        let timeout = self.ctx.config.handler_timeout();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 && !self.is_active() {
                self.ctx.abandon(&delivery);
                return;
            }

            let mut current = delivery.clone();
            current.attempt = attempt;
            let handler = self.handler.clone();
            let mut call = tokio::spawn(async move { handler.handle(current).await });

            let result = match tokio::time::timeout(timeout, &mut call).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(join_error)) => Err(format!("handler panicked: {}", join_error)),
                Err(_) => {
                    call.abort();
                    Err(format!("handler timed out after {}ms", timeout.as_millis()))
                }
            };

            match result {
                Ok(()) => {
                    debug!(
                        message_id = %delivery.message_id,
                        subscription = %self.subscription_id,
                        attempt,
                        "Delivered"
                    );
                    self.ctx
                        .record_outcome(&self.subscriber_id, &delivery.sender_id, Outcome::Success);
                    self.ctx.audit.subscriber_outcome(
                        &delivery.message_id,
                        self.subscription_id,
                        DeliveryState::Delivered { attempts: attempt },
                    );
                    return;
                }
                Err(reason) => {
                    warn!(
                        message_id = %delivery.message_id,
                        subscription = %self.subscription_id,
                        attempt,
                        max_attempts,
                        reason = %reason,
                        "Delivery attempt failed"
                    );
                    last_error = reason;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.ctx.backoff(attempt)).await;
                    }
                }
            }
        }

        self.ctx
            .record_outcome(&delivery.sender_id, &self.subscriber_id, Outcome::Failure);
        self.ctx.audit.subscriber_outcome(
            &delivery.message_id,
            self.subscription_id,
            DeliveryState::Failed {
                reason: RejectReason::DeliveryFailed,
            },
        );
        self.ctx.alerts.emit(
            AlertBuilder::new(AlertKind::DeliveryFailed)
                .timestamp(self.ctx.clock.now_ms())
                .message(delivery.message_id.clone())
                .agent(self.subscriber_id.clone())
                .subscription(self.subscription_id)
                .detail(format!(
                    "gave up after {} attempts: {}",
                    max_attempts, last_error
                ))
                .metadata("topic", delivery.topic.clone())
                .metadata("publisher", delivery.sender_id.clone())
                .build(),
        );
    }
}

/// Moves spilled deliveries into a full worker buffer, in order.
pub struct OverflowForwarder {
    subscriber_id: AgentId,
    active: Arc<AtomicBool>,
    sender: mpsc::Sender<Delivery>,
    spilled: Arc<AtomicUsize>,
    ctx: Arc<DeliveryContext>,
}

impl OverflowForwarder {
    pub fn new(
        subscriber_id: AgentId,
        active: Arc<AtomicBool>,
        sender: mpsc::Sender<Delivery>,
        spilled: Arc<AtomicUsize>,
        ctx: Arc<DeliveryContext>,
    ) -> Self {
        Self {
            subscriber_id,
            active,
            sender,
            spilled,
            ctx,
        }
    }

    /// Run until the subscription's overflow side is dropped.
    pub fn spawn(
        self,
        handle: &tokio::runtime::Handle,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
    ) -> JoinHandle<()> {
        handle.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                self.forward(delivery).await;
                self.spilled.fetch_sub(1, Ordering::AcqRel);
            }
        })
    }

    async fn forward(&self, mut delivery: Delivery) {
        let max_attempts = self.ctx.config.max_delivery_attempts.max(1);
        let wait = self.ctx.config.handler_timeout();

        for attempt in 1..=max_attempts {
            if !self.active.load(Ordering::Acquire) {
                self.ctx.abandon(&delivery);
                return;
            }
            match self.sender.send_timeout(delivery, wait).await {
                Ok(()) => {
                    debug!(subscriber = %self.subscriber_id, attempt, "Spilled delivery buffered");
                    return;
                }
                Err(SendTimeoutError::Closed(returned)) => {
                    self.ctx.fail_handoff(
                        &returned,
                        &self.subscriber_id,
                        RejectReason::DeliveryFailed,
                        "subscriber worker stopped".to_string(),
                    );
                    return;
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    delivery = returned;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.ctx.backoff(attempt)).await;
                    }
                }
            }
        }

        self.ctx.fail_handoff(
            &delivery,
            &self.subscriber_id,
            RejectReason::QueueFull,
            format!("subscriber buffer stayed full for {} attempts", max_attempts),
        );
    }
}
