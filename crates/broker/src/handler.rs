//! Subscriber-side delivery interface.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use trustgate_core::{AgentId, MessageId, Priority, SubscriptionId};
use trustgate_crypto::SealedPayload;

/// Failure reported by a handler. Triggers a retry while attempts remain.
#[derive(Debug, Clone, Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// One message handed to one subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub topic: String,
    pub sender_id: AgentId,
    /// Effective priority at dispatch (after policy demotion and aging)
    pub priority: Priority,
    pub created_at: u64,
    pub subscription_id: SubscriptionId,
    /// Ciphertext as published
    pub sealed: Arc<SealedPayload>,
    /// Decrypted payload; only present for authorized subscriptions
    pub plaintext: Option<Arc<[u8]>>,
    /// 1-based attempt counter
    pub attempt: u32,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        (self.0)(delivery).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
