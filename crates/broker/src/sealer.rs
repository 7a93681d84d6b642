//! Publisher-side helper that encrypts and signs outgoing messages.

use crate::error::BrokerResult;
use std::sync::Arc;
use tracing::debug;
use trustgate_core::{new_message_id, AgentId, Priority, SecureMessage, SharedClock};
use trustgate_crypto::CryptoProtocol;

/// Builds [`SecureMessage`]s for one sender.
pub struct MessageSealer {
    crypto: Arc<CryptoProtocol>,
    sender_id: AgentId,
    clock: SharedClock,
    default_ttl_secs: u64,
}

impl MessageSealer {
    /// Registers `sender_id` for signing if it has no key yet.
    pub fn new(crypto: Arc<CryptoProtocol>, sender_id: impl Into<AgentId>, clock: SharedClock) -> Self {
        let sender_id = sender_id.into();
        crypto.register_sender(&sender_id);
        Self {
            crypto,
            sender_id,
            clock,
            default_ttl_secs: 600,
        }
    }

    pub fn with_default_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn seal(&self, topic: &str, priority: Priority, payload: &[u8]) -> BrokerResult<SecureMessage> {
        self.seal_with_ttl(topic, priority, payload, self.default_ttl_secs)
    }

    pub fn seal_with_ttl(
        &self,
        topic: &str,
        priority: Priority,
        payload: &[u8],
        ttl_seconds: u64,
    ) -> BrokerResult<SecureMessage> {
        let sealed = self.crypto.encrypt(payload)?;
        let mut message = SecureMessage {
            message_id: new_message_id(),
            topic: topic.to_string(),
            priority,
            key_id: sealed.key_id,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            signature: Vec::new(),
            sender_id: self.sender_id.clone(),
            created_at: self.clock.now_ms(),
            ttl_seconds,
        };
        message.signature = self.crypto.sign_as(&self.sender_id, &message.signing_bytes())?;
        debug!(message_id = %message.message_id, topic, "Message sealed");
        Ok(message)
    }
}
