//! Core types shared by the crypto, trust and broker crates.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable unique agent identifier
pub type AgentId = String;

/// Unique message identifier (UUID v4 string)
pub type MessageId = String;

/// Symmetric key identifier
pub type KeyId = String;

/// Generate a fresh message identifier.
pub fn new_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

/// Broker-assigned subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Delivery priority. Declaration order is urgency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Delivered before everything else
    Critical,
    /// Elevated
    High,
    /// Default
    Normal,
    /// Background traffic
    Low,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Tier index (0 = most urgent).
    pub fn tier(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Priority for a tier index; indices past the last tier clamp to `Low`.
    pub fn from_tier(tier: usize) -> Self {
        match tier {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    /// One tier less urgent (saturating at `Low`).
    pub fn demoted(self) -> Self {
        Self::from_tier(self.tier() + 1)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Observed outcome of an interaction between two agents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "quality", rename_all = "lowercase")]
pub enum Outcome {
    /// Interaction completed as expected
    Success,
    /// Interaction failed
    Failure,
    /// Graded outcome in [0, 1]
    Quality(f64),
}

impl Outcome {
    /// Quality of the outcome in [0, 1].
    pub fn quality(&self) -> f64 {
        match self {
            Outcome::Success => 1.0,
            Outcome::Failure => 0.0,
            Outcome::Quality(q) => q.clamp(0.0, 1.0),
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if let Outcome::Quality(q) = self {
            if !q.is_finite() || !(0.0..=1.0).contains(q) {
                return Err(CoreError::InvalidData(format!(
                    "outcome quality {} outside [0, 1]",
                    q
                )));
            }
        }
        Ok(())
    }
}

/// Immutable record of one observed interaction.
///
/// `from_agent` observed `to_agent` and rated the interaction with `outcome`.
/// Fields are private and exposed read-only; records are never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    from_agent: AgentId,
    to_agent: AgentId,
    outcome: Outcome,
    timestamp: u64,
}

impl TransactionRecord {
    /// Create a validated record.
    pub fn new(
        from_agent: impl Into<AgentId>,
        to_agent: impl Into<AgentId>,
        outcome: Outcome,
        timestamp: u64,
    ) -> CoreResult<Self> {
        let record = Self {
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            outcome,
            timestamp,
        };
        record.validate()?;
        Ok(record)
    }

    /// Re-check constraints (used after deserializing persisted records).
    pub fn validate(&self) -> CoreResult<()> {
        if self.from_agent.is_empty() || self.to_agent.is_empty() {
            return Err(CoreError::InvalidData(
                "transaction agents must be non-empty".to_string(),
            ));
        }
        self.outcome.validate()
    }

    /// Observing agent
    pub fn from_agent(&self) -> &str {
        &self.from_agent
    }

    /// Observed agent
    pub fn to_agent(&self) -> &str {
        &self.to_agent
    }

    /// Rated outcome
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Observation time (Unix epoch milliseconds)
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// Encrypted, signed message as carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureMessage {
    /// Unique message identifier
    pub message_id: MessageId,
    /// Dot-separated topic (e.g. `agents.search.results`)
    pub topic: String,
    /// Delivery priority
    pub priority: Priority,
    /// Identifier of the symmetric key used for `ciphertext`
    pub key_id: KeyId,
    /// AEAD nonce
    pub nonce: Vec<u8>,
    /// AEAD ciphertext including tag
    pub ciphertext: Vec<u8>,
    /// Keyed-hash signature over [`SecureMessage::signing_bytes`]
    pub signature: Vec<u8>,
    /// Publishing agent
    pub sender_id: AgentId,
    /// Creation time (Unix epoch milliseconds)
    pub created_at: u64,
    /// Lifetime after `created_at`
    pub ttl_seconds: u64,
}

/// Domain tag for message signatures
const MESSAGE_SIGNING_DOMAIN: &[u8] = b"trustgate.secure-message.v1";

impl SecureMessage {
    /// Canonical byte representation covered by the signature.
    ///
    /// Every variable-length field is length-prefixed so distinct messages
    /// can never produce the same byte string.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            MESSAGE_SIGNING_DOMAIN.len() + self.ciphertext.len() + self.topic.len() + 128,
        );
        put_field(&mut buf, MESSAGE_SIGNING_DOMAIN);
        put_field(&mut buf, self.message_id.as_bytes());
        put_field(&mut buf, self.topic.as_bytes());
        buf.push(self.priority.tier() as u8);
        put_field(&mut buf, self.key_id.as_bytes());
        put_field(&mut buf, &self.nonce);
        put_field(&mut buf, &self.ciphertext);
        put_field(&mut buf, self.sender_id.as_bytes());
        buf.extend_from_slice(&self.created_at.to_le_bytes());
        buf.extend_from_slice(&self.ttl_seconds.to_le_bytes());
        buf
    }

    /// Absolute expiry deadline (Unix epoch milliseconds).
    pub fn deadline_ms(&self) -> u64 {
        self.created_at
            .saturating_add(self.ttl_seconds.saturating_mul(1000))
    }

    /// True once `now_ms` has reached the deadline.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms()
    }
}

fn put_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}
