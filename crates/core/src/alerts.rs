//! Alert schema and delivery channel.
//!
//! Policy decisions that never surface as a synchronous error (rejections,
//! expiry, failed deliveries, trust non-convergence) are reported as
//! [`Alert`]s. Every alert is:
//! - logged through `tracing` at a level matching its severity
//! - broadcast to live subscribers of the [`AlertChannel`]
//! - retained in a bounded in-memory history for inspection

use crate::clock::current_timestamp_ms;
use crate::types::{AgentId, MessageId, SubscriptionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Severity level for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    /// Informational
    Info,
    /// Degraded but operating
    Warning,
    /// Operation failed
    Error,
    /// Security-relevant failure
    Critical,
}

/// Why a message (or one delivery of it) was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Signature did not verify against the sender's current key
    BadSignature,
    /// Ciphertext could not be opened
    DecryptionFailed,
    /// Publisher trust below threshold under the reject policy
    LowTrust,
    /// Publisher exhausted its token bucket
    RateLimited { retry_after_ms: u64 },
    /// Queue depth bound reached
    QueueFull,
    /// Handler kept failing after all attempts
    DeliveryFailed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::BadSignature => write!(f, "bad signature"),
            RejectReason::DecryptionFailed => write!(f, "decryption failed"),
            RejectReason::LowTrust => write!(f, "low trust"),
            RejectReason::RateLimited { retry_after_ms } => {
                write!(f, "rate limited (retry after {}ms)", retry_after_ms)
            }
            RejectReason::QueueFull => write!(f, "queue full"),
            RejectReason::DeliveryFailed => write!(f, "delivery failed"),
        }
    }
}

/// Kind of alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    /// Message rejected before or during delivery
    Rejected { reason: RejectReason },
    /// Message reached its deadline undelivered
    Expired,
    /// Trust iteration hit its cap before converging
    NonConvergenceWarning,
    /// One subscriber exhausted its delivery attempts
    DeliveryFailed,
    /// A new symmetric key became active
    KeyRotated,
}

impl AlertKind {
    /// Default severity for the kind.
    pub fn default_severity(&self) -> AlertSeverity {
        match self {
            AlertKind::Rejected {
                reason: RejectReason::BadSignature | RejectReason::DecryptionFailed,
            } => AlertSeverity::Critical,
            AlertKind::Rejected { .. } => AlertSeverity::Warning,
            AlertKind::Expired => AlertSeverity::Warning,
            AlertKind::NonConvergenceWarning => AlertSeverity::Warning,
            AlertKind::DeliveryFailed => AlertSeverity::Error,
            AlertKind::KeyRotated => AlertSeverity::Info,
        }
    }
}

/// Structured metadata for alerts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertMetadata {
    #[serde(flatten)]
    pub data: HashMap<String, serde_json::Value>,
}

impl AlertMetadata {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

/// A single alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert identifier
    pub alert_id: String,
    /// Timestamp (Unix epoch milliseconds)
    pub timestamp: u64,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    /// Message the alert concerns
    pub message_id: Option<MessageId>,
    /// Agent the alert concerns (usually the publisher)
    pub agent_id: Option<AgentId>,
    /// Subscription the alert concerns
    pub subscription_id: Option<SubscriptionId>,
    /// Human-readable detail; never contains key material or plaintext
    pub detail: String,
    pub metadata: AlertMetadata,
}

/// Builder for creating alerts.
pub struct AlertBuilder {
    alert: Alert,
}

impl AlertBuilder {
    pub fn new(kind: AlertKind) -> Self {
        Self {
            alert: Alert {
                alert_id: uuid::Uuid::new_v4().to_string(),
                timestamp: current_timestamp_ms(),
                severity: kind.default_severity(),
                kind,
                message_id: None,
                agent_id: None,
                subscription_id: None,
                detail: String::new(),
                metadata: AlertMetadata::default(),
            },
        }
    }

    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.alert.severity = severity;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.alert.timestamp = timestamp;
        self
    }

    pub fn message(mut self, message_id: impl Into<MessageId>) -> Self {
        self.alert.message_id = Some(message_id.into());
        self
    }

    pub fn agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.alert.agent_id = Some(agent_id.into());
        self
    }

    pub fn subscription(mut self, subscription_id: SubscriptionId) -> Self {
        self.alert.subscription_id = Some(subscription_id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.alert.detail = detail.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.alert.metadata.insert(key, value);
        self
    }

    pub fn build(self) -> Alert {
        self.alert
    }
}

/// Destination for alerts.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: Alert);
}

/// Default number of alerts retained in history
pub const DEFAULT_ALERT_HISTORY: usize = 4_096;

/// Broadcast alert channel with bounded history.
pub struct AlertChannel {
    sender: broadcast::Sender<Alert>,
    history: Mutex<VecDeque<Alert>>,
    history_limit: usize,
}

impl AlertChannel {
    pub fn new() -> Self {
        Self::with_capacity(1_024, DEFAULT_ALERT_HISTORY)
    }

    /// `capacity` bounds the broadcast buffer, `history_limit` the retained history.
    pub fn with_capacity(capacity: usize, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    /// Receive alerts emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }

    /// Snapshot of retained alerts, oldest first.
    pub fn history(&self) -> Vec<Alert> {
        self.history.lock().iter().cloned().collect()
    }

    /// Retained alerts matching a predicate.
    pub fn find(&self, mut predicate: impl FnMut(&Alert) -> bool) -> Vec<Alert> {
        self.history
            .lock()
            .iter()
            .filter(|a| predicate(a))
            .cloned()
            .collect()
    }

    fn log(alert: &Alert) {
        let kind = serde_json::to_string(&alert.kind).unwrap_or_default();
        let message_id = alert.message_id.as_deref().unwrap_or("-");
        let agent_id = alert.agent_id.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Info => {
                info!(kind = %kind, message_id, agent_id, detail = %alert.detail, "alert")
            }
            AlertSeverity::Warning => {
                warn!(kind = %kind, message_id, agent_id, detail = %alert.detail, "alert")
            }
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(kind = %kind, message_id, agent_id, detail = %alert.detail, "alert")
            }
        }
    }
}

impl Default for AlertChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for AlertChannel {
    fn emit(&self, alert: Alert) {
        Self::log(&alert);
        if self.history_limit > 0 {
            let mut history = self.history.lock();
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }
        // No live receivers is normal
        let _ = self.sender.send(alert);
    }
}
