//! Message lifecycle tracking and signed audit trail.
//!
//! Every state transition and every per-subscriber outcome produces one
//! [`AuditEntry`]. Entries are signed with the node key and written to the
//! persistence gateway under `audit:{message_id}:{seq}`; the latest state
//! of each message is also kept in memory for [`AuditTrail::status`].
//!
//! A message id that is already tracked is refused, which makes replaying
//! a captured message a validation error rather than a second delivery.

use crate::error::{BrokerError, BrokerResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use trustgate_core::{
    keys, AgentId, GatewayExt, MessageId, PersistenceGateway, RejectReason, SecureMessage,
    SharedClock, SubscriptionId,
};
use trustgate_crypto::CryptoProtocol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Submitted,
    Verified,
    Queued,
    /// Handed to every matching subscription's worker
    Delivered,
    Expired,
    Rejected { reason: RejectReason },
    Cancelled,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageState::Delivered
                | MessageState::Expired
                | MessageState::Rejected { .. }
                | MessageState::Cancelled
        )
    }
}

/// Outcome of a message for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered { attempts: u32 },
    Failed { reason: RejectReason },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatus {
    pub message_id: MessageId,
    pub sender_id: AgentId,
    pub topic: String,
    pub state: MessageState,
    pub updated_at: u64,
    pub subscribers: BTreeMap<SubscriptionId, DeliveryState>,
    #[serde(skip)]
    next_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub message_id: MessageId,
    pub seq: u64,
    pub timestamp: u64,
    pub state: MessageState,
    pub subscription_id: Option<SubscriptionId>,
    pub delivery: Option<DeliveryState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedAuditEntry {
    entry: AuditEntry,
    signature: String,
}

pub struct AuditTrail {
    statuses: Mutex<HashMap<MessageId, MessageStatus>>,
    crypto: Arc<CryptoProtocol>,
    gateway: Option<Arc<dyn PersistenceGateway>>,
    clock: SharedClock,
    ttl: Duration,
}

impl AuditTrail {
    pub fn new(
        crypto: Arc<CryptoProtocol>,
        gateway: Option<Arc<dyn PersistenceGateway>>,
        clock: SharedClock,
        ttl: Duration,
    ) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            crypto,
            gateway,
            clock,
            ttl,
        }
    }

    /// Start tracking a message in `Submitted`. Fails on a duplicate id.
    pub fn begin(&self, message: &SecureMessage) -> BrokerResult<()> {
        let now = self.clock.now_ms();
        let entry = {
            let mut statuses = self.statuses.lock();
            if statuses.contains_key(&message.message_id) {
                return Err(BrokerError::Validation(format!(
                    "duplicate message id {}",
                    message.message_id
                )));
            }
            let status = statuses
                .entry(message.message_id.clone())
                .or_insert(MessageStatus {
                    message_id: message.message_id.clone(),
                    sender_id: message.sender_id.clone(),
                    topic: message.topic.clone(),
                    state: MessageState::Submitted,
                    updated_at: now,
                    subscribers: BTreeMap::new(),
                    next_seq: 0,
                });
            Self::next_entry(status, now, None, None)
        };
        self.persist(entry);
        Ok(())
    }

    /// Move a tracked message to `state`.
    pub fn transition(&self, message_id: &str, state: MessageState) {
        let now = self.clock.now_ms();
        let entry = {
            let mut statuses = self.statuses.lock();
            let Some(status) = statuses.get_mut(message_id) else {
                warn!(message_id, "Transition for untracked message");
                return;
            };
            status.state = state;
            status.updated_at = now;
            Self::next_entry(status, now, None, None)
        };
        self.persist(entry);
    }

    /// Move to `to` only if the message is currently in `from`.
    pub fn transition_from(&self, message_id: &str, from: &MessageState, to: MessageState) -> bool {
        let now = self.clock.now_ms();
        let entry = {
            let mut statuses = self.statuses.lock();
            match statuses.get_mut(message_id) {
                Some(status) if &status.state == from => {
                    status.state = to;
                    status.updated_at = now;
                    Self::next_entry(status, now, None, None)
                }
                _ => return false,
            }
        };
        self.persist(entry);
        true
    }

    /// Record the outcome of a message for one subscription.
    pub fn subscriber_outcome(
        &self,
        message_id: &str,
        subscription_id: SubscriptionId,
        delivery: DeliveryState,
    ) {
        let now = self.clock.now_ms();
        let entry = {
            let mut statuses = self.statuses.lock();
            let Some(status) = statuses.get_mut(message_id) else {
                return;
            };
            status.subscribers.insert(subscription_id, delivery.clone());
            status.updated_at = now;
            Self::next_entry(status, now, Some(subscription_id), Some(delivery))
        };
        self.persist(entry);
    }

    fn next_entry(
        status: &mut MessageStatus,
        now: u64,
        subscription_id: Option<SubscriptionId>,
        delivery: Option<DeliveryState>,
    ) -> AuditEntry {
        let seq = status.next_seq;
        status.next_seq += 1;
        AuditEntry {
            message_id: status.message_id.clone(),
            seq,
            timestamp: now,
            state: status.state.clone(),
            subscription_id,
            delivery,
        }
    }

    fn persist(&self, entry: AuditEntry) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        let signed = match serde_json::to_vec(&entry) {
            Ok(bytes) => SignedAuditEntry {
                signature: hex::encode(self.crypto.sign(&bytes)),
                entry,
            },
            Err(e) => {
                warn!(error = %e, "Failed to encode audit entry");
                return;
            }
        };
        let key = keys::audit(&signed.entry.message_id, signed.entry.seq);
        if let Err(e) = gateway.put_json(&key, &signed, Some(self.ttl)) {
            warn!(error = %e, key = %key, "Failed to persist audit entry");
        }
    }

    pub fn status(&self, message_id: &str) -> Option<MessageStatus> {
        self.statuses.lock().get(message_id).cloned()
    }

    #[cfg(test)]
    fn state(&self, message_id: &str) -> Option<MessageState> {
        self.statuses.lock().get(message_id).map(|s| s.state.clone())
    }

    /// Persisted entries for a message, oldest first. Entries whose
    /// signature does not verify are dropped.
    pub fn entries(&self, message_id: &str) -> BrokerResult<Vec<AuditEntry>> {
        let Some(gateway) = &self.gateway else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for (key, signed) in gateway.scan_json::<SignedAuditEntry>(&keys::audit_prefix(message_id))? {
            let bytes = serde_json::to_vec(&signed.entry).map_err(trustgate_core::CoreError::from)?;
            let valid = hex::decode(&signed.signature)
                .map(|signature| self.crypto.verify(&bytes, &signature))
                .unwrap_or(false);
            if valid {
                entries.push(signed.entry);
            } else {
                warn!(key = %key, "Audit entry failed signature check");
            }
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Forget terminal messages last updated longer ago than the audit TTL.
    pub fn prune(&self) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.ttl.as_millis() as u64);
        let mut statuses = self.statuses.lock();
        let before = statuses.len();
        statuses.retain(|_, s| !(s.state.is_terminal() && s.updated_at < cutoff));
        let removed = before - statuses.len();
        if removed > 0 {
            debug!(removed, "Pruned message statuses");
        }
        removed
    }

    pub fn tracked(&self) -> usize {
        self.statuses.lock().len()
    }
}
