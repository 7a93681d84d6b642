//! Keyed-hash message signing.
//!
//! Signatures are BLAKE3 keyed hashes (MACs) over canonical bytes:
//! - the node signs its own records with a node key
//! - each agent signs with a per-sender key held in [`SenderKeyRegistry`]
//! - verification compares `blake3::Hash` values, which is constant-time
//!
//! Key bytes never leave this module and are zeroized on drop.

use crate::error::{CryptoError, CryptoResult};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use trustgate_core::AgentId;
use zeroize::Zeroizing;

/// Signature size (BLAKE3 output, 32 bytes).
pub const SIGNATURE_SIZE: usize = 32;

/// One MAC key.
pub struct SigningKey {
    key: Zeroizing<[u8; blake3::KEY_LEN]>,
}

impl SigningKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; blake3::KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self { key }
    }

    /// Parse a hex-encoded 32-byte key.
    pub fn from_hex(key_hex: &str) -> CryptoResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(key_hex.trim())
                .map_err(|_| CryptoError::NoValidKey("signing key is not valid hex".to_string()))?,
        );
        if bytes.len() != blake3::KEY_LEN {
            return Err(CryptoError::NoValidKey(format!(
                "signing key must be {} bytes",
                blake3::KEY_LEN
            )));
        }
        let mut key = Zeroizing::new([0u8; blake3::KEY_LEN]);
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        blake3::keyed_hash(&self.key, payload).as_bytes().to_vec()
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(provided) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
            return false;
        };
        blake3::keyed_hash(&self.key, payload) == blake3::Hash::from(provided)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

/// Lifecycle state of a sender key, as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyInfo {
    /// Incremented on each rotation, starting at 1
    pub generation: u64,
    pub revoked: bool,
}

struct SenderKey {
    key: SigningKey,
    generation: u64,
    revoked: bool,
}

/// Metrics for observability.
#[derive(Debug, Default)]
pub struct SigningMetrics {
    pub signatures_total: AtomicU64,
    pub verifications_total: AtomicU64,
    pub verification_failures_total: AtomicU64,
}

/// Per-sender signing keys.
#[derive(Default)]
pub struct SenderKeyRegistry {
    keys: RwLock<HashMap<AgentId, SenderKey>>,
    metrics: SigningMetrics,
}

impl SenderKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key for `sender` unless one exists. Returns true when created.
    ///
    /// Registering a revoked sender issues it a fresh key.
    pub fn register(&self, sender: &str) -> bool {
        let mut keys = self.keys.write();
        match keys.get_mut(sender) {
            Some(existing) if !existing.revoked => false,
            Some(existing) => {
                existing.key = SigningKey::generate();
                existing.generation += 1;
                existing.revoked = false;
                info!(sender_id = %sender, generation = existing.generation, "Sender key reissued");
                true
            }
            None => {
                keys.insert(
                    sender.to_string(),
                    SenderKey {
                        key: SigningKey::generate(),
                        generation: 1,
                        revoked: false,
                    },
                );
                debug!(sender_id = %sender, "Sender key registered");
                true
            }
        }
    }

    /// Replace the sender's key; signatures made with the old key stop verifying.
    pub fn rotate(&self, sender: &str) -> CryptoResult<u64> {
        let mut keys = self.keys.write();
        let entry = keys
            .get_mut(sender)
            .filter(|k| !k.revoked)
            .ok_or_else(|| CryptoError::UnknownSender(sender.to_string()))?;
        entry.key = SigningKey::generate();
        entry.generation += 1;
        info!(sender_id = %sender, generation = entry.generation, "Sender key rotated");
        Ok(entry.generation)
    }

    /// Revoke the sender's key. Returns false if the sender was unknown.
    pub fn revoke(&self, sender: &str) -> bool {
        let mut keys = self.keys.write();
        match keys.get_mut(sender) {
            Some(entry) => {
                entry.key = SigningKey::generate();
                entry.revoked = true;
                info!(sender_id = %sender, "Sender key revoked");
                true
            }
            None => false,
        }
    }

    pub fn sign(&self, sender: &str, payload: &[u8]) -> CryptoResult<Vec<u8>> {
        let keys = self.keys.read();
        let entry = keys
            .get(sender)
            .filter(|k| !k.revoked)
            .ok_or_else(|| CryptoError::UnknownSender(sender.to_string()))?;
        self.metrics.signatures_total.fetch_add(1, Ordering::Relaxed);
        Ok(entry.key.sign(payload))
    }

    /// Verify against the sender's current key. Unknown or revoked senders fail.
    pub fn verify(&self, sender: &str, payload: &[u8], signature: &[u8]) -> bool {
        self.metrics.verifications_total.fetch_add(1, Ordering::Relaxed);
        let valid = self
            .keys
            .read()
            .get(sender)
            .filter(|k| !k.revoked)
            .map(|k| k.key.verify(payload, signature))
            .unwrap_or(false);
        if !valid {
            self.metrics
                .verification_failures_total
                .fetch_add(1, Ordering::Relaxed);
        }
        valid
    }

    pub fn info(&self, sender: &str) -> Option<SenderKeyInfo> {
        self.keys.read().get(sender).map(|k| SenderKeyInfo {
            generation: k.generation,
            revoked: k.revoked,
        })
    }

    pub fn metrics(&self) -> &SigningMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_and_bit_flip() {
        let key = SigningKey::generate();
        let payload = b"topic=agents.status;seq=1".to_vec();
        let signature = key.sign(&payload);
        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert!(key.verify(&payload, &signature));

        let mut tampered = payload.clone();
        tampered[0] ^= 0x01;
        assert!(!key.verify(&tampered, &signature));

        let mut bad_sig = signature.clone();
        bad_sig[31] ^= 0x80;
        assert!(!key.verify(&payload, &bad_sig));
        assert!(!key.verify(&payload, &signature[..16]));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = SigningKey::from_hex(&"11".repeat(32)).unwrap();
        assert_eq!(key.sign(b"abc"), key.sign(b"abc"));
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(matches!(
            SigningKey::from_hex("zz"),
            Err(CryptoError::NoValidKey(_))
        ));
        assert!(matches!(
            SigningKey::from_hex(&"ab".repeat(16)),
            Err(CryptoError::NoValidKey(_))
        ));
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = SenderKeyRegistry::new();
        assert!(registry.register("agent-a"));
        assert!(!registry.register("agent-a"));

        let signature = registry.sign("agent-a", b"payload").unwrap();
        assert!(registry.verify("agent-a", b"payload", &signature));
        assert!(!registry.verify("agent-b", b"payload", &signature));

        assert_eq!(registry.rotate("agent-a").unwrap(), 2);
        assert!(!registry.verify("agent-a", b"payload", &signature));

        assert!(registry.revoke("agent-a"));
        assert!(registry.sign("agent-a", b"payload").is_err());
        assert!(registry.info("agent-a").unwrap().revoked);

        assert!(registry.register("agent-a"));
        assert_eq!(registry.info("agent-a").unwrap().generation, 3);
        assert_eq!(
            registry
                .metrics()
                .verification_failures_total
                .load(Ordering::Relaxed),
            2
        );
    }
}
