//! CryptoProtocol: authenticated encryption, signing and key rotation.
//!
//! # Key lifecycle
//!
//! 1. **Active**: exactly one key encrypts new payloads
//! 2. **Rotate**: a new key is appended and made active under one write lock
//! 3. **Decrypt-only**: previous keys keep opening ciphertexts until `expires_at`
//! 4. **Purge**: expired keys are dropped and their bytes zeroized
//!
//! If the active key has expired when `encrypt` is called, the protocol
//! rotates before sealing. Readers never observe a ring without an active key.

use crate::error::{CryptoError, CryptoResult};
use crate::keyring::{open_with, KeyMaterial, KeyRing, KEY_SIZE};
use crate::signing::{SenderKeyInfo, SenderKeyRegistry, SigningKey};
use chacha20poly1305::{aead::KeyInit, ChaCha20Poly1305, Key};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use trustgate_core::config::CryptoConfig;
use trustgate_core::{AlertBuilder, AlertKind, AlertSink, KeyId, SharedClock};
use zeroize::Zeroizing;

/// Output of [`CryptoProtocol::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub key_id: KeyId,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

pub struct CryptoProtocol {
    ring: RwLock<KeyRing>,
    node_key: SigningKey,
    senders: SenderKeyRegistry,
    key_lifetime_ms: u64,
    rotation_lead_ms: u64,
    clock: SharedClock,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl CryptoProtocol {
    /// Build from configuration.
    ///
    /// Fails with [`CryptoError::NoValidKey`] when provisioned key material is
    /// malformed or would already be expired.
    pub fn new(config: &CryptoConfig, clock: SharedClock) -> CryptoResult<Self> {
        let now = clock.now_ms();
        let key_lifetime_ms = config.key_lifetime_secs.saturating_mul(1000);
        if key_lifetime_ms == 0 {
            return Err(CryptoError::NoValidKey(
                "key lifetime of zero leaves no valid key".to_string(),
            ));
        }

        let initial = match &config.initial_key_hex {
            Some(key_hex) => KeyMaterial::from_bytes(parse_key_hex(key_hex)?, 1, now, key_lifetime_ms),
            None => KeyMaterial::generate(1, now, key_lifetime_ms),
        };
        let node_key = match &config.signing_key_hex {
            Some(key_hex) => SigningKey::from_hex(key_hex)?,
            None => SigningKey::generate(),
        };

        info!(key_id = %initial.key_id(), "Crypto protocol initialized");

        Ok(Self {
            ring: RwLock::new(KeyRing::new(initial)),
            node_key,
            senders: SenderKeyRegistry::new(),
            key_lifetime_ms,
            rotation_lead_ms: config.rotation_lead_secs.saturating_mul(1000),
            clock,
            alerts: None,
        })
    }

    /// Emit `KeyRotated` alerts to `sink`.
    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    /// Encrypt with the active key, rotating first if it is due.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<SealedPayload> {
        let now = self.clock.now_ms();
        {
            let ring = self.ring.read();
            let active = ring.active();
            if !self.rotation_due(active, now) {
                return Self::seal_with(active, plaintext);
            }
        }

        let mut ring = self.ring.write();
        // Another writer may have rotated while we waited
        if self.rotation_due(ring.active(), now) {
            self.install_new_key(&mut ring, now);
        }
        Self::seal_with(ring.active(), plaintext)
    }

    fn seal_with(key: &KeyMaterial, plaintext: &[u8]) -> CryptoResult<SealedPayload> {
        let (nonce, ciphertext) = key.seal(plaintext)?;
        Ok(SealedPayload {
            key_id: key.key_id().to_string(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    fn rotation_due(&self, key: &KeyMaterial, now: u64) -> bool {
        now.saturating_add(self.rotation_lead_ms) >= key.expires_at()
    }

    pub fn decrypt(&self, sealed: &SealedPayload) -> CryptoResult<Vec<u8>> {
        self.decrypt_with(&sealed.key_id, &sealed.nonce, &sealed.ciphertext)
    }

    /// Decrypt with a named key.
    ///
    /// Unknown key, expired key and a failed tag return the same error, and
    /// each path runs exactly one AEAD open.
    pub fn decrypt_with(&self, key_id: &str, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let now = self.clock.now_ms();
        let ring = self.ring.read();
        match ring.find(key_id) {
            Some(key) if !key.is_expired(now) => key.open(nonce, ciphertext),
            _ => {
                let throwaway = Zeroizing::new([0u8; KEY_SIZE]);
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&throwaway[..]));
                let _ = open_with(&cipher, nonce, ciphertext);
                Err(CryptoError::Decryption)
            }
        }
    }

    /// Append a new key and make it active. Returns the new key id.
    pub fn rotate_key(&self) -> KeyId {
        let now = self.clock.now_ms();
        let mut ring = self.ring.write();
        self.install_new_key(&mut ring, now)
    }

    fn install_new_key(&self, ring: &mut KeyRing, now: u64) -> KeyId {
        let previous = ring.active().key_id().to_string();
        let key = KeyMaterial::generate(ring.next_epoch(), now, self.key_lifetime_ms);
        let key_id = ring.install(key);

        info!(key_id = %key_id, previous_key_id = %previous, "Symmetric key rotated");
        if let Some(alerts) = &self.alerts {
            alerts.emit(
                AlertBuilder::new(AlertKind::KeyRotated)
                    .timestamp(now)
                    .detail(format!("active key is now {}", key_id))
                    .metadata("key_id", key_id.clone())
                    .metadata("previous_key_id", previous)
                    .build(),
            );
        }
        key_id
    }

    /// Drop expired decrypt-only keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let removed = self.ring.write().purge_expired(now);
        if removed > 0 {
            debug!(removed, "Purged expired keys");
        }
        removed
    }

    pub fn active_key_id(&self) -> KeyId {
        self.ring.read().active().key_id().to_string()
    }

    /// Ids of every retained key, oldest first.
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.ring.read().key_ids()
    }

    /// Sign with the node key.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.node_key.sign(payload)
    }

    /// Verify a node-key signature.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        self.node_key.verify(payload, signature)
    }

    /// Issue a signing key for `sender` unless it already has one.
    pub fn register_sender(&self, sender: &str) -> bool {
        self.senders.register(sender)
    }

    pub fn rotate_sender_key(&self, sender: &str) -> CryptoResult<u64> {
        self.senders.rotate(sender)
    }

    pub fn revoke_sender(&self, sender: &str) -> bool {
        self.senders.revoke(sender)
    }

    pub fn sender_key_info(&self, sender: &str) -> Option<SenderKeyInfo> {
        self.senders.info(sender)
    }

    /// Sign on behalf of a registered sender.
    pub fn sign_as(&self, sender: &str, payload: &[u8]) -> CryptoResult<Vec<u8>> {
        self.senders.sign(sender, payload)
    }

    /// Verify against the sender's current key; unknown senders fail.
    pub fn verify_from(&self, sender: &str, payload: &[u8], signature: &[u8]) -> bool {
        self.senders.verify(sender, payload, signature)
    }

    pub fn sender_registry(&self) -> &SenderKeyRegistry {
        &self.senders
    }
}

fn parse_key_hex(key_hex: &str) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    let bytes = Zeroizing::new(
        hex::decode(key_hex.trim())
            .map_err(|_| CryptoError::NoValidKey("initial key is not valid hex".to_string()))?,
    );
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::NoValidKey(format!(
            "initial key must be {} bytes",
            KEY_SIZE
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Ok(key)
}
