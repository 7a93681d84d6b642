//! Symmetric key ring with explicit expiry.
//!
//! The ring is an ordered, append-only list of [`KeyMaterial`]. The last
//! entry is the active key used for new encryptions; earlier entries stay
//! decrypt-only until their `expires_at`, after which [`KeyRing::purge_expired`]
//! drops them. Key bytes live in `Zeroizing` buffers and are wiped on drop.
//!
//! # Nonces
//!
//! Each key owns a random 4-byte prefix and a 64-bit counter. A nonce is
//! `prefix || counter_be`, so a key never reuses a nonce; running out of
//! counter values is reported as [`CryptoError::NonceExhausted`].

use crate::error::{CryptoError, CryptoResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce as ChaCha20Nonce,
};
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use trustgate_core::KeyId;
use zeroize::Zeroizing;

/// Symmetric key size (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

const NONCE_PREFIX_SIZE: usize = 4;

/// One symmetric key and its validity window.
pub struct KeyMaterial {
    key_id: KeyId,
    key: Zeroizing<[u8; KEY_SIZE]>,
    created_at: u64,
    expires_at: u64,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    next_counter: AtomicU64,
}

impl KeyMaterial {
    /// Generate fresh random key material.
    pub fn generate(epoch: u64, created_at: u64, lifetime_ms: u64) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self::from_bytes(key, epoch, created_at, lifetime_ms)
    }

    /// Wrap provisioned key bytes.
    pub fn from_bytes(
        key: Zeroizing<[u8; KEY_SIZE]>,
        epoch: u64,
        created_at: u64,
        lifetime_ms: u64,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        rng.fill_bytes(&mut nonce_prefix);
        let mut tag = [0u8; 2];
        rng.fill_bytes(&mut tag);

        Self {
            key_id: format!("key-{:04}-{}", epoch, hex::encode(tag)),
            key,
            created_at,
            expires_at: created_at.saturating_add(lifetime_ms),
            nonce_prefix,
            next_counter: AtomicU64::new(0),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// True once `now_ms` has reached `expires_at`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }

    fn next_nonce(&self) -> CryptoResult<[u8; NONCE_SIZE]> {
        let counter = self
            .next_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .map_err(|_| CryptoError::NonceExhausted {
                key_id: self.key_id.clone(),
            })?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }

    /// Encrypt with a fresh nonce. Returns `(nonce, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<([u8; NONCE_SIZE], Vec<u8>)> {
        let nonce = self.next_nonce()?;
        let ciphertext = self
            .cipher()
            .encrypt(ChaCha20Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption("AEAD seal failed".to_string()))?;
        Ok((nonce, ciphertext))
    }

    /// Authenticated decryption.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        open_with(&self.cipher(), nonce, ciphertext)
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&self, value: u64) {
        self.next_counter.store(value, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Runs one AEAD open. A malformed nonce is still pushed through the cipher
/// (with a zero nonce) so every failure path costs the same.
pub(crate) fn open_with(
    cipher: &ChaCha20Poly1305,
    nonce: &[u8],
    ciphertext: &[u8],
) -> CryptoResult<Vec<u8>> {
    let well_formed = nonce.len() == NONCE_SIZE;
    let zero_nonce = [0u8; NONCE_SIZE];
    let nonce = if well_formed { nonce } else { &zero_nonce[..] };

    let result = cipher.decrypt(ChaCha20Nonce::from_slice(nonce), ciphertext);
    match result {
        Ok(plaintext) if well_formed => Ok(plaintext),
        _ => Err(CryptoError::Decryption),
    }
}

/// Ordered, append-only list of keys; the last key is active.
#[derive(Debug)]
pub struct KeyRing {
    keys: Vec<KeyMaterial>,
    epoch: u64,
}

impl KeyRing {
    pub fn new(initial: KeyMaterial) -> Self {
        Self {
            keys: vec![initial],
            epoch: 1,
        }
    }

    /// Key used for new encryptions.
    pub fn active(&self) -> &KeyMaterial {
        // `keys` is never empty: construction seeds it and purge keeps the last entry
        &self.keys[self.keys.len() - 1]
    }

    /// Epoch number the next generated key will carry.
    pub fn next_epoch(&self) -> u64 {
        self.epoch + 1
    }

    pub fn find(&self, key_id: &str) -> Option<&KeyMaterial> {
        self.keys.iter().rev().find(|k| k.key_id == key_id)
    }

    /// Append a key and make it active.
    pub fn install(&mut self, key: KeyMaterial) -> KeyId {
        let key_id = key.key_id.clone();
        self.keys.push(key);
        self.epoch += 1;
        key_id
    }

    /// Drop expired keys other than the active one. Dropped keys are zeroized.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let last = self.keys.len() - 1;
        let before = self.keys.len();
        let mut index = 0;
        self.keys.retain(|k| {
            let keep = index == last || !k.is_expired(now_ms);
            index += 1;
            keep
        });
        before - self.keys.len()
    }

    pub fn key_ids(&self) -> Vec<KeyId> {
        self.keys.iter().map(|k| k.key_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
