//! Crypto error types.
//!
//! Errors never carry plaintext, key bytes or signatures.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Unknown key, expired key and failed tag all map to this one value.
    #[error("Decryption failed")]
    Decryption,

    #[error("Nonce space exhausted for key {key_id}")]
    NonceExhausted { key_id: String },

    /// Configured key material is unusable. Fatal at startup.
    #[error("No valid key: {0}")]
    NoValidKey(String),

    #[error("Unknown sender: {0}")]
    UnknownSender(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
