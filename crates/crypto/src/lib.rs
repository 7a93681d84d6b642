//! Cryptographic message security for TrustGate.
//!
//! This crate gives the broker authenticity and confidentiality for agent
//! messages without exposing key material to callers.
//!
//! # Core Capabilities
//!
//! - **Authenticated Encryption**: ChaCha20-Poly1305 with counter-based nonces
//! - **Message Signing**: BLAKE3 keyed hashes, per node and per sender
//! - **Key Rotation**: append-only key ring, decrypt-only retention until expiry
//!
//! # Security Principles
//!
//! - Secrets must never be logged, serialized or returned
//! - All signatures are verified in constant time
//! - Decryption failures are opaque: unknown key, expired key and bad tag
//!   produce the same error
//! - Key bytes are zeroized when a key is dropped

pub mod error;
pub mod keyring;
pub mod protocol;
pub mod signing;

pub use error::{CryptoError, CryptoResult};
pub use keyring::{KeyMaterial, KeyRing, KEY_SIZE, NONCE_SIZE};
pub use protocol::{CryptoProtocol, SealedPayload};
pub use signing::{SenderKeyInfo, SenderKeyRegistry, SigningKey, SigningMetrics, SIGNATURE_SIZE};
