//! Broker error types
//!
//! Only shape problems surface synchronously from `publish`; policy
//! rejections are reported as alerts and in the message's status.

use thiserror::Error;
use trustgate_core::CoreError;
use trustgate_crypto::CryptoError;
use trustgate_trust_mesh::TrustError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("No Tokio runtime available")]
    NoRuntime,

    #[error("Broker already started")]
    AlreadyStarted,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),

    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
