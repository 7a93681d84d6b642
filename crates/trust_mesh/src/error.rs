//! Trust engine error types

use thiserror::Error;
use trustgate_core::CoreError;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),
}

pub type TrustResult<T> = Result<T, TrustError>;
