//! Core error types

use thiserror::Error;

/// Core error type for TrustGate
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value violated a data model constraint
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Persistence backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result alias used across the core crate
pub type CoreResult<T> = std::result::Result<T, CoreError>;
