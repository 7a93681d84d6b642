//! Core functionality for the TrustGate agent messaging substrate.
//!
//! This crate provides the shared data model, configuration, logging,
//! alerting, time source and persistence interface used by the crypto,
//! trust and broker crates.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod types;

pub use alerts::{
    Alert, AlertBuilder, AlertChannel, AlertKind, AlertMetadata, AlertSeverity, AlertSink,
    RejectReason,
};
pub use clock::{current_timestamp_ms, Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use persistence::{keys, GatewayExt, InMemoryGateway, PersistenceGateway};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteGateway;
pub use types::{
    new_message_id, AgentId, KeyId, MessageId, Outcome, Priority, SecureMessage, SubscriptionId,
    TransactionRecord,
};
