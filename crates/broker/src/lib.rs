//! Secure message broker for TrustGate.
//!
//! Agents publish encrypted, signed [`SecureMessage`](trustgate_core::SecureMessage)s
//! on dot-separated topics. The broker:
//! - verifies every signature before a message can be queued
//! - consults the trust engine to reject or deprioritize low-trust publishers
//! - applies per-publisher token buckets
//! - orders delivery by priority tier with FIFO ties and aging
//! - expires messages at `created_at + ttl`
//! - delivers through one ordered worker per subscription, with bounded
//!   retries and a handler timeout
//! - feeds delivery outcomes back to the trust engine
//!
//! Every lifecycle step is recorded in a signed audit trail.

pub mod audit;
pub mod broker;
pub mod error;
pub mod handler;
pub mod pattern;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod sealer;
pub mod worker;

pub use audit::{AuditEntry, AuditTrail, DeliveryState, MessageState, MessageStatus};
pub use broker::{SecureBroker, SecureBrokerBuilder};
pub use error::{BrokerError, BrokerResult};
pub use handler::{handler_fn, Delivery, HandlerError, MessageHandler};
pub use pattern::{validate_topic, TopicPattern};
pub use queue::{PriorityQueue, QueuedMessage};
pub use rate_limit::{RateDecision, RateLimiter, TokenBucket};
pub use sealer::MessageSealer;
