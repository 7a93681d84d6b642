//! Trust Mesh Service
//!
//! This crate implements the global trust engine that provides:
//! - Append-only transaction history fed by delivery outcomes and explicit feedback
//! - EigenTrust power iteration over a recency-weighted local trust graph
//! - Temporal decay of previous scores toward the prior
//! - Copy-on-write, versioned trust snapshots readable without blocking
//! - Scheduled and threshold-triggered recomputation
//! - Composite agent ranking
//!
//! The broker reads scores from here to gate admission and priority.

pub mod engine;
pub mod error;
pub mod graph;
pub mod history;
pub mod rank;
pub mod scheduler;
pub mod trust;

pub use engine::{power_iterate, IterationOutcome, IterationParams};
pub use error::{TrustError, TrustResult};
pub use graph::{EvidenceWeighting, TrustGraph};
pub use history::{HistorySnapshot, TransactionLog};
pub use rank::{compute_rank, AgentPerformance, RankWeights, DEFAULT_TASK_COMPLEXITY};
pub use scheduler::TrustScheduler;
pub use trust::{
    RecomputeReport, RecomputeTrigger, TrustLevel, TrustScore, TrustScorer, TrustSnapshot,
};
