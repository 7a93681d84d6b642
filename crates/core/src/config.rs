//! Configuration management for TrustGate.
//!
//! Every section deserializes with defaults, so a TOML file only needs to
//! name the values it overrides:
//!
//! ```toml
//! [node]
//! node_id = "gate-01"
//!
//! [trust]
//! damping_factor = 0.9
//! pre_trusted = ["planner", "auditor"]
//!
//! [broker]
//! max_rate_per_sec = 250.0
//! low_trust_policy = "reject"
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::AgentId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub logging: LoggingConfig,
    pub crypto: CryptoConfig,
    pub trust: TrustConfig,
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity of this node; also the sender id of node-originated traffic
    pub node_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "trustgate-node".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Lifetime of each symmetric key
    pub key_lifetime_secs: u64,
    /// Optional pre-provisioned 32-byte key (hex); generated when absent
    pub initial_key_hex: Option<String>,
    /// Optional pre-provisioned 32-byte node signing key (hex)
    pub signing_key_hex: Option<String>,
    /// Rotate automatically this long before the active key expires
    pub rotation_lead_secs: u64,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_lifetime_secs: 86_400, // 24 hours
            initial_key_hex: None,
            signing_key_hex: None,
            rotation_lead_secs: 0,
        }
    }
}

impl CryptoConfig {
    pub fn key_lifetime(&self) -> Duration {
        Duration::from_secs(self.key_lifetime_secs)
    }
}

/// How raw (sum-normalized) trust is mapped to the published score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreNormalization {
    /// Published score equals the raw share; scores sum to 1
    Sum,
    /// Published score is the raw share divided by the maximum share
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Weight of the propagated term (alpha)
    pub damping_factor: f64,
    /// L1 distance below which iteration stops
    pub convergence_threshold: f64,
    /// Iteration cap per recompute
    pub max_iterations: usize,
    /// Per-unit decay of a previous score toward the prior
    pub decay_factor: f64,
    /// Length of one decay unit
    pub decay_unit_secs: u64,
    /// Per-unit decay applied to the weight of old evidence
    pub evidence_decay: f64,
    /// Floor used for ranking low-trust agents
    pub trust_threshold: f64,
    /// Published score at or above which an agent is healthy
    pub healthy_threshold: f64,
    /// Published score mapping
    pub normalization: ScoreNormalization,
    /// Agents the teleport vector is concentrated on (uniform when empty)
    pub pre_trusted: Vec<AgentId>,
    /// Only records younger than this enter a recompute
    pub history_window_secs: u64,
    /// Persisted transaction TTL
    pub retention_secs: u64,
    /// Number of new records that makes a recompute due
    pub recompute_threshold: usize,
    /// Period of the scheduled recompute
    pub recompute_interval_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            damping_factor: 0.85,
            convergence_threshold: 1e-6,
            max_iterations: 100,
            decay_factor: 0.95,
            decay_unit_secs: 86_400, // 1 day
            evidence_decay: 0.95,
            trust_threshold: 0.1,
            healthy_threshold: 0.5,
            normalization: ScoreNormalization::Max,
            pre_trusted: Vec::new(),
            history_window_secs: 30 * 86_400,
            retention_secs: 30 * 86_400,
            recompute_threshold: 100,
            recompute_interval_secs: 60,
        }
    }
}

/// What happens to a publisher that exhausted its token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Reject with a retry-after hint
    Reject,
    /// Accept at the lowest priority tier
    Demote,
}

/// What happens to a publisher whose trust is below the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LowTrustPolicy {
    /// Accept at the lowest priority tier
    Deprioritize,
    /// Reject the message
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Token refill rate per publisher (messages per second)
    pub max_rate_per_sec: f64,
    /// Bucket capacity; defaults to one second of refill
    pub burst: Option<f64>,
    /// Rate multiplier for publishers below the trust threshold
    pub low_trust_rate_factor: f64,
    pub rate_limit_policy: RateLimitPolicy,
    pub low_trust_policy: LowTrustPolicy,
    /// TTL stamped by `MessageSealer` when the caller gives none
    pub default_ttl_secs: u64,
    /// Upper bound on ttl_seconds accepted at publish
    pub max_ttl_secs: u64,
    /// Largest accepted ciphertext
    pub max_payload_bytes: usize,
    /// Tolerated future skew of `created_at`
    pub max_clock_skew_ms: u64,
    /// Queue depth bound (backpressure)
    pub max_queue_depth: usize,
    /// Waiting time after which a message is promoted one tier
    pub aging_interval_ms: u64,
    /// Period of the background expiry sweep
    pub sweep_interval_ms: u64,
    /// Bound on a single handler invocation
    pub handler_timeout_ms: u64,
    /// Attempts per subscriber before giving up
    pub max_delivery_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_backoff_ms: u64,
    /// Per-subscription worker buffer
    pub subscriber_buffer: usize,
    /// Feed delivery outcomes back into the trust engine
    pub record_delivery_outcomes: bool,
    /// TTL of audit trail entries
    pub audit_ttl_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_rate_per_sec: 100.0,
            burst: None,
            low_trust_rate_factor: 0.25,
            rate_limit_policy: RateLimitPolicy::Reject,
            low_trust_policy: LowTrustPolicy::Deprioritize,
            default_ttl_secs: 600, // 10 minutes
            max_ttl_secs: 86_400,
            max_payload_bytes: 1024 * 1024,
            max_clock_skew_ms: 30_000,
            max_queue_depth: 10_000,
            aging_interval_ms: 5_000,
            sweep_interval_ms: 1_000,
            handler_timeout_ms: 5_000,
            max_delivery_attempts: 3,
            retry_backoff_ms: 100,
            subscriber_buffer: 1_024,
            record_delivery_outcomes: true,
            audit_ttl_secs: 86_400,
        }
    }
}

impl BrokerConfig {
    /// Bucket capacity (tokens)
    pub fn bucket_capacity(&self) -> f64 {
        self.burst.unwrap_or(self.max_rate_per_sec)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file for the sqlite backend
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: "data/trustgate.db".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject configurations the engines cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        let t = &self.trust;
        check(
            t.damping_factor > 0.0 && t.damping_factor < 1.0,
            "trust.damping_factor must be in (0, 1)",
        )?;
        check(
            t.convergence_threshold > 0.0 && t.convergence_threshold.is_finite(),
            "trust.convergence_threshold must be positive",
        )?;
        check(t.max_iterations > 0, "trust.max_iterations must be > 0")?;
        check(
            t.decay_factor > 0.0 && t.decay_factor <= 1.0,
            "trust.decay_factor must be in (0, 1]",
        )?;
        check(
            t.evidence_decay > 0.0 && t.evidence_decay <= 1.0,
            "trust.evidence_decay must be in (0, 1]",
        )?;
        check(t.decay_unit_secs > 0, "trust.decay_unit_secs must be > 0")?;
        check(
            (0.0..=1.0).contains(&t.trust_threshold),
            "trust.trust_threshold must be in [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&t.healthy_threshold),
            "trust.healthy_threshold must be in [0, 1]",
        )?;
        check(
            t.recompute_interval_secs > 0,
            "trust.recompute_interval_secs must be > 0",
        )?;

        let b = &self.broker;
        check(
            b.max_rate_per_sec > 0.0 && b.max_rate_per_sec.is_finite(),
            "broker.max_rate_per_sec must be positive",
        )?;
        check(
            b.bucket_capacity() >= 1.0,
            "broker.burst must allow at least one message",
        )?;
        check(
            b.low_trust_rate_factor > 0.0 && b.low_trust_rate_factor <= 1.0,
            "broker.low_trust_rate_factor must be in (0, 1]",
        )?;
        check(
            b.default_ttl_secs <= b.max_ttl_secs,
            "broker.default_ttl_secs exceeds broker.max_ttl_secs",
        )?;
        check(b.max_queue_depth > 0, "broker.max_queue_depth must be > 0")?;
        check(
            b.max_delivery_attempts > 0,
            "broker.max_delivery_attempts must be > 0",
        )?;
        check(b.subscriber_buffer > 0, "broker.subscriber_buffer must be > 0")?;
        check(b.aging_interval_ms > 0, "broker.aging_interval_ms must be > 0")?;
        check(b.sweep_interval_ms > 0, "broker.sweep_interval_ms must be > 0")?;
        check(
            self.crypto.key_lifetime_secs > 0,
            "crypto.key_lifetime_secs must be > 0",
        )?;
        check(
            self.crypto.rotation_lead_secs < self.crypto.key_lifetime_secs,
            "crypto.rotation_lead_secs must be shorter than the key lifetime",
        )?;
        check(!self.node.node_id.is_empty(), "node.node_id must be set")?;
        Ok(())
    }
}

fn check(condition: bool, message: &str) -> CoreResult<()> {
    if condition {
        Ok(())
    } else {
        Err(CoreError::Config(message.to_string()))
    }
}
