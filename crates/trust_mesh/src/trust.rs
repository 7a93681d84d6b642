//! Trust Scoring Module
//!
//! Computes global trust scores from transaction history with EigenTrust
//! power iteration and temporal decay.
//!
//! # Snapshots
//!
//! Each recompute publishes a new immutable [`TrustSnapshot`] by swapping an
//! `Arc`. Readers clone the `Arc` and never wait on a running recompute, so
//! a score is stale by at most one cycle. Recomputes are serialized.
//!
//! # Decay
//!
//! The converged share `r` of each agent regresses toward its prior `p` as
//! `p + (r - p) * decay^elapsed_units`, where `elapsed_units` counts decay
//! units since the newest evidence about that agent; an agent nobody has
//! reported on ages with the newest evidence in the graph. The decayed
//! vector is renormalized and published, so an idle graph drifts back to the
//! prior. The previous snapshot only warm-starts the iteration.

use crate::engine::{power_iterate, IterationOutcome, IterationParams};
use crate::error::{TrustError, TrustResult};
use crate::graph::{EvidenceWeighting, TrustGraph};
use crate::history::TransactionLog;
use crate::rank::{compute_rank, AgentPerformance, RankWeights};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use trustgate_core::config::{ScoreNormalization, TrustConfig};
use trustgate_core::persistence::{keys, GatewayExt, PersistenceGateway};
use trustgate_core::{
    AgentId, AlertBuilder, AlertKind, AlertSink, SharedClock, TransactionRecord,
};

/// Trust level thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Score >= healthy threshold
    Healthy,
    /// Score >= trust threshold
    Suspect,
    /// Score < trust threshold
    Quarantined,
}

/// Trust score for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub agent_id: AgentId,
    /// Share of global trust; raw scores of a snapshot sum to 1
    pub raw: f64,
    /// Published score in [0, 1]
    pub score: f64,
    pub level: TrustLevel,
    /// Unix epoch milliseconds
    pub last_updated: u64,
}

/// What started a recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecomputeTrigger {
    Manual,
    Scheduled,
    Threshold,
    /// Scores reloaded from the persistence gateway
    Restore,
}

/// Immutable, versioned view of global trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSnapshot {
    /// 0 for the empty or restored snapshot, then +1 per recompute
    pub version: u64,
    pub computed_at: u64,
    pub trigger: RecomputeTrigger,
    pub scores: BTreeMap<AgentId, TrustScore>,
    pub iterations: usize,
    pub converged: bool,
    pub residual: f64,
    /// Published score for an agent absent from `scores`
    pub neutral_score: f64,
}

impl TrustSnapshot {
    fn empty(now_ms: u64) -> Self {
        Self {
            version: 0,
            computed_at: now_ms,
            trigger: RecomputeTrigger::Manual,
            scores: BTreeMap::new(),
            iterations: 0,
            converged: true,
            residual: 0.0,
            neutral_score: 1.0,
        }
    }

    pub fn get(&self, agent: &str) -> Option<&TrustScore> {
        self.scores.get(agent)
    }

    /// Published score, or the neutral prior for an unseen agent.
    pub fn score_of(&self, agent: &str) -> f64 {
        self.scores
            .get(agent)
            .map(|s| s.score)
            .unwrap_or(self.neutral_score)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Summary of one recompute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecomputeReport {
    pub version: u64,
    pub trigger: RecomputeTrigger,
    pub agents: usize,
    pub records_used: usize,
    pub iterations: usize,
    pub converged: bool,
    pub residual: f64,
    pub duration_ms: u64,
}

/// Persisted form of a published score.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedTrust {
    agent_id: AgentId,
    raw: f64,
    score: f64,
    computed_at: u64,
}

/// Global trust engine.
pub struct TrustScorer {
    config: TrustConfig,
    log: TransactionLog,
    snapshot: RwLock<Arc<TrustSnapshot>>,
    recompute_guard: Mutex<()>,
    gateway: Option<Arc<dyn PersistenceGateway>>,
    alerts: Option<Arc<dyn AlertSink>>,
    clock: SharedClock,
    txn_seq: AtomicU64,
    threshold_notify: Notify,
    rank_weights: RankWeights,
}

impl TrustScorer {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_config(TrustConfig::default(), clock)
    }

    pub fn with_config(config: TrustConfig, clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            config,
            log: TransactionLog::new(),
            snapshot: RwLock::new(Arc::new(TrustSnapshot::empty(now))),
            recompute_guard: Mutex::new(()),
            gateway: None,
            alerts: None,
            clock,
            txn_seq: AtomicU64::new(0),
            threshold_notify: Notify::new(),
            rank_weights: RankWeights::default(),
        }
    }

    /// Persist transactions and scores through `gateway`.
    pub fn with_gateway(mut self, gateway: Arc<dyn PersistenceGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Emit `NonConvergenceWarning` alerts to `sink`.
    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn with_rank_weights(mut self, weights: RankWeights) -> Self {
        self.rank_weights = weights;
        self
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Append a transaction record. Never recomputes.
    ///
    /// Returns true once enough new records have accumulated for a
    /// threshold-triggered recompute; a running scheduler is woken as well.
    pub fn record_transaction(&self, record: TransactionRecord) -> TrustResult<bool> {
        record
            .validate()
            .map_err(|e| TrustError::InvalidTransaction(e.to_string()))?;

        if let Some(gateway) = &self.gateway {
            let seq = self.txn_seq.fetch_add(1, Ordering::SeqCst);
            let key = keys::transaction(record.timestamp(), seq);
            let ttl = Some(Duration::from_secs(self.config.retention_secs));
            if let Err(e) = gateway.put_json(&key, &record, ttl) {
                warn!(error = %e, key = %key, "Failed to persist transaction");
            }
        }

        debug!(
            from = %record.from_agent(),
            to = %record.to_agent(),
            quality = record.outcome().quality(),
            "Transaction recorded"
        );

        let pending = self.log.append(record);
        let due = pending >= self.config.recompute_threshold.max(1) as u64;
        if due {
            self.threshold_notify.notify_one();
        }
        Ok(due)
    }

    /// Records appended since the last recompute snapshot.
    pub fn pending_transactions(&self) -> u64 {
        self.log.pending()
    }

    /// Recompute global trust and publish a new snapshot.
    pub fn recompute(&self, trigger: RecomputeTrigger) -> RecomputeReport {
        let _guard = self.recompute_guard.lock();
        let started = Instant::now();
        let now = self.clock.now_ms();

        let retention_ms = self.config.retention_secs.saturating_mul(1000);
        self.log.evict_before(now.saturating_sub(retention_ms));

        let window_ms = self.config.history_window_secs.saturating_mul(1000);
        let history = self.log.snapshot(now.saturating_sub(window_ms));
        let previous = self.snapshot();

        let known: BTreeSet<&str> = previous
            .scores
            .keys()
            .map(String::as_str)
            .chain(self.config.pre_trusted.iter().map(String::as_str))
            .collect();

        let decay_unit_ms = self.config.decay_unit_secs.saturating_mul(1000).max(1);
        let graph = TrustGraph::build(
            &history.records,
            known,
            EvidenceWeighting {
                now_ms: now,
                evidence_decay: self.config.evidence_decay,
                decay_unit_ms,
            },
        );

        let prior = self.prior_vector(&graph);
        let initial = Self::warm_start(&graph, &previous);
        let outcome = power_iterate(
            &graph,
            &prior,
            &initial,
            IterationParams {
                damping: self.config.damping_factor,
                convergence_threshold: self.config.convergence_threshold,
                max_iterations: self.config.max_iterations,
            },
        );

        let decayed = self.decay_toward_prior(&graph, &prior, &outcome.scores, now, decay_unit_ms);
        let snapshot = self.build_snapshot(&graph, &decayed, &outcome, previous.version + 1, now, trigger);
        let report = RecomputeReport {
            version: snapshot.version,
            trigger,
            agents: graph.len(),
            records_used: history.records.len(),
            iterations: outcome.iterations,
            converged: outcome.converged,
            residual: outcome.residual,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if !outcome.converged {
            warn!(
                iterations = outcome.iterations,
                residual = outcome.residual,
                "Trust iteration did not converge; publishing last iterate"
            );
            if let Some(alerts) = &self.alerts {
                alerts.emit(
                    AlertBuilder::new(AlertKind::NonConvergenceWarning)
                        .timestamp(now)
                        .detail(format!(
                            "stopped after {} iterations with residual {:.3e}",
                            outcome.iterations, outcome.residual
                        ))
                        .metadata("version", snapshot.version)
                        .build(),
                );
            }
        }

        self.persist_scores(&snapshot);
        *self.snapshot.write() = Arc::new(snapshot);
        self.log.mark_consumed(history.watermark);

        info!(
            version = report.version,
            trigger = ?trigger,
            agents = report.agents,
            records = report.records_used,
            iterations = report.iterations,
            converged = report.converged,
            "Trust recomputed"
        );

        report
    }

    /// Teleport distribution: uniform over pre-trusted agents when any are
    /// known, otherwise uniform over everyone.
    fn prior_vector(&self, graph: &TrustGraph) -> Vec<f64> {
        let n = graph.len();
        let pre_trusted: Vec<usize> = self
            .config
            .pre_trusted
            .iter()
            .filter_map(|a| graph.index_of(a))
            .collect();

        if pre_trusted.is_empty() {
            return vec![1.0 / n.max(1) as f64; n];
        }
        let mut prior = vec![0.0; n];
        let share = 1.0 / pre_trusted.len() as f64;
        for i in pre_trusted {
            prior[i] = share;
        }
        prior
    }

    /// Previous raw shares for known agents, uniform for newcomers.
    fn warm_start(graph: &TrustGraph, previous: &TrustSnapshot) -> Vec<f64> {
        let uniform = 1.0 / graph.len().max(1) as f64;
        graph
            .agents()
            .iter()
            .map(|agent| previous.get(agent).map_or(uniform, |prev| prev.raw))
            .collect()
    }

    /// Regress converged shares toward the prior by the age of the newest
    /// evidence about each agent, then renormalize.
    fn decay_toward_prior(
        &self,
        graph: &TrustGraph,
        prior: &[f64],
        converged: &[f64],
        now: u64,
        decay_unit_ms: u64,
    ) -> Vec<f64> {
        let newest = graph.newest_evidence();
        let mut decayed: Vec<f64> = converged
            .iter()
            .zip(prior)
            .enumerate()
            .map(|(i, (&r, &p))| {
                let Some(last) = graph.last_evidence(i).or(newest) else {
                    return r;
                };
                let elapsed_units = now.saturating_sub(last) as f64 / decay_unit_ms as f64;
                p + (r - p) * self.config.decay_factor.powf(elapsed_units)
            })
            .collect();

        let total: f64 = decayed.iter().sum();
        if total > 0.0 && total.is_finite() {
            for value in decayed.iter_mut() {
                *value /= total;
            }
        }
        decayed
    }

    fn build_snapshot(
        &self,
        graph: &TrustGraph,
        raw_scores: &[f64],
        outcome: &IterationOutcome,
        version: u64,
        now: u64,
        trigger: RecomputeTrigger,
    ) -> TrustSnapshot {
        let max_raw = raw_scores.iter().cloned().fold(0.0f64, f64::max);
        let publish = |raw: f64| -> f64 {
            match self.config.normalization {
                ScoreNormalization::Sum => raw,
                ScoreNormalization::Max if max_raw > 0.0 => raw / max_raw,
                ScoreNormalization::Max => 0.0,
            }
            .clamp(0.0, 1.0)
        };

        let scores = graph
            .agents()
            .iter()
            .zip(raw_scores)
            .map(|(agent, &raw)| {
                let score = publish(raw);
                (
                    agent.clone(),
                    TrustScore {
                        agent_id: agent.clone(),
                        raw,
                        score,
                        level: self.level_for(score),
                        last_updated: now,
                    },
                )
            })
            .collect();

        let neutral_score = if graph.is_empty() {
            1.0
        } else {
            publish(1.0 / graph.len() as f64)
        };

        TrustSnapshot {
            version,
            computed_at: now,
            trigger,
            scores,
            iterations: outcome.iterations,
            converged: outcome.converged,
            residual: outcome.residual,
            neutral_score,
        }
    }

    fn persist_scores(&self, snapshot: &TrustSnapshot) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        for score in snapshot.scores.values() {
            let value = PersistedTrust {
                agent_id: score.agent_id.clone(),
                raw: score.raw,
                score: score.score,
                computed_at: snapshot.computed_at,
            };
            if let Err(e) = gateway.put_json(&keys::trust_score(&score.agent_id), &value, None) {
                warn!(agent_id = %score.agent_id, error = %e, "Failed to persist trust score");
            }
        }
    }

    /// Reload persisted scores and transaction history.
    ///
    /// Restored scores become the version-0 snapshot and warm-start the next
    /// recompute; the restored transaction timestamps drive its decay.
    pub fn restore(&self) -> TrustResult<usize> {
        let Some(gateway) = &self.gateway else {
            return Ok(0);
        };
        let _guard = self.recompute_guard.lock();

        let mut restored_txns = 0;
        for (key, record) in gateway.scan_json::<TransactionRecord>(keys::TXN_PREFIX)? {
            match record.validate() {
                Ok(()) => {
                    self.log.append(record);
                    restored_txns += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping invalid persisted transaction"),
            }
        }
        self.txn_seq.fetch_add(restored_txns as u64, Ordering::SeqCst);

        let persisted: Vec<PersistedTrust> = gateway
            .scan_json::<PersistedTrust>(keys::TRUST_PREFIX)?
            .into_iter()
            .map(|(_, v)| v)
            .collect();

        if !persisted.is_empty() {
            let computed_at = persisted.iter().map(|p| p.computed_at).max().unwrap_or(0);
            let total: f64 = persisted.iter().map(|p| p.raw).sum();
            let scores = persisted
                .into_iter()
                .map(|p| {
                    (
                        p.agent_id.clone(),
                        TrustScore {
                            level: self.level_for(p.score),
                            agent_id: p.agent_id,
                            raw: p.raw,
                            score: p.score,
                            last_updated: p.computed_at,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>();
            let n = scores.len();
            let neutral_score = match self.config.normalization {
                ScoreNormalization::Sum => 1.0 / n as f64,
                ScoreNormalization::Max => {
                    let max_raw = scores.values().map(|s| s.raw).fold(0.0f64, f64::max);
                    if max_raw > 0.0 {
                        ((total / n as f64) / max_raw).clamp(0.0, 1.0)
                    } else {
                        1.0
                    }
                }
            };
            *self.snapshot.write() = Arc::new(TrustSnapshot {
                version: 0,
                computed_at,
                trigger: RecomputeTrigger::Restore,
                scores,
                iterations: 0,
                converged: true,
                residual: 0.0,
                neutral_score,
            });
        }

        info!(
            transactions = restored_txns,
            agents = self.snapshot().len(),
            "Trust state restored"
        );
        Ok(restored_txns)
    }

    /// Current snapshot. Never blocks on a running recompute.
    pub fn snapshot(&self) -> Arc<TrustSnapshot> {
        self.snapshot.read().clone()
    }

    /// Last computed score, or the neutral prior for an unseen agent.
    pub fn get_score(&self, agent: &str) -> f64 {
        self.snapshot().score_of(agent)
    }

    /// Score used for ranking: never below the trust threshold.
    pub fn ranking_score(&self, agent: &str) -> f64 {
        self.get_score(agent).max(self.config.trust_threshold)
    }

    pub fn is_low_trust(&self, agent: &str) -> bool {
        self.get_score(agent) < self.config.trust_threshold
    }

    pub fn level(&self, agent: &str) -> TrustLevel {
        self.level_for(self.get_score(agent))
    }

    fn level_for(&self, score: f64) -> TrustLevel {
        if score >= self.config.healthy_threshold {
            TrustLevel::Healthy
        } else if score >= self.config.trust_threshold {
            TrustLevel::Suspect
        } else {
            TrustLevel::Quarantined
        }
    }

    /// Composite rank of an agent from its performance and trust.
    pub fn rank(&self, agent: &str, performance: &AgentPerformance) -> f64 {
        compute_rank(performance, self.ranking_score(agent), &self.rank_weights)
    }

    /// Rank a set of agents, best first. Ties keep input order.
    pub fn rank_agents(&self, candidates: &[(AgentId, AgentPerformance)]) -> Vec<(AgentId, f64)> {
        let mut ranked: Vec<(AgentId, f64)> = candidates
            .iter()
            .map(|(agent, perf)| (agent.clone(), self.rank(agent, perf)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub(crate) async fn threshold_reached(&self) {
        self.threshold_notify.notified().await
    }
}
