//! Trust graph derived from a transaction snapshot.
//!
//! Edge `i -> j` carries the evidence agent `i` holds about agent `j`:
//!
//! ```text
//! s_ij = max( sum(w * q) - sum(w * (1 - q)), 0 )
//! w    = evidence_decay ^ (age / decay_unit)
//! ```
//!
//! Rows are normalized to sum to 1 (`C[i][j] = s_ij / sum_k s_ik`). Agents
//! with no positive evidence about anyone are dangling and spread their
//! trust uniformly. Self-observations are ignored. The graph also remembers
//! the newest evidence about each agent, which drives temporal decay of the
//! published scores. It is rebuilt for every recompute and never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use trustgate_core::{AgentId, TransactionRecord};

/// Parameters for turning records into weighted evidence.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceWeighting {
    pub now_ms: u64,
    pub evidence_decay: f64,
    pub decay_unit_ms: u64,
}

impl EvidenceWeighting {
    /// Recency weight of a record observed at `timestamp_ms`.
    pub fn weight(&self, timestamp_ms: u64) -> f64 {
        let age_ms = self.now_ms.saturating_sub(timestamp_ms);
        let units = age_ms as f64 / self.decay_unit_ms.max(1) as f64;
        self.evidence_decay.powf(units)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Evidence {
    positive: f64,
    negative: f64,
}

impl Evidence {
    fn net(&self) -> f64 {
        (self.positive - self.negative).max(0.0)
    }
}

/// Row-normalized local trust matrix over a fixed agent set.
#[derive(Debug, Clone)]
pub struct TrustGraph {
    agents: Vec<AgentId>,
    index: HashMap<AgentId, usize>,
    /// Normalized outgoing edges; `None` marks a dangling row
    rows: Vec<Option<BTreeMap<usize, f64>>>,
    /// Timestamp of the newest record about each agent
    last_evidence: Vec<Option<u64>>,
}

impl TrustGraph {
    /// Build the graph over every agent named in `records` or `known_agents`.
    ///
    /// Agent order is lexicographic so identical inputs give identical
    /// matrices and identical iteration results.
    pub fn build<'a>(
        records: &[TransactionRecord],
        known_agents: impl IntoIterator<Item = &'a str>,
        weighting: EvidenceWeighting,
    ) -> Self {
        let mut names: BTreeSet<&str> = known_agents.into_iter().collect();
        for record in records {
            names.insert(record.from_agent());
            names.insert(record.to_agent());
        }

        let agents: Vec<AgentId> = names.into_iter().map(str::to_string).collect();
        let index: HashMap<AgentId, usize> = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.clone(), i))
            .collect();

        let mut evidence: Vec<BTreeMap<usize, Evidence>> = vec![BTreeMap::new(); agents.len()];
        let mut last_evidence: Vec<Option<u64>> = vec![None; agents.len()];
        for record in records {
            let (Some(&i), Some(&j)) = (index.get(record.from_agent()), index.get(record.to_agent()))
            else {
                continue;
            };
            if i == j {
                continue;
            }
            let seen = &mut last_evidence[j];
            *seen = Some(seen.map_or(record.timestamp(), |t| t.max(record.timestamp())));
            let w = weighting.weight(record.timestamp());
            let q = record.outcome().quality();
            let entry = evidence[i].entry(j).or_default();
            entry.positive += w * q;
            entry.negative += w * (1.0 - q);
        }

        let rows = evidence
            .into_iter()
            .map(|row| {
                let net: BTreeMap<usize, f64> = row
                    .into_iter()
                    .map(|(j, e)| (j, e.net()))
                    .filter(|(_, s)| *s > 0.0)
                    .collect();
                let total: f64 = net.values().sum();
                if total > f64::EPSILON {
                    Some(net.into_iter().map(|(j, s)| (j, s / total)).collect())
                } else {
                    None
                }
            })
            .collect();

        Self {
            agents,
            index,
            rows,
            last_evidence,
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    pub fn index_of(&self, agent: &str) -> Option<usize> {
        self.index.get(agent).copied()
    }

    /// Timestamp of the newest record about agent `i`, if any.
    pub fn last_evidence(&self, i: usize) -> Option<u64> {
        self.last_evidence.get(i).copied().flatten()
    }

    /// Timestamp of the newest record in the graph.
    pub fn newest_evidence(&self) -> Option<u64> {
        self.last_evidence.iter().flatten().copied().max()
    }

    /// Normalized outgoing edges of row `i`, or `None` if the row is dangling.
    pub fn row(&self, i: usize) -> Option<&BTreeMap<usize, f64>> {
        self.rows.get(i).and_then(|r| r.as_ref())
    }

    /// Normalized local trust `C[i][j]`, with the uniform fallback for dangling rows.
    pub fn local_trust(&self, i: usize, j: usize) -> f64 {
        match self.row(i) {
            Some(row) => row.get(&j).copied().unwrap_or(0.0),
            None if self.agents.is_empty() => 0.0,
            None => 1.0 / self.agents.len() as f64,
        }
    }
}
