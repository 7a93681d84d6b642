//! Append-only transaction history.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use trustgate_core::TransactionRecord;

/// In-memory transaction history feeding trust recomputation.
///
/// Records are only ever appended, or evicted once older than the retention
/// window. A recompute works on a cloned snapshot, so appends that race
/// with it are counted towards the next cycle.
#[derive(Debug, Default)]
pub struct TransactionLog {
    records: RwLock<Vec<TransactionRecord>>,
    total_appended: AtomicU64,
    consumed: AtomicU64,
}

/// Records taken for one recompute.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub records: Vec<TransactionRecord>,
    /// Value of the append counter when the snapshot was taken
    pub watermark: u64,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Returns the number of records not yet consumed by a recompute.
    pub fn append(&self, record: TransactionRecord) -> u64 {
        let mut records = self.records.write();
        records.push(record);
        let total = self.total_appended.fetch_add(1, Ordering::SeqCst) + 1;
        total.saturating_sub(self.consumed.load(Ordering::SeqCst))
    }

    /// Clone every record with `timestamp >= since_ms`.
    pub fn snapshot(&self, since_ms: u64) -> HistorySnapshot {
        let records = self.records.read();
        HistorySnapshot {
            records: records
                .iter()
                .filter(|r| r.timestamp() >= since_ms)
                .cloned()
                .collect(),
            watermark: self.total_appended.load(Ordering::SeqCst),
        }
    }

    /// Mark everything up to `watermark` as consumed.
    pub fn mark_consumed(&self, watermark: u64) {
        self.consumed.fetch_max(watermark, Ordering::SeqCst);
    }

    /// Records appended since the last consumed watermark.
    pub fn pending(&self) -> u64 {
        self.total_appended
            .load(Ordering::SeqCst)
            .saturating_sub(self.consumed.load(Ordering::SeqCst))
    }

    /// Evict records older than `cutoff_ms`. Returns how many were evicted.
    pub fn evict_before(&self, cutoff_ms: u64) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.timestamp() >= cutoff_ms);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
