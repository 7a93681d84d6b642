//! Narrow key-value persistence interface.
//!
//! The trust engine and the broker only ever need get / put-with-TTL /
//! prefix scan / delete, so the backing store is hidden behind
//! [`PersistenceGateway`]. Absence of a key after its TTL is normal and
//! never an error.
//!
//! # Key spaces
//!
//! - `trust:{agent}` - last published score of an agent
//! - `txn:{timestamp}:{seq}` - one transaction record
//! - `audit:{message_id}:{seq}` - one message lifecycle entry

use crate::clock::SharedClock;
use crate::error::CoreResult;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Key-value store with optional per-key TTL.
pub trait PersistenceGateway: Send + Sync {
    /// Insert or replace a value.
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CoreResult<()>;

    /// Fetch a live value.
    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;

    /// All live entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> CoreResult<()>;
}

/// JSON helpers available on every gateway.
pub trait GatewayExt: PersistenceGateway {
    fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> CoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes, ttl)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> CoreResult<Vec<(String, T)>> {
        self.scan(prefix)?
            .into_iter()
            .map(|(key, bytes)| Ok((key, serde_json::from_slice(&bytes)?)))
            .collect()
    }
}

impl<G: PersistenceGateway + ?Sized> GatewayExt for G {}

/// Key construction for the shared key spaces.
pub mod keys {
    pub const TRUST_PREFIX: &str = "trust:";
    pub const TXN_PREFIX: &str = "txn:";
    pub const AUDIT_PREFIX: &str = "audit:";

    pub fn trust_score(agent_id: &str) -> String {
        format!("{}{}", TRUST_PREFIX, agent_id)
    }

    /// Zero-padded so lexical order equals chronological order.
    pub fn transaction(timestamp_ms: u64, seq: u64) -> String {
        format!("{}{:020}:{:010}", TXN_PREFIX, timestamp_ms, seq)
    }

    pub fn audit(message_id: &str, seq: u64) -> String {
        format!("{}{}:{:06}", AUDIT_PREFIX, message_id, seq)
    }

    pub fn audit_prefix(message_id: &str) -> String {
        format!("{}{}:", AUDIT_PREFIX, message_id)
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at.map_or(true, |deadline| now_ms < deadline)
    }
}

/// In-process gateway for tests and embedded deployments.
pub struct InMemoryGateway {
    entries: Mutex<BTreeMap<String, StoredValue>>,
    clock: SharedClock,
}

impl InMemoryGateway {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, v| v.is_live(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceGateway for InMemoryGateway {
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CoreResult<()> {
        let now = self.clock.now_ms();
        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64));
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn scan(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.is_live(now))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
