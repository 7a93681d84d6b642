//! Test utilities for cross-crate integration tests

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trustgate_broker::{handler_fn, Delivery, MessageHandler, SecureBroker};
use trustgate_core::{AlertChannel, Config, InMemoryGateway, ManualClock, PersistenceGateway};
use trustgate_crypto::CryptoProtocol;
use trustgate_trust_mesh::TrustScorer;

/// Fixed start time for manual clocks (2024-01-01T00:00:00Z)
pub const T0_MS: u64 = 1_704_067_200_000;

/// One fully wired node driven by a manual clock.
pub struct TestNode {
    pub clock: Arc<ManualClock>,
    pub crypto: Arc<CryptoProtocol>,
    pub trust: Arc<TrustScorer>,
    pub broker: SecureBroker,
    pub alerts: Arc<AlertChannel>,
    pub gateway: Arc<dyn PersistenceGateway>,
}

impl TestNode {
    /// Node backed by an in-memory gateway.
    pub fn new(config: &Config) -> Self {
        let clock = Arc::new(ManualClock::new(T0_MS));
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new(clock.clone()));
        Self::with_gateway(config, clock, gateway)
    }

    pub fn with_gateway(
        config: &Config,
        clock: Arc<ManualClock>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let alerts = Arc::new(AlertChannel::new());
        let crypto = Arc::new(
            CryptoProtocol::new(&config.crypto, clock.clone())
                .expect("crypto init")
                .with_alerts(alerts.clone()),
        );
        let trust = Arc::new(
            TrustScorer::with_config(config.trust.clone(), clock.clone())
                .with_gateway(gateway.clone())
                .with_alerts(alerts.clone()),
        );
        let broker = SecureBroker::builder(crypto.clone(), trust.clone())
            .config(config.broker.clone())
            .clock(clock.clone())
            .alerts(alerts.clone())
            .gateway(gateway.clone())
            .build();

        Self {
            clock,
            crypto,
            trust,
            broker,
            alerts,
            gateway,
        }
    }
}

/// Handler that records every delivery it sees.
#[derive(Clone, Default)]
pub struct Collector {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        let deliveries = self.deliveries.clone();
        handler_fn(move |delivery: Delivery| {
            let deliveries = deliveries.clone();
            async move {
                deliveries.lock().push(delivery);
                Ok(())
            }
        })
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.lock().is_empty()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Number of times each message id was seen.
    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for delivery in self.deliveries.lock().iter() {
            *counts.entry(delivery.message_id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Unique database path in the system temp directory.
pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("trustgate-it-{}.db", uuid::Uuid::new_v4()))
}

/// Remove a SQLite database and its WAL side files.
pub fn remove_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm"] {
        let mut side = path.clone().into_os_string();
        side.push(suffix);
        let _ = std::fs::remove_file(side);
    }
}
