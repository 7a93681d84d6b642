//! Restart continuity through the SQLite gateway

use crate::test_utils::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trustgate_broker::MessageState;
use trustgate_core::config::CryptoConfig;
use trustgate_core::{
    Config, ManualClock, Outcome, PersistenceGateway, Priority, SqliteGateway, TransactionRecord,
};
use trustgate_trust_mesh::RecomputeTrigger;

fn config(signing_key: &str) -> Config {
    Config {
        crypto: CryptoConfig {
            signing_key_hex: Some(signing_key.repeat(32)),
            ..CryptoConfig::default()
        },
        ..Config::default()
    }
}

fn open_node(path: &PathBuf, start_ms: u64, signing_key: &str) -> TestNode {
    let clock = Arc::new(ManualClock::new(start_ms));
    let gateway: Arc<dyn PersistenceGateway> =
        Arc::new(SqliteGateway::open(path, clock.clone()).unwrap());
    TestNode::with_gateway(&config(signing_key), clock, gateway)
}

#[tokio::test]
async fn test_trust_and_audit_survive_restart() {
    let path = temp_db_path();

    let (scores, message_id) = {
        let node = open_node(&path, T0_MS, "07");
        for (from, to) in [("alpha", "beta"), ("beta", "gamma"), ("gamma", "alpha"), ("alpha", "gamma")] {
            node.broker
                .report_outcome(TransactionRecord::new(from, to, Outcome::Success, T0_MS).unwrap())
                .unwrap();
        }
        node.trust.recompute(RecomputeTrigger::Manual);

        let message = node
            .broker
            .sealer("alpha")
            .seal("audit.trail", Priority::High, b"persist me")
            .unwrap();
        let id = node.broker.publish(message).unwrap();
        assert_eq!(node.broker.status(&id).unwrap().state, MessageState::Queued);

        (node.trust.snapshot().scores.clone(), id)
    };

    let restarted = open_node(&path, T0_MS + 3_600_000, "07");
    assert_eq!(restarted.trust.restore().unwrap(), 4);

    let snapshot = restarted.trust.snapshot();
    assert_eq!(snapshot.version, 0);
    assert_eq!(snapshot.trigger, RecomputeTrigger::Restore);
    assert_eq!(snapshot.len(), scores.len());
    for (agent, before) in &scores {
        assert!((restarted.trust.get_score(agent) - before.score).abs() < 1e-12);
    }
    assert_eq!(restarted.trust.pending_transactions(), 4);

    // The next recompute starts from the restored scores
    let report = restarted.trust.recompute(RecomputeTrigger::Manual);
    assert_eq!(report.version, 1);
    assert_eq!(report.records_used, 4);

    let states: Vec<MessageState> = restarted
        .broker
        .audit_entries(&message_id)
        .unwrap()
        .into_iter()
        .map(|e| e.state)
        .collect();
    assert_eq!(
        states,
        vec![MessageState::Submitted, MessageState::Verified, MessageState::Queued]
    );

    drop(restarted);
    remove_db(&path);
}

#[tokio::test]
async fn test_audit_entries_from_another_node_key_are_rejected() {
    let path = temp_db_path();

    let message_id = {
        let node = open_node(&path, T0_MS, "07");
        let message = node
            .broker
            .sealer("alpha")
            .seal("audit.trail", Priority::Normal, b"signed by node 07")
            .unwrap();
        let id = node.broker.publish(message).unwrap();
        assert_eq!(node.broker.audit_entries(&id).unwrap().len(), 3);
        id
    };

    let impostor = open_node(&path, T0_MS, "09");
    assert!(impostor.broker.audit_entries(&message_id).unwrap().is_empty());

    drop(impostor);
    remove_db(&path);
}

#[tokio::test]
async fn test_delivery_outcomes_persist_as_transactions() {
    let path = temp_db_path();

    {
        let node = open_node(&path, T0_MS, "07");
        let collector = Collector::new();
        node.broker
            .subscribe("jobs.#", "worker", collector.handler())
            .unwrap();
        node.broker.start().unwrap();

        let sealer = node.broker.sealer("planner");
        for _ in 0..3 {
            node.broker
                .publish(sealer.seal("jobs.build", Priority::Normal, b"job").unwrap())
                .unwrap();
        }
        let trust = node.trust.clone();
        assert!(wait_until(Duration::from_secs(5), || trust.pending_transactions() == 3).await);
        node.broker.shutdown().await;
    }

    let restarted = open_node(&path, T0_MS + 60_000, "07");
    assert_eq!(restarted.trust.restore().unwrap(), 3);
    restarted.trust.recompute(RecomputeTrigger::Manual);
    assert!(restarted.trust.get_score("planner") > restarted.trust.get_score("worker"));

    drop(restarted);
    remove_db(&path);
}

#[test]
fn test_shipped_config_loads() {
    let config = Config::from_file(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../config/trustgate.toml"
    ))
    .unwrap();
    assert_eq!(config.node.node_id, "trustgate-node-1");
    assert_eq!(config.broker.max_delivery_attempts, 3);
    assert_eq!(config.trust.trust_threshold, 0.1);
}
