//! Delivery outcomes feed trust, and trust feeds admission.

use crate::test_utils::*;
use std::time::Duration;
use trustgate_broker::{handler_fn, Delivery, HandlerError};
use trustgate_core::config::{BrokerConfig, TrustConfig};
use trustgate_core::{Clock, Config, Outcome, Priority, TransactionRecord};
use trustgate_trust_mesh::{RecomputeTrigger, TrustLevel};

const HONEST: usize = 5;

fn config() -> Config {
    Config {
        trust: TrustConfig {
            trust_threshold: 0.3,
            ..TrustConfig::default()
        },
        broker: BrokerConfig {
            max_delivery_attempts: 1,
            ..BrokerConfig::default()
        },
        ..Config::default()
    }
}

fn honest(i: usize) -> String {
    format!("honest-{}", i)
}

#[tokio::test]
async fn test_failing_subscriber_loses_trust_and_priority() {
    let node = TestNode::new(&config());

    let collectors: Vec<Collector> = (0..HONEST).map(|_| Collector::new()).collect();
    for (i, collector) in collectors.iter().enumerate() {
        node.broker
            .subscribe("mesh.#", honest(i), collector.handler())
            .unwrap();
    }
    let flaky = handler_fn(|_delivery: Delivery| async {
        Err(HandlerError::new("dropped on the floor"))
    });
    node.broker.subscribe("mesh.#", "flaky", flaky).unwrap();
    node.broker.start().unwrap();

    for i in 0..HONEST {
        let sealer = node.broker.sealer(honest(i));
        for _ in 0..2 {
            node.broker
                .publish(sealer.seal("mesh.work", Priority::Normal, b"result").unwrap())
                .unwrap();
        }
    }

    // 10 messages, each: 4 successes from the other honest agents, 1 failure against flaky
    let trust = node.trust.clone();
    assert!(wait_until(Duration::from_secs(10), || trust.pending_transactions() == 50).await);

    let report = node.trust.recompute(RecomputeTrigger::Manual);
    assert!(report.converged);

    let flaky_score = node.trust.get_score("flaky");
    for i in 0..HONEST {
        let score = node.trust.get_score(&honest(i));
        assert!(score > flaky_score, "{} = {} vs flaky = {}", honest(i), score, flaky_score);
        assert_eq!(node.trust.level(&honest(i)), TrustLevel::Healthy);
    }
    assert!(node.trust.is_low_trust("flaky"));
    assert_eq!(node.trust.ranking_score("flaky"), 0.3);

    // With the dispatcher stopped, a critical message from the low-trust
    // publisher queues behind routine honest traffic
    node.broker.shutdown().await;

    let flaky_message = node
        .broker
        .sealer("flaky")
        .seal("alerts.urgent", Priority::Critical, b"look at me")
        .unwrap();
    let routine = node
        .broker
        .sealer(honest(0))
        .seal("alerts.routine", Priority::Normal, b"heartbeat")
        .unwrap();
    let flaky_id = node.broker.publish(flaky_message).unwrap();
    let routine_id = node.broker.publish(routine).unwrap();

    let observer = Collector::new();
    node.broker
        .subscribe("alerts.#", "observer", observer.handler())
        .unwrap();
    node.broker.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || observer.len() == 2).await);
    let order: Vec<_> = observer
        .deliveries()
        .into_iter()
        .map(|d| (d.message_id, d.priority))
        .collect();
    assert_eq!(
        order,
        vec![(routine_id, Priority::Normal), (flaky_id, Priority::Low)]
    );

    node.broker.shutdown().await;
}

#[tokio::test]
async fn test_explicit_feedback_changes_ranking() {
    let node = TestNode::new(&Config::default());
    let now = node.clock.now_ms();

    for rater in ["planner", "searcher", "caller"] {
        for (target, quality) in [("reliable", 0.95), ("sloppy", 0.2)] {
            let record = TransactionRecord::new(rater, target, Outcome::Quality(quality), now).unwrap();
            node.broker.report_outcome(record).unwrap();
        }
    }
    node.broker
        .report_outcome(TransactionRecord::new("reliable", "planner", Outcome::Success, now).unwrap())
        .unwrap();
    node.trust.recompute(RecomputeTrigger::Manual);

    assert!(node.trust.get_score("reliable") > node.trust.get_score("sloppy"));

    let performance = trustgate_trust_mesh::AgentPerformance {
        avg_response_time_secs: 1.0,
        success_rate: 0.9,
        task_complexity: None,
    };
    let ranked = node.trust.rank_agents(&[
        ("sloppy".to_string(), performance.clone()),
        ("reliable".to_string(), performance),
    ]);
    assert_eq!(ranked[0].0, "reliable");
}

#[tokio::test]
async fn test_scheduler_recomputes_from_broker_traffic() {
    let config = Config {
        trust: TrustConfig {
            recompute_threshold: 4,
            recompute_interval_secs: 3_600,
            ..TrustConfig::default()
        },
        ..Config::default()
    };
    let node = TestNode::new(&config);
    let scheduler = node.trust.spawn_scheduler();

    let readers: Vec<Collector> = (0..4).map(|_| Collector::new()).collect();
    for (i, reader) in readers.iter().enumerate() {
        node.broker
            .subscribe("jobs.*", format!("reader-{}", i), reader.handler())
            .unwrap();
    }
    node.broker.start().unwrap();

    let sealer = node.broker.sealer("dispatcher");
    node.broker
        .publish(sealer.seal("jobs.new", Priority::High, b"job").unwrap())
        .unwrap();

    let trust = node.trust.clone();
    assert!(wait_until(Duration::from_secs(5), || trust.snapshot().version >= 1).await);
    assert_eq!(node.trust.snapshot().trigger, RecomputeTrigger::Threshold);
    assert!(node.trust.snapshot().get("dispatcher").is_some());

    node.broker.shutdown().await;
    scheduler.shutdown().await;
}
