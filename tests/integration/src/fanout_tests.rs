//! Fan-out delivery at scale
//!
//! 50 publishing agents, 5 topics, 10 subscribers per topic. Every
//! subscriber must see every message on its topics exactly once.

use crate::test_utils::*;
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use trustgate_broker::MessageState;
use trustgate_core::{Config, Priority};

const PUBLISHERS: usize = 50;
const TOPICS: usize = 5;
const SUBSCRIBERS: usize = 10;

fn topic(i: usize) -> String {
    format!("fleet.topic-{}.events", i)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_once_fanout() {
    let node = TestNode::new(&Config::default());

    let collectors: Vec<Collector> = (0..SUBSCRIBERS).map(|_| Collector::new()).collect();
    for (s, collector) in collectors.iter().enumerate() {
        for t in 0..TOPICS {
            node.broker
                .subscribe_authorized(&topic(t), format!("subscriber-{:02}", s), collector.handler())
                .unwrap();
        }
    }
    assert_eq!(node.broker.subscription_count(), SUBSCRIBERS * TOPICS);
    node.broker.start().unwrap();

    // Publishers run concurrently, one message per topic each
    let publishes = (0..PUBLISHERS).map(|p| {
        let broker = node.broker.clone();
        tokio::spawn(async move {
            let sealer = broker.sealer(format!("agent-{:02}", p));
            let mut ids = Vec::with_capacity(TOPICS);
            for t in 0..TOPICS {
                let payload = format!("agent-{:02} -> topic-{}", p, t);
                let message = sealer
                    .seal(&topic(t), Priority::Normal, payload.as_bytes())
                    .unwrap();
                ids.push(broker.publish(message).unwrap());
            }
            ids
        })
    });
    let published: Vec<String> = join_all(publishes)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    assert_eq!(published.len(), PUBLISHERS * TOPICS);

    let expected = PUBLISHERS * TOPICS;
    let all_done = wait_until(Duration::from_secs(30), || {
        collectors.iter().all(|c| c.len() >= expected)
    })
    .await;
    assert!(all_done, "not every subscriber received every message");

    // Give any duplicate a chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    let published_set: HashSet<&String> = published.iter().collect();
    for collector in &collectors {
        let counts = collector.counts();
        assert_eq!(counts.len(), expected);
        assert!(counts.values().all(|&n| n == 1), "duplicate delivery");
        assert!(counts.keys().all(|id| published_set.contains(id)));
        for delivery in collector.deliveries() {
            let text = String::from_utf8(delivery.plaintext.unwrap().to_vec()).unwrap();
            assert!(delivery.topic.ends_with(".events"));
            assert!(text.starts_with(delivery.sender_id.as_str()));
        }
    }

    for id in &published {
        assert_eq!(node.broker.status(id).unwrap().state, MessageState::Delivered);
    }
    assert!(node.alerts.find(|a| a.message_id.is_some()).is_empty());

    node.broker.shutdown().await;
}

#[tokio::test]
async fn test_wildcard_subscribers_receive_all_topics() {
    let node = TestNode::new(&Config::default());
    let everything = Collector::new();
    let one_topic = Collector::new();
    node.broker
        .subscribe("fleet.#", "monitor", everything.handler())
        .unwrap();
    node.broker
        .subscribe("fleet.*.events", "events-only", one_topic.handler())
        .unwrap();
    node.broker.start().unwrap();

    let sealer = node.broker.sealer("agent-00");
    for t in 0..TOPICS {
        node.broker
            .publish(sealer.seal(&topic(t), Priority::Low, b"x").unwrap())
            .unwrap();
    }
    node.broker
        .publish(sealer.seal("fleet.status", Priority::Low, b"x").unwrap())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || everything.len() == TOPICS + 1).await);
    assert!(wait_until(Duration::from_secs(5), || one_topic.len() == TOPICS).await);
    assert!(one_topic.deliveries().iter().all(|d| d.plaintext.is_none()));

    node.broker.shutdown().await;
}
