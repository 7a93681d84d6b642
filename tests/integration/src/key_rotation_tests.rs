//! Key rotation and expiry as observed through the broker

use crate::test_utils::*;
use std::time::Duration;
use trustgate_broker::{MessageState, SecureBroker};
use trustgate_core::config::CryptoConfig;
use trustgate_core::{AlertKind, Config, Priority, RejectReason, SecureMessage};

const KEY_LIFETIME_SECS: u64 = 3_600;

fn config() -> Config {
    Config {
        crypto: CryptoConfig {
            key_lifetime_secs: KEY_LIFETIME_SECS,
            ..CryptoConfig::default()
        },
        ..Config::default()
    }
}

fn seal(broker: &SecureBroker, sender: &str, payload: &[u8], ttl_secs: u64) -> SecureMessage {
    broker
        .sealer(sender)
        .seal_with_ttl("keys.rotation", Priority::Normal, payload, ttl_secs)
        .unwrap()
}

#[tokio::test]
async fn test_messages_survive_rotation_until_key_expiry() {
    let node = TestNode::new(&config());
    let collector = Collector::new();
    node.broker
        .subscribe_authorized("keys.#", "reader", collector.handler())
        .unwrap();

    let first_key = node.crypto.active_key_id();
    let before = seal(&node.broker, "writer", b"under first key", 7_200);

    node.clock.advance(Duration::from_secs(600));
    let second_key = node.crypto.rotate_key();
    assert_ne!(first_key, second_key);
    let after = seal(&node.broker, "writer", b"under second key", 7_200);
    assert_eq!(before.key_id, first_key);
    assert_eq!(after.key_id, second_key);

    node.broker.publish(before).unwrap();
    node.broker.publish(after).unwrap();
    node.broker.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || collector.len() == 2).await);
    let payloads: Vec<Vec<u8>> = collector
        .deliveries()
        .into_iter()
        .map(|d| d.plaintext.unwrap().to_vec())
        .collect();
    assert_eq!(payloads, vec![b"under first key".to_vec(), b"under second key".to_vec()]);

    node.broker.shutdown().await;
}

#[tokio::test]
async fn test_expired_key_payload_rejected_after_queueing() {
    let node = TestNode::new(&config());
    let collector = Collector::new();
    node.broker
        .subscribe_authorized("keys.#", "reader", collector.handler())
        .unwrap();

    // Queued under the first key with a TTL that outlives the key
    let stale = seal(&node.broker, "writer", b"stale key", 7_200);
    let stale_id = node.broker.publish(stale).unwrap();

    // Past the first key's expiry the next seal rotates automatically
    node.clock.advance(Duration::from_secs(KEY_LIFETIME_SECS));
    let fresh = seal(&node.broker, "writer", b"fresh key", 600);
    let fresh_id = node.broker.publish(fresh).unwrap();
    assert_eq!(node.alerts.find(|a| a.kind == AlertKind::KeyRotated).len(), 1);

    node.broker.start().unwrap();

    let broker = node.broker.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            broker.status(&stale_id).map(|s| s.state)
                == Some(MessageState::Rejected {
                    reason: RejectReason::DecryptionFailed,
                })
        })
        .await
    );
    assert!(wait_until(Duration::from_secs(5), || collector.len() == 1).await);
    assert_eq!(collector.deliveries()[0].message_id, fresh_id);
    assert_eq!(
        node.alerts
            .find(|a| a.kind
                == AlertKind::Rejected {
                    reason: RejectReason::DecryptionFailed
                })
            .len(),
        1
    );

    node.crypto.purge_expired();
    assert_eq!(node.crypto.key_ids(), vec![node.crypto.active_key_id()]);

    node.broker.shutdown().await;
}

#[tokio::test]
async fn test_sender_key_rotation_invalidates_old_signatures() {
    let node = TestNode::new(&config());
    let signed_before = seal(&node.broker, "writer", b"old signature", 600);

    node.crypto.rotate_sender_key("writer").unwrap();
    let id = node.broker.publish(signed_before).unwrap();
    assert_eq!(
        node.broker.status(&id).unwrap().state,
        MessageState::Rejected {
            reason: RejectReason::BadSignature
        }
    );

    let signed_after = seal(&node.broker, "writer", b"new signature", 600);
    let id = node.broker.publish(signed_after).unwrap();
    assert_eq!(node.broker.status(&id).unwrap().state, MessageState::Queued);
}
