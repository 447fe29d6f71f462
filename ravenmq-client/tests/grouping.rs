mod common;

use common::*;
use ravenmq_client::*;

async fn grouped_counts(auto_group: bool, producers: usize, consumers: usize) -> Vec<usize> {
    let config = fast_config().auto_group(auto_group).build().unwrap();
    let harness = ha_cluster(config);
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Auto).await.unwrap();
    session.create_queue("grouped", "grouped", None, false).await.unwrap();

    let mut receivers = Vec::new();
    for _ in 0..consumers {
        receivers.push(session.create_consumer("grouped").await.unwrap());
    }

    for p in 0..producers {
        send_texts(&session, "grouped", (0..100).map(|i| format!("p{}-{}", p, i))).await;
    }
    session.start().await.unwrap();

    let mut counts = Vec::new();
    for consumer in &receivers {
        counts.push(drain(consumer).await.len());
    }
    connection.close().await.unwrap();
    counts
}

#[tokio::test]
async fn test_auto_group_pins_single_producer_to_one_consumer() {
    let mut counts = grouped_counts(true, 1, 2).await;
    counts.sort_unstable();
    assert_eq!(counts, vec![0, 100]);
}

#[tokio::test]
async fn test_each_producer_gets_its_own_group() {
    let mut counts = grouped_counts(true, 2, 3).await;
    counts.sort_unstable();
    assert_eq!(counts, vec![0, 100, 100]);
}

#[tokio::test]
async fn test_ungrouped_messages_are_spread() {
    let counts = grouped_counts(false, 1, 2).await;
    assert_eq!(counts, vec![50, 50]);
}

#[tokio::test]
async fn test_fixed_group_id_overrides_auto_group() {
    let config = fast_config()
        .auto_group(true)
        .group_id("fixed")
        .build()
        .unwrap();
    let harness = ha_cluster(config);
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Auto).await.unwrap();

    let first = session.create_producer(Some("a".into())).await.unwrap();
    let second = session.create_producer(Some("a".into())).await.unwrap();
    assert_eq!(first.group_id().map(|g| g.to_string()), Some("fixed".to_string()));
    assert_eq!(first.group_id(), second.group_id());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_group_order_is_kept_within_a_consumer() {
    let config = fast_config().auto_group(true).build().unwrap();
    let harness = ha_cluster(config);
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Auto).await.unwrap();
    session.create_queue("ordered", "ordered", None, false).await.unwrap();
    let consumer = session.create_consumer("ordered").await.unwrap();

    send_texts(&session, "ordered", (0..20).map(|i| i.to_string())).await;
    session.start().await.unwrap();

    let received = texts(&drain(&consumer).await);
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(received, expected);
    connection.close().await.unwrap();
}
