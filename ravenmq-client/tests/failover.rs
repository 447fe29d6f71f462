mod common;

use common::*;
use ravenmq_client::*;
use std::time::Duration;

#[tokio::test]
async fn test_acknowledged_messages_are_not_redelivered_after_failover() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Client).await.unwrap();
    session.create_queue("orders", "orders", None, true).await.unwrap();
    let consumer = session.create_consumer("orders").await.unwrap();
    send_texts(&session, "orders", (1..=10).map(|i| format!("message-{}", i))).await;
    session.start().await.unwrap();
    wait_for_backup(&harness).await;

    let mut received = Vec::new();
    for _ in 0..10 {
        received.push(consumer.receive(Some(RECEIVE_TIMEOUT)).await.unwrap().unwrap());
    }
    received[4].acknowledge().await.unwrap();

    let mut events = connection.subscribe_failover();
    harness.cluster.kill_node("node-1");
    match next_failover_outcome(&mut events).await {
        FailoverEvent::FailoverCompleted { to, .. } => assert_eq!(to, harness.backup),
        other => panic!("unexpected failover outcome: {:?}", other),
    }

    // delivered before the failover, so no longer acknowledgeable
    let stale = received[5].acknowledge().await;
    assert!(matches!(stale, Err(RavenClientError::Acknowledgement { .. })));

    let mut again = Vec::new();
    for _ in 0..5 {
        again.push(consumer.receive(Some(RECEIVE_TIMEOUT)).await.unwrap().unwrap());
    }
    let expected: Vec<String> = (6..=10).map(|i| format!("message-{}", i)).collect();
    assert_eq!(texts(&again), expected);
    assert!(again.iter().all(|m| !m.is_redelivered()));
    assert!(consumer.receive(Some(QUIET)).await.unwrap().is_none());

    again[4].acknowledge().await.unwrap();
    let query = session.queue_query("orders").await.unwrap();
    assert_eq!(query.message_count, 0);
    assert_eq!(connection.endpoint().await, Some(harness.backup.clone()));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_unconfirmed_sends_are_resent_once() {
    let config = fast_config()
        .confirmation_window_size(1024 * 1024)
        .build()
        .unwrap();
    let harness = ha_cluster(config);
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Auto).await.unwrap();
    session.create_queue("resend", "resend", None, true).await.unwrap();
    let consumer = session.create_consumer("resend").await.unwrap();
    wait_for_backup(&harness).await;

    send_texts(&session, "resend", (0..3).map(|i| format!("kept-{}", i))).await;
    assert!(wait_for(|| session.unconfirmed_sends() == 0).await);

    harness.cluster.swallow_sends("node-1", true);
    send_texts(&session, "resend", (0..5).map(|i| format!("lost-{}", i))).await;
    assert_eq!(session.unconfirmed_sends(), 5);

    harness.cluster.swallow_sends("node-1", false);
    let mut events = connection.subscribe_failover();
    harness.cluster.kill_node("node-1");
    assert!(matches!(
        next_failover_outcome(&mut events).await,
        FailoverEvent::FailoverCompleted { .. }
    ));

    session.start().await.unwrap();
    let received = texts(&drain(&consumer).await);
    let mut expected: Vec<String> = (0..3).map(|i| format!("kept-{}", i)).collect();
    expected.extend((0..5).map(|i| format!("lost-{}", i)));
    assert_eq!(received, expected);
    assert!(wait_for(|| session.unconfirmed_sends() == 0).await);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_transaction_is_rolled_back_by_failover() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_transacted_session().await.unwrap();
    session.create_queue("tx", "tx", None, true).await.unwrap();
    wait_for_backup(&harness).await;

    let producer = session.create_producer(Some("tx".into())).await.unwrap();
    for i in 0..3 {
        producer
            .send(&session.create_message(true).with_body(format!("first-{}", i)))
            .await
            .unwrap();
    }
    assert_eq!(session.pending_transaction_work(), (3, 0));

    let mut events = connection.subscribe_failover();
    harness.cluster.kill_node("node-1");
    next_failover_outcome(&mut events).await;
    assert!(session.is_rollback_only());

    let commit = session.commit().await;
    assert!(matches!(commit, Err(RavenClientError::TransactionRolledBack { .. })));
    assert!(!session.is_rollback_only());

    for i in 0..3 {
        producer
            .send(&session.create_message(true).with_body(format!("second-{}", i)))
            .await
            .unwrap();
    }
    session.commit().await.unwrap();

    let reader = connection.create_session(AckMode::Auto).await.unwrap();
    let consumer = reader.create_consumer("tx").await.unwrap();
    reader.start().await.unwrap();
    let expected: Vec<String> = (0..3).map(|i| format!("second-{}", i)).collect();
    assert_eq!(texts(&drain(&consumer).await), expected);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_reset_if_needed_clears_rollback_only() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_transacted_session().await.unwrap();
    wait_for_backup(&harness).await;

    let mut events = connection.subscribe_failover();
    harness.cluster.kill_node("node-1");
    next_failover_outcome(&mut events).await;

    assert!(session.is_rollback_only());
    session.reset_if_needed().await.unwrap();
    assert!(!session.is_rollback_only());
    session.commit().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_failover_notifies_events_status_and_listeners() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let _session = connection.create_session(AckMode::Auto).await.unwrap();
    wait_for_backup(&harness).await;

    let listener = recording_listener();
    connection.add_failure_listener(listener.clone());
    let mut events = connection.subscribe_failover();
    let before = connection.status().generation;

    harness.cluster.kill_node("node-1");

    let started = tokio::time::timeout(RECEIVE_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        started,
        FailoverEvent::FailoverStarted {
            from: harness.live.clone()
        }
    );
    match next_failover_outcome(&mut events).await {
        FailoverEvent::FailoverCompleted { to, generation } => {
            assert_eq!(to, harness.backup);
            assert!(generation > before);
        }
        other => panic!("unexpected failover outcome: {:?}", other),
    }

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(wait_for(|| !listener.failed.lock().is_empty()).await);
    assert_eq!(listener.before_reconnect.lock().len(), 1);
    let failed = listener.failed.lock().clone();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].1);
    assert_eq!(connection.node_id().await.as_deref(), Some("node-1"));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_failure_without_backup_closes_connection() {
    let harness = ha_cluster(fast_config().reconnect_attempts(2).build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Auto).await.unwrap();
    wait_for_backup(&harness).await;

    let listener = recording_listener();
    connection.add_failure_listener(listener.clone());
    let mut events = connection.subscribe_failover();

    harness.cluster.kill_backup("node-1");
    harness.cluster.kill_node("node-1");

    assert!(matches!(
        next_failover_outcome(&mut events).await,
        FailoverEvent::FailoverFailed { .. }
    ));
    assert!(wait_for(|| connection.state() == ConnectionState::Closed).await);
    assert!(connection.is_closed());
    assert!(wait_for(|| session.is_closed()).await);

    let failed = listener.failed.lock().clone();
    assert_eq!(failed.len(), 1);
    assert!(!failed[0].1);

    let producer = session.create_producer(Some("x".into())).await;
    assert!(matches!(producer, Err(RavenClientError::Closed { .. })));
    assert!(connection.create_session(AckMode::Auto).await.is_err());
}

#[tokio::test]
async fn test_zero_reconnect_attempts_make_faults_fatal() {
    let harness = ha_cluster(fast_config().reconnect_attempts(0).build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let _session = connection.create_session(AckMode::Auto).await.unwrap();
    wait_for_backup(&harness).await;

    let mut events = connection.subscribe_failover();
    harness.cluster.kill_node("node-1");
    assert!(matches!(
        next_failover_outcome(&mut events).await,
        FailoverEvent::FailoverFailed { .. }
    ));
    assert!(wait_for(|| connection.is_closed()).await);
}

#[tokio::test]
async fn test_server_disconnect_reconnects_to_same_live() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Auto).await.unwrap();
    session.create_queue("q", "q", None, true).await.unwrap();
    let consumer = session.create_consumer("q").await.unwrap();
    session.start().await.unwrap();
    wait_for_backup(&harness).await;

    let mut events = connection.subscribe_failover();
    harness.cluster.disconnect_clients("node-1", "maintenance");
    match next_failover_outcome(&mut events).await {
        FailoverEvent::FailoverCompleted { to, .. } => assert_eq!(to, harness.live),
        other => panic!("unexpected failover outcome: {:?}", other),
    }

    send_texts(&session, "q", vec!["after".to_string()]).await;
    let message = consumer.receive(Some(RECEIVE_TIMEOUT)).await.unwrap().unwrap();
    assert_eq!(message.text().unwrap(), "after");
    assert_eq!(harness.cluster.connection_count("node-1"), 1);
    connection.close().await.unwrap();
    assert_eq!(harness.cluster.connection_count("node-1"), 0);
}

#[tokio::test]
async fn test_unacknowledged_messages_are_first_deliveries_after_disconnect() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Client).await.unwrap();
    session.create_queue("q", "q", None, true).await.unwrap();
    let consumer = session.create_consumer("q").await.unwrap();
    send_texts(&session, "q", (0..4).map(|i| format!("pending-{}", i))).await;
    session.start().await.unwrap();
    wait_for_backup(&harness).await;

    let first = drain(&consumer).await;
    assert_eq!(first.len(), 4);

    let mut events = connection.subscribe_failover();
    harness.cluster.disconnect_clients("node-1", "maintenance");
    match next_failover_outcome(&mut events).await {
        FailoverEvent::FailoverCompleted { to, .. } => assert_eq!(to, harness.live),
        other => panic!("unexpected failover outcome: {:?}", other),
    }

    let again = drain(&consumer).await;
    assert_eq!(texts(&again), texts(&first));
    assert!(again.iter().all(|m| !m.is_redelivered()));
    assert!(again.iter().all(|m| m.delivery_count() == 1));

    again[3].acknowledge().await.unwrap();
    assert_eq!(session.queue_query("q").await.unwrap().message_count, 0);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_non_ha_locator_ignores_backup() {
    let cluster = InVmCluster::new();
    let (live, _backup) = cluster.add_node("node-1");
    let locator = RavenClient::create_locator_without_ha(
        cluster.connector(),
        vec![live.clone()],
        fast_config().reconnect_attempts(3).build().unwrap(),
    )
    .unwrap();
    let connection = locator.create_connection().await.unwrap();
    let _session = connection.create_session(AckMode::Auto).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(locator.topology().is_empty());

    let mut events = connection.subscribe_failover();
    cluster.kill_node("node-1");
    assert!(matches!(
        next_failover_outcome(&mut events).await,
        FailoverEvent::FailoverFailed { .. }
    ));
}

#[tokio::test]
async fn test_initial_connection_can_fail_over_to_backup() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let first = harness.locator.create_connection().await.unwrap();
    wait_for_backup(&harness).await;
    first.close().await.unwrap();

    harness.cluster.kill_node("node-1");
    assert!(harness.locator.create_connection().await.is_err());

    // no session was created yet, so the configuration can still change
    harness
        .locator
        .set_failover_on_initial_connection(true)
        .unwrap();
    let connection = harness.locator.create_connection().await.unwrap();
    assert_eq!(connection.endpoint().await, Some(harness.backup.clone()));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_sessions_keep_working_across_two_failovers() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::Auto).await.unwrap();
    session.create_queue("q", "q", None, true).await.unwrap();
    let consumer = session.create_consumer("q").await.unwrap();
    session.start().await.unwrap();
    wait_for_backup(&harness).await;

    let mut events = connection.subscribe_failover();
    harness.cluster.disconnect_clients("node-1", "first");
    next_failover_outcome(&mut events).await;
    harness.cluster.kill_node("node-1");
    next_failover_outcome(&mut events).await;

    send_texts(&session, "q", vec!["survived".to_string()]).await;
    let message = consumer.receive(Some(RECEIVE_TIMEOUT)).await.unwrap().unwrap();
    assert_eq!(message.text().unwrap(), "survived");
    assert_eq!(connection.endpoint().await, Some(harness.backup.clone()));
    connection.close().await.unwrap();
}
