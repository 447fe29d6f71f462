mod common;

use async_trait::async_trait;
use common::*;
use ravenmq_client::inflow::{
    durable_subscription_queue, ActivationSpec, InflowActivation, MessageEndpoint,
    MessageEndpointFactory,
};
use ravenmq_client::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Endpoint that reports every message and fails the first `failures`
struct ReportingEndpoint {
    delivered: mpsc::UnboundedSender<(String, bool)>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageEndpoint for ReportingEndpoint {
    async fn before_delivery(&self) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    async fn on_message(&self, message: ClientMessage) -> std::result::Result<(), HandlerError> {
        let text = message.text()?.to_string();
        let _ = self.delivered.send((text, message.is_redelivered()));
        let remaining = self.failures.load(Ordering::Acquire);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::Release);
            return Err("endpoint refused the message".into());
        }
        Ok(())
    }

    async fn after_delivery(&self) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

struct Factory {
    delivered: mpsc::UnboundedSender<(String, bool)>,
    failures: Arc<AtomicUsize>,
    created: AtomicUsize,
}

impl MessageEndpointFactory for Factory {
    fn create_endpoint(&self, _session: Option<Session>) -> Result<Arc<dyn MessageEndpoint>> {
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(ReportingEndpoint {
            delivered: self.delivered.clone(),
            failures: Arc::clone(&self.failures),
        }))
    }
}

fn factory(failures: usize) -> (Arc<Factory>, mpsc::UnboundedReceiver<(String, bool)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let factory = Arc::new(Factory {
        delivered: tx,
        failures: Arc::new(AtomicUsize::new(failures)),
        created: AtomicUsize::new(0),
    });
    (factory, rx)
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<(String, bool)>) -> (String, bool) {
    tokio::time::timeout(RECEIVE_TIMEOUT, rx.recv())
        .await
        .expect("no delivery")
        .expect("endpoint gone")
}

#[tokio::test]
async fn test_queue_activation_delivers_and_acknowledges() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    admin.create_queue("jobs", "jobs", None, true).await.unwrap();

    let (factory, mut rx) = factory(0);
    let activation = InflowActivation::new(
        ActivationSpec::queue("jobs").max_sessions(2),
        factory.clone(),
        None,
    );
    assert_eq!(activation.session_ack_mode(), AckMode::Client);
    activation.start(&connection).await.unwrap();
    assert_eq!(factory.created.load(Ordering::Acquire), 2);

    send_texts(&admin, "jobs", (0..4).map(|i| format!("job-{}", i))).await;
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(next_delivery(&mut rx).await.0);
    }
    seen.sort();
    let expected: Vec<String> = (0..4).map(|i| format!("job-{}", i)).collect();
    assert_eq!(seen, expected);

    assert!(wait_for(|| harness.cluster.queue_depth("node-1", "jobs") == Some(0)).await);
    activation.stop().await;
    assert_eq!(admin.queue_query("jobs").await.unwrap().message_count, 0);
    assert_eq!(admin.queue_query("jobs").await.unwrap().consumer_count, 0);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_local_transaction_is_redelivered() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    admin.create_queue("jobs", "jobs", None, true).await.unwrap();

    let (factory, mut rx) = factory(1);
    let activation = InflowActivation::new(
        ActivationSpec::queue("jobs").use_local_tx(true),
        factory,
        None,
    );
    assert_eq!(activation.session_ack_mode(), AckMode::Transacted);
    activation.start(&connection).await.unwrap();

    send_texts(&admin, "jobs", vec!["flaky".to_string()]).await;
    assert_eq!(next_delivery(&mut rx).await, ("flaky".to_string(), false));
    assert_eq!(next_delivery(&mut rx).await, ("flaky".to_string(), true));

    let query_session = connection.create_session(AckMode::Auto).await.unwrap();
    assert!(wait_for_async_empty(&query_session, "jobs").await);
    activation.stop().await;
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_client_delivery_is_recovered() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    admin.create_queue("jobs", "jobs", None, true).await.unwrap();

    let (factory, mut rx) = factory(1);
    let activation = InflowActivation::new(ActivationSpec::queue("jobs"), factory, None);
    activation.start(&connection).await.unwrap();

    send_texts(&admin, "jobs", vec!["retry-me".to_string()]).await;
    assert_eq!(next_delivery(&mut rx).await, ("retry-me".to_string(), false));
    assert_eq!(next_delivery(&mut rx).await, ("retry-me".to_string(), true));
    assert!(wait_for_async_empty(&admin, "jobs").await);
    activation.stop().await;
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_stop_mid_stream_loses_no_message() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    admin.create_queue("jobs", "jobs", None, true).await.unwrap();
    send_texts(&admin, "jobs", (0..20).map(|i| format!("job-{:02}", i))).await;

    let (factory, mut rx) = factory(0);
    let activation = InflowActivation::new(ActivationSpec::queue("jobs"), factory.clone(), None);
    activation.start(&connection).await.unwrap();
    let mut seen = vec![next_delivery(&mut rx).await.0];
    activation.stop().await;
    while let Ok((text, _)) = rx.try_recv() {
        seen.push(text);
    }

    let restarted = InflowActivation::new(ActivationSpec::queue("jobs"), factory, None);
    restarted.start(&connection).await.unwrap();
    while seen.iter().collect::<std::collections::BTreeSet<_>>().len() < 20 {
        seen.push(next_delivery(&mut rx).await.0);
    }
    assert!(wait_for_async_empty(&admin, "jobs").await);
    restarted.stop().await;
    connection.close().await.unwrap();
}

async fn wait_for_async_empty(session: &Session, queue: &str) -> bool {
    for _ in 0..500 {
        if session.queue_query(queue).await.unwrap().message_count == 0 {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_durable_subscription_is_created_and_reused() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    let queue = durable_subscription_queue("client-a", "prices");
    assert_eq!(queue, "client-a.prices");

    let spec = ActivationSpec::topic("prices")
        .durable_subscription("client-a", "prices")
        .message_selector("venue = 'x'");
    let (factory, mut rx) = factory(0);
    let activation = InflowActivation::new(spec.clone(), factory.clone(), None);
    activation.start(&connection).await.unwrap();

    let query = admin.queue_query(queue.clone()).await.unwrap();
    assert!(query.exists && query.durable);
    assert_eq!(query.filter.as_ref().map(|f| f.to_string()), Some("venue = 'x'".to_string()));
    assert_eq!(query.consumer_count, 1);

    let producer = admin.create_producer(Some("prices".into())).await.unwrap();
    for venue in ["y", "x"] {
        producer
            .send(
                &admin
                    .create_message(true)
                    .with_body(format!("from-{}", venue))
                    .with_property("venue", venue),
            )
            .await
            .unwrap();
    }
    assert_eq!(next_delivery(&mut rx).await.0, "from-x");
    activation.stop().await;

    // messages published while stopped wait in the subscription
    producer
        .send(
            &admin
                .create_message(true)
                .with_body("while-away")
                .with_property("venue", "x"),
        )
        .await
        .unwrap();
    assert_eq!(admin.queue_query(queue.clone()).await.unwrap().message_count, 1);

    let restarted = InflowActivation::new(spec, factory, None);
    restarted.start(&connection).await.unwrap();
    assert_eq!(next_delivery(&mut rx).await.0, "while-away");
    restarted.stop().await;
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_durable_subscription_is_recreated_when_topic_changes() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    let queue = durable_subscription_queue("client-a", "feed");
    admin
        .create_queue("old-topic", queue.clone(), None, true)
        .await
        .unwrap();

    let (factory, _rx) = factory(0);
    let activation = InflowActivation::new(
        ActivationSpec::topic("new-topic").durable_subscription("client-a", "feed"),
        factory,
        None,
    );
    activation.start(&connection).await.unwrap();

    let query = admin.queue_query(queue).await.unwrap();
    assert_eq!(query.address.as_ref().map(|a| a.to_string()), Some("new-topic".to_string()));
    activation.stop().await;
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_durable_subscription_requires_client_id() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();

    let mut spec = ActivationSpec::topic("prices");
    spec.subscription_durable = true;
    spec.subscription_name = Some("prices".to_string());
    let (factory, _rx) = factory(0);
    let activation = InflowActivation::new(spec, factory, None);

    let started = activation.start(&connection).await;
    assert!(matches!(started, Err(RavenClientError::IllegalState { .. })));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_durable_subscription_with_subscriber_is_refused() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    let queue = durable_subscription_queue("client-a", "prices");
    admin.create_queue("prices", queue.clone(), None, true).await.unwrap();
    let _existing = admin.create_consumer(queue).await.unwrap();

    let (factory, _rx) = factory(0);
    let activation = InflowActivation::new(
        ActivationSpec::topic("prices").durable_subscription("client-a", "prices"),
        factory,
        None,
    );
    let started = activation.start(&connection).await;
    assert!(matches!(started, Err(RavenClientError::IllegalState { .. })));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_topic_subscription_queue_is_removed_on_stop() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();

    let (factory, mut rx) = factory(0);
    let activation = InflowActivation::new(
        ActivationSpec::topic("news").max_sessions(2),
        factory,
        None,
    );
    activation.start(&connection).await.unwrap();
    let queue = activation.topic_temporary_queue().unwrap();
    let query = admin.queue_query(queue.clone()).await.unwrap();
    assert!(query.exists && !query.durable);
    assert_eq!(query.consumer_count, 2);

    send_texts(&admin, "news", vec!["headline".to_string()]).await;
    assert_eq!(next_delivery(&mut rx).await.0, "headline");

    activation.stop().await;
    assert!(!admin.queue_query(queue).await.unwrap().exists);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_activation_starts_once() {
    let harness = ha_cluster(fast_config().build().unwrap());
    let connection = harness.locator.create_connection().await.unwrap();
    let admin = connection.create_session(AckMode::Auto).await.unwrap();
    admin.create_queue("jobs", "jobs", None, true).await.unwrap();

    let (factory, _rx) = factory(0);
    let activation = InflowActivation::new(ActivationSpec::queue("jobs"), factory, None);
    activation.start(&connection).await.unwrap();
    assert!(activation.start(&connection).await.is_err());
    activation.stop().await;
    connection.close().await.unwrap();
}
