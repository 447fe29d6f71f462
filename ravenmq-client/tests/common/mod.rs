#![allow(dead_code)]

use ravenmq_client::*;
use std::sync::Arc;
use std::time::Duration;

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

/// Configuration that fails over quickly
pub fn fast_config() -> LocatorConfigBuilder {
    LocatorConfig::builder()
        .retry_interval(Duration::from_millis(20))
        .max_retry_interval(Duration::from_millis(20))
        .reconnect_attempts(10)
        .call_timeout(Duration::from_secs(5))
}

pub struct Harness {
    pub cluster: InVmCluster,
    pub live: Endpoint,
    pub backup: Endpoint,
    pub locator: ServerLocator,
}

/// One node with a backup and an HA locator pointing at it
pub fn ha_cluster(config: LocatorConfig) -> Harness {
    let cluster = InVmCluster::new();
    let (live, backup) = cluster.add_node("node-1");
    let locator =
        RavenClient::create_locator_with_ha(cluster.connector(), vec![live.clone()], config)
            .expect("locator");
    Harness {
        cluster,
        live,
        backup,
        locator,
    }
}

/// Poll `condition` until it holds or five seconds passed
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until the connection learned its backup from the server
pub async fn wait_for_backup(harness: &Harness) {
    let topology = harness.locator.topology();
    assert!(
        wait_for(|| topology.backup_for(&harness.live).is_some()).await,
        "backup never announced"
    );
}

/// Wait for the next completed (or failed) failover
pub async fn next_failover_outcome(
    events: &mut tokio::sync::broadcast::Receiver<FailoverEvent>,
) -> FailoverEvent {
    loop {
        let event = tokio::time::timeout(RECEIVE_TIMEOUT, events.recv())
            .await
            .expect("failover timed out")
            .expect("failover events closed");
        match event {
            FailoverEvent::FailoverStarted { .. } => continue,
            outcome => return outcome,
        }
    }
}

pub async fn send_texts(session: &Session, address: &str, texts: impl IntoIterator<Item = String>) {
    let producer = session
        .create_producer(Some(address.into()))
        .await
        .expect("producer");
    for text in texts {
        producer
            .send(&session.create_message(true).with_body(text))
            .await
            .expect("send");
    }
}

/// Receive until the consumer stays quiet
pub async fn drain(consumer: &Consumer) -> Vec<ClientMessage> {
    let mut received = Vec::new();
    while let Some(message) = consumer.receive(Some(QUIET)).await.expect("receive") {
        received.push(message);
    }
    received
}

pub fn texts(messages: &[ClientMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| m.text().expect("text").to_string())
        .collect()
}

#[derive(Default)]
pub struct RecordingListener {
    pub before_reconnect: parking_lot::Mutex<Vec<String>>,
    pub failed: parking_lot::Mutex<Vec<(String, bool)>>,
}

impl SessionFailureListener for RecordingListener {
    fn before_reconnect(&self, error: &RavenClientError) {
        self.before_reconnect.lock().push(error.to_string());
    }

    fn connection_failed(&self, error: &RavenClientError, failed_over: bool) {
        self.failed.lock().push((error.to_string(), failed_over));
    }
}

pub fn recording_listener() -> Arc<RecordingListener> {
    Arc::new(RecordingListener::default())
}
