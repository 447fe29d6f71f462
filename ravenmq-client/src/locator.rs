//! Server locator: configuration holder and connection factory.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{LoadBalancingPolicyKind, LocatorConfig};
use crate::connection::{Connection, ConnectionInner};
use crate::error::RavenClientError;
use crate::metrics::{global_metrics, ClientMetrics};
use crate::topology::{Endpoint, TopologyView};
use crate::transport::Connector;
use crate::wire_string::WireString;
use crate::Result;

/// Chooses which of `max` candidate servers to try first
pub trait ConnectionLoadBalancingPolicy: Send + Sync + fmt::Debug {
    fn select(&self, max: usize) -> usize;
}

/// Cycles through the candidates starting at a random position
#[derive(Debug)]
pub struct RoundRobinPolicy {
    position: Mutex<Option<usize>>,
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self {
            position: Mutex::new(None),
        }
    }
}

impl ConnectionLoadBalancingPolicy for RoundRobinPolicy {
    fn select(&self, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        let mut position = self.position.lock();
        let next = match *position {
            Some(pos) => (pos + 1) % max,
            None => rand::rng().random_range(0..max),
        };
        *position = Some(next);
        next
    }
}

/// Picks a random candidate every time
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl ConnectionLoadBalancingPolicy for RandomPolicy {
    fn select(&self, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        rand::rng().random_range(0..max)
    }
}

/// Always the first candidate
#[derive(Debug, Default)]
pub struct FirstElementPolicy;

impl ConnectionLoadBalancingPolicy for FirstElementPolicy {
    fn select(&self, _max: usize) -> usize {
        0
    }
}

fn policy_for(kind: LoadBalancingPolicyKind) -> Arc<dyn ConnectionLoadBalancingPolicy> {
    match kind {
        LoadBalancingPolicyKind::RoundRobin => Arc::new(RoundRobinPolicy::default()),
        LoadBalancingPolicyKind::Random => Arc::new(RandomPolicy),
        LoadBalancingPolicyKind::First => Arc::new(FirstElementPolicy),
    }
}

pub(crate) struct LocatorInner {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) initial_endpoints: Vec<Endpoint>,
    pub(crate) ha: bool,
    pub(crate) topology: TopologyView,
    pub(crate) metrics: Arc<ClientMetrics>,
    config: RwLock<Arc<LocatorConfig>>,
    policy: RwLock<Arc<dyn ConnectionLoadBalancingPolicy>>,
    frozen: AtomicBool,
    closed: AtomicBool,
    connection_counter: AtomicUsize,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
}

impl fmt::Debug for LocatorInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatorInner")
            .field("initial_endpoints", &self.initial_endpoints)
            .field("ha", &self.ha)
            .field("frozen", &self.frozen.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocatorInner {
    pub(crate) fn config(&self) -> Arc<LocatorConfig> {
        Arc::clone(&self.config.read())
    }

    pub(crate) fn policy(&self) -> Arc<dyn ConnectionLoadBalancingPolicy> {
        Arc::clone(&self.policy.read())
    }

    /// Called when a session is created from one of our connections
    pub(crate) fn freeze(&self) {
        let _config = self.config.write();
        if !self.frozen.swap(true, Ordering::AcqRel) {
            debug!("Locator configuration frozen");
        }
    }

    /// Live endpoints to choose from when connecting
    pub(crate) fn live_candidates(&self) -> Vec<Endpoint> {
        if self.ha {
            let live = self.topology.live_endpoints();
            if !live.is_empty() {
                return live;
            }
        }
        self.initial_endpoints.clone()
    }

    /// `endpoints` rotated so that the policy's pick comes first
    pub(crate) fn ordered(&self, mut endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        if endpoints.len() > 1 {
            let start = self.policy().select(endpoints.len()) % endpoints.len();
            endpoints.rotate_left(start);
        }
        endpoints
    }

    pub(crate) fn next_connection_number(&self) -> usize {
        self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Factory for connections to a cluster.
///
/// Configuration can be changed until the first session is created from one
/// of this locator's connections; after that every setter fails.
#[derive(Debug, Clone)]
pub struct ServerLocator {
    inner: Arc<LocatorInner>,
}

impl ServerLocator {
    /// Create a locator. In HA mode `endpoints` only bootstrap the first
    /// connection and the topology pushed by the servers is used afterwards.
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoints: Vec<Endpoint>,
        ha: bool,
        config: LocatorConfig,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(RavenClientError::invalid_config(
                "At least one endpoint is required",
            ));
        }
        config.validate()?;

        let topology = TopologyView::new();
        let policy = policy_for(config.load_balancing_policy);

        Ok(Self {
            inner: Arc::new(LocatorInner {
                connector,
                initial_endpoints: endpoints,
                ha,
                topology,
                metrics: global_metrics(),
                config: RwLock::new(Arc::new(config)),
                policy: RwLock::new(policy),
                frozen: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                connection_counter: AtomicUsize::new(0),
                connections: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Open a connection to one of the candidate servers
    pub async fn create_connection(&self) -> Result<Connection> {
        if self.inner.is_closed() {
            return Err(RavenClientError::closed("ServerLocator"));
        }

        let connection = Connection::connect(Arc::clone(&self.inner)).await?;
        let mut connections = self.inner.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(connection.downgrade());
        Ok(connection)
    }

    /// Close every connection created by this locator
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let connections: Vec<Arc<ConnectionInner>> = self
            .inner
            .connections
            .lock()
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();

        info!(connections = connections.len(), "Closing server locator");
        for connection in connections {
            Connection::from_inner(connection).close().await.ok();
        }
    }

    /// Whether the locator was closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub(crate) fn inner(&self) -> &LocatorInner {
        &self.inner
    }

    /// Cluster topology learnt from servers
    pub fn topology(&self) -> &TopologyView {
        &self.inner.topology
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> Arc<LocatorConfig> {
        self.inner.config()
    }

    /// Whether a session was created, freezing the configuration
    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::Acquire)
    }

    /// Whether failover may use servers learnt from the topology
    pub fn is_ha(&self) -> bool {
        self.inner.ha
    }

    /// Endpoints the locator was created with
    pub fn initial_endpoints(&self) -> &[Endpoint] {
        &self.inner.initial_endpoints
    }

    /// Apply a change to the configuration, validating the result
    pub fn update_config<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut LocatorConfig),
    {
        let mut guard = self.inner.config.write();
        if self.is_frozen() {
            return Err(RavenClientError::illegal_state(
                "Cannot change the locator configuration after a session has been created",
            ));
        }

        let mut config = LocatorConfig::clone(&guard);
        let previous_policy = config.load_balancing_policy;
        change(&mut config);
        config.validate()?;

        if config.load_balancing_policy != previous_policy {
            *self.inner.policy.write() = policy_for(config.load_balancing_policy);
        }
        *guard = Arc::new(config);
        Ok(())
    }

    /// Replace the load balancing policy with a custom one
    pub fn set_load_balancing_policy_instance(
        &self,
        policy: Arc<dyn ConnectionLoadBalancingPolicy>,
    ) -> Result<()> {
        let _guard = self.inner.config.write();
        if self.is_frozen() {
            return Err(RavenClientError::illegal_state(
                "Cannot change the load balancing policy after a session has been created",
            ));
        }
        *self.inner.policy.write() = policy;
        Ok(())
    }

    /// Change the client failure check period; refused once a session exists
    pub fn set_client_failure_check_period(&self, period: Duration) -> Result<()> {
        self.update_config(|c| c.client_failure_check_period = period)
    }

    /// Change the connection TTL; refused once a session exists
    pub fn set_connection_ttl(&self, ttl: Duration) -> Result<()> {
        self.update_config(|c| c.connection_ttl = ttl)
    }

    /// Change the call timeout; refused once a session exists
    pub fn set_call_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_config(|c| c.call_timeout = timeout)
    }

    /// Change the min large message size; refused once a session exists
    pub fn set_min_large_message_size(&self, size: usize) -> Result<()> {
        self.update_config(|c| c.min_large_message_size = size)
    }

    /// Change the consumer window size; refused once a session exists
    pub fn set_consumer_window_size(&self, size: i32) -> Result<()> {
        self.update_config(|c| c.consumer_window_size = size)
    }

    /// Change the producer window size; refused once a session exists
    pub fn set_producer_window_size(&self, size: i32) -> Result<()> {
        self.update_config(|c| c.producer_window_size = size)
    }

    /// Change the confirmation window size; refused once a session exists
    pub fn set_confirmation_window_size(&self, size: i32) -> Result<()> {
        self.update_config(|c| c.confirmation_window_size = size)
    }

    /// Change the block on acknowledge; refused once a session exists
    pub fn set_block_on_acknowledge(&self, block: bool) -> Result<()> {
        self.update_config(|c| c.block_on_acknowledge = block)
    }

    /// Change the block on durable send; refused once a session exists
    pub fn set_block_on_durable_send(&self, block: bool) -> Result<()> {
        self.update_config(|c| c.block_on_durable_send = block)
    }

    /// Change the block on non durable send; refused once a session exists
    pub fn set_block_on_non_durable_send(&self, block: bool) -> Result<()> {
        self.update_config(|c| c.block_on_non_durable_send = block)
    }

    /// Change the auto group; refused once a session exists
    pub fn set_auto_group(&self, auto_group: bool) -> Result<()> {
        self.update_config(|c| c.auto_group = auto_group)
    }

    /// Change the group id; refused once a session exists
    pub fn set_group_id<S: Into<WireString>>(&self, group_id: Option<S>) -> Result<()> {
        let group_id = group_id.map(Into::into);
        self.update_config(|c| c.group_id = group_id)
    }

    /// Change the ack batch size; refused once a session exists
    pub fn set_ack_batch_size(&self, size: usize) -> Result<()> {
        self.update_config(|c| c.ack_batch_size = size)
    }

    /// Change the retry interval; refused once a session exists
    pub fn set_retry_interval(&self, interval: Duration) -> Result<()> {
        self.update_config(|c| c.retry.retry_interval = interval)
    }

    /// Change the retry interval multiplier; refused once a session exists
    pub fn set_retry_interval_multiplier(&self, multiplier: f64) -> Result<()> {
        self.update_config(|c| c.retry.retry_interval_multiplier = multiplier)
    }

    /// Change the max retry interval; refused once a session exists
    pub fn set_max_retry_interval(&self, interval: Duration) -> Result<()> {
        self.update_config(|c| c.retry.max_retry_interval = interval)
    }

    /// Change the reconnect attempts; refused once a session exists
    pub fn set_reconnect_attempts(&self, attempts: u32) -> Result<()> {
        self.update_config(|c| c.retry.reconnect_attempts = attempts)
    }

    /// Change the initial connect attempts; refused once a session exists
    pub fn set_initial_connect_attempts(&self, attempts: u32) -> Result<()> {
        self.update_config(|c| c.retry.initial_connect_attempts = attempts)
    }

    /// Change the failover on initial connection; refused once a session exists
    pub fn set_failover_on_initial_connection(&self, failover: bool) -> Result<()> {
        self.update_config(|c| c.retry.failover_on_initial_connection = failover)
    }

    /// Change the load balancing policy; refused once a session exists
    pub fn set_load_balancing_policy(&self, policy: LoadBalancingPolicyKind) -> Result<()> {
        self.update_config(|c| c.load_balancing_policy = policy)
    }

    /// Change the task name prefix; refused once a session exists
    pub fn set_task_name_prefix<S: Into<String>>(&self, prefix: S) -> Result<()> {
        let prefix = prefix.into();
        self.update_config(|c| c.task_name_prefix = prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_robin_cycles_from_random_start() {
        let policy = RoundRobinPolicy::default();
        let first = policy.select(3);
        assert!(first < 3);
        assert_eq!(policy.select(3), (first + 1) % 3);
        assert_eq!(policy.select(3), (first + 2) % 3);
        assert_eq!(policy.select(3), first);
    }

    #[test]
    fn test_random_policy_stays_in_range() {
        let policy = RandomPolicy;
        let picks: HashSet<usize> = (0..200).map(|_| policy.select(4)).collect();
        assert!(picks.iter().all(|p| *p < 4));
        assert!(picks.len() > 1);
        assert_eq!(policy.select(0), 0);
    }

    #[test]
    fn test_first_element_policy() {
        let policy = FirstElementPolicy;
        assert_eq!(policy.select(5), 0);
        assert_eq!(policy.select(5), 0);
    }
}
