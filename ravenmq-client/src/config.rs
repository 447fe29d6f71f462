//! Configuration types for the RavenMQ client

use std::time::Duration;

use crate::error::RavenClientError;
use crate::wire_string::WireString;
use crate::Result;

/// Default period between failure checks
pub const DEFAULT_CLIENT_FAILURE_CHECK_PERIOD: Duration = Duration::from_secs(30);
/// Default silence after which the server is considered gone
pub const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(60);
/// Default timeout for a blocking call to the server
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default threshold above which messages are streamed in chunks
pub const DEFAULT_MIN_LARGE_MESSAGE_SIZE: usize = 100 * 1024;
/// Default consumer credit window in bytes
pub const DEFAULT_CONSUMER_WINDOW_SIZE: i32 = 1024 * 1024;
/// Default producer window in bytes
pub const DEFAULT_PRODUCER_WINDOW_SIZE: i32 = 64 * 1024;
/// Confirmations disabled
pub const DEFAULT_CONFIRMATION_WINDOW_SIZE: i32 = -1;
/// Default bytes of DUPS_OK acknowledgements batched before a flush
pub const DEFAULT_ACK_BATCH_SIZE: usize = 1024 * 1024;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_INTERVAL_MULTIPLIER: f64 = 1.0;
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 0;
pub const DEFAULT_INITIAL_CONNECT_ATTEMPTS: u32 = 1;
pub const DEFAULT_TASK_NAME_PREFIX: &str = "ravenmq-client";

/// How the locator picks a server among several candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingPolicyKind {
    #[default]
    RoundRobin,
    Random,
    First,
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub retry_interval: Duration,
    /// Factor applied to the delay after each attempt
    pub retry_interval_multiplier: f64,
    /// Upper bound on the delay
    pub max_retry_interval: Duration,
    /// Reconnect attempts after a fault, 0 means a fault is fatal
    pub reconnect_attempts: u32,
    /// Rounds over the candidates when connecting for the first time
    pub initial_connect_attempts: u32,
    /// Try the backup when the live server cannot be reached initially
    pub failover_on_initial_connection: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_interval_multiplier: DEFAULT_RETRY_INTERVAL_MULTIPLIER,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            initial_connect_attempts: DEFAULT_INITIAL_CONNECT_ATTEMPTS,
            failover_on_initial_connection: false,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (zero based), capped at the maximum
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.retry_interval_multiplier.powi(attempt.min(64) as i32);
        let millis = self.retry_interval.as_millis() as f64 * factor;
        let capped = millis.min(self.max_retry_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Finite sequence of delays for a reconnect run
    pub fn backoff_schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.reconnect_attempts).map(move |attempt| self.delay_for_attempt(attempt))
    }
}

/// Locator configuration, frozen once the first session exists
#[derive(Debug, Clone, PartialEq)]
pub struct LocatorConfig {
    pub client_failure_check_period: Duration,
    pub connection_ttl: Duration,
    pub call_timeout: Duration,
    pub min_large_message_size: usize,
    /// Bytes of credit per consumer, -1 unbounded, 0 one message at a time
    pub consumer_window_size: i32,
    /// Bytes of outstanding sends per producer, -1 unbounded
    pub producer_window_size: i32,
    /// Bytes of unconfirmed sends kept for resending, -1 disables confirmations
    pub confirmation_window_size: i32,
    pub block_on_acknowledge: bool,
    pub block_on_durable_send: bool,
    pub block_on_non_durable_send: bool,
    pub auto_group: bool,
    /// Group id stamped on every send, takes precedence over auto grouping
    pub group_id: Option<WireString>,
    pub ack_batch_size: usize,
    pub retry: RetryConfig,
    pub load_balancing_policy: LoadBalancingPolicyKind,
    pub task_name_prefix: String,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            client_failure_check_period: DEFAULT_CLIENT_FAILURE_CHECK_PERIOD,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            min_large_message_size: DEFAULT_MIN_LARGE_MESSAGE_SIZE,
            consumer_window_size: DEFAULT_CONSUMER_WINDOW_SIZE,
            producer_window_size: DEFAULT_PRODUCER_WINDOW_SIZE,
            confirmation_window_size: DEFAULT_CONFIRMATION_WINDOW_SIZE,
            block_on_acknowledge: false,
            block_on_durable_send: true,
            block_on_non_durable_send: false,
            auto_group: false,
            group_id: None,
            ack_batch_size: DEFAULT_ACK_BATCH_SIZE,
            retry: RetryConfig::default(),
            load_balancing_policy: LoadBalancingPolicyKind::default(),
            task_name_prefix: DEFAULT_TASK_NAME_PREFIX.to_string(),
        }
    }
}

impl LocatorConfig {
    /// Start building a locator configuration
    pub fn builder() -> LocatorConfigBuilder {
        LocatorConfigBuilder::new()
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.retry.retry_interval_multiplier < 1.0 {
            return Err(RavenClientError::invalid_config(format!(
                "retry_interval_multiplier must be >= 1.0, got {}",
                self.retry.retry_interval_multiplier
            )));
        }
        if self.retry.max_retry_interval < self.retry.retry_interval {
            return Err(RavenClientError::invalid_config(
                "max_retry_interval must not be lower than retry_interval",
            ));
        }
        if self.retry.initial_connect_attempts == 0 {
            return Err(RavenClientError::invalid_config(
                "initial_connect_attempts must be at least 1",
            ));
        }
        for (name, value) in [
            ("consumer_window_size", self.consumer_window_size),
            ("producer_window_size", self.producer_window_size),
            ("confirmation_window_size", self.confirmation_window_size),
        ] {
            if value < -1 {
                return Err(RavenClientError::invalid_config(format!(
                    "{} must be -1 or greater, got {}",
                    name, value
                )));
            }
        }
        if self.producer_window_size == 0 {
            return Err(RavenClientError::invalid_config(
                "producer_window_size must not be 0",
            ));
        }
        if self.client_failure_check_period.is_zero() || self.connection_ttl.is_zero() {
            return Err(RavenClientError::invalid_config(
                "client_failure_check_period and connection_ttl must be positive",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(RavenClientError::invalid_config("call_timeout must be positive"));
        }
        if self.min_large_message_size == 0 {
            return Err(RavenClientError::invalid_config(
                "min_large_message_size must be positive",
            ));
        }
        Ok(())
    }

    /// Whether a send of a message with this durability waits for the server
    pub fn blocks_on_send(&self, durable: bool) -> bool {
        if durable {
            self.block_on_durable_send
        } else {
            self.block_on_non_durable_send
        }
    }
}

/// Builder for LocatorConfig
#[derive(Debug, Default)]
pub struct LocatorConfigBuilder {
    config: LocatorConfig,
}

impl LocatorConfigBuilder {
    /// Builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the connection checks it still hears from the server
    pub fn client_failure_check_period(mut self, period: Duration) -> Self {
        self.config.client_failure_check_period = period;
        self
    }

    /// How long the server keeps a silent connection
    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.config.connection_ttl = ttl;
        self
    }

    /// Timeout for every blocking call to the server
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Body size from which messages are sent in chunks
    pub fn min_large_message_size(mut self, size: usize) -> Self {
        self.config.min_large_message_size = size;
        self
    }

    /// Consumer credit window in bytes; -1 is unbounded, 0 one message at a time
    pub fn consumer_window_size(mut self, size: i32) -> Self {
        self.config.consumer_window_size = size;
        self
    }

    /// Producer send window in bytes; -1 is unbounded
    pub fn producer_window_size(mut self, size: i32) -> Self {
        self.config.producer_window_size = size;
        self
    }

    /// Bytes of unconfirmed sends kept for resending; -1 disables confirmations
    pub fn confirmation_window_size(mut self, size: i32) -> Self {
        self.config.confirmation_window_size = size;
        self
    }

    /// Wait for the server on every acknowledgement
    pub fn block_on_acknowledge(mut self, block: bool) -> Self {
        self.config.block_on_acknowledge = block;
        self
    }

    /// Wait for the server on durable sends
    pub fn block_on_durable_send(mut self, block: bool) -> Self {
        self.config.block_on_durable_send = block;
        self
    }

    /// Wait for the server on non-durable sends
    pub fn block_on_non_durable_send(mut self, block: bool) -> Self {
        self.config.block_on_non_durable_send = block;
        self
    }

    /// Give every producer a generated group id
    pub fn auto_group(mut self, auto_group: bool) -> Self {
        self.config.auto_group = auto_group;
        self
    }

    /// Group id stamped on every message sent
    pub fn group_id<S: Into<WireString>>(mut self, group_id: S) -> Self {
        self.config.group_id = Some(group_id.into());
        self
    }

    /// Bytes of DUPS_OK acknowledgements batched before flushing
    pub fn ack_batch_size(mut self, size: usize) -> Self {
        self.config.ack_batch_size = size;
        self
    }

    /// Delay before the first reconnect attempt
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry.retry_interval = interval;
        self
    }

    /// Growth factor applied to the delay after each attempt
    pub fn retry_interval_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry.retry_interval_multiplier = multiplier;
        self
    }

    /// Upper bound on the reconnect delay
    pub fn max_retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry.max_retry_interval = interval;
        self
    }

    /// Reconnect attempts after a failure; 0 gives up at once
    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.reconnect_attempts = attempts;
        self
    }

    /// Attempts for the first connection
    pub fn initial_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.initial_connect_attempts = attempts;
        self
    }

    /// Try the backup when the first connection fails
    pub fn failover_on_initial_connection(mut self, failover: bool) -> Self {
        self.config.retry.failover_on_initial_connection = failover;
        self
    }

    /// Replace the whole retry policy
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Policy picking the initial server
    pub fn load_balancing_policy(mut self, policy: LoadBalancingPolicyKind) -> Self {
        self.config.load_balancing_policy = policy;
        self
    }

    /// Prefix for names of spawned client tasks
    pub fn task_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.task_name_prefix = prefix.into();
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<LocatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Options for a single consumer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerOptions {
    /// Server-side selector expression
    pub filter: Option<WireString>,
    /// Skip messages sent by this consumer's own connection
    pub no_local: bool,
    /// Receive without consuming
    pub browse_only: bool,
    /// Override of the locator's consumer window
    pub window_size: Option<i32>,
}

impl ConsumerOptions {
    /// Options with no filter and the locator window
    pub fn new() -> Self {
        Self::default()
    }

    /// Only deliver messages matching this filter
    pub fn filter<S: Into<WireString>>(mut self, filter: S) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Skip messages sent on the same connection
    pub fn no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Browse the queue without consuming
    pub fn browse_only(mut self, browse_only: bool) -> Self {
        self.browse_only = browse_only;
        self
    }

    /// Credit window for this consumer, overriding the locator default
    pub fn window_size(mut self, window_size: i32) -> Self {
        self.window_size = Some(window_size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LocatorConfig::default();
        assert_eq!(config.client_failure_check_period, Duration::from_secs(30));
        assert_eq!(config.connection_ttl, Duration::from_secs(60));
        assert_eq!(config.consumer_window_size, 1024 * 1024);
        assert_eq!(config.confirmation_window_size, -1);
        assert!(config.block_on_durable_send);
        assert!(!config.block_on_non_durable_send);
        assert_eq!(config.retry.reconnect_attempts, 0);
        assert_eq!(config.load_balancing_policy, LoadBalancingPolicyKind::RoundRobin);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_locator_config_builder() {
        let config = LocatorConfig::builder()
            .reconnect_attempts(5)
            .retry_interval(Duration::from_millis(10))
            .max_retry_interval(Duration::from_millis(100))
            .retry_interval_multiplier(2.0)
            .auto_group(true)
            .group_id("fixed")
            .build()
            .unwrap();

        assert_eq!(config.retry.reconnect_attempts, 5);
        assert!(config.auto_group);
        assert_eq!(config.group_id, Some(WireString::from("fixed")));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(LocatorConfig::builder()
            .retry_interval_multiplier(0.5)
            .build()
            .is_err());
        assert!(LocatorConfig::builder()
            .retry_interval(Duration::from_secs(5))
            .max_retry_interval(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(LocatorConfig::builder().consumer_window_size(-2).build().is_err());
        assert!(LocatorConfig::builder().initial_connect_attempts(0).build().is_err());
        assert!(LocatorConfig::builder()
            .connection_ttl(Duration::ZERO)
            .build()
            .is_err());
        assert!(LocatorConfig::builder().min_large_message_size(0).build().is_err());
    }

    #[test]
    fn test_backoff_schedule_is_capped_and_finite() {
        let retry = RetryConfig {
            retry_interval: Duration::from_millis(100),
            retry_interval_multiplier: 2.0,
            max_retry_interval: Duration::from_millis(500),
            reconnect_attempts: 6,
            ..RetryConfig::default()
        };

        let delays: Vec<u64> = retry
            .backoff_schedule()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500, 500]);

        let none = RetryConfig::default();
        assert_eq!(none.backoff_schedule().count(), 0);
    }

    #[test]
    fn test_consumer_options_builder() {
        let options = ConsumerOptions::new()
            .filter("color = 'red'")
            .no_local(true)
            .window_size(0);
        assert_eq!(options.filter, Some(WireString::from("color = 'red'")));
        assert!(options.no_local);
        assert!(!options.browse_only);
        assert_eq!(options.window_size, Some(0));
    }
}
