//! Inflow delivery into container managed endpoints.
//!
//! An [`InflowActivation`] binds a destination to a [`MessageEndpointFactory`].
//! Each of its sessions gets an [`InflowMessageHandler`] that owns one
//! consumer, pulls messages on a session task and brackets every delivery
//! with `before_delivery` / `after_delivery` on the endpoint.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::consumer::{Consumer, HandlerError};
use crate::context::ThreadAwareContext;
use crate::error::RavenClientError;
use crate::message::ClientMessage;
use crate::session::{AckMode, Session, SessionInner};
use crate::wire_string::WireString;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationKind {
    #[default]
    Queue,
    Topic,
}

/// Deployment settings of an inflow activation
#[derive(Debug, Clone)]
pub struct ActivationSpec {
    pub destination: WireString,
    pub destination_kind: DestinationKind,
    pub message_selector: Option<String>,
    pub subscription_durable: bool,
    pub subscription_name: Option<String>,
    pub client_id: Option<String>,
    /// Commit each delivery on the session itself
    pub use_local_tx: bool,
    /// Deliveries run inside a container transaction
    pub delivery_transacted: bool,
    pub transaction_timeout: Option<Duration>,
    pub max_sessions: usize,
}

impl ActivationSpec {
    fn new(destination: WireString, destination_kind: DestinationKind) -> Self {
        Self {
            destination,
            destination_kind,
            message_selector: None,
            subscription_durable: false,
            subscription_name: None,
            client_id: None,
            use_local_tx: false,
            delivery_transacted: false,
            transaction_timeout: None,
            max_sessions: 1,
        }
    }

    /// Activation consuming from a queue
    pub fn queue<D: Into<WireString>>(destination: D) -> Self {
        Self::new(destination.into(), DestinationKind::Queue)
    }

    /// Activation subscribing to a topic
    pub fn topic<D: Into<WireString>>(destination: D) -> Self {
        Self::new(destination.into(), DestinationKind::Topic)
    }

    /// Filter applied to the subscription; blank means none
    pub fn message_selector<S: Into<String>>(mut self, selector: S) -> Self {
        self.message_selector = Some(selector.into());
        self
    }

    /// Make the topic subscription durable under `client_id` and `name`
    pub fn durable_subscription<C: Into<String>, N: Into<String>>(
        mut self,
        client_id: C,
        subscription_name: N,
    ) -> Self {
        self.subscription_durable = true;
        self.client_id = Some(client_id.into());
        self.subscription_name = Some(subscription_name.into());
        self
    }

    /// Wrap each delivery in a local transaction
    pub fn use_local_tx(mut self, use_local_tx: bool) -> Self {
        self.use_local_tx = use_local_tx;
        self
    }

    /// Deliveries run inside a transaction owned by the container
    pub fn delivery_transacted(mut self, transacted: bool) -> Self {
        self.delivery_transacted = transacted;
        self
    }

    /// Timeout of the container transaction
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = Some(timeout);
        self
    }

    /// Number of sessions, each with its own endpoint
    pub fn max_sessions(mut self, sessions: usize) -> Self {
        self.max_sessions = sessions;
        self
    }

    /// Selector as a queue filter; blank selectors mean none
    fn selector(&self) -> Option<WireString> {
        self.message_selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(WireString::from)
    }

    fn is_topic(&self) -> bool {
        self.destination_kind == DestinationKind::Topic
    }
}

/// Queue name backing a durable subscription
pub fn durable_subscription_queue(client_id: &str, subscription_name: &str) -> WireString {
    WireString::from(format!("{}.{}", client_id, subscription_name))
}

/// Application endpoint receiving inflow messages
#[async_trait]
pub trait MessageEndpoint: Send + Sync {
    async fn before_delivery(&self) -> std::result::Result<(), HandlerError>;

    async fn on_message(&self, message: ClientMessage) -> std::result::Result<(), HandlerError>;

    async fn after_delivery(&self) -> std::result::Result<(), HandlerError>;

    async fn release(&self) {}
}

/// Creates endpoints; transacted (non-local) deliveries hand over the
/// session so the container can enlist it
pub trait MessageEndpointFactory: Send + Sync {
    fn create_endpoint(&self, session: Option<Session>) -> Result<Arc<dyn MessageEndpoint>>;
}

/// Container transaction hooks
pub trait TransactionManager: Send + Sync {
    fn set_transaction_timeout(&self, timeout: Duration);

    /// Mark the current transaction, if any, rollback-only
    fn set_rollback_only(&self) -> std::result::Result<(), HandlerError>;
}

/// A destination bound to an endpoint factory, served by up to
/// `max_sessions` handlers
pub struct InflowActivation {
    spec: ActivationSpec,
    endpoint_factory: Arc<dyn MessageEndpointFactory>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    topic_temporary_queue: Mutex<Option<WireString>>,
    handlers: tokio::sync::Mutex<Vec<Arc<InflowMessageHandler>>>,
}

impl std::fmt::Debug for InflowActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflowActivation")
            .field("spec", &self.spec)
            .field("topic_temporary_queue", &*self.topic_temporary_queue.lock())
            .finish()
    }
}

impl InflowActivation {
    /// Activation for `spec`; nothing runs until [`InflowActivation::start`]
    pub fn new(
        spec: ActivationSpec,
        endpoint_factory: Arc<dyn MessageEndpointFactory>,
        transaction_manager: Option<Arc<dyn TransactionManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            endpoint_factory,
            transaction_manager,
            topic_temporary_queue: Mutex::new(None),
            handlers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Settings this activation was created with
    pub fn spec(&self) -> &ActivationSpec {
        &self.spec
    }

    /// Destination the activation consumes from
    pub fn address(&self) -> &WireString {
        &self.spec.destination
    }

    /// Whether the destination is a topic
    pub fn is_topic(&self) -> bool {
        self.spec.is_topic()
    }

    /// Whether deliveries run in a container transaction
    pub fn is_delivery_transacted(&self) -> bool {
        self.spec.delivery_transacted
    }

    /// Name of the queue created for a non-durable topic subscription
    pub fn topic_temporary_queue(&self) -> Option<WireString> {
        self.topic_temporary_queue.lock().clone()
    }

    /// Ack mode of the sessions serving this activation
    pub fn session_ack_mode(&self) -> AckMode {
        if self.spec.delivery_transacted || self.spec.use_local_tx {
            AckMode::Transacted
        } else {
            AckMode::Client
        }
    }

    /// Create the sessions and handlers and start delivery
    pub async fn start(self: &Arc<Self>, connection: &Connection) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        if !handlers.is_empty() {
            return Err(RavenClientError::illegal_state("Activation already started"));
        }

        for session_nr in 0..self.spec.max_sessions.max(1) {
            let session = connection.create_session(self.session_ack_mode()).await?;
            let handler = InflowMessageHandler::new(
                Arc::clone(self),
                self.transaction_manager.clone(),
                session.clone(),
                session_nr,
            );
            if let Err(e) = handler.setup().await {
                handler.teardown().await;
                for started in handlers.drain(..) {
                    started.teardown().await;
                }
                return Err(e);
            }
            session.start().await?;
            handlers.push(handler);
        }
        info!(destination = %self.spec.destination, sessions = handlers.len(), "Inflow activation started");
        Ok(())
    }

    /// Tear every handler down
    pub async fn stop(&self) {
        let handlers: Vec<_> = self.handlers.lock().await.drain(..).collect();
        for handler in handlers {
            handler.teardown().await;
        }
        info!(destination = %self.spec.destination, "Inflow activation stopped");
    }
}

struct Running {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Delivers messages of one session to one endpoint
pub struct InflowMessageHandler {
    activation: Arc<InflowActivation>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    session: Session,
    session_nr: usize,
    consumer: Mutex<Option<Consumer>>,
    endpoint: Mutex<Option<Arc<dyn MessageEndpoint>>>,
    running: Mutex<Option<Running>>,
    use_local_tx: bool,
    transacted: bool,
    use_xa: bool,
}

impl std::fmt::Debug for InflowMessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflowMessageHandler")
            .field("session", &self.session.name())
            .field("session_nr", &self.session_nr)
            .field("use_local_tx", &self.use_local_tx)
            .field("transacted", &self.transacted)
            .finish()
    }
}

impl InflowMessageHandler {
    /// Handler number `session_nr` of `activation`, owning `session`
    pub fn new(
        activation: Arc<InflowActivation>,
        transaction_manager: Option<Arc<dyn TransactionManager>>,
        session: Session,
        session_nr: usize,
    ) -> Arc<Self> {
        let spec = activation.spec();
        let transacted = spec.delivery_transacted;
        let use_local_tx = !transacted && spec.use_local_tx;
        Arc::new(Self {
            transaction_manager,
            session,
            session_nr,
            consumer: Mutex::new(None),
            endpoint: Mutex::new(None),
            running: Mutex::new(None),
            use_local_tx,
            transacted,
            use_xa: transacted && !spec.use_local_tx,
            activation,
        })
    }

    /// Index of this handler within its activation
    pub fn session_nr(&self) -> usize {
        self.session_nr
    }

    /// Activation owning this handler
    pub fn activation(&self) -> &Arc<InflowActivation> {
        &self.activation
    }

    /// Create the consumer (and any subscription queue), the endpoint and
    /// the delivery task
    pub async fn setup(self: &Arc<Self>) -> Result<()> {
        debug!(session = %self.session.name(), session_nr = self.session_nr, "Inflow setup");
        let spec = self.activation.spec();
        let selector = spec.selector();

        let consumer = if spec.is_topic() && spec.subscription_durable {
            let queue = self.durable_subscription(selector).await?;
            self.session.create_consumer(queue).await?
        } else {
            let queue = if spec.is_topic() {
                self.topic_queue(selector.clone()).await?
            } else {
                spec.destination.clone()
            };
            self.session
                .create_consumer_with(queue, selector, false)
                .await?
        };

        let endpoint = self
            .activation
            .endpoint_factory
            .create_endpoint(self.use_xa.then(|| self.session.clone()))?;

        *self.endpoint.lock() = Some(endpoint);
        *self.consumer.lock() = Some(consumer.clone());

        let cancel = CancellationToken::new();
        let join = self.session.inner().tasks.spawn(
            "inflow",
            delivery_loop(Arc::clone(self), consumer, cancel.clone()),
        );
        *self.running.lock() = Some(Running { cancel, join });
        Ok(())
    }

    async fn durable_subscription(&self, selector: Option<WireString>) -> Result<WireString> {
        let spec = self.activation.spec();
        let subscription_name = spec.subscription_name.as_deref().unwrap_or_default();
        let client_id = spec.client_id.as_deref().ok_or_else(|| {
            RavenClientError::illegal_state(format!(
                "Cannot create durable subscription for {} - client ID has not been set",
                subscription_name
            ))
        })?;
        let queue = durable_subscription_queue(client_id, subscription_name);

        let query = self.session.queue_query(queue.clone()).await?;
        if !query.exists {
            self.session
                .create_queue(spec.destination.clone(), queue.clone(), selector, true)
                .await?;
            return Ok(queue);
        }

        // handlers after the first share the subscription
        if self.session_nr == 0 && query.consumer_count > 0 {
            return Err(RavenClientError::illegal_state(
                "Cannot create a subscriber on the durable subscription since it already has subscriber(s)",
            ));
        }

        let selector_changed = query.filter.as_ref() != selector.as_ref();
        let topic_changed = query.address.as_ref() != Some(&spec.destination);
        if selector_changed || topic_changed {
            info!(queue = %queue, selector_changed, topic_changed, "Recreating durable subscription");
            self.session.delete_queue(queue.clone()).await?;
            self.session
                .create_queue(spec.destination.clone(), queue.clone(), selector, true)
                .await?;
        }
        Ok(queue)
    }

    /// Queue of a non-durable topic subscription, shared by the activation's
    /// handlers
    async fn topic_queue(&self, selector: Option<WireString>) -> Result<WireString> {
        if let Some(queue) = self.activation.topic_temporary_queue() {
            return Ok(queue);
        }
        let queue = WireString::from(Uuid::new_v4().to_string());
        self.session
            .create_queue(self.activation.address().clone(), queue.clone(), selector, false)
            .await?;
        *self.activation.topic_temporary_queue.lock() = Some(queue.clone());
        Ok(queue)
    }

    /// Release the endpoint, close the consumer and session. Errors are
    /// logged, never returned.
    pub async fn teardown(&self) {
        debug!(session = %self.session.name(), session_nr = self.session_nr, "Inflow teardown");

        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if tokio::task::try_id() != Some(running.join.id()) {
                let _ = running.join.await;
            }
        }

        let endpoint = self.endpoint.lock().take();
        if let Some(endpoint) = endpoint {
            endpoint.release().await;
        }

        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.close().await {
                debug!(error = %e, "Error closing inflow consumer");
            }
        }

        if let Some(queue) = self.activation.topic_temporary_queue() {
            match self.session.queue_query(queue.clone()).await {
                Ok(query) if query.exists && query.consumer_count == 0 => {
                    if let Err(e) = self.session.delete_queue(queue).await {
                        debug!(error = %e, "Error deleting topic subscription queue");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Error querying topic subscription queue"),
            }
        }

        if let Err(e) = self.session.close().await {
            debug!(session = %self.session.name(), error = %e, "Error releasing session");
        }
    }

    /// Deliver one message to the endpoint.
    ///
    /// Transacted deliveries are acknowledged before the endpoint runs,
    /// others after it returned. A failed delivery is rolled back unless a
    /// container transaction owns it.
    pub async fn on_message(&self, message: ClientMessage) {
        let endpoint = self.endpoint.lock().clone();
        let inner = self.session.inner();
        let mut before_delivery = false;

        let outcome: std::result::Result<(), HandlerError> = async {
            let endpoint = endpoint.as_ref().ok_or("Endpoint was released")?;
            if let (Some(timeout), Some(tm)) = (
                self.activation.spec().transaction_timeout,
                self.transaction_manager.as_ref(),
            ) {
                tm.set_transaction_timeout(timeout);
            }

            endpoint.before_delivery().await?;
            before_delivery = true;

            endpoint.on_message(message.clone()).await?;
            if !self.transacted {
                message.acknowledge().await?;
            }

            if let Err(e) = endpoint.after_delivery().await {
                warn!(error = %e, "Unable to call after delivery");
                return Ok(());
            }

            if self.use_local_tx {
                inner.commit_inner().await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            error!(session = %self.session.name(), message_id = message.message_id(), error = %e, "Failed to deliver message");
            inner.metrics.record_handler_error();

            if before_delivery {
                if self.use_xa {
                    if let Some(tm) = &self.transaction_manager {
                        if let Err(e) = tm.set_rollback_only() {
                            warn!(error = %e, "Unable to mark the transaction rollback-only");
                            if let Err(e) = inner.rollback_inner().await {
                                warn!(error = %e, "Unable to rollback");
                            }
                        }
                    }
                }
                if let Some(endpoint) = &endpoint {
                    if let Err(e) = endpoint.after_delivery().await {
                        warn!(error = %e, "Unable to call after delivery");
                    }
                }
            }

            if self.use_local_tx || !self.transacted {
                if let Err(e) = inner.rollback_inner().await {
                    warn!(error = %e, "Unable to roll local transaction back");
                }
            }
        }

        if let Err(e) = reset_if_needed(inner).await {
            warn!(error = %e, "Unable to reset session after failure");
        }
    }
}

async fn reset_if_needed(session: &SessionInner) -> Result<()> {
    if session.is_closed() {
        return Ok(());
    }
    session.reset_if_needed_inner().await
}

async fn delivery_loop(handler: Arc<InflowMessageHandler>, consumer: Consumer, cancel: CancellationToken) {
    let context = Arc::clone(&handler.session.inner().context);
    context.set_current_thread(false);

    // only the wait is cancelled; a taken message always reaches the endpoint
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = consumer.ready() => {}
        }
        match consumer.receive_no_wait().await {
            Ok(Some(message)) => handler.on_message(message).await,
            Ok(None) if consumer.is_closed() => break,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Inflow receive failed");
                break;
            }
        }
    }

    context.clear_current_thread(false);
    debug!(session = %handler.session.name(), "Inflow delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_selector_is_none() {
        let spec = ActivationSpec::queue("orders").message_selector("   ");
        assert_eq!(spec.selector(), None);
        let spec = ActivationSpec::queue("orders").message_selector(" color = 'red' ");
        assert_eq!(spec.selector(), Some(WireString::from("color = 'red'")));
    }

    #[test]
    fn test_durable_queue_name() {
        assert_eq!(
            durable_subscription_queue("client-1", "prices"),
            WireString::from("client-1.prices")
        );
    }
}
