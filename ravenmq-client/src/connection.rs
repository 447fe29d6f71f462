//! Connection management for the RavenMQ client
//!
//! A connection owns one transport at a time. Every use of the transport goes
//! through the failover gate: ordinary calls hold its read side, failover holds
//! the write side for the whole transition.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ThreadAwareContext;
use crate::error::RavenClientError;
use crate::failover::{self, Fault};
use crate::locator::LocatorInner;
use crate::session::{AckMode, Session, SessionInner};
use crate::task::{TaskFactory, TaskPriority};
use crate::topology::Endpoint;
use crate::transport::{
    with_call_timeout, BrokerTransport, EventReceiver, PumpItem, ServerEvent, SessionSpec,
    TopologyChange, WeakEventSender,
};
use crate::wire_string::WireString;
use crate::Result;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    FailingOver,
    Closed,
}

/// State plus the generation of the transport in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

/// Broadcast to failover subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    FailoverStarted { from: Endpoint },
    FailoverCompleted { to: Endpoint, generation: u64 },
    FailoverFailed { reason: String },
}

/// Observer of connection failures
pub trait SessionFailureListener: Send + Sync {
    /// Called when a fault was detected, before reconnecting
    fn before_reconnect(&self, error: &RavenClientError);

    /// Called after the failover finished; `failed_over` is false when the
    /// connection could not be recovered and is now closed
    fn connection_failed(&self, error: &RavenClientError, failed_over: bool);
}

/// Transport currently in use, guarded by the failover gate
pub(crate) struct TransportSlot {
    pub(crate) transport: Option<Arc<dyn BrokerTransport>>,
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) generation: u64,
    pub(crate) events: Option<WeakEventSender>,
    pub(crate) pump: Option<CancellationToken>,
}

impl TransportSlot {
    pub(crate) fn install(
        &mut self,
        transport: Arc<dyn BrokerTransport>,
        endpoint: Endpoint,
        generation: u64,
        events: WeakEventSender,
        pump: CancellationToken,
    ) {
        self.transport = Some(transport);
        self.endpoint = Some(endpoint);
        self.generation = generation;
        self.events = Some(events);
        self.pump = Some(pump);
    }

    /// Detach the transport and stop its pump
    pub(crate) fn take(&mut self) -> Option<Arc<dyn BrokerTransport>> {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        self.events = None;
        self.transport.take()
    }
}

/// Outcome of a failed transport call
#[derive(Debug)]
pub(crate) enum CallFailure {
    /// The transport broke; a failover has been requested
    Fault {
        generation: u64,
        error: RavenClientError,
    },
    Error(RavenClientError),
}

impl CallFailure {
    pub(crate) fn into_error(self) -> RavenClientError {
        match self {
            CallFailure::Fault { error, .. } | CallFailure::Error(error) => error,
        }
    }
}

const MAX_CALL_ATTEMPTS: usize = 3;

pub(crate) struct ConnectionInner {
    pub(crate) id: String,
    pub(crate) locator: Arc<LocatorInner>,
    /// Event pump, failure checker and failover loop
    pub(crate) services: TaskFactory,
    pub(crate) gate: RwLock<TransportSlot>,
    pub(crate) active_generation: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    sessions: Mutex<Vec<Arc<SessionInner>>>,
    sessions_by_name: DashMap<WireString, Arc<SessionInner>>,
    failover_events: broadcast::Sender<FailoverEvent>,
    failure_listeners: Mutex<Vec<Arc<dyn SessionFailureListener>>>,
    faults: mpsc::UnboundedSender<Fault>,
    last_traffic: Mutex<Instant>,
    pub(crate) shutdown: CancellationToken,
    closed: AtomicBool,
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, state: ConnectionState, generation: u64) {
        self.status
            .send_replace(ConnectionStatus { state, generation });
    }

    pub(crate) fn emit(&self, event: FailoverEvent) {
        // no subscribers is fine
        let _ = self.failover_events.send(event);
    }

    pub(crate) fn failure_listeners(&self) -> Vec<Arc<dyn SessionFailureListener>> {
        self.failure_listeners.lock().clone()
    }

    pub(crate) fn touch(&self) {
        *self.last_traffic.lock() = Instant::now();
    }

    fn silent_for(&self) -> std::time::Duration {
        self.last_traffic.lock().elapsed()
    }

    /// Sessions in creation order
    pub(crate) fn sessions(&self) -> Vec<Arc<SessionInner>> {
        self.sessions.lock().clone()
    }

    pub(crate) fn unregister_session(&self, name: &WireString) {
        self.sessions.lock().retain(|s| &s.name != name);
        self.sessions_by_name.remove(name);
    }

    fn closed_error(&self) -> RavenClientError {
        RavenClientError::closed("Connection")
    }

    /// Ask the failover loop to handle a broken transport
    pub(crate) fn report_fault<S: Into<String>>(&self, generation: u64, reason: S) {
        let reason = reason.into();
        debug!(connection = %self.id, generation, reason = %reason, "Transport fault reported");
        let _ = self.faults.send(Fault { generation, reason });
    }

    /// Run one call against the current transport under the call timeout
    pub(crate) async fn invoke<T, F, Fut>(&self, call: F) -> std::result::Result<T, CallFailure>
    where
        F: FnOnce(Arc<dyn BrokerTransport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let call_timeout = self.locator.config().call_timeout;
        let slot = self.gate.read().await;
        let Some(transport) = slot.transport.clone() else {
            return Err(CallFailure::Error(self.closed_error()));
        };
        let generation = slot.generation;
        let result = with_call_timeout(call_timeout, call(transport)).await;
        drop(slot);

        match result {
            Ok(value) => {
                self.touch();
                Ok(value)
            }
            Err(error) if error.is_connection_error() => {
                warn!(connection = %self.id, generation, error = %error, "Transport call failed");
                self.report_fault(generation, error.to_string());
                Err(CallFailure::Fault { generation, error })
            }
            Err(error) => Err(CallFailure::Error(error)),
        }
    }

    /// Run an idempotent call, retrying it on the recovered transport
    pub(crate) async fn invoke_retrying<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn BrokerTransport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.invoke(&call).await {
                Ok(value) => return Ok(value),
                Err(CallFailure::Error(error)) => return Err(error),
                Err(CallFailure::Fault { generation, error }) => {
                    if attempt >= MAX_CALL_ATTEMPTS {
                        return Err(error);
                    }
                    self.await_recovery(generation).await?;
                }
            }
        }
    }

    /// Wait until a transport newer than `generation` is connected
    pub(crate) async fn await_recovery(&self, generation: u64) -> Result<()> {
        let mut status = self.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current.state {
                ConnectionState::Closed => return Err(self.closed_error()),
                ConnectionState::Connected if current.generation > generation => return Ok(()),
                _ => {}
            }
            if status.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    /// Wait until deliveries already pushed by the server have been routed
    pub(crate) async fn flush_events(&self) {
        let events = self.gate.read().await.events.clone();
        if let Some(events) = events {
            events.flush().await;
        }
    }

    /// Start routing events of transport `generation`
    pub(crate) fn start_pump(self: &Arc<Self>, generation: u64, mut events: EventReceiver) -> CancellationToken {
        let token = self.shutdown.child_token();
        let cancel = token.clone();
        let weak = Arc::downgrade(self);

        self.services.spawn("event-pump", async move {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = events.recv() => item,
                };
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                match item {
                    Some(PumpItem::Event(event)) => connection.handle_event(generation, event),
                    Some(PumpItem::Flush(done)) => {
                        let _ = done.send(());
                    }
                    None => {
                        connection.report_fault(generation, "Server event stream closed");
                        break;
                    }
                }
            }
            debug!(generation, "Event pump stopped");
        });

        token
    }

    fn handle_event(&self, generation: u64, event: ServerEvent) {
        self.touch();
        match event {
            ServerEvent::Delivery(delivery) => {
                let session = self
                    .sessions_by_name
                    .get(&delivery.session)
                    .map(|s| Arc::clone(s.value()));
                match session {
                    Some(session) => {
                        session.route_delivery(delivery, generation, &self.active_generation)
                    }
                    None => debug!(session = %delivery.session, "Delivery for unknown session dropped"),
                }
            }
            ServerEvent::Confirmation { session, sequence } => {
                let session = self
                    .sessions_by_name
                    .get(&session)
                    .map(|s| Arc::clone(s.value()));
                if let Some(session) = session {
                    session.handle_confirmation(sequence);
                }
            }
            ServerEvent::Disconnect { reason } => {
                warn!(connection = %self.id, reason = %reason, "Server requested disconnect");
                self.report_fault(generation, format!("Disconnected by server: {}", reason));
            }
            ServerEvent::Topology(change) => {
                if !self.locator.ha {
                    return;
                }
                match change {
                    TopologyChange::Up(member) => {
                        self.locator.topology.update_member(member);
                    }
                    TopologyChange::Down { node_id } => {
                        self.locator.topology.remove_member(&node_id);
                    }
                }
            }
        }
    }

    fn start_failure_checker(self: &Arc<Self>) {
        let config = self.locator.config();
        let period = config.client_failure_check_period;
        let ttl = config.connection_ttl;
        let weak = Arc::downgrade(self);

        self.services.spawn("failure-check", async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                let status = connection.status();
                if status.state != ConnectionState::Connected {
                    continue;
                }
                if connection.silent_for() > ttl {
                    connection.report_fault(
                        status.generation,
                        format!("No traffic from server for {:?}", ttl),
                    );
                    continue;
                }
                // failures are reported as faults by invoke
                let _ = connection.invoke(|t| async move { t.ping().await }).await;
            }
        });
    }

    async fn register_session(
        self: &Arc<Self>,
        transport: Arc<dyn BrokerTransport>,
        spec: &SessionSpec,
    ) -> Result<Arc<SessionInner>> {
        transport.create_session(spec).await?;
        let session = SessionInner::new(Arc::clone(self), spec);
        self.sessions.lock().push(Arc::clone(&session));
        self.sessions_by_name
            .insert(session.name.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Close every session without talking to the server
    pub(crate) async fn close_sessions_locally(&self) {
        let sessions: Vec<Arc<SessionInner>> = self.sessions.lock().drain(..).rev().collect();
        self.sessions_by_name.clear();
        for session in sessions {
            session.close_inner(false).await;
        }
    }
}

/// Connection to a broker cluster
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) async fn connect(locator: Arc<LocatorInner>) -> Result<Self> {
        let config = locator.config();
        let id = format!(
            "connection-{}-{}",
            locator.next_connection_number(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let services = TaskFactory::with_options(
            config.task_name_prefix.clone(),
            TaskPriority::High,
            true,
            Some(id.clone()),
        );

        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Connecting,
            generation: 0,
        });
        let (failover_events, _) = broadcast::channel(16);
        let (faults, fault_rx) = mpsc::unbounded_channel();

        let (transport, endpoint, events, event_rx) =
            match failover::initial_connect(&locator, &config).await {
                Ok(connected) => connected,
                Err(e) => {
                    locator.metrics.record_connection_failed();
                    return Err(e);
                }
            };

        let inner = Arc::new(ConnectionInner {
            id,
            locator,
            services,
            gate: RwLock::new(TransportSlot {
                transport: None,
                endpoint: None,
                generation: 0,
                events: None,
                pump: None,
            }),
            active_generation: AtomicU64::new(0),
            status,
            sessions: Mutex::new(Vec::new()),
            sessions_by_name: DashMap::new(),
            failover_events,
            failure_listeners: Mutex::new(Vec::new()),
            faults,
            last_traffic: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let generation = 1;
        inner.active_generation.store(generation, Ordering::Release);
        {
            let mut slot = inner.gate.write().await;
            let pump = inner.start_pump(generation, event_rx);
            slot.install(transport, endpoint.clone(), generation, events, pump);
        }
        inner.set_status(ConnectionState::Connected, generation);

        failover::spawn_failover_loop(&inner, fault_rx);
        inner.start_failure_checker();
        inner.locator.metrics.record_connection_created();

        info!(connection = %inner.id, endpoint = %endpoint, "Connected");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Unique id of this connection
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Create a session with the given acknowledgement mode
    pub async fn create_session(&self, ack_mode: AckMode) -> Result<Session> {
        if self.inner.is_closed() {
            return Err(RavenClientError::closed("Connection"));
        }

        let config = self.inner.locator.config();
        let spec = SessionSpec {
            name: WireString::from(Uuid::new_v4().to_string()),
            ack_mode,
            confirmation_window_size: config.confirmation_window_size,
        };

        let inner = &self.inner;
        let spec_ref = &spec;
        let session = inner
            .invoke_retrying(move |t| async move { inner.register_session(t, spec_ref).await })
            .await?;
        self.inner.locator.freeze();

        debug!(connection = %self.inner.id, session = %session.name, ?ack_mode, "Session created");
        Ok(Session::from_inner(session))
    }

    /// Shorthand for a transacted session
    pub async fn create_transacted_session(&self) -> Result<Session> {
        self.create_session(AckMode::Transacted).await
    }

    /// Current state with its transport generation
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.status().state
    }

    /// Whether the connection was closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Endpoint of the server currently in use
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.inner.gate.read().await.endpoint.clone()
    }

    /// Node id of the server currently in use
    pub async fn node_id(&self) -> Option<String> {
        self.inner
            .gate
            .read()
            .await
            .transport
            .as_ref()
            .map(|t| t.node_id().to_string())
    }

    /// Open sessions on this connection
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Receive every failover event from now on
    pub fn subscribe_failover(&self) -> broadcast::Receiver<FailoverEvent> {
        self.inner.failover_events.subscribe()
    }

    /// Receive every status change
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Register a listener told about failover attempts
    pub fn add_failure_listener(&self, listener: Arc<dyn SessionFailureListener>) {
        self.inner.failure_listeners.lock().push(listener);
    }

    /// Close the connection and every session on it. Idempotent.
    pub async fn close(&self) -> Result<()> {
        for session in self.inner.sessions() {
            session.context.assert_not_listener_thread("Connection::close")?;
        }
        if !self.inner.mark_closed() {
            return Ok(());
        }

        info!(connection = %self.inner.id, "Closing connection");
        self.inner.shutdown.cancel();
        self.inner.services.shutdown();
        let generation = self.inner.status().generation;
        self.inner.set_status(ConnectionState::Closed, generation);

        let sessions: Vec<Arc<SessionInner>> = self.inner.sessions().into_iter().rev().collect();
        for session in sessions {
            session.close_inner(true).await;
        }

        let transport = self.inner.gate.write().await.take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.inner.active_generation.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_failure_into_error() {
        let fault = CallFailure::Fault {
            generation: 3,
            error: RavenClientError::connection("gone"),
        };
        assert!(fault.into_error().is_connection_error());

        let plain = CallFailure::Error(RavenClientError::illegal_state("nope"));
        assert!(plain.into_error().is_illegal_state());
    }
}
