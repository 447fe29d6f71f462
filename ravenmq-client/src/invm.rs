//! In-process broker cluster.
//!
//! Every node is a live/backup pair over one shared store, so a backup that
//! takes over sees the queues, messages and send sequences its live had.
//! Killing a live drops its client connections without touching the store:
//! in-flight messages go back to their queues with unchanged delivery counts.
//! Used by the tests and demos to drive the client through failover.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ErrorCode, RavenClientError};
use crate::message::{ClientMessage, PropertyValue};
use crate::session::AckMode;
use crate::topology::{Endpoint, TopologyMember};
use crate::transport::{
    BrokerTransport, ConsumerSpec, Connector, Delivery, EventSender, LargeMessageChunk,
    QueueQuery, QueueSpec, SendPacket, ServerEvent, SessionAttach, SessionSpec, TopologyChange,
};
use crate::wire_string::WireString;
use crate::Result;

const INVM_HOST: &str = "invm";
const FIRST_PORT: u16 = 5445;

/// Selector of the form `key = 'text' AND other = 42`
#[derive(Debug, Clone, PartialEq)]
struct Filter {
    terms: Vec<(String, Literal)>,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(i64),
    Bool(bool),
}

impl Filter {
    fn parse(expression: &str) -> Result<Filter> {
        let mut terms = Vec::new();
        for term in expression.split(" AND ") {
            let (key, value) = term.split_once('=').ok_or_else(|| {
                RavenClientError::protocol(format!("Invalid filter expression: {}", expression))
            })?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return Err(RavenClientError::protocol(format!(
                    "Invalid filter expression: {}",
                    expression
                )));
            }

            let literal = if let Some(text) = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
            {
                Literal::Text(text.to_string())
            } else if let Ok(number) = value.parse::<i64>() {
                Literal::Number(number)
            } else if let Ok(flag) = value.parse::<bool>() {
                Literal::Bool(flag)
            } else {
                return Err(RavenClientError::protocol(format!(
                    "Invalid filter literal: {}",
                    value
                )));
            };
            terms.push((key.to_string(), literal));
        }
        Ok(Filter { terms })
    }

    fn matches(&self, message: &ClientMessage) -> bool {
        self.terms.iter().all(|(key, literal)| {
            match (message.property(key), literal) {
                (Some(PropertyValue::String(s)), Literal::Text(t)) => s.as_text() == t,
                (Some(PropertyValue::Int(i)), Literal::Number(n)) => i64::from(*i) == *n,
                (Some(PropertyValue::Long(l)), Literal::Number(n)) => l == n,
                (Some(PropertyValue::Bool(b)), Literal::Bool(f)) => b == f,
                _ => false,
            }
        })
    }
}

fn parse_filter(filter: Option<&WireString>) -> Result<Option<Filter>> {
    filter.map(|f| Filter::parse(f.as_text())).transpose()
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    message: ClientMessage,
    /// Deliveries the store knows were cancelled
    persisted_count: u32,
    /// Connection that sent it
    origin: u64,
}

type ConsumerKey = (WireString, u64);

#[derive(Debug)]
struct QueueState {
    address: WireString,
    filter_text: Option<WireString>,
    filter: Option<Filter>,
    durable: bool,
    temporary: bool,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerKey>,
    next_consumer: usize,
    groups: HashMap<WireString, ConsumerKey>,
}

#[derive(Debug)]
struct ConsumerState {
    queue: WireString,
    filter: Option<Filter>,
    no_local: bool,
    browse_only: bool,
    credits: Option<i64>,
    in_flight: Vec<StoredMessage>,
    browsed: u64,
}

#[derive(Debug)]
struct SessionState {
    connection: u64,
    started: bool,
    confirmations: bool,
    transacted: bool,
    consumers: BTreeMap<u64, ConsumerState>,
    tx_sends: Vec<(WireString, ClientMessage)>,
    tx_acks: Vec<(u64, u64)>,
}

#[derive(Debug)]
struct LargeAssembly {
    address: WireString,
    header: ClientMessage,
    body: BytesMut,
}

#[derive(Debug)]
struct ServerConnection {
    events: EventSender,
    alive: Arc<AtomicBool>,
}

/// State shared by a live server and its backup
#[derive(Debug, Default)]
struct Store {
    queues: BTreeMap<WireString, QueueState>,
    next_message_id: u64,
    sessions: HashMap<WireString, SessionState>,
    last_sequence: HashMap<WireString, u64>,
    large: HashMap<WireString, LargeAssembly>,
    connections: HashMap<u64, ServerConnection>,
}

impl Store {
    fn session_mut(&mut self, name: &WireString) -> Result<&mut SessionState> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| ErrorCode::ObjectClosed.to_client_error(name.as_text()))
    }

    /// Store a message in every queue bound to `address` whose filter accepts it
    fn route(&mut self, address: &WireString, message: ClientMessage, origin: u64) {
        self.next_message_id += 1;
        let id = self.next_message_id;
        let mut routed = 0;
        for queue in self.queues.values_mut() {
            if &queue.address != address {
                continue;
            }
            if queue.filter.as_ref().is_some_and(|f| !f.matches(&message)) {
                continue;
            }
            queue.messages.push_back(StoredMessage {
                id,
                message: message.clone(),
                persisted_count: 0,
                origin,
            });
            routed += 1;
        }
        if routed == 0 {
            debug!(address = %address, "No queue bound to address, message dropped");
        }
    }

    /// Put cancelled deliveries back in id order; the first `delivered`
    /// of them reached the application and count as a delivery
    fn requeue(&mut self, queue: &WireString, messages: Vec<StoredMessage>, delivered: usize) {
        let Some(queue) = self.queues.get_mut(queue) else {
            return;
        };
        for (index, mut stored) in messages.into_iter().enumerate() {
            if index < delivered {
                stored.persisted_count += 1;
            }
            queue.messages.push_back(stored);
        }
        queue.messages.make_contiguous().sort_by_key(|s| s.id);
    }

    fn detach_consumer(&mut self, key: &ConsumerKey, delivered: bool) {
        let Some(consumer) = self
            .sessions
            .get_mut(&key.0)
            .and_then(|s| s.consumers.remove(&key.1))
        else {
            return;
        };
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.consumers.retain(|k| k != key);
            queue.groups.retain(|_, pinned| pinned != key);
            if queue.next_consumer >= queue.consumers.len() {
                queue.next_consumer = 0;
            }
        }
        let counted = if delivered { consumer.in_flight.len() } else { 0 };
        self.requeue(&consumer.queue, consumer.in_flight, counted);
    }

    fn remove_session(&mut self, name: &WireString, delivered: bool) {
        let keys: Vec<ConsumerKey> = match self.sessions.get(name) {
            Some(session) => session
                .consumers
                .keys()
                .map(|id| (name.clone(), *id))
                .collect(),
            None => return,
        };
        for key in keys {
            self.detach_consumer(&key, delivered);
        }
        self.sessions.remove(name);
    }

    /// Return a session's in-flight deliveries. Per consumer, only those up
    /// to its last consumed message count as delivered.
    fn cancel_session_deliveries(&mut self, name: &WireString, last_consumed: &[(u64, u64)]) {
        let returned: Vec<(WireString, Vec<StoredMessage>, usize)> = match self.sessions.get_mut(name) {
            Some(session) => session
                .consumers
                .iter_mut()
                .map(|(id, c)| {
                    let in_flight = std::mem::take(&mut c.in_flight);
                    let delivered = last_consumed
                        .iter()
                        .find(|(consumer_id, _)| consumer_id == id)
                        .and_then(|(_, message_id)| in_flight.iter().position(|s| s.id == *message_id))
                        .map_or(0, |position| position + 1);
                    (c.queue.clone(), in_flight, delivered)
                })
                .collect(),
            None => return,
        };
        for (queue, messages, delivered) in returned {
            self.requeue(&queue, messages, delivered);
        }
    }

    /// Drop every session of a connection
    fn drop_connection(&mut self, connection: u64, delivered: bool) {
        if let Some(conn) = self.connections.remove(&connection) {
            conn.alive.store(false, Ordering::Release);
        }
        let names: Vec<WireString> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.connection == connection)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.remove_session(&name, delivered);
        }
    }

    fn confirm(&self, session: &WireString, sequence: u64) {
        let Some(state) = self.sessions.get(session) else {
            return;
        };
        if !state.confirmations {
            return;
        }
        if let Some(conn) = self.connections.get(&state.connection) {
            conn.events.send(ServerEvent::Confirmation {
                session: session.clone(),
                sequence,
            });
        }
    }

    /// Record `sequence` for `session`; false when it was already stored
    fn accept_sequence(&mut self, session: &WireString, sequence: u64) -> bool {
        let last = self.last_sequence.entry(session.clone()).or_insert(0);
        if sequence <= *last {
            return false;
        }
        *last = sequence;
        true
    }

    fn store_send(&mut self, session: &WireString, address: WireString, message: ClientMessage) -> Result<()> {
        let state = self.session_mut(session)?;
        let origin = state.connection;
        if state.transacted {
            state.tx_sends.push((address, message));
        } else {
            self.route(&address, message, origin);
        }
        Ok(())
    }

    fn dispatch(&mut self) {
        let Store {
            queues,
            sessions,
            connections,
            ..
        } = self;
        for queue in queues.values_mut() {
            dispatch_queue(queue, sessions, connections);
            browse_queue(queue, sessions, connections);
        }
    }
}

fn eligible(
    key: &ConsumerKey,
    stored: &StoredMessage,
    sessions: &HashMap<WireString, SessionState>,
) -> bool {
    let Some(session) = sessions.get(&key.0) else {
        return false;
    };
    let Some(consumer) = session.consumers.get(&key.1) else {
        return false;
    };
    session.started
        && !consumer.browse_only
        && consumer.credits.map_or(true, |c| c > 0)
        && consumer
            .filter
            .as_ref()
            .map_or(true, |f| f.matches(&stored.message))
        && !(consumer.no_local && stored.origin == session.connection)
}

fn pick(
    consumers: &[ConsumerKey],
    next: &mut usize,
    stored: &StoredMessage,
    sessions: &HashMap<WireString, SessionState>,
) -> Option<ConsumerKey> {
    let count = consumers.len();
    for offset in 0..count {
        let index = (*next + offset) % count;
        if eligible(&consumers[index], stored, sessions) {
            *next = (index + 1) % count;
            return Some(consumers[index].clone());
        }
    }
    None
}

fn send_delivery(
    key: &ConsumerKey,
    consumer: &mut ConsumerState,
    message: ClientMessage,
    connection: u64,
    connections: &HashMap<u64, ServerConnection>,
) {
    if let Some(credits) = consumer.credits.as_mut() {
        *credits -= message.encode_size() as i64;
    }
    if let Some(conn) = connections.get(&connection) {
        conn.events.send(ServerEvent::Delivery(Delivery {
            session: key.0.clone(),
            consumer_id: key.1,
            message,
        }));
    }
}

fn dispatch_queue(
    queue: &mut QueueState,
    sessions: &mut HashMap<WireString, SessionState>,
    connections: &HashMap<u64, ServerConnection>,
) {
    let QueueState {
        messages,
        consumers,
        next_consumer,
        groups,
        ..
    } = queue;

    let mut index = 0;
    while index < messages.len() {
        let stored = &messages[index];
        let target = match stored.message.group_id() {
            Some(group) => match groups.get(group) {
                // pinned groups wait for their consumer
                Some(pinned) => eligible(pinned, stored, sessions).then(|| pinned.clone()),
                None => {
                    let picked = pick(consumers, next_consumer, stored, sessions);
                    if let Some(picked) = &picked {
                        groups.insert(group.clone(), picked.clone());
                    }
                    picked
                }
            },
            None => pick(consumers, next_consumer, stored, sessions),
        };

        let Some(key) = target else {
            index += 1;
            continue;
        };
        let Some(stored) = messages.remove(index) else {
            break;
        };
        let Some(session) = sessions.get_mut(&key.0) else {
            continue;
        };
        let connection = session.connection;
        let Some(consumer) = session.consumers.get_mut(&key.1) else {
            continue;
        };

        let message = stored
            .message
            .clone()
            .stored(stored.id)
            .with_delivery_count(stored.persisted_count + 1);
        consumer.in_flight.push(stored);
        send_delivery(&key, consumer, message, connection, connections);
    }
}

fn browse_queue(
    queue: &QueueState,
    sessions: &mut HashMap<WireString, SessionState>,
    connections: &HashMap<u64, ServerConnection>,
) {
    for key in &queue.consumers {
        let Some(session) = sessions.get_mut(&key.0) else {
            continue;
        };
        let connection = session.connection;
        let started = session.started;
        let Some(consumer) = session.consumers.get_mut(&key.1) else {
            continue;
        };
        if !consumer.browse_only || !started {
            continue;
        }

        let from = consumer.browsed;
        for stored in queue.messages.iter().filter(|s| s.id > from) {
            if consumer.credits.is_some_and(|c| c <= 0) {
                break;
            }
            consumer.browsed = stored.id;
            if consumer
                .filter
                .as_ref()
                .is_some_and(|f| !f.matches(&stored.message))
            {
                continue;
            }
            let message = stored
                .message
                .clone()
                .stored(stored.id)
                .with_delivery_count(stored.persisted_count + 1);
            send_delivery(key, consumer, message, connection, connections);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveSide {
    Live,
    Backup,
    Down,
}

#[derive(Debug)]
struct Node {
    node_id: String,
    live: Endpoint,
    backup: Endpoint,
    active: Mutex<ActiveSide>,
    backup_alive: AtomicBool,
    swallow_sends: AtomicBool,
    store: Arc<Mutex<Store>>,
}

impl Node {
    fn member(&self) -> Option<TopologyMember> {
        match *self.active.lock() {
            ActiveSide::Live => Some(TopologyMember::new(
                self.node_id.clone(),
                self.live.clone(),
                self.backup_alive
                    .load(Ordering::Acquire)
                    .then(|| self.backup.clone()),
            )),
            ActiveSide::Backup => Some(TopologyMember::new(
                self.node_id.clone(),
                self.backup.clone(),
                None,
            )),
            ActiveSide::Down => None,
        }
    }

    fn serves(&self, endpoint: &Endpoint) -> bool {
        match *self.active.lock() {
            ActiveSide::Live => &self.live == endpoint,
            ActiveSide::Backup => &self.backup == endpoint,
            ActiveSide::Down => false,
        }
    }

    fn disconnect_all(&self) {
        let mut store = self.store.lock();
        let connections: Vec<u64> = store.connections.keys().copied().collect();
        for connection in connections {
            store.drop_connection(connection, false);
        }
        store.dispatch();
    }
}

#[derive(Debug, Default)]
struct ClusterInner {
    nodes: Mutex<BTreeMap<String, Arc<Node>>>,
    next_port: AtomicU16,
    next_connection: AtomicU64,
}

impl ClusterInner {
    fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().values().cloned().collect()
    }

    fn node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.lock().get(node_id).cloned()
    }

    fn announce(&self, change: TopologyChange) {
        for node in self.nodes() {
            let store = node.store.lock();
            for conn in store.connections.values() {
                conn.events.send(ServerEvent::Topology(change.clone()));
            }
        }
    }
}

/// A cluster of in-process live/backup server pairs
#[derive(Debug, Clone, Default)]
pub struct InVmCluster {
    inner: Arc<ClusterInner>,
}

impl InVmCluster {
    /// Empty cluster with no nodes
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; returns its live and backup endpoints
    pub fn add_node<S: Into<String>>(&self, node_id: S) -> (Endpoint, Endpoint) {
        let node_id = node_id.into();
        let offset = self.inner.next_port.fetch_add(2, Ordering::Relaxed);
        let live = Endpoint::new(INVM_HOST, FIRST_PORT + offset);
        let backup = Endpoint::new(INVM_HOST, FIRST_PORT + offset + 1);

        let node = Arc::new(Node {
            node_id: node_id.clone(),
            live: live.clone(),
            backup: backup.clone(),
            active: Mutex::new(ActiveSide::Live),
            backup_alive: AtomicBool::new(true),
            swallow_sends: AtomicBool::new(false),
            store: Arc::new(Mutex::new(Store::default())),
        });
        if let Some(member) = node.member() {
            self.inner.announce(TopologyChange::Up(member));
        }
        self.inner.nodes.lock().insert(node_id, node);
        (live, backup)
    }

    /// Connector opening transports to this cluster
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(InVmConnector {
            cluster: Arc::clone(&self.inner),
        })
    }

    /// Crash the active server of a node; a live is replaced by its backup
    pub fn kill_node(&self, node_id: &str) {
        let Some(node) = self.inner.node(node_id) else {
            return;
        };
        let side = {
            let mut active = node.active.lock();
            *active = match *active {
                ActiveSide::Live if node.backup_alive.load(Ordering::Acquire) => ActiveSide::Backup,
                _ => ActiveSide::Down,
            };
            *active
        };
        info!(node = node_id, ?side, "Killing in-vm server");
        node.disconnect_all();

        match node.member() {
            Some(member) => self.inner.announce(TopologyChange::Up(member)),
            None => self.inner.announce(TopologyChange::Down {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Crash the backup of a node, whether or not it is active
    pub fn kill_backup(&self, node_id: &str) {
        let Some(node) = self.inner.node(node_id) else {
            return;
        };
        node.backup_alive.store(false, Ordering::Release);
        let was_active = {
            let mut active = node.active.lock();
            let was_active = *active == ActiveSide::Backup;
            if was_active {
                *active = ActiveSide::Down;
            }
            was_active
        };
        if was_active {
            node.disconnect_all();
        }
        match node.member() {
            Some(member) => self.inner.announce(TopologyChange::Up(member)),
            None => self.inner.announce(TopologyChange::Down {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Accept sends without storing or confirming them
    pub fn swallow_sends(&self, node_id: &str, swallow: bool) {
        if let Some(node) = self.inner.node(node_id) {
            node.swallow_sends.store(swallow, Ordering::Release);
        }
    }

    /// Ask every client of a node to go away, without stopping the server
    pub fn disconnect_clients(&self, node_id: &str, reason: &str) {
        let Some(node) = self.inner.node(node_id) else {
            return;
        };
        let store = node.store.lock();
        for conn in store.connections.values() {
            conn.events.send(ServerEvent::Disconnect {
                reason: reason.to_string(),
            });
        }
    }

    /// Messages waiting in a queue, not counting deliveries in flight
    pub fn queue_depth(&self, node_id: &str, queue: &str) -> Option<usize> {
        let node = self.inner.node(node_id)?;
        let store = node.store.lock();
        store
            .queues
            .get(&WireString::from(queue))
            .map(|q| q.messages.len())
    }

    /// Client connections currently attached to a node
    pub fn connection_count(&self, node_id: &str) -> usize {
        self.inner
            .node(node_id)
            .map_or(0, |node| node.store.lock().connections.len())
    }
}

#[derive(Debug)]
struct InVmConnector {
    cluster: Arc<ClusterInner>,
}

#[async_trait]
impl Connector for InVmConnector {
    async fn connect(&self, endpoint: &Endpoint, events: EventSender) -> Result<Arc<dyn BrokerTransport>> {
        let nodes = self.cluster.nodes();
        let node = nodes
            .iter()
            .find(|n| n.serves(endpoint))
            .cloned()
            .ok_or_else(|| RavenClientError::connection(format!("Connection refused: {}", endpoint)))?;

        for member in nodes.iter().filter_map(|n| n.member()) {
            events.send(ServerEvent::Topology(TopologyChange::Up(member)));
        }

        let id = self.cluster.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        node.store.lock().connections.insert(
            id,
            ServerConnection {
                events,
                alive: Arc::clone(&alive),
            },
        );

        debug!(endpoint = %endpoint, connection = id, node = %node.node_id, "In-vm connection accepted");
        Ok(Arc::new(InVmTransport {
            endpoint: endpoint.clone(),
            node,
            connection: id,
            alive,
        }))
    }
}

struct InVmTransport {
    endpoint: Endpoint,
    node: Arc<Node>,
    connection: u64,
    alive: Arc<AtomicBool>,
}

impl fmt::Debug for InVmTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InVmTransport")
            .field("endpoint", &self.endpoint)
            .field("node", &self.node.node_id)
            .field("connection", &self.connection)
            .finish()
    }
}

impl InVmTransport {
    /// Run `op` against the store, then deliver whatever became deliverable
    fn with_store<T>(&self, op: impl FnOnce(&mut Store) -> Result<T>) -> Result<T> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(ErrorCode::NotConnected.to_client_error(&self.endpoint.to_string()));
        }
        let mut store = self.node.store.lock();
        // killed while waiting for the lock
        if !self.alive.load(Ordering::Acquire) {
            return Err(ErrorCode::NotConnected.to_client_error(&self.endpoint.to_string()));
        }
        let result = op(&mut store);
        store.dispatch();
        result
    }

    fn swallowing(&self) -> bool {
        self.node.swallow_sends.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BrokerTransport for InVmTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn node_id(&self) -> &str {
        &self.node.node_id
    }

    async fn ping(&self) -> Result<()> {
        self.with_store(|_| Ok(()))
    }

    async fn create_session(&self, spec: &SessionSpec) -> Result<SessionAttach> {
        let connection = self.connection;
        self.with_store(|store| {
            store.remove_session(&spec.name, false);
            store.sessions.insert(
                spec.name.clone(),
                SessionState {
                    connection,
                    started: false,
                    confirmations: spec.confirmation_window_size > 0,
                    transacted: spec.ack_mode == AckMode::Transacted,
                    consumers: BTreeMap::new(),
                    tx_sends: Vec::new(),
                    tx_acks: Vec::new(),
                },
            );
            Ok(SessionAttach {
                last_received_sequence: store.last_sequence.get(&spec.name).copied(),
            })
        })
    }

    async fn close_session(&self, session: &WireString) -> Result<()> {
        self.with_store(|store| {
            store.remove_session(session, true);
            store.large.remove(session);
            Ok(())
        })
    }

    async fn start(&self, session: &WireString) -> Result<()> {
        self.with_store(|store| {
            store.session_mut(session)?.started = true;
            Ok(())
        })
    }

    async fn stop(&self, session: &WireString) -> Result<()> {
        self.with_store(|store| {
            store.session_mut(session)?.started = false;
            Ok(())
        })
    }

    async fn queue_query(&self, queue: &WireString) -> Result<QueueQuery> {
        self.with_store(|store| {
            let Some(state) = store.queues.get(queue) else {
                return Ok(QueueQuery::default());
            };
            let in_flight: usize = store
                .sessions
                .values()
                .flat_map(|s| s.consumers.values())
                .filter(|c| &c.queue == queue)
                .map(|c| c.in_flight.len())
                .sum();
            Ok(QueueQuery {
                exists: true,
                consumer_count: state.consumers.len(),
                message_count: state.messages.len() + in_flight,
                filter: state.filter_text.clone(),
                address: Some(state.address.clone()),
                durable: state.durable,
                temporary: state.temporary,
            })
        })
    }

    async fn create_queue(&self, spec: &QueueSpec) -> Result<()> {
        let connection = self.connection;
        self.with_store(|store| {
            if store.queues.contains_key(&spec.name) {
                return Err(ErrorCode::QueueExists.to_client_error(spec.name.as_text()));
            }
            let filter = parse_filter(spec.filter.as_ref())?;
            store.queues.insert(
                spec.name.clone(),
                QueueState {
                    address: spec.address.clone(),
                    filter_text: spec.filter.clone(),
                    filter,
                    durable: spec.durable,
                    temporary: spec.temporary,
                    owner: spec.temporary.then_some(connection),
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                    groups: HashMap::new(),
                },
            );
            Ok(())
        })
    }

    async fn delete_queue(&self, queue: &WireString) -> Result<()> {
        self.with_store(|store| {
            let state = store
                .queues
                .get(queue)
                .ok_or_else(|| ErrorCode::QueueDoesNotExist.to_client_error(queue.as_text()))?;
            if !state.consumers.is_empty() {
                return Err(ErrorCode::IllegalState
                    .to_client_error(&format!("Queue {} has consumers", queue)));
            }
            store.queues.remove(queue);
            Ok(())
        })
    }

    async fn create_consumer(&self, session: &WireString, spec: &ConsumerSpec) -> Result<()> {
        self.with_store(|store| {
            if !store.queues.contains_key(&spec.queue) {
                return Err(ErrorCode::QueueDoesNotExist.to_client_error(spec.queue.as_text()));
            }
            let filter = parse_filter(spec.filter.as_ref())?;
            store.session_mut(session)?.consumers.insert(
                spec.consumer_id,
                ConsumerState {
                    queue: spec.queue.clone(),
                    filter,
                    no_local: spec.no_local,
                    browse_only: spec.browse_only,
                    credits: spec.initial_credits.map(i64::from),
                    in_flight: Vec::new(),
                    browsed: 0,
                },
            );
            if let Some(queue) = store.queues.get_mut(&spec.queue) {
                queue.consumers.push((session.clone(), spec.consumer_id));
            }
            Ok(())
        })
    }

    async fn close_consumer(&self, session: &WireString, consumer_id: u64) -> Result<()> {
        self.with_store(|store| {
            store.detach_consumer(&(session.clone(), consumer_id), true);
            Ok(())
        })
    }

    async fn flow(&self, session: &WireString, consumer_id: u64, credits: i32) -> Result<()> {
        self.with_store(|store| {
            let consumer = store
                .session_mut(session)?
                .consumers
                .get_mut(&consumer_id)
                .ok_or_else(|| ErrorCode::ObjectClosed.to_client_error("consumer"))?;
            if let Some(available) = consumer.credits.as_mut() {
                *available += i64::from(credits);
            }
            Ok(())
        })
    }

    async fn send(&self, session: &WireString, packet: SendPacket) -> Result<()> {
        if self.swallowing() {
            return self.with_store(|_| Ok(()));
        }
        self.with_store(|store| {
            store.session_mut(session)?;
            if store.accept_sequence(session, packet.sequence) {
                store.store_send(session, packet.address, packet.message)?;
            }
            store.confirm(session, packet.sequence);
            Ok(())
        })
    }

    async fn send_large_chunk(&self, session: &WireString, chunk: LargeMessageChunk) -> Result<()> {
        if self.swallowing() {
            return self.with_store(|_| Ok(()));
        }
        self.with_store(|store| {
            store.session_mut(session)?;
            if store.accept_sequence(session, chunk.sequence) {
                if let Some(header) = chunk.header {
                    store.large.insert(
                        session.clone(),
                        LargeAssembly {
                            address: chunk.address.clone(),
                            header,
                            body: BytesMut::new(),
                        },
                    );
                }
                let assembly = store.large.get_mut(session).ok_or_else(|| {
                    RavenClientError::protocol("Large message chunk without a header")
                })?;
                assembly.body.extend_from_slice(&chunk.body);

                if chunk.last {
                    if let Some(assembly) = store.large.remove(session) {
                        let message = assembly.header.with_body(assembly.body.freeze());
                        store.store_send(session, assembly.address, message)?;
                    }
                }
            }
            store.confirm(session, chunk.sequence);
            Ok(())
        })
    }

    async fn acknowledge(
        &self,
        session: &WireString,
        consumer_id: u64,
        message_id: u64,
        _block: bool,
    ) -> Result<()> {
        self.with_store(|store| {
            let state = store.session_mut(session)?;
            let transacted = state.transacted;
            let consumer = state
                .consumers
                .get_mut(&consumer_id)
                .ok_or_else(|| ErrorCode::ObjectClosed.to_client_error("consumer"))?;
            let position = consumer
                .in_flight
                .iter()
                .position(|s| s.id == message_id)
                .ok_or_else(|| ErrorCode::UnknownMessage.to_client_error(&message_id.to_string()))?;

            if transacted {
                state.tx_acks.push((consumer_id, message_id));
            } else {
                consumer.in_flight.drain(..=position);
            }
            Ok(())
        })
    }

    async fn cancel_unacked(&self, session: &WireString, last_consumed: &[(u64, u64)]) -> Result<()> {
        self.with_store(|store| {
            store.session_mut(session)?;
            store.cancel_session_deliveries(session, last_consumed);
            Ok(())
        })
    }

    async fn commit(&self, session: &WireString) -> Result<()> {
        self.with_store(|store| {
            let state = store.session_mut(session)?;
            let origin = state.connection;
            let sends = std::mem::take(&mut state.tx_sends);
            for (consumer_id, message_id) in std::mem::take(&mut state.tx_acks) {
                if let Some(consumer) = state.consumers.get_mut(&consumer_id) {
                    if let Some(position) = consumer.in_flight.iter().position(|s| s.id == message_id) {
                        consumer.in_flight.drain(..=position);
                    }
                }
            }
            for (address, message) in sends {
                store.route(&address, message, origin);
            }
            Ok(())
        })
    }

    async fn rollback(&self, session: &WireString, last_consumed: &[(u64, u64)]) -> Result<()> {
        self.with_store(|store| {
            let state = store.session_mut(session)?;
            state.tx_sends.clear();
            state.tx_acks.clear();
            store.cancel_session_deliveries(session, last_consumed);
            Ok(())
        })
    }

    async fn close(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let connection = self.connection;
        let mut store = self.node.store.lock();
        store.drop_connection(connection, true);
        let temporary: Vec<WireString> = store
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection) && q.consumers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in temporary {
            store.queues.remove(&name);
        }
        store.dispatch();
        debug!(connection, "In-vm connection closed");
    }

    async fn abort(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let connection = self.connection;
        let mut store = self.node.store.lock();
        store.drop_connection(connection, false);
        store.dispatch();
        debug!(connection, "In-vm connection aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parse_and_match() {
        let filter = Filter::parse("color = 'red' AND size = 3").unwrap();
        let message = ClientMessage::new(false)
            .with_property("color", "red")
            .with_property("size", 3i32);
        assert!(filter.matches(&message));

        let other = ClientMessage::new(false).with_property("color", "blue");
        assert!(!filter.matches(&other));

        assert!(Filter::parse("color").is_err());
        assert!(Filter::parse("color = red").is_err());
    }

    #[tokio::test]
    async fn test_connect_only_to_active_side() {
        let cluster = InVmCluster::new();
        let (live, backup) = cluster.add_node("a");
        let connector = cluster.connector();

        let (events, _rx) = EventSender::channel();
        assert!(connector.connect(&backup, events).await.is_err());
        let (events, _rx) = EventSender::channel();
        let transport = connector.connect(&live, events).await.unwrap();
        assert_eq!(transport.node_id(), "a");

        cluster.kill_node("a");
        assert!(transport.ping().await.unwrap_err().is_connection_error());
        let (events, _rx) = EventSender::channel();
        assert!(connector.connect(&live, events).await.is_err());
        let (events, _rx) = EventSender::channel();
        assert!(connector.connect(&backup, events).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_sequences_are_ignored() {
        let cluster = InVmCluster::new();
        let (live, _) = cluster.add_node("a");
        let (events, _rx) = EventSender::channel();
        let transport = cluster.connector().connect(&live, events).await.unwrap();

        let session = WireString::from("s");
        transport
            .create_session(&SessionSpec {
                name: session.clone(),
                ack_mode: AckMode::Auto,
                confirmation_window_size: -1,
            })
            .await
            .unwrap();
        transport
            .create_queue(&QueueSpec {
                address: "addr".into(),
                name: "q".into(),
                filter: None,
                durable: true,
                temporary: false,
            })
            .await
            .unwrap();

        let packet = SendPacket {
            sequence: 1,
            address: "addr".into(),
            message: ClientMessage::new(true),
            requires_response: true,
        };
        transport.send(&session, packet.clone()).await.unwrap();
        transport.send(&session, packet).await.unwrap();
        assert_eq!(cluster.queue_depth("a", "q"), Some(1));

        let attach = transport
            .create_session(&SessionSpec {
                name: session,
                ack_mode: AckMode::Auto,
                confirmation_window_size: -1,
            })
            .await
            .unwrap();
        assert_eq!(attach.last_received_sequence, Some(1));
    }
}
