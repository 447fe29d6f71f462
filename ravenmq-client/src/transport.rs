//! Broker collaborator interface.
//!
//! A [`Connector`] opens a [`BrokerTransport`] to one server endpoint. The
//! transport carries the client's requests; everything the server pushes
//! (deliveries, send confirmations, disconnects, topology changes) arrives on
//! the [`ServerEvent`] channel handed to `connect`. When the server goes away
//! the channel is closed.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::RavenClientError;
use crate::message::ClientMessage;
use crate::session::AckMode;
use crate::topology::{Endpoint, TopologyMember};
use crate::wire_string::WireString;
use crate::Result;

/// Items read by a connection's event pump
#[derive(Debug)]
pub(crate) enum PumpItem {
    Event(ServerEvent),
    /// Answered once every item queued before it has been handled
    Flush(oneshot::Sender<()>),
}

pub(crate) type EventReceiver = mpsc::UnboundedReceiver<PumpItem>;

/// Channel on which a transport reports server pushed events.
///
/// Dropping every sender tells the client the server is gone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<PumpItem>,
}

impl EventSender {
    pub(crate) fn channel() -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, rx)
    }

    /// Push an event; false once the client stopped listening
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(PumpItem::Event(event)).is_ok()
    }

    /// Whether the receiving side was dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn downgrade(&self) -> WeakEventSender {
        WeakEventSender {
            tx: self.tx.downgrade(),
        }
    }
}

/// Client-held handle that does not keep the event stream open
#[derive(Debug, Clone)]
pub(crate) struct WeakEventSender {
    tx: mpsc::WeakUnboundedSender<PumpItem>,
}

impl WeakEventSender {
    /// Wait until the pump has handled every event queued so far
    pub(crate) async fn flush(&self) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let (done, wait) = oneshot::channel();
        let queued = tx.send(PumpItem::Flush(done)).is_ok();
        drop(tx);
        if queued {
            let _ = wait.await;
        }
    }
}

/// Request to create (or re-attach) a session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub name: WireString,
    pub ack_mode: AckMode,
    /// Server confirms every send when positive
    pub confirmation_window_size: i32,
}

/// Server answer to a session creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionAttach {
    /// Highest send sequence the server already stored for this session name
    pub last_received_sequence: Option<u64>,
}

/// Request to attach a consumer to a queue
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub consumer_id: u64,
    pub queue: WireString,
    pub filter: Option<WireString>,
    pub no_local: bool,
    pub browse_only: bool,
    /// Initial credits in bytes, `None` for unbounded
    pub initial_credits: Option<i32>,
}

/// Request to create a queue
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub address: WireString,
    pub name: WireString,
    pub filter: Option<WireString>,
    pub durable: bool,
    pub temporary: bool,
}

/// Result of a queue query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueQuery {
    pub exists: bool,
    pub consumer_count: usize,
    pub message_count: usize,
    pub filter: Option<WireString>,
    pub address: Option<WireString>,
    pub durable: bool,
    pub temporary: bool,
}

/// A regular message send
#[derive(Debug, Clone)]
pub struct SendPacket {
    pub sequence: u64,
    pub address: WireString,
    pub message: ClientMessage,
    pub requires_response: bool,
}

/// One chunk of a large message
#[derive(Debug, Clone)]
pub struct LargeMessageChunk {
    pub sequence: u64,
    pub address: WireString,
    /// Message header, present on the first chunk only
    pub header: Option<ClientMessage>,
    pub body: Bytes,
    pub last: bool,
    pub requires_response: bool,
}

/// A message pushed to one consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub session: WireString,
    pub consumer_id: u64,
    pub message: ClientMessage,
}

/// Change in the cluster as announced by a server
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyChange {
    Up(TopologyMember),
    Down { node_id: String },
}

/// Everything a server pushes to the client
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Delivery(Delivery),
    /// The server stored every send of `session` up to `sequence`
    Confirmation { session: WireString, sequence: u64 },
    /// The server is going away
    Disconnect { reason: String },
    Topology(TopologyChange),
}

/// Client side of a connection to one server
#[async_trait]
pub trait BrokerTransport: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &Endpoint;

    /// Identity of the node serving this connection
    fn node_id(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    async fn create_session(&self, spec: &SessionSpec) -> Result<SessionAttach>;

    async fn close_session(&self, session: &WireString) -> Result<()>;

    async fn start(&self, session: &WireString) -> Result<()>;

    async fn stop(&self, session: &WireString) -> Result<()>;

    async fn queue_query(&self, queue: &WireString) -> Result<QueueQuery>;

    async fn create_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn delete_queue(&self, queue: &WireString) -> Result<()>;

    async fn create_consumer(&self, session: &WireString, spec: &ConsumerSpec) -> Result<()>;

    async fn close_consumer(&self, session: &WireString, consumer_id: u64) -> Result<()>;

    /// Grant `credits` more bytes to a consumer
    async fn flow(&self, session: &WireString, consumer_id: u64, credits: i32) -> Result<()>;

    async fn send(&self, session: &WireString, packet: SendPacket) -> Result<()>;

    async fn send_large_chunk(&self, session: &WireString, chunk: LargeMessageChunk) -> Result<()>;

    /// Acknowledge `message_id` and every earlier delivery to the consumer
    async fn acknowledge(
        &self,
        session: &WireString,
        consumer_id: u64,
        message_id: u64,
        block: bool,
    ) -> Result<()>;

    /// Return every delivered, unacknowledged message of the session.
    /// `last_consumed` holds `(consumer_id, message_id)` of the last message
    /// each consumer handed out; only deliveries up to it count as delivered.
    async fn cancel_unacked(&self, session: &WireString, last_consumed: &[(u64, u64)]) -> Result<()>;

    async fn commit(&self, session: &WireString) -> Result<()>;

    /// Roll back the session's transaction, returning deliveries the same
    /// way as [`BrokerTransport::cancel_unacked`]
    async fn rollback(&self, session: &WireString, last_consumed: &[(u64, u64)]) -> Result<()>;

    /// Graceful close; the server counts every in-flight delivery
    async fn close(&self);

    /// Drop a failed connection; in-flight deliveries are returned uncounted
    async fn abort(&self);
}

/// Opens transports to server endpoints
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSender,
    ) -> Result<Arc<dyn BrokerTransport>>;
}

/// Run a transport call under the call timeout
pub(crate) async fn with_call_timeout<T, F>(call_timeout: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(call_timeout, call)
        .await
        .map_err(|_| RavenClientError::timeout(call_timeout.as_millis() as u64))?
}
