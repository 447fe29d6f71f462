//! Sessions: acknowledgement modes, transactions and the resend cache.

use parking_lot::Mutex;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{ConsumerOptions, LocatorConfig};
use crate::connection::{CallFailure, ConnectionInner};
use crate::consumer::{Consumer, ConsumerInner};
use crate::context::{SessionContext, ThreadAwareContext};
use crate::error::RavenClientError;
use crate::message::{AckToken, ClientMessage};
use crate::metrics::{ClientMetrics, Timer};
use crate::producer::{CompletionListener, Producer, ProducerInner};
use crate::task::{TaskFactory, TaskPriority};
use crate::transport::{
    BrokerTransport, Delivery, LargeMessageChunk, QueueQuery, QueueSpec, SendPacket, SessionSpec,
};
use crate::wire_string::WireString;
use crate::Result;

/// Acknowledgement mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// Each message is acknowledged once handed to the application
    Auto,
    /// The application acknowledges; acknowledgement is cumulative per session
    Client,
    /// Like `Auto`, with acknowledgements batched
    DupsOk,
    /// Sends and acknowledgements take effect on commit
    Transacted,
}

/// A packet kept until the server confirms its sequence
#[derive(Debug, Clone)]
pub(crate) enum CachedPacket {
    Send(SendPacket),
    Chunk(LargeMessageChunk),
}

impl CachedPacket {
    fn sequence(&self) -> u64 {
        match self {
            CachedPacket::Send(p) => p.sequence,
            CachedPacket::Chunk(c) => c.sequence,
        }
    }

    fn set_sequence(&mut self, sequence: u64) {
        match self {
            CachedPacket::Send(p) => p.sequence = sequence,
            CachedPacket::Chunk(c) => c.sequence = sequence,
        }
    }

    fn set_requires_response(&mut self, requires_response: bool) {
        match self {
            CachedPacket::Send(p) => p.requires_response = requires_response,
            CachedPacket::Chunk(c) => c.requires_response = requires_response,
        }
    }

    fn size(&self) -> usize {
        match self {
            CachedPacket::Send(p) => p.message.encode_size(),
            CachedPacket::Chunk(c) => {
                c.body.len() + c.header.as_ref().map_or(0, ClientMessage::header_size)
            }
        }
    }

    pub(crate) async fn transmit(&self, transport: &dyn BrokerTransport, session: &WireString) -> Result<()> {
        match self {
            CachedPacket::Send(p) => transport.send(session, p.clone()).await,
            CachedPacket::Chunk(c) => transport.send_large_chunk(session, c.clone()).await,
        }
    }
}

struct Completion {
    message: ClientMessage,
    listener: Arc<dyn CompletionListener>,
}

struct CachedSend {
    sequence: u64,
    packet: CachedPacket,
    _window: OwnedSemaphorePermit,
    _producer: Option<OwnedSemaphorePermit>,
    completion: Option<Completion>,
}

#[derive(Debug, Clone, Copy)]
struct Unacked {
    consumer_id: u64,
    message_id: u64,
    consumption_seq: u64,
}

#[derive(Debug, Default)]
struct DupsOkBatch {
    last: HashMap<u64, u64>,
    bytes: usize,
}

pub(crate) struct SessionInner {
    pub(crate) name: WireString,
    pub(crate) ack_mode: AckMode,
    pub(crate) connection: Arc<ConnectionInner>,
    pub(crate) config: Arc<LocatorConfig>,
    pub(crate) context: Arc<SessionContext>,
    pub(crate) tasks: TaskFactory,
    pub(crate) metrics: Arc<ClientMetrics>,
    closed: AtomicBool,
    started: AtomicBool,
    epoch: AtomicU64,
    rollback_only: AtomicBool,
    next_sequence: AtomicU64,
    consumption_seq: AtomicU64,
    next_consumer_id: AtomicU64,
    next_producer_id: AtomicU64,
    consumers: DashMap<u64, Arc<ConsumerInner>>,
    producers: DashMap<u64, Arc<ProducerInner>>,
    unacked: Mutex<Vec<Unacked>>,
    dups_ok: Mutex<DupsOkBatch>,
    tx_sends: AtomicUsize,
    tx_acks: AtomicUsize,
    resend_cache: Mutex<VecDeque<CachedSend>>,
    confirmation_window: Option<Arc<Semaphore>>,
    send_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("name", &self.name)
            .field("ack_mode", &self.ack_mode)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl SessionInner {
    pub(crate) fn new(connection: Arc<ConnectionInner>, spec: &SessionSpec) -> Arc<Self> {
        let config = connection.locator.config();
        let tasks = TaskFactory::with_options(
            config.task_name_prefix.clone(),
            TaskPriority::Normal,
            false,
            Some(spec.name.to_string()),
        );
        let confirmation_window = (config.confirmation_window_size > 0)
            .then(|| Arc::new(Semaphore::new(config.confirmation_window_size as usize)));
        let metrics = Arc::clone(&connection.locator.metrics);

        Arc::new(Self {
            name: spec.name.clone(),
            ack_mode: spec.ack_mode,
            connection,
            config,
            context: Arc::new(SessionContext::new()),
            tasks,
            metrics,
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            rollback_only: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            consumption_seq: AtomicU64::new(0),
            next_consumer_id: AtomicU64::new(0),
            next_producer_id: AtomicU64::new(0),
            consumers: DashMap::new(),
            producers: DashMap::new(),
            unacked: Mutex::new(Vec::new()),
            dups_ok: Mutex::new(DupsOkBatch::default()),
            tx_sends: AtomicUsize::new(0),
            tx_acks: AtomicUsize::new(0),
            resend_cache: Mutex::new(VecDeque::new()),
            confirmation_window,
            send_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_transacted(&self) -> bool {
        self.ack_mode == AckMode::Transacted
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RavenClientError::closed("Session"));
        }
        Ok(())
    }

    /// Open consumers, oldest first
    pub(crate) fn consumers_in_order(&self) -> Vec<Arc<ConsumerInner>> {
        let mut consumers: Vec<Arc<ConsumerInner>> = self
            .consumers
            .iter()
            .map(|c| Arc::clone(c.value()))
            .filter(|c| !c.is_closed())
            .collect();
        consumers.sort_by_key(|c| c.id);
        consumers
    }

    pub(crate) fn remove_consumer(&self, consumer_id: u64) {
        self.consumers.remove(&consumer_id);
        self.unacked.lock().retain(|u| u.consumer_id != consumer_id);
    }

    pub(crate) fn remove_producer(&self, producer_id: u64) {
        self.producers.remove(&producer_id);
    }

    pub(crate) fn route_delivery(&self, delivery: Delivery, generation: u64, active: &AtomicU64) {
        let consumer = self
            .consumers
            .get(&delivery.consumer_id)
            .map(|c| Arc::clone(c.value()));
        match consumer {
            Some(consumer) => {
                let epoch = self.epoch.load(Ordering::Acquire);
                consumer.push_delivery(delivery.message, epoch, generation, active);
            }
            None => debug!(
                session = %self.name,
                consumer = delivery.consumer_id,
                "Delivery for unknown consumer dropped"
            ),
        }
    }

    /// Reset local state before replaying on a new server
    pub(crate) fn begin_replay(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.unacked.lock().clear();
        *self.dups_ok.lock() = DupsOkBatch::default();
        for consumer in self.consumers_in_order() {
            consumer.reset_for_failover();
        }
        if self.is_transacted() {
            self.rollback_only.store(true, Ordering::Release);
            self.tx_sends.store(0, Ordering::Release);
            self.tx_acks.store(0, Ordering::Release);
        }
        debug!(session = %self.name, epoch, "Session replay started");
    }

    /// Packets still waiting for a confirmation, in send order
    pub(crate) fn pending_resends(&self) -> Vec<CachedPacket> {
        self.resend_cache
            .lock()
            .iter()
            .map(|c| c.packet.clone())
            .collect()
    }

    /// The server stored every send up to `sequence`
    pub(crate) fn handle_confirmation(&self, sequence: u64) {
        let confirmed: Vec<CachedSend> = {
            let mut cache = self.resend_cache.lock();
            let mut confirmed = Vec::new();
            while cache.front().is_some_and(|c| c.sequence <= sequence) {
                if let Some(entry) = cache.pop_front() {
                    confirmed.push(entry);
                }
            }
            confirmed
        };

        for entry in confirmed {
            if let Some(completion) = entry.completion {
                self.complete(completion, None);
            }
        }
    }

    fn complete(&self, completion: Completion, error: Option<RavenClientError>) {
        let Completion { message, listener } = completion;
        self.context.submit_completion(
            &self.tasks,
            Box::pin(async move {
                match error {
                    None => listener.on_completion(message).await,
                    Some(error) => listener.on_exception(message, error).await,
                }
            }),
        );
    }

    pub(crate) fn next_consumer_id(&self) -> u64 {
        self.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Hand a buffered message to the application: credits, receipt and
    /// bookkeeping for CLIENT acknowledgement
    pub(crate) async fn accept_delivery(
        self: &Arc<Self>,
        consumer: &ConsumerInner,
        mut message: ClientMessage,
        epoch: u64,
    ) -> ClientMessage {
        let size = message.encode_size();
        if let Some(credits) = consumer.consumed(size) {
            self.return_credits(consumer.id, credits).await;
        }

        let consumption_seq = self.consumption_seq.fetch_add(1, Ordering::AcqRel) + 1;
        message.ack = Some(AckToken {
            session: Arc::downgrade(self),
            consumer_id: consumer.id,
            epoch,
            consumption_seq,
        });

        if self.ack_mode == AckMode::Client && !consumer.options.browse_only {
            self.unacked.lock().push(Unacked {
                consumer_id: consumer.id,
                message_id: message.message_id(),
                consumption_seq,
            });
        }
        self.metrics
            .record_consume(size as u64, message.is_redelivered());
        message
    }

    pub(crate) async fn return_credits(&self, consumer_id: u64, credits: i32) {
        let name = &self.name;
        let result = self
            .connection
            .invoke(|t| async move { t.flow(name, consumer_id, credits).await })
            .await;
        if let Err(e) = result {
            debug!(session = %self.name, consumer = consumer_id, error = ?e, "Returning credits failed");
        }
    }

    /// Acknowledgement once the application got the message, for every mode
    /// except CLIENT
    pub(crate) async fn auto_acknowledge(&self, consumer: &ConsumerInner, message: &ClientMessage) {
        if consumer.options.browse_only {
            return;
        }
        let Some(token) = message.ack.as_ref() else {
            return;
        };
        if token.epoch != self.epoch.load(Ordering::Acquire) {
            debug!(session = %self.name, message_id = message.message_id(), "Skipping acknowledgement of a message delivered before failover");
            return;
        }

        match self.ack_mode {
            AckMode::Client => {}
            AckMode::Auto => {
                let block = self.config.block_on_acknowledge;
                if let Err(e) = self.send_ack(consumer.id, message.message_id(), block, token.epoch).await {
                    warn!(session = %self.name, message_id = message.message_id(), error = %e, "Automatic acknowledgement failed");
                }
            }
            AckMode::DupsOk => {
                let flush = {
                    let mut batch = self.dups_ok.lock();
                    batch.last.insert(consumer.id, message.message_id());
                    batch.bytes += message.encode_size();
                    batch.bytes >= self.config.ack_batch_size
                };
                if flush {
                    self.flush_dups_ok().await;
                }
            }
            AckMode::Transacted => {
                match self.send_ack(consumer.id, message.message_id(), false, token.epoch).await {
                    Ok(()) => {
                        self.tx_acks.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        warn!(session = %self.name, error = %e, "Transactional acknowledgement failed");
                    }
                }
            }
        }
    }

    /// Send a cumulative acknowledgement, refusing it when the session
    /// failed over since the message was delivered
    async fn send_ack(&self, consumer_id: u64, message_id: u64, block: bool, epoch: u64) -> Result<()> {
        let name = &self.name;
        let current = &self.epoch;
        let result = self
            .connection
            .invoke(|t| async move {
                if current.load(Ordering::Acquire) != epoch {
                    return Err(RavenClientError::acknowledgement(
                        "Message was delivered before a failover and can no longer be acknowledged",
                    ));
                }
                t.acknowledge(name, consumer_id, message_id, block).await
            })
            .await;

        match result {
            Ok(()) => {
                self.metrics.record_acknowledgement();
                Ok(())
            }
            Err(CallFailure::Error(e)) => Err(e),
            Err(CallFailure::Fault { generation, .. }) => {
                self.connection.await_recovery(generation).await?;
                Err(RavenClientError::acknowledgement(
                    "Connection failed over before the acknowledgement completed",
                ))
            }
        }
    }

    pub(crate) async fn flush_dups_ok(&self) {
        let batch = std::mem::take(&mut *self.dups_ok.lock());
        let epoch = self.epoch.load(Ordering::Acquire);
        for (consumer_id, message_id) in batch.last {
            if let Err(e) = self.send_ack(consumer_id, message_id, false, epoch).await {
                warn!(session = %self.name, consumer = consumer_id, error = %e, "Flushing batched acknowledgements failed");
            }
        }
    }

    /// CLIENT acknowledgement of everything consumed up to `token`
    pub(crate) async fn acknowledge_token(&self, token: &AckToken) -> Result<()> {
        if self.ack_mode != AckMode::Client {
            return Ok(());
        }
        self.ensure_open()?;
        self.acknowledge_up_to(token.epoch, token.consumption_seq).await
    }

    async fn acknowledge_up_to(&self, epoch: u64, consumption_seq: u64) -> Result<()> {
        if epoch != self.epoch.load(Ordering::Acquire) {
            return Err(RavenClientError::acknowledgement(
                "Message was delivered before a failover and can no longer be acknowledged",
            ));
        }

        let targets: BTreeMap<u64, u64> = self
            .unacked
            .lock()
            .iter()
            .filter(|u| u.consumption_seq <= consumption_seq)
            .map(|u| (u.consumer_id, u.message_id))
            .collect();

        for (consumer_id, message_id) in targets {
            self.send_ack(consumer_id, message_id, self.config.block_on_acknowledge, epoch)
                .await?;
        }

        self.unacked
            .lock()
            .retain(|u| u.consumption_seq > consumption_seq);
        Ok(())
    }

    /// Send `message` to `address` for `producer`
    pub(crate) async fn send_message(
        self: &Arc<Self>,
        producer: &ProducerInner,
        address: WireString,
        message: &ClientMessage,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<()> {
        self.ensure_open()?;
        let timer = Timer::start();

        let mut outbound = message.outbound(address.clone());
        if outbound.group_id().is_none() {
            if let Some(group_id) = &producer.group_id {
                outbound.set_group_id(group_id.clone());
            }
        }
        let size = outbound.encode_size();
        let mut producer_permit = producer.acquire_window(size).await?;

        let blocking = listener.is_none() && self.config.blocks_on_send(outbound.is_durable());
        let large = size >= self.config.min_large_message_size;
        let packets = if large {
            self.metrics.record_large_message();
            split_large_message(address, outbound, self.config.min_large_message_size)
        } else {
            vec![CachedPacket::Send(SendPacket {
                sequence: 0,
                address,
                message: outbound,
                requires_response: false,
            })]
        };

        let mut completion = listener.map(|listener| Completion {
            message: message.clone(),
            listener,
        });

        let _sending = self.send_lock.lock().await;
        self.ensure_open()?;
        let count = packets.len();
        for (index, mut packet) in packets.into_iter().enumerate() {
            let last = index + 1 == count;
            let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel) + 1;
            packet.set_sequence(sequence);
            packet.set_requires_response(blocking && last);

            let cached = match &self.confirmation_window {
                Some(window) => {
                    let permits = packet
                        .size()
                        .clamp(1, self.config.confirmation_window_size as usize)
                        as u32;
                    let permit = Arc::clone(window)
                        .acquire_many_owned(permits)
                        .await
                        .map_err(|_| RavenClientError::closed("Session"))?;
                    self.resend_cache.lock().push_back(CachedSend {
                        sequence,
                        packet: packet.clone(),
                        _window: permit,
                        _producer: if last { producer_permit.take() } else { None },
                        completion: if last { completion.take() } else { None },
                    });
                    true
                }
                None => false,
            };

            if let Err(e) = self.transmit(&packet, cached).await {
                self.metrics.record_send_error();
                return Err(e);
            }
        }

        if self.is_transacted() {
            self.tx_sends.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(completion) = completion {
            self.complete(completion, None);
        }
        drop(producer_permit);
        self.metrics.record_send(size as u64, timer.elapsed());
        Ok(())
    }

    async fn transmit(&self, packet: &CachedPacket, cached: bool) -> Result<()> {
        let name = &self.name;
        loop {
            let result = self
                .connection
                .invoke(|t| async move { packet.transmit(t.as_ref(), name).await })
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(CallFailure::Error(e)) => return Err(e),
                Err(CallFailure::Fault { generation, .. }) => {
                    self.connection.await_recovery(generation).await?;
                    // replay resent cached packets; a transacted session is rollback-only now
                    if cached || self.is_transacted() {
                        return Ok(());
                    }
                    debug!(session = %self.name, sequence = packet.sequence(), "Resending after failover");
                }
            }
        }
    }

    pub(crate) async fn commit_inner(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.is_transacted() {
            return Err(RavenClientError::illegal_state(
                "Cannot commit a session that is not transacted",
            ));
        }

        let sending = self.send_lock.lock().await;
        let name = &self.name;
        let rollback_only = &self.rollback_only;
        let result = self
            .connection
            .invoke(|t| async move {
                if rollback_only.load(Ordering::Acquire) {
                    return Err(RavenClientError::rolled_back(
                        "The transaction was rolled back because the session failed over",
                    ));
                }
                t.commit(name).await
            })
            .await;
        drop(sending);

        match result {
            Ok(()) => {
                self.tx_sends.store(0, Ordering::Release);
                self.tx_acks.store(0, Ordering::Release);
                debug!(session = %self.name, "Transaction committed");
                Ok(())
            }
            Err(CallFailure::Error(e @ RavenClientError::TransactionRolledBack { .. })) => {
                self.rollback_inner().await?;
                Err(e)
            }
            Err(CallFailure::Error(e)) => Err(e),
            Err(CallFailure::Fault { generation, .. }) => {
                self.connection.await_recovery(generation).await?;
                self.rollback_inner().await?;
                Err(RavenClientError::rolled_back(
                    "The connection failed over during commit and the transaction was rolled back",
                ))
            }
        }
    }

    pub(crate) async fn rollback_inner(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.is_transacted() {
            return self.recover_inner().await;
        }

        let was_started = self.is_started();
        if was_started {
            self.stop_delivery().await?;
        }
        let credits = self.clear_consumer_buffers();
        let last_consumed = self.last_consumed();

        let name = &self.name;
        let last_consumed = &last_consumed;
        match self
            .connection
            .invoke(|t| async move { t.rollback(name, last_consumed).await })
            .await
        {
            Ok(()) => {}
            Err(CallFailure::Error(e)) => return Err(e),
            // the new server never saw the transaction
            Err(CallFailure::Fault { generation, .. }) => {
                self.connection.await_recovery(generation).await?;
            }
        }

        self.rollback_only.store(false, Ordering::Release);
        self.tx_sends.store(0, Ordering::Release);
        self.tx_acks.store(0, Ordering::Release);
        self.send_credits(credits).await;

        if was_started {
            self.start_delivery().await?;
        }
        debug!(session = %self.name, "Transaction rolled back");
        Ok(())
    }

    async fn recover_inner(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_dups_ok().await;

        let was_started = self.is_started();
        if was_started {
            self.stop_delivery().await?;
        }
        let credits = self.clear_consumer_buffers();
        let last_consumed = self.last_consumed();

        let name = &self.name;
        let last_consumed = &last_consumed;
        self.connection
            .invoke_retrying(|t| async move { t.cancel_unacked(name, last_consumed).await })
            .await?;
        self.unacked.lock().clear();
        self.send_credits(credits).await;

        if was_started {
            self.start_delivery().await?;
        }
        debug!(session = %self.name, "Session recovered");
        Ok(())
    }

    fn clear_consumer_buffers(&self) -> Vec<(u64, i32)> {
        self.consumers_in_order()
            .into_iter()
            .filter_map(|c| c.clear_buffer().map(|credits| (c.id, credits)))
            .collect()
    }

    fn last_consumed(&self) -> Vec<(u64, u64)> {
        self.consumers_in_order()
            .into_iter()
            .filter_map(|c| match c.take_last_consumed() {
                0 => None,
                id => Some((c.id, id)),
            })
            .collect()
    }

    async fn send_credits(&self, credits: Vec<(u64, i32)>) {
        for (consumer_id, credits) in credits {
            self.return_credits(consumer_id, credits).await;
        }
    }

    pub(crate) async fn start_delivery(&self) -> Result<()> {
        let name = &self.name;
        let started = &self.started;
        self.connection
            .invoke_retrying(|t| async move {
                t.start(name).await?;
                started.store(true, Ordering::Release);
                Ok(())
            })
            .await?;
        for consumer in self.consumers_in_order() {
            consumer.wake();
        }
        Ok(())
    }

    /// Stop the server sending and wait until deliveries already on their
    /// way are buffered
    pub(crate) async fn stop_delivery(&self) -> Result<()> {
        let name = &self.name;
        let started = &self.started;
        self.connection
            .invoke_retrying(|t| async move {
                t.stop(name).await?;
                started.store(false, Ordering::Release);
                Ok(())
            })
            .await?;
        self.connection.flush_events().await;
        Ok(())
    }

    pub(crate) async fn reset_if_needed_inner(&self) -> Result<()> {
        if self.rollback_only.load(Ordering::Acquire) {
            info!(session = %self.name, "Rolling back transaction marked rollback-only");
            self.rollback_inner().await?;
        }
        Ok(())
    }

    /// Close consumers and producers; with `remote` the server is told too
    pub(crate) async fn close_inner(&self, remote: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for consumer in self.consumers_in_order() {
            consumer.shutdown().await;
        }
        for producer in self.producers.iter() {
            producer.mark_closed();
        }
        self.producers.clear();

        if remote {
            self.flush_dups_ok().await;
            let name = &self.name;
            if let Err(e) = self
                .connection
                .invoke(|t| async move { t.close_session(name).await })
                .await
            {
                debug!(session = %self.name, error = ?e, "Closing session on server failed");
            }
        }
        self.consumers.clear();

        let pending: Vec<CachedSend> = self.resend_cache.lock().drain(..).collect();
        for entry in pending {
            if let Some(completion) = entry.completion {
                self.complete(completion, Some(RavenClientError::closed("Session")));
            }
        }
        self.context.shutdown_completions();
        self.connection.unregister_session(&self.name);
        debug!(session = %self.name, remote, "Session closed");
    }
}

/// Cut an oversized message into chunks, the first one carrying the header
fn split_large_message(address: WireString, message: ClientMessage, chunk_size: usize) -> Vec<CachedPacket> {
    let body = message.body().clone();
    let mut header = Some(message.with_body(bytes::Bytes::new()));
    let mut chunks = Vec::new();
    let mut offset = 0;
    loop {
        let end = (offset + chunk_size).min(body.len());
        let last = end >= body.len();
        chunks.push(CachedPacket::Chunk(LargeMessageChunk {
            sequence: 0,
            address: address.clone(),
            header: header.take(),
            body: body.slice(offset..end),
            last,
            requires_response: false,
        }));
        if last {
            break;
        }
        offset = end;
    }
    chunks
}

/// A single-threaded context for producing and consuming messages
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Unique session name
    pub fn name(&self) -> &WireString {
        &self.inner.name
    }

    /// Create a producer, optionally bound to a fixed address
    pub async fn create_producer(&self, address: Option<WireString>) -> Result<Producer> {
        self.inner.ensure_open()?;
        let config = &self.inner.config;
        let group_id = match (&config.group_id, config.auto_group) {
            (Some(fixed), _) => Some(fixed.clone()),
            (None, true) => Some(WireString::from(uuid::Uuid::new_v4().to_string())),
            (None, false) => None,
        };
        let id = self.inner.next_producer_id.fetch_add(1, Ordering::Relaxed) + 1;
        let producer = Arc::new(ProducerInner::new(
            id,
            address,
            group_id,
            config.producer_window_size,
        ));
        self.inner.producers.insert(id, Arc::clone(&producer));
        Ok(Producer::new(producer, Arc::clone(&self.inner)))
    }

    /// Consume from `queue` with default options
    pub async fn create_consumer<Q: Into<WireString>>(&self, queue: Q) -> Result<Consumer> {
        self.create_consumer_with_options(queue, ConsumerOptions::default())
            .await
    }

    /// Consume from `queue` with a filter and the no-local flag
    pub async fn create_consumer_with<Q: Into<WireString>>(
        &self,
        queue: Q,
        filter: Option<WireString>,
        no_local: bool,
    ) -> Result<Consumer> {
        let options = ConsumerOptions {
            filter,
            no_local,
            ..ConsumerOptions::default()
        };
        self.create_consumer_with_options(queue, options).await
    }

    /// Create a consumer that reads messages without consuming them
    pub async fn create_browser<Q: Into<WireString>>(
        &self,
        queue: Q,
        filter: Option<WireString>,
    ) -> Result<Consumer> {
        let options = ConsumerOptions {
            filter,
            browse_only: true,
            ..ConsumerOptions::default()
        };
        self.create_consumer_with_options(queue, options).await
    }

    /// Consume from `queue` with explicit options
    pub async fn create_consumer_with_options<Q: Into<WireString>>(
        &self,
        queue: Q,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let window = options
            .window_size
            .unwrap_or(inner.config.consumer_window_size);
        let id = inner.next_consumer_id();
        let consumer = Arc::new(ConsumerInner::new(id, queue.into(), options, window));
        let spec = consumer.spec();

        // registered first so that replay re-creates it if a failover hits
        inner.consumers.insert(id, Arc::clone(&consumer));
        let name = &inner.name;
        let spec = &spec;
        let result = inner
            .connection
            .invoke(|t| async move { t.create_consumer(name, spec).await })
            .await;

        match result {
            Ok(()) => {}
            Err(CallFailure::Fault { generation, .. }) => {
                if let Err(e) = inner.connection.await_recovery(generation).await {
                    inner.remove_consumer(id);
                    return Err(e);
                }
            }
            Err(CallFailure::Error(e)) => {
                inner.remove_consumer(id);
                return Err(e);
            }
        }

        debug!(session = %inner.name, consumer = id, queue = %consumer.queue, "Consumer created");
        Ok(Consumer::new(consumer, Arc::clone(inner)))
    }

    /// New message to send from this session
    pub fn create_message(&self, durable: bool) -> ClientMessage {
        ClientMessage::new(durable)
    }

    /// Create a queue bound to `address`
    pub async fn create_queue<A, N>(
        &self,
        address: A,
        name: N,
        filter: Option<WireString>,
        durable: bool,
    ) -> Result<()>
    where
        A: Into<WireString>,
        N: Into<WireString>,
    {
        self.create_queue_spec(QueueSpec {
            address: address.into(),
            name: name.into(),
            filter,
            durable,
            temporary: false,
        })
        .await
    }

    /// Non-durable queue deleted when the connection that created it closes
    pub async fn create_temporary_queue<A, N>(&self, address: A, name: N) -> Result<()>
    where
        A: Into<WireString>,
        N: Into<WireString>,
    {
        self.create_queue_spec(QueueSpec {
            address: address.into(),
            name: name.into(),
            filter: None,
            durable: false,
            temporary: true,
        })
        .await
    }

    pub(crate) async fn create_queue_spec(&self, spec: QueueSpec) -> Result<()> {
        self.inner.ensure_open()?;
        let spec = &spec;
        self.inner
            .connection
            .invoke_retrying(|t| async move { t.create_queue(spec).await })
            .await
    }

    /// Delete a queue with no consumers
    pub async fn delete_queue<N: Into<WireString>>(&self, name: N) -> Result<()> {
        self.inner.ensure_open()?;
        let name = &name.into();
        self.inner
            .connection
            .invoke_retrying(|t| async move { t.delete_queue(name).await })
            .await
    }

    /// Describe a queue; `exists` is false when there is none
    pub async fn queue_query<N: Into<WireString>>(&self, name: N) -> Result<QueueQuery> {
        self.inner.ensure_open()?;
        let name = &name.into();
        self.inner
            .connection
            .invoke_retrying(|t| async move { t.queue_query(name).await })
            .await
    }

    /// Start delivering messages to consumers
    pub async fn start(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.start_delivery().await
    }

    /// Stop delivery; returns once no message handler of this session runs
    pub async fn stop(&self) -> Result<()> {
        self.inner.context.assert_not_listener_thread("Session::stop")?;
        self.inner.ensure_open()?;
        self.inner.stop_delivery().await?;
        for consumer in self.inner.consumers_in_order() {
            let _idle = consumer.handler_busy.lock().await;
        }
        Ok(())
    }

    /// Commit the transaction
    pub async fn commit(&self) -> Result<()> {
        self.inner.context.assert_not_listener_thread("Session::commit")?;
        self.inner.commit_inner().await
    }

    /// Roll the transaction back, returning consumed messages
    pub async fn rollback(&self) -> Result<()> {
        self.inner.context.assert_not_listener_thread("Session::rollback")?;
        self.inner.rollback_inner().await
    }

    /// Redeliver every unacknowledged message of the session
    pub async fn recover(&self) -> Result<()> {
        if self.inner.is_transacted() {
            return Err(RavenClientError::illegal_state(
                "Cannot recover a transacted session, use rollback",
            ));
        }
        self.inner.recover_inner().await
    }

    /// CLIENT acknowledgement of `message` and everything consumed before it
    pub async fn acknowledge(&self, message: &ClientMessage) -> Result<()> {
        let token = message.ack.as_ref().ok_or_else(|| {
            RavenClientError::illegal_state("Message was not received from a consumer")
        })?;
        if !std::ptr::eq(token.session.as_ptr(), Arc::as_ptr(&self.inner)) {
            return Err(RavenClientError::illegal_state(
                "Message was received on another session",
            ));
        }
        self.inner.acknowledge_token(token).await
    }

    /// Acknowledge everything consumed so far
    pub async fn acknowledge_all(&self) -> Result<()> {
        self.inner.ensure_open()?;
        match self.inner.ack_mode {
            AckMode::Client => {
                let epoch = self.inner.epoch.load(Ordering::Acquire);
                self.inner.acknowledge_up_to(epoch, u64::MAX).await
            }
            AckMode::DupsOk => {
                self.inner.flush_dups_ok().await;
                Ok(())
            }
            AckMode::Auto | AckMode::Transacted => Ok(()),
        }
    }

    /// Roll back a transaction left rollback-only by a failover
    pub async fn reset_if_needed(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.reset_if_needed_inner().await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.context.assert_not_listener_thread("Session::close")?;
        self.inner.close_inner(true).await;
        Ok(())
    }

    /// Whether the session was closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Whether sends and acknowledgements are transacted
    pub fn is_transacted(&self) -> bool {
        self.inner.is_transacted()
    }

    /// Acknowledgement mode of the session
    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    /// Whether the transaction can only be rolled back
    pub fn is_rollback_only(&self) -> bool {
        self.inner.rollback_only.load(Ordering::Acquire)
    }

    /// Sends and acknowledgements made in the current transaction
    pub fn pending_transaction_work(&self) -> (usize, usize) {
        (
            self.inner.tx_sends.load(Ordering::Acquire),
            self.inner.tx_acks.load(Ordering::Acquire),
        )
    }

    /// Number of sends waiting for a server confirmation
    pub fn unconfirmed_sends(&self) -> usize {
        self.inner.resend_cache.lock().len()
    }

    /// Delivery context shared by the session consumers
    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.inner.context)
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}
