//! Consumer client for receiving messages from RavenMQ
//!
//! Deliveries pushed by the server are buffered per consumer and paid for
//! with byte credits. A consumer either hands messages out through
//! [`Consumer::receive`] or runs a message handler on its own delivery task,
//! never both.

use async_trait::async_trait;
use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ConsumerOptions;
use crate::connection::CallFailure;
use crate::context::ThreadAwareContext;
use crate::error::RavenClientError;
use crate::message::ClientMessage;
use crate::session::SessionInner;
use crate::transport::ConsumerSpec;
use crate::wire_string::WireString;
use crate::Result;

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback for pushed messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: ClientMessage) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ClientMessage) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn on_message(&self, message: ClientMessage) -> std::result::Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Credit state of a consumer as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Open,
    PausedAwaitingCredit,
    Closed,
}

#[derive(Debug)]
struct Buffered {
    message: ClientMessage,
    epoch: u64,
}

#[derive(Debug)]
struct ConsumerBuffer {
    messages: VecDeque<Buffered>,
    /// Bytes delivered and not yet given back as credit
    outstanding: i64,
    /// Bytes consumed since credits were last returned
    credits_to_send: i64,
    state: FlowState,
}

#[derive(Debug)]
struct HandlerTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct ConsumerInner {
    pub(crate) id: u64,
    pub(crate) queue: WireString,
    pub(crate) options: ConsumerOptions,
    window: i32,
    buffer: Mutex<ConsumerBuffer>,
    notify: Notify,
    closed: AtomicBool,
    /// Server id of the last message handed to the application
    last_consumed: AtomicU64,
    handler: Mutex<Option<HandlerTask>>,
    /// Held while a handler processes a message
    pub(crate) handler_busy: tokio::sync::Mutex<()>,
}

impl ConsumerInner {
    pub(crate) fn new(id: u64, queue: WireString, options: ConsumerOptions, window: i32) -> Self {
        Self {
            id,
            queue,
            options,
            window,
            buffer: Mutex::new(ConsumerBuffer {
                messages: VecDeque::new(),
                outstanding: 0,
                credits_to_send: 0,
                state: FlowState::Open,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            last_consumed: AtomicU64::new(0),
            handler: Mutex::new(None),
            handler_busy: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Credits granted when the consumer is attached to a server
    pub(crate) fn initial_credits(&self) -> Option<i32> {
        match self.window {
            w if w < 0 => None,
            0 => Some(1),
            w => Some(w),
        }
    }

    pub(crate) fn spec(&self) -> ConsumerSpec {
        ConsumerSpec {
            consumer_id: self.id,
            queue: self.queue.clone(),
            filter: self.options.filter.clone(),
            no_local: self.options.no_local,
            browse_only: self.options.browse_only,
            initial_credits: self.initial_credits(),
        }
    }

    fn pause_threshold(&self) -> i64 {
        i64::from(self.window.max(1))
    }

    /// Buffer a delivery of transport `generation`; dropped when that
    /// transport is no longer the active one
    pub(crate) fn push_delivery(
        &self,
        message: ClientMessage,
        epoch: u64,
        generation: u64,
        active: &AtomicU64,
    ) -> bool {
        {
            let mut buffer = self.buffer.lock();
            if self.is_closed() || active.load(Ordering::Acquire) != generation {
                return false;
            }
            buffer.outstanding += message.encode_size() as i64;
            if self.window >= 0 && buffer.outstanding >= self.pause_threshold() {
                buffer.state = FlowState::PausedAwaitingCredit;
            }
            buffer.messages.push_back(Buffered { message, epoch });
        }
        self.notify.notify_waiters();
        true
    }

    fn take(&self, started: bool) -> Option<Buffered> {
        if !started {
            return None;
        }
        let buffered = self.buffer.lock().messages.pop_front()?;
        self.last_consumed
            .store(buffered.message.message_id(), Ordering::Release);
        Some(buffered)
    }

    /// Last consumed message id, cleared for the next round of deliveries
    pub(crate) fn take_last_consumed(&self) -> u64 {
        self.last_consumed.swap(0, Ordering::AcqRel)
    }

    /// Account for a consumed message; returns the credits to send back
    pub(crate) fn consumed(&self, size: usize) -> Option<i32> {
        let size = size as i64;
        let mut buffer = self.buffer.lock();
        let credits = match self.window {
            w if w < 0 => return None,
            0 => size,
            w => {
                buffer.credits_to_send += size;
                if buffer.credits_to_send < i64::from((w / 2).max(1)) {
                    return None;
                }
                std::mem::take(&mut buffer.credits_to_send)
            }
        };
        buffer.outstanding -= credits;
        if buffer.state == FlowState::PausedAwaitingCredit && buffer.outstanding < self.pause_threshold() {
            buffer.state = FlowState::Open;
        }
        Some(credits.min(i64::from(i32::MAX)) as i32)
    }

    /// Drop buffered messages; returns the credits they held
    pub(crate) fn clear_buffer(&self) -> Option<i32> {
        let mut buffer = self.buffer.lock();
        let dropped: i64 = buffer
            .messages
            .drain(..)
            .map(|b| b.message.encode_size() as i64)
            .sum();
        let credits = dropped + std::mem::take(&mut buffer.credits_to_send);
        buffer.outstanding -= credits;
        if buffer.state == FlowState::PausedAwaitingCredit {
            buffer.state = FlowState::Open;
        }
        (self.window >= 0 && credits > 0).then(|| credits.min(i64::from(i32::MAX)) as i32)
    }

    /// Forget everything delivered by the previous server
    pub(crate) fn reset_for_failover(&self) {
        self.last_consumed.store(0, Ordering::Release);
        let mut buffer = self.buffer.lock();
        buffer.messages.clear();
        buffer.outstanding = 0;
        buffer.credits_to_send = 0;
        if buffer.state != FlowState::Closed {
            buffer.state = FlowState::Open;
        }
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn flow_state(&self) -> FlowState {
        self.buffer.lock().state
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.lock().messages.len()
    }

    /// Stop local delivery: no more buffering, handler cancelled and drained.
    /// Returns false when already closed.
    pub(crate) async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut buffer = self.buffer.lock();
            buffer.messages.clear();
            buffer.state = FlowState::Closed;
        }
        self.notify.notify_waiters();

        let task = self.handler.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            // closing from inside the handler must not wait for itself
            if tokio::task::try_id() != Some(task.join.id()) {
                let _ = task.join.await;
            }
        }
        true
    }
}

/// Receives messages from one queue
#[derive(Debug, Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    session: Arc<SessionInner>,
}

impl Consumer {
    pub(crate) fn new(inner: Arc<ConsumerInner>, session: Arc<SessionInner>) -> Self {
        Self { inner, session }
    }

    /// Consumer id within its session
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Queue this consumer reads
    pub fn queue(&self) -> &WireString {
        &self.inner.queue
    }

    /// Filter applied by the server, if any
    pub fn filter(&self) -> Option<&WireString> {
        self.inner.options.filter.as_ref()
    }

    /// Whether messages are browsed instead of consumed
    pub fn is_browse_only(&self) -> bool {
        self.inner.options.browse_only
    }

    /// Credit state of the consumer
    pub fn flow_state(&self) -> FlowState {
        self.inner.flow_state()
    }

    /// Messages delivered by the server and not yet handed out
    pub fn buffered(&self) -> usize {
        self.inner.buffered()
    }

    /// Whether the consumer or its session was closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.session.is_closed()
    }

    /// Wait for the next message; `Ok(None)` on timeout or once closed
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<ClientMessage>> {
        if self.inner.has_handler() {
            return Err(RavenClientError::illegal_state(
                "Cannot receive on a consumer with a message handler",
            ));
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if self.is_closed() {
                return Ok(None);
            }

            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.next_ready().await {
                return Ok(Some(message));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Return a buffered message if one is ready
    pub async fn receive_no_wait(&self) -> Result<Option<ClientMessage>> {
        if self.inner.has_handler() {
            return Err(RavenClientError::illegal_state(
                "Cannot receive on a consumer with a message handler",
            ));
        }
        if self.is_closed() {
            return Ok(None);
        }
        Ok(self.next_ready().await)
    }

    async fn next_ready(&self) -> Option<ClientMessage> {
        let buffered = self.inner.take(self.session.is_started())?;
        let message = self
            .session
            .accept_delivery(&self.inner, buffered.message, buffered.epoch)
            .await;
        self.session.auto_acknowledge(&self.inner, &message).await;
        Some(message)
    }

    /// Wait until a message can be taken or the consumer closes, without
    /// taking it
    pub(crate) async fn ready(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() || (self.session.is_started() && self.inner.buffered() > 0) {
                return;
            }
            notified.await;
        }
    }

    /// Messages as a stream, ending when the consumer closes
    pub fn stream(&self) -> impl Stream<Item = ClientMessage> + Send + 'static {
        futures::stream::unfold(self.clone(), |consumer| async move {
            match consumer.receive(None).await {
                Ok(Some(message)) => Some((message, consumer)),
                Ok(None) | Err(_) => None,
            }
        })
    }

    /// Install `handler`, replacing any previous one; messages are then
    /// pushed to it one at a time on a dedicated task
    pub async fn set_message_handler<H>(&self, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        if self.is_closed() {
            return Err(RavenClientError::closed("Consumer"));
        }

        let previous = self.inner.handler.lock().take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            if tokio::task::try_id() != Some(previous.join.id()) {
                let _ = previous.join.await;
            }
        }

        let cancel = CancellationToken::new();
        let join = self.session.tasks.spawn(
            "delivery",
            delivery_loop(
                Arc::clone(&self.inner),
                Arc::clone(&self.session),
                Arc::new(handler),
                cancel.clone(),
            ),
        );
        *self.inner.handler.lock() = Some(HandlerTask { cancel, join });
        debug!(consumer = self.inner.id, "Message handler installed");
        Ok(())
    }

    /// Close the consumer. Idempotent.
    ///
    /// Stops credits, waits for a running handler to return (unless called
    /// from that handler) and detaches from the server.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.shutdown().await {
            return Ok(());
        }

        self.session.flush_dups_ok().await;
        self.session.remove_consumer(self.inner.id);

        let name = &self.session.name;
        let consumer_id = self.inner.id;
        match self
            .session
            .connection
            .invoke(|t| async move { t.close_consumer(name, consumer_id).await })
            .await
        {
            Ok(()) | Err(CallFailure::Fault { .. }) => Ok(()),
            Err(CallFailure::Error(e)) if self.session.is_closed() => {
                debug!(consumer = consumer_id, error = %e, "Ignoring close error on closed session");
                Ok(())
            }
            Err(CallFailure::Error(e)) => Err(e),
        }
    }
}

async fn delivery_loop(
    consumer: Arc<ConsumerInner>,
    session: Arc<SessionInner>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    session.context.set_current_thread(false);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let notified = consumer.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let Some(buffered) = consumer.take(session.is_started()) else {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = notified.as_mut() => {}
            }
            continue;
        };

        let _busy = consumer.handler_busy.lock().await;
        let message = session
            .accept_delivery(&consumer, buffered.message, buffered.epoch)
            .await;
        let message_id = message.message_id();

        match AssertUnwindSafe(handler.on_message(message.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(consumer = consumer.id, message_id, error = %e, "Message handler failed");
                session.metrics.record_handler_error();
            }
            Err(_) => {
                error!(consumer = consumer.id, message_id, "Message handler panicked");
                session.metrics.record_handler_error();
            }
        }

        session.auto_acknowledge(&consumer, &message).await;
    }

    session.context.clear_current_thread(false);
    debug!(consumer = consumer.id, "Delivery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: usize) -> ClientMessage {
        ClientMessage::new(false).with_body(vec![0u8; body])
    }

    #[test]
    fn test_initial_credits() {
        let unbounded = ConsumerInner::new(1, "q".into(), ConsumerOptions::default(), -1);
        assert_eq!(unbounded.initial_credits(), None);
        let slow = ConsumerInner::new(2, "q".into(), ConsumerOptions::default(), 0);
        assert_eq!(slow.initial_credits(), Some(1));
        let windowed = ConsumerInner::new(3, "q".into(), ConsumerOptions::default(), 4096);
        assert_eq!(windowed.initial_credits(), Some(4096));
    }

    #[test]
    fn test_pause_and_credit_return_at_half_window() {
        let active = AtomicU64::new(1);
        let m = message(100);
        let size = m.encode_size();
        let consumer = ConsumerInner::new(1, "q".into(), ConsumerOptions::default(), (size * 4) as i32);

        for _ in 0..4 {
            assert!(consumer.push_delivery(m.clone(), 0, 1, &active));
        }
        assert_eq!(consumer.flow_state(), FlowState::PausedAwaitingCredit);

        assert!(consumer.take(true).is_some());
        assert_eq!(consumer.consumed(size), None);
        assert!(consumer.take(true).is_some());
        assert_eq!(consumer.consumed(size), Some((size * 2) as i32));
        assert_eq!(consumer.flow_state(), FlowState::Open);
    }

    #[test]
    fn test_slow_consumer_returns_each_message() {
        let active = AtomicU64::new(1);
        let consumer = ConsumerInner::new(1, "q".into(), ConsumerOptions::default(), 0);
        let m = message(10);
        assert!(consumer.push_delivery(m.clone(), 0, 1, &active));
        assert_eq!(consumer.flow_state(), FlowState::PausedAwaitingCredit);
        assert!(consumer.take(true).is_some());
        assert_eq!(consumer.consumed(m.encode_size()), Some(m.encode_size() as i32));
        assert_eq!(consumer.flow_state(), FlowState::Open);
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let active = AtomicU64::new(2);
        let consumer = ConsumerInner::new(1, "q".into(), ConsumerOptions::default(), -1);
        assert!(!consumer.push_delivery(message(1), 0, 1, &active));
        assert!(consumer.push_delivery(message(1), 0, 2, &active));
        assert!(consumer.take(false).is_none());
        assert!(consumer.take(true).is_some());
    }

    #[test]
    fn test_clear_buffer_returns_held_credits() {
        let active = AtomicU64::new(1);
        let m = message(20);
        let consumer = ConsumerInner::new(1, "q".into(), ConsumerOptions::default(), 10_000);
        consumer.push_delivery(m.clone(), 0, 1, &active);
        consumer.push_delivery(m.clone(), 0, 1, &active);
        assert_eq!(consumer.clear_buffer(), Some((m.encode_size() * 2) as i32));
        assert_eq!(consumer.buffered(), 0);
        assert_eq!(consumer.clear_buffer(), None);
    }
}
