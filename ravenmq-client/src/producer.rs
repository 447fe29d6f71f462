//! Producer client for sending messages to RavenMQ

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::RavenClientError;
use crate::message::ClientMessage;
use crate::session::SessionInner;
use crate::wire_string::WireString;
use crate::Result;

/// Notified once an asynchronous send was stored by the server, or failed.
///
/// Listeners of one session run one at a time and must not close, commit,
/// roll back or stop that session.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn on_completion(&self, message: ClientMessage);

    async fn on_exception(&self, message: ClientMessage, error: RavenClientError);
}

#[derive(Debug)]
pub(crate) struct ProducerInner {
    pub(crate) id: u64,
    pub(crate) address: Option<WireString>,
    pub(crate) group_id: Option<WireString>,
    window: Option<Arc<Semaphore>>,
    window_size: i32,
    closed: AtomicBool,
}

impl ProducerInner {
    pub(crate) fn new(
        id: u64,
        address: Option<WireString>,
        group_id: Option<WireString>,
        window_size: i32,
    ) -> Self {
        let window = (window_size > 0).then(|| Arc::new(Semaphore::new(window_size as usize)));
        Self {
            id,
            address,
            group_id,
            window,
            window_size,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(window) = &self.window {
                window.close();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve window space for a send of `size` bytes
    pub(crate) async fn acquire_window(&self, size: usize) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(window) = &self.window else {
            return Ok(None);
        };
        let permits = size.clamp(1, self.window_size as usize) as u32;
        Arc::clone(window)
            .acquire_many_owned(permits)
            .await
            .map(Some)
            .map_err(|_| RavenClientError::closed("Producer"))
    }
}

/// Sends messages on behalf of a session
#[derive(Debug, Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
    session: Arc<SessionInner>,
}

impl Producer {
    pub(crate) fn new(inner: Arc<ProducerInner>, session: Arc<SessionInner>) -> Self {
        Self { inner, session }
    }

    /// Send to the producer's address
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        self.send_internal(None, message, None).await
    }

    /// Send to `address`, which wins over the producer's own address
    pub async fn send_to<A: Into<WireString>>(&self, address: A, message: &ClientMessage) -> Result<()> {
        self.send_internal(Some(address.into()), message, None)
            .await
    }

    /// Send without waiting for the server; `listener` hears about the outcome
    pub async fn send_with_completion(
        &self,
        address: Option<WireString>,
        message: &ClientMessage,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<()> {
        self.send_internal(address, message, Some(listener)).await
    }

    async fn send_internal(
        &self,
        address: Option<WireString>,
        message: &ClientMessage,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<()> {
        if self.inner.is_closed() || self.session.is_closed() {
            return Err(RavenClientError::closed("Producer"));
        }
        let address = address
            .or_else(|| self.inner.address.clone())
            .ok_or(RavenClientError::DestinationRequired)?;

        debug!(producer = self.inner.id, address = %address, "Sending message");
        self.session
            .send_message(&self.inner, address, message, listener)
            .await
    }

    /// Default address, if any
    pub fn address(&self) -> Option<&WireString> {
        self.inner.address.as_ref()
    }

    /// Group id stamped on messages that carry none
    pub fn group_id(&self) -> Option<&WireString> {
        self.inner.group_id.as_ref()
    }

    /// Close the producer. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.mark_closed();
        self.session.remove_producer(self.inner.id);
        Ok(())
    }

    /// Whether the producer or its session was closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.session.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_caps_large_sends() {
        let producer = ProducerInner::new(1, None, None, 100);
        // a send bigger than the window takes the whole window
        let big = producer.acquire_window(1_000).await.unwrap();
        assert!(big.is_some());
        assert_eq!(producer.window.as_ref().unwrap().available_permits(), 0);
        drop(big);
        assert_eq!(producer.window.as_ref().unwrap().available_permits(), 100);
    }

    #[tokio::test]
    async fn test_unbounded_window_and_close() {
        let unbounded = ProducerInner::new(1, None, None, -1);
        assert!(unbounded.acquire_window(10).await.unwrap().is_none());

        let bounded = ProducerInner::new(2, None, None, 10);
        bounded.mark_closed();
        let err = bounded.acquire_window(5).await.unwrap_err();
        assert!(matches!(err, RavenClientError::Closed { object: "Producer" }));
    }
}
