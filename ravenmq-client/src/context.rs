//! Listener-aware session context.
//!
//! Tracks which tasks are currently running message handlers or completion
//! listeners for a session, so that management calls made from inside those
//! callbacks can be refused instead of deadlocking.

use dashmap::DashSet;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::Id;
use tracing::debug;

use crate::error::RavenClientError;
use crate::task::TaskFactory;
use crate::Result;

/// Hook used by adapter layers to mark the callback running on the current task
pub trait ThreadAwareContext: Send + Sync {
    /// Record the current task as running a message handler, or the
    /// completion listener when `is_completion_listener` is set
    fn set_current_thread(&self, is_completion_listener: bool);

    fn clear_current_thread(&self, is_completion_listener: bool);

    /// Fail with a reentrancy error when called from one of this context's
    /// callbacks
    fn assert_not_listener_thread(&self, operation: &str) -> Result<()>;
}

type CompletionJob = BoxFuture<'static, ()>;

/// Per-session implementation of [`ThreadAwareContext`]
#[derive(Debug)]
pub struct SessionContext {
    listener_tasks: DashSet<Id>,
    completion_task: Mutex<Option<Id>>,
    completions: Mutex<Option<mpsc::UnboundedSender<CompletionJob>>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// Context with no delivery task registered
    pub fn new() -> Self {
        Self {
            listener_tasks: DashSet::new(),
            completion_task: Mutex::new(None),
            completions: Mutex::new(None),
        }
    }

    /// True when the caller is a handler or completion task of this context
    pub fn is_listener_task(&self) -> bool {
        let Some(id) = tokio::task::try_id() else {
            return false;
        };
        self.listener_tasks.contains(&id) || *self.completion_task.lock() == Some(id)
    }

    /// Queue a completion callback.
    ///
    /// Callbacks of one context run one at a time, in submission order, on a
    /// single executor task started on first use.
    pub(crate) fn submit_completion(self: &std::sync::Arc<Self>, tasks: &TaskFactory, job: CompletionJob) {
        let mut slot = self.completions.lock();
        if slot.as_ref().map_or(true, |tx| tx.is_closed()) {
            *slot = Some(self.start_completion_executor(tasks));
        }
        if let Some(sender) = slot.as_ref() {
            let _ = sender.send(job);
        }
    }

    fn start_completion_executor(
        self: &std::sync::Arc<Self>,
        tasks: &TaskFactory,
    ) -> mpsc::UnboundedSender<CompletionJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<CompletionJob>();
        let context = std::sync::Arc::clone(self);
        tasks.spawn("completion", async move {
            context.set_current_thread(true);
            while let Some(job) = rx.recv().await {
                job.await;
            }
            context.clear_current_thread(true);
            debug!("Completion executor stopped");
        });
        tx
    }

    /// Stop the completion executor once queued callbacks have run
    pub(crate) fn shutdown_completions(&self) {
        self.completions.lock().take();
    }
}

impl ThreadAwareContext for SessionContext {
    fn set_current_thread(&self, is_completion_listener: bool) {
        let Some(id) = tokio::task::try_id() else {
            return;
        };
        if is_completion_listener {
            *self.completion_task.lock() = Some(id);
        } else {
            self.listener_tasks.insert(id);
        }
    }

    fn clear_current_thread(&self, is_completion_listener: bool) {
        let Some(id) = tokio::task::try_id() else {
            return;
        };
        if is_completion_listener {
            let mut current = self.completion_task.lock();
            if *current == Some(id) {
                *current = None;
            }
        } else {
            self.listener_tasks.remove(&id);
        }
    }

    fn assert_not_listener_thread(&self, operation: &str) -> Result<()> {
        if self.is_listener_task() {
            return Err(RavenClientError::reentrancy(format!(
                "{} cannot be called from a message or completion listener of the same session",
                operation
            )));
        }
        Ok(())
    }
}
