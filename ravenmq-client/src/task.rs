//! Task provisioning for background work

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// Scheduling hint carried into task spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Creates the client's tasks: delivery loops, completion executors,
/// event pumps and failure checkers.
///
/// Daemon tasks stop when the factory shuts down; other tasks run to
/// completion.
#[derive(Debug, Clone)]
pub struct TaskFactory {
    inner: Arc<TaskFactoryInner>,
}

#[derive(Debug)]
struct TaskFactoryInner {
    name_prefix: String,
    priority: TaskPriority,
    daemon: bool,
    context: Option<String>,
    counter: AtomicU64,
    active: AtomicUsize,
    shutdown: CancellationToken,
}

impl TaskFactory {
    /// Task settings with default priority
    pub fn new<S: Into<String>>(name_prefix: S) -> Self {
        Self::with_options(name_prefix, TaskPriority::Normal, true, None)
    }

    /// Create a factory; `context` is attached to the span of every task
    pub fn with_options<S: Into<String>>(
        name_prefix: S,
        priority: TaskPriority,
        daemon: bool,
        context: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskFactoryInner {
                name_prefix: name_prefix.into(),
                priority,
                daemon,
                context,
                counter: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Prefix of spawned task names
    pub fn name_prefix(&self) -> &str {
        &self.inner.name_prefix
    }

    /// Scheduling priority hint
    pub fn priority(&self) -> TaskPriority {
        self.inner.priority
    }

    /// Whether tasks may be abandoned on shutdown
    pub fn is_daemon(&self) -> bool {
        self.inner.daemon
    }

    /// Label added to task names
    pub fn context(&self) -> Option<&str> {
        self.inner.context.as_deref()
    }

    /// Number of tasks spawned by this factory that are still running
    pub fn active_tasks(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Spawn a task named `<prefix>-<kind>-<n>`
    pub fn spawn<F>(&self, kind: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{}-{}", self.inner.name_prefix, kind, n);
        let span = info_span!(
            "task",
            name = %name,
            priority = ?self.inner.priority,
            daemon = self.inner.daemon,
            context = self.inner.context.as_deref().unwrap_or("")
        );

        let inner = Arc::clone(&self.inner);
        inner.active.fetch_add(1, Ordering::AcqRel);
        let shutdown = inner.shutdown.clone();
        let daemon = inner.daemon;

        tokio::spawn(
            async move {
                if daemon {
                    tokio::select! {
                        _ = shutdown.cancelled() => debug!("Task stopped by shutdown"),
                        _ = future => {}
                    }
                } else {
                    future.await;
                }
                inner.active.fetch_sub(1, Ordering::AcqRel);
            }
            .instrument(span),
        )
    }

    /// Stop every daemon task spawned by this factory
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether the executor stopped accepting tasks
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawned_tasks_are_counted() {
        let factory = TaskFactory::with_options("test", TaskPriority::High, false, Some("ctx".into()));
        assert_eq!(factory.context(), Some("ctx"));

        let handle = factory.spawn("work", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        handle.await.unwrap();
        assert_eq!(factory.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_daemon_tasks() {
        let factory = TaskFactory::new("daemon");
        assert!(factory.is_daemon());

        let handle = factory.spawn("forever", std::future::pending());
        assert_eq!(factory.active_tasks(), 1);

        factory.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(factory.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_non_daemon_tasks_running() {
        let factory = TaskFactory::with_options("worker", TaskPriority::Low, false, None);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handle = factory.spawn("finish", async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(());
        });
        factory.shutdown();

        handle.await.unwrap();
        assert!(rx.await.is_ok());
    }
}
