//! Metrics collection for the RavenMQ client

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Client metrics collector
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub send_latency_sum: AtomicU64,
    pub send_latency_count: AtomicU64,
    pub large_messages_sent: AtomicU64,
    pub resent_messages: AtomicU64,

    // Consumer metrics
    pub messages_consumed: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub acknowledgements: AtomicU64,
    pub redeliveries: AtomicU64,
    pub handler_errors: AtomicU64,

    // Connection metrics
    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
    pub failovers: AtomicU64,
    pub failover_failures: AtomicU64,
}

impl ClientMetrics {
    /// Record a successful send operation
    pub fn record_send(&self, byte_count: u64, latency: Duration) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
        self.send_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.send_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a message sent in chunks
    pub fn record_large_message(&self) {
        self.large_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record sends replayed after a failover
    pub fn record_resend(&self, count: u64) {
        self.resent_messages.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a message handed to the application
    pub fn record_consume(&self, byte_count: u64, redelivered: bool) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(byte_count, Ordering::Relaxed);
        if redelivered {
            self.redeliveries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count an acknowledgement sent to the server
    pub fn record_acknowledgement(&self) {
        self.acknowledgements.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handler that returned an error or panicked
    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful connection
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connection
    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed failover
    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failover that gave up
    pub fn record_failover_failure(&self) {
        self.failover_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average send latency in microseconds
    pub fn average_send_latency_us(&self) -> f64 {
        let sum = self.send_latency_sum.load(Ordering::Relaxed);
        let count = self.send_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            average_send_latency_us: self.average_send_latency_us(),
            large_messages_sent: self.large_messages_sent.load(Ordering::Relaxed),
            resent_messages: self.resent_messages.load(Ordering::Relaxed),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            acknowledgements: self.acknowledgements.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            failover_failures: self.failover_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub average_send_latency_us: f64,
    pub large_messages_sent: u64,
    pub resent_messages: u64,
    pub messages_consumed: u64,
    pub bytes_consumed: u64,
    pub acknowledgements: u64,
    pub redeliveries: u64,
    pub handler_errors: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub failovers: u64,
    pub failover_failures: u64,
}

/// Timing helper for measuring operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start timing
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since start
    pub fn elapsed(self) -> Duration {
        self.start.elapsed()
    }
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ClientMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ClientMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<ClientMetrics> {
    GLOBAL_METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ClientMetrics::default();
        metrics.record_send(100, Duration::from_micros(10));
        metrics.record_send(50, Duration::from_micros(30));
        metrics.record_consume(10, false);
        metrics.record_consume(10, true);
        metrics.record_handler_error();
        metrics.record_failover();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 150);
        assert_eq!(snapshot.average_send_latency_us, 20.0);
        assert_eq!(snapshot.messages_consumed, 2);
        assert_eq!(snapshot.redeliveries, 1);
        assert_eq!(snapshot.handler_errors, 1);
        assert_eq!(snapshot.failovers, 1);
    }
}
