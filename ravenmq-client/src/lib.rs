//! # RavenMQ Client Library
//!
//! Session and consumer engine for RavenMQ broker clusters.
//!
//! ## Features
//!
//! - **Acknowledgement modes**: AUTO, CLIENT, DUPS_OK and TRANSACTED sessions
//! - **Flow control**: consumer credits, producer windows and confirmation windows
//! - **Message grouping**: sticky group-id pinning, with per-producer auto groups
//! - **Transparent failover**: reconnects to a backup and replays sessions
//!   without redelivering or losing in-flight messages
//! - **Observability**: `tracing` logs and lock-free client metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ravenmq_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let cluster = InVmCluster::new();
//!     let (live, _backup) = cluster.add_node("node-1");
//!
//!     let locator = RavenClient::create_locator_with_ha(
//!         cluster.connector(),
//!         vec![live],
//!         LocatorConfig::builder().reconnect_attempts(5).build()?,
//!     )?;
//!     let connection = locator.create_connection().await?;
//!     let session = connection.create_session(AckMode::Auto).await?;
//!     session.create_queue("orders", "orders", None, true).await?;
//!
//!     let producer = session.create_producer(Some("orders".into())).await?;
//!     producer.send(&session.create_message(true).with_body("hello")).await?;
//!
//!     let consumer = session.create_consumer("orders").await?;
//!     session.start().await?;
//!     if let Some(message) = consumer.receive(Some(std::time::Duration::from_secs(1))).await? {
//!         println!("received {}", message.text()?);
//!     }
//!
//!     connection.close().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod error;
mod failover;
pub mod inflow;
pub mod invm;
pub mod locator;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod session;
pub mod task;
pub mod telemetry;
pub mod topology;
pub mod transport;
pub mod wire_string;

pub use client::*;
pub use config::*;
pub use connection::{
    Connection, ConnectionState, ConnectionStatus, FailoverEvent, SessionFailureListener,
};
pub use consumer::{Consumer, FlowState, HandlerError, MessageHandler};
pub use context::{SessionContext, ThreadAwareContext};
pub use error::*;
pub use invm::InVmCluster;
pub use locator::{
    ConnectionLoadBalancingPolicy, FirstElementPolicy, RandomPolicy, RoundRobinPolicy,
    ServerLocator,
};
pub use message::{ClientMessage, PropertyValue};
pub use metrics::{global_metrics, ClientMetrics, MetricsSnapshot};
pub use producer::{CompletionListener, Producer};
pub use session::{AckMode, Session};
pub use task::{TaskFactory, TaskPriority};
pub use telemetry::{init_logging, LogFormat};
pub use topology::{Endpoint, TopologyMember, TopologyView};
pub use wire_string::WireString;

/// Client library result type
pub type Result<T> = std::result::Result<T, RavenClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
