//! Failover example using the RavenMQ Rust client
//!
//! Kills the live server halfway through consumption; the connection moves
//! to the backup and the remaining messages arrive as first deliveries.

use ravenmq_client::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env())?;

    println!("🔁 RavenMQ Rust client - Failover Example");
    println!("=========================================");

    let cluster = InVmCluster::new();
    let (live, backup) = cluster.add_node("node-1");
    println!("✅ Live at {}, backup at {}", live, backup);

    let config = LocatorConfig::builder()
        .reconnect_attempts(5)
        .retry_interval(Duration::from_millis(50))
        .max_retry_interval(Duration::from_millis(50))
        .build()?;
    let locator = RavenClient::create_locator_with_ha(cluster.connector(), vec![live], config)?;
    let connection = locator.create_connection().await?;

    let mut events = connection.subscribe_failover();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("   ⚡ {:?}", event);
        }
    });

    let session = connection.create_session(AckMode::Client).await?;
    session.create_queue("jobs", "jobs", None, true).await?;
    let producer = session.create_producer(Some("jobs".into())).await?;
    for i in 0..10 {
        producer
            .send(&session.create_message(true).with_body(format!("job {}", i)))
            .await?;
    }

    let consumer = session.create_consumer("jobs").await?;
    session.start().await?;

    let mut received = Vec::new();
    for _ in 0..10 {
        if let Some(message) = consumer.receive(Some(Duration::from_secs(1))).await? {
            received.push(message);
        }
    }
    received[4].acknowledge().await?;
    println!("✅ Acknowledged the first 5 jobs");

    cluster.kill_node("node-1");
    println!("💥 Live server killed");

    match received[5].acknowledge().await {
        Ok(()) => println!("   unexpected: stale acknowledgement accepted"),
        Err(e) => println!("✅ Stale acknowledgement refused: {}", e),
    }

    for _ in 0..5 {
        if let Some(message) = consumer.receive(Some(Duration::from_secs(2))).await? {
            println!(
                "   {} (redelivered: {})",
                message.text()?,
                message.is_redelivered()
            );
            message.acknowledge().await?;
        }
    }

    println!("✅ Now connected to {:?}", connection.endpoint().await);
    connection.close().await?;
    println!("\n🎉 Failover example completed");
    Ok(())
}
