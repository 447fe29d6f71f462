//! Message grouping example using the RavenMQ Rust client

use ravenmq_client::*;
use std::collections::HashMap;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env())?;

    println!("📦 RavenMQ Rust client - Grouped Delivery Example");
    println!("=================================================");

    let cluster = InVmCluster::new();
    let (live, _backup) = cluster.add_node("node-1");

    let config = LocatorConfig::builder().auto_group(true).build()?;
    let locator = RavenClient::create_locator_without_ha(cluster.connector(), vec![live], config)?;
    let connection = locator.create_connection().await?;
    let session = connection.create_session(AckMode::Auto).await?;
    session.create_queue("orders", "orders", None, true).await?;

    let consumers = vec![
        session.create_consumer("orders").await?,
        session.create_consumer("orders").await?,
        session.create_consumer("orders").await?,
    ];

    // every producer gets its own group, so its messages stick to one consumer
    for p in 0..2 {
        let producer = session.create_producer(Some("orders".into())).await?;
        println!("✅ Producer {} uses group {:?}", p, producer.group_id());
        for i in 0..50 {
            let message = session
                .create_message(true)
                .with_body(format!("producer {} message {}", p, i))
                .with_property("producer", p as i32);
            producer.send(&message).await?;
        }
    }

    session.start().await?;

    let mut counts: HashMap<u64, usize> = HashMap::new();
    for consumer in &consumers {
        while let Some(_message) = consumer.receive(Some(Duration::from_millis(200))).await? {
            *counts.entry(consumer.id()).or_default() += 1;
        }
    }

    for consumer in &consumers {
        println!(
            "   Consumer {}: {} messages",
            consumer.id(),
            counts.get(&consumer.id()).copied().unwrap_or(0)
        );
    }

    connection.close().await?;
    println!("\n🎉 Grouping example completed");
    Ok(())
}
