//! Basic usage example
//!
//! This example demonstrates the basic usage of a3s-broker:
//! - Creating a queue manager with one queue
//! - Enqueuing tagged items, including an updateable one
//! - Consuming through a subset subscription and acknowledging
//!
//! Run with `RUST_LOG=a3s_broker=debug` to see worker and tag group logs.

use a3s_broker::{EventEmitter, QueueConfig, QueueManagerBuilder, RequeueLocation, Selector, TagSet};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== A3S Broker: Basic Usage Example ===\n");

    let emitter = EventEmitter::new(100);
    let mut events = emitter.subscribe_queue("orders");

    let manager = QueueManagerBuilder::new(emitter)
        .with_queue("orders", QueueConfig::new(100).with_dead_letters(10))
        .build()
        .await?;
    println!("✓ Queue 'orders' created");

    // Enqueue a few items across different tag sets
    let items = [
        (TagSet::from([("region", "eu"), ("kind", "invoice")]), "invoice #1", false),
        (TagSet::from([("region", "us"), ("kind", "invoice")]), "invoice #2", false),
        (TagSet::from([("region", "eu"), ("kind", "price")]), "price v1", true),
        (TagSet::from([("region", "eu"), ("kind", "price")]), "price v2", true),
    ];
    for (tags, payload, updateable) in items {
        let outcome = manager
            .enqueue("orders", tags.clone(), payload.as_bytes().to_vec(), updateable)
            .await?;
        println!("  → {} [{}] {:?}", payload, tags, outcome);
    }

    let stats = manager.stats("orders").await?;
    println!("\n{} outstanding of {}", stats.total, stats.max);
    for group in &stats.tag_groups {
        println!("  {}: {} ready, {} processing", group.tags, group.ready, group.processing);
    }

    // Everything in region=eu, whatever else it is tagged with
    println!("\nConsuming region=eu...\n");
    let selection = [Selector::matches([("region", "eu")])];
    let subscription = manager.subscribe("orders", Some(&selection)).await?;

    let mut retried = false;
    for _ in 0..3 {
        let Some(reservation) = subscription.reserve().await? else {
            break;
        };
        let item = reservation.commit();
        let text = String::from_utf8_lossy(&item.payload).into_owned();

        if !retried && item.tags.get("kind") == Some("invoice") {
            // First attempt fails downstream; put it back at the front.
            retried = true;
            manager
                .ack("orders", &item.tags, item.id, false, Some(RequeueLocation::Front))
                .await?;
            println!("✗ {} failed, requeued", text);
            continue;
        }

        manager.ack("orders", &item.tags, item.id, true, None).await?;
        println!("✓ {} [{}] acknowledged", text, item.tags);
    }

    let stats = manager.stats("orders").await?;
    println!("\n=== Queue Statistics ===");
    println!("Total outstanding: {}", stats.total);
    println!("Ready: {}, processing: {}", stats.ready(), stats.processing());

    println!("\n=== Events ===");
    while let Ok(Some(event)) =
        tokio::time::timeout(tokio::time::Duration::from_millis(10), events.recv()).await
    {
        println!("  {} {:?}", event.key, event.item_id());
    }

    println!("\n=== Shutting Down ===");
    manager.shutdown().await;
    println!("✓ Shutdown complete");

    Ok(())
}
