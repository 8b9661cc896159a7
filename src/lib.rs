//! # A3S Broker
//!
//! A tag-addressable message queue broker core.
//!
//! Producers enqueue items carrying a set of key/value tags. Consumers
//! subscribe by exact tag set, by "contains at least these tags", or to
//! everything, and receive items through an unbuffered hand-off.
//!
//! ## Core (always compiled)
//!
//! - Combinatorial subset index: an item is reachable from every
//!   sub-combination of its tag set without scanning subscriptions
//! - One FIFO tag group and worker task per exact tag set
//! - Two-phase delivery: an item is reserved, then committed or aborted
//! - Updateable items collapse onto the queued tail item
//! - Bounded admission per queue
//! - ACK with front/end requeue, dead letter queue for permanent failures
//! - Event system for broker lifecycle notifications
//! - Graceful shutdown that releases every blocked consumer
//!
//! ## Feature Flags
//!
//! | Feature | Default | Dependencies | Description |
//! |---------|---------|-------------|-------------|
//! | `metrics` | ✅ | — | `MetricsBackend` trait, `LocalMetrics`, wait-time histograms |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_broker::{QueueManagerBuilder, QueueConfig, Selector, TagSet};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = QueueManagerBuilder::default()
//!         .with_queue("orders", QueueConfig::new(100))
//!         .build()
//!         .await?;
//!
//!     let tags = TagSet::from([("region", "eu"), ("kind", "invoice")]);
//!     manager.enqueue("orders", tags.clone(), b"hello".to_vec(), false).await?;
//!
//!     let subscription = manager.subscribe("orders", Some(&[Selector::matches([("region", "eu")])])).await?;
//!     if let Some(reservation) = subscription.reserve().await? {
//!         let item = reservation.commit();
//!         manager.ack("orders", &item.tags, item.id, true, None).await?;
//!     }
//!     Ok(())
//! }
//! ```

// Core modules (always compiled)
pub mod config;
pub mod counter;
pub mod dlq;
pub mod error;
pub mod event;
pub mod group;
pub mod index;
pub mod manager;
pub mod notifier;
pub mod queue;
pub mod rendezvous;
pub mod tags;

// Feature-gated modules
#[cfg(feature = "metrics")]
pub mod metrics;

// Core re-exports
pub use config::QueueConfig;
pub use counter::AdmissionCounter;
pub use dlq::{DeadLetter, DeadLetterQueue};
pub use error::{BrokerError, Result};
pub use event::{BrokerEvent, EventEmitter, EventPayload, EventStream};
pub use group::{
    Delivery, Item, ItemId, RequeueLocation, Reservation, TagGroup, TagGroupStats, WorkerState,
};
pub use manager::{QueueManager, QueueManagerBuilder};
pub use queue::{Enqueued, TagQueue};
pub use rendezvous::{ChannelKind, Receiver, Subscription};
pub use tags::{
    generate_combinations, MatchMode, Selector, TagCombination, TagSet, MAX_TAGS_LIMIT,
};

// Feature-gated re-exports
#[cfg(feature = "metrics")]
pub use metrics::{
    metric_names, BrokerMetrics, HistogramStats, LocalMetrics, MetricsBackend, MetricsSnapshot,
};

use serde::{Deserialize, Serialize};

/// Queue statistics snapshot
///
/// Point-in-time view of one queue: admission totals plus the ready and
/// processing counts of every live tag group, sorted by tag set.
///
/// # Fields
///
/// * `name` - Queue name
/// * `max` - Admission limit
/// * `total` - Outstanding items (ready plus processing)
/// * `tag_groups` - Per tag group counts, serialized as `tags`
///
/// # Example
///
/// ```rust,ignore
/// let stats = manager.stats("orders").await?;
/// println!("{}: {}/{} outstanding", stats.name, stats.total, stats.max);
///
/// for group in &stats.tag_groups {
///     println!("{}: {} ready, {} processing", group.tags, group.ready, group.processing);
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub max: usize,
    pub total: usize,
    #[serde(rename = "tags")]
    pub tag_groups: Vec<TagGroupStats>,
}

impl QueueStats {
    pub fn ready(&self) -> usize {
        self.tag_groups.iter().map(|g| g.ready).sum()
    }

    pub fn processing(&self) -> usize {
        self.tag_groups.iter().map(|g| g.processing).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_manager_builder() {
        let manager = QueueManagerBuilder::default()
            .with_queue("a", QueueConfig::new(5))
            .with_queue("b", QueueConfig::new(10))
            .build()
            .await
            .unwrap();

        assert_eq!(manager.queue_names().await, vec!["a", "b"]);
        assert_eq!(manager.stats("b").await.unwrap().max, 10);
    }

    #[test]
    fn test_queue_stats_default() {
        let stats = QueueStats::default();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.ready(), 0);
        assert!(stats.tag_groups.is_empty());
    }

    #[test]
    fn test_queue_stats_serialization() {
        let stats = QueueStats {
            name: "q".to_string(),
            max: 5,
            total: 3,
            tag_groups: vec![
                TagGroupStats {
                    tags: TagSet::from([("x", "1")]),
                    ready: 2,
                    processing: 0,
                },
                TagGroupStats {
                    tags: TagSet::from([("y", "2")]),
                    ready: 0,
                    processing: 1,
                },
            ],
        };
        assert_eq!(stats.ready(), 2);
        assert_eq!(stats.processing(), 1);

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"tags\":[{\"tags\":{\"x\":\"1\"}"));

        let parsed: QueueStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stats);
    }
}
