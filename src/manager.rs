//! Queue manager owns the set of named queues

use crate::config::QueueConfig;
use crate::dlq::DeadLetter;
use crate::error::{BrokerError, Result};
use crate::event::EventEmitter;
use crate::group::{ItemId, RequeueLocation};
#[cfg(feature = "metrics")]
use crate::metrics::BrokerMetrics;
use crate::queue::{Enqueued, TagQueue};
use crate::rendezvous::Subscription;
use crate::tags::{Selector, TagSet};
use crate::QueueStats;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Queue manager
pub struct QueueManager {
    queues: RwLock<HashMap<String, Arc<TagQueue>>>,
    event_emitter: EventEmitter,
    #[cfg(feature = "metrics")]
    metrics: Option<BrokerMetrics>,
    is_shutting_down: AtomicBool,
}

impl QueueManager {
    pub fn new(event_emitter: EventEmitter) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            event_emitter,
            #[cfg(feature = "metrics")]
            metrics: None,
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Create a queue with default configuration and the given capacity.
    ///
    /// Does nothing when a queue of that name already exists.
    pub async fn create(&self, name: &str, max_size: usize) -> Result<()> {
        self.create_with(name, QueueConfig::new(max_size)).await
    }

    /// Create a queue from a full configuration; no-op if the name is taken
    pub async fn create_with(&self, name: &str, config: QueueConfig) -> Result<()> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShutdownInProgress);
        }

        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            return Ok(());
        }
        let queue = self.build_queue(name, config)?;
        queues.insert(name.to_string(), Arc::new(queue));
        Ok(())
    }

    #[cfg(feature = "metrics")]
    fn build_queue(&self, name: &str, config: QueueConfig) -> Result<TagQueue> {
        match &self.metrics {
            Some(metrics) => TagQueue::with_metrics(
                name,
                config,
                self.event_emitter.clone(),
                metrics.clone(),
            ),
            None => TagQueue::new(name, config, self.event_emitter.clone()),
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn build_queue(&self, name: &str, config: QueueConfig) -> Result<TagQueue> {
        TagQueue::new(name, config, self.event_emitter.clone())
    }

    /// Look up a queue by name
    pub async fn queue(&self, name: &str) -> Result<Arc<TagQueue>> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    pub async fn enqueue(
        &self,
        name: &str,
        tags: TagSet,
        payload: Vec<u8>,
        updateable: bool,
    ) -> Result<Enqueued> {
        self.queue(name)
            .await?
            .enqueue(tags, payload, updateable)
            .await
    }

    pub async fn subscribe(
        &self,
        name: &str,
        selection: Option<&[Selector]>,
    ) -> Result<Subscription> {
        self.queue(name).await?.subscribe(selection)
    }

    pub async fn ack(
        &self,
        name: &str,
        tags: &TagSet,
        id: ItemId,
        passed: bool,
        requeue: Option<RequeueLocation>,
    ) -> Result<()> {
        self.queue(name)
            .await?
            .ack(tags, id, passed, requeue)
            .await
    }

    pub async fn stats(&self, name: &str) -> Result<QueueStats> {
        Ok(self.queue(name).await?.stats().await)
    }

    /// Dead letters of a queue; empty when it keeps none
    pub async fn dead_letters(&self, name: &str) -> Result<Vec<DeadLetter>> {
        let queue = self.queue(name).await?;
        Ok(match queue.dlq() {
            Some(dlq) => dlq.list().await,
            None => Vec::new(),
        })
    }

    /// Names of every registered queue, sorted
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Shut a queue down and unregister it
    pub async fn delete(&self, name: &str) -> Result<()> {
        let queue = self
            .queues
            .write()
            .await
            .remove(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        queue.shutdown().await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.forget_queue(name).await;
        }
        tracing::info!(queue = %name, "a3s.broker.manager: queue deleted");
        Ok(())
    }

    /// Shut every queue down. Consumers blocked on any subscription are released.
    pub async fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let queues: Vec<Arc<TagQueue>> = self.queues.read().await.values().cloned().collect();
        tracing::info!(queues = queues.len(), "a3s.broker.manager: shutting down");
        for queue in queues {
            queue.shutdown().await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventEmitter {
        &self.event_emitter
    }

    /// Get the metrics collector (if configured)
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&BrokerMetrics> {
        self.metrics.as_ref()
    }
}

/// Builder for a [`QueueManager`] with pre-created queues
pub struct QueueManagerBuilder {
    event_emitter: EventEmitter,
    queues: Vec<(String, QueueConfig)>,
    #[cfg(feature = "metrics")]
    metrics: Option<BrokerMetrics>,
}

impl QueueManagerBuilder {
    pub fn new(event_emitter: EventEmitter) -> Self {
        Self {
            event_emitter,
            queues: Vec::new(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Replace the event emitter with one of the given buffer capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_emitter = EventEmitter::new(capacity);
        self
    }

    /// Create a queue when the manager is built
    pub fn with_queue(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.push((name.into(), config));
        self
    }

    /// Add metrics collection
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: BrokerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> anyhow::Result<QueueManager> {
        #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
        let mut manager = QueueManager::new(self.event_emitter);
        #[cfg(feature = "metrics")]
        {
            manager.metrics = self.metrics;
        }

        for (name, config) in self.queues {
            manager
                .create_with(&name, config)
                .await
                .with_context(|| format!("failed to create queue '{}'", name))?;
        }
        Ok(manager)
    }
}

impl Default for QueueManagerBuilder {
    fn default() -> Self {
        Self::new(EventEmitter::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::events;
    use std::time::Duration;

    async fn make_manager() -> QueueManager {
        let manager = QueueManager::new(EventEmitter::new(100));
        manager.create("q", 5).await.unwrap();
        manager
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs.iter().copied().collect()
    }

    // ========================================================================
    // Builder Tests
    // ========================================================================

    #[tokio::test]
    async fn test_builder_creates_queues() {
        let manager = QueueManagerBuilder::new(EventEmitter::new(100))
            .with_queue("orders", QueueConfig::new(10).with_dead_letters(5))
            .with_queue("audit", QueueConfig::new(2))
            .build()
            .await
            .unwrap();

        assert_eq!(manager.queue_names().await, vec!["audit", "orders"]);
        let orders = manager.queue("orders").await.unwrap();
        assert!(orders.dlq().is_some());
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let err = QueueManagerBuilder::default()
            .with_queue("bad", QueueConfig::new(0))
            .build()
            .await
            .err()
            .expect("zero capacity must be rejected");
        assert!(err.to_string().contains("bad"));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_builder_with_metrics() {
        use crate::metrics::metric_names;

        let metrics = BrokerMetrics::local();
        let manager = QueueManagerBuilder::default()
            .with_event_capacity(16)
            .with_metrics(metrics.clone())
            .with_queue("q", QueueConfig::new(5))
            .build()
            .await
            .unwrap();
        assert!(manager.metrics().is_some());

        manager
            .enqueue("q", tags(&[("x", "1")]), b"a".to_vec(), false)
            .await
            .unwrap();
        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.counters.get(metric_names::ITEMS_ENQUEUED), Some(&1));

        manager.create("r", 5).await.unwrap();
        manager
            .enqueue("r", tags(&[("x", "1")]), b"b".to_vec(), false)
            .await
            .unwrap();
        let backend = metrics.backend();
        assert_eq!(backend.get_gauge(metric_names::QUEUE_TOTAL).await, Some(2.0));

        manager.delete("r").await.unwrap();
        assert_eq!(backend.get_gauge(metric_names::QUEUE_TOTAL).await, Some(1.0));
    }

    // ========================================================================
    // Create / lookup
    // ========================================================================

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let manager = make_manager().await;
        manager
            .enqueue("q", tags(&[("x", "1")]), b"a".to_vec(), false)
            .await
            .unwrap();

        manager.create("q", 100).await.unwrap();
        let stats = manager.stats("q").await.unwrap();
        assert_eq!(stats.max, 5);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let manager = make_manager().await;

        let err = manager
            .enqueue("missing", tags(&[("x", "1")]), vec![], false)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::QueueNotFound("missing".to_string()));
        assert!(manager.subscribe("missing", None).await.is_err());
        assert!(manager.ack("missing", &tags(&[("x", "1")]), 1, true, None).await.is_err());
        assert!(manager.stats("missing").await.is_err());
        assert!(manager.dead_letters("missing").await.is_err());
    }

    // ========================================================================
    // Routing
    // ========================================================================

    #[tokio::test]
    async fn test_enqueue_subscribe_ack_roundtrip() {
        let manager = make_manager().await;
        let set = tags(&[("region", "eu"), ("kind", "invoice")]);
        manager
            .enqueue("q", set.clone(), b"hello".to_vec(), false)
            .await
            .unwrap();

        let selection = [Selector::matches([("region", "eu")])];
        let subscription = manager.subscribe("q", Some(&selection)).await.unwrap();
        let reservation = tokio::time::timeout(Duration::from_secs(2), subscription.reserve())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let item = reservation.commit();
        assert_eq!(item.tags, set);

        manager.ack("q", &item.tags, item.id, true, None).await.unwrap();
        let stats = manager.stats("q").await.unwrap();
        assert_eq!(stats.total, 0);
        assert!(stats.tag_groups.is_empty());
    }

    #[tokio::test]
    async fn test_dead_letters() {
        let manager = QueueManager::new(EventEmitter::default());
        manager
            .create_with("q", QueueConfig::new(5).with_dead_letters(2))
            .await
            .unwrap();
        manager.create("plain", 5).await.unwrap();

        let set = tags(&[("x", "1")]);
        manager.enqueue("q", set.clone(), b"bad".to_vec(), false).await.unwrap();
        let subscription = manager.subscribe("q", None).await.unwrap();
        let item = subscription.reserve().await.unwrap().unwrap().commit();
        manager.ack("q", &set, item.id, false, None).await.unwrap();

        let letters = manager.dead_letters("q").await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, b"bad".to_vec());
        assert!(manager.dead_letters("plain").await.unwrap().is_empty());
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_delete_queue() {
        let manager = make_manager().await;
        let subscription = manager.subscribe("q", None).await.unwrap();

        manager.delete("q").await.unwrap();
        assert!(manager.queue_names().await.is_empty());
        assert!(subscription.recv().await.is_none());

        let err = manager.delete("q").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let manager = make_manager().await;
        let mut events_rx = manager.events().subscribe();
        let subscription = manager.subscribe("q", None).await.unwrap();

        manager.shutdown().await;
        assert!(manager.is_shutting_down());
        assert!(subscription.recv().await.is_none());

        let err = manager
            .enqueue("q", tags(&[("x", "1")]), vec![], false)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::ShutdownInProgress);
        assert_eq!(
            manager.create("other", 1).await.unwrap_err(),
            BrokerError::ShutdownInProgress
        );

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.key, events::QUEUE_SHUTDOWN);
        assert_eq!(event.queue, "q");
    }
}
