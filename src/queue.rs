//! Tag-addressable queue
//!
//! A [`TagQueue`] routes producers and consumers through a shared
//! [`TagIndex`]. Enqueue fans an item's tag set out into every
//! sub-combination so that consumers subscribed on any subset are reachable
//! by the item's tag group without scanning subscriptions. ACK resolves the
//! item by exact tag set and garbage-collects the tag group and its index
//! nodes once nothing references them.

use crate::config::QueueConfig;
use crate::counter::AdmissionCounter;
use crate::dlq::{DeadLetter, DeadLetterQueue};
use crate::error::{BrokerError, Result};
use crate::event::{events, BrokerEvent, EventEmitter};
use crate::group::{Acked, Deposit, ItemId, RequeueLocation, TagGroup};
use crate::index::{TagIndex, TagNode};
#[cfg(feature = "metrics")]
use crate::metrics::BrokerMetrics;
use crate::rendezvous::{ChannelKind, Rendezvous, Subscription};
use crate::tags::{MatchMode, Selector, TagCombination, TagSet};
use crate::QueueStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Attempts to retire an emptied tag group before leaving it for a later ACK
const COLLECT_ATTEMPTS: usize = 8;

/// State shared by a queue and all of its tag groups
pub(crate) struct QueueContext {
    pub(crate) name: String,
    pub(crate) counter: AdmissionCounter,
    pub(crate) emitter: EventEmitter,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Option<BrokerMetrics>,
}

impl QueueContext {
    fn new(name: String, max_size: usize, emitter: EventEmitter) -> Self {
        Self {
            name,
            counter: AdmissionCounter::new(max_size),
            emitter,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Context with a private event channel, for exercising tag groups alone
    #[cfg(test)]
    pub(crate) fn detached(name: &str, max_size: usize) -> Self {
        Self::new(name.to_string(), max_size, EventEmitter::default())
    }
}

enum Collect {
    Retired(Arc<TagGroup>),
    Busy,
    Gone,
}

/// Outcome of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enqueued {
    /// Stored as a new item under this ID
    Admitted(ItemId),
    /// Written over the updateable tail item with this ID
    Collapsed(ItemId),
}

impl Enqueued {
    pub fn id(&self) -> ItemId {
        match self {
            Enqueued::Admitted(id) | Enqueued::Collapsed(id) => *id,
        }
    }
}

/// A named queue of tag groups
pub struct TagQueue {
    ctx: Arc<QueueContext>,
    config: QueueConfig,
    index: TagIndex,
    global: Arc<Rendezvous>,
    next_group_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    dlq: Option<DeadLetterQueue>,
}

impl TagQueue {
    pub fn new(
        name: impl Into<String>,
        config: QueueConfig,
        event_emitter: EventEmitter,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = QueueContext::new(name.into(), config.max_size, event_emitter);
        Ok(Self::from_context(ctx, config))
    }

    /// Create a queue that records into `metrics`
    #[cfg(feature = "metrics")]
    pub fn with_metrics(
        name: impl Into<String>,
        config: QueueConfig,
        event_emitter: EventEmitter,
        metrics: BrokerMetrics,
    ) -> Result<Self> {
        config.validate()?;
        let mut ctx = QueueContext::new(name.into(), config.max_size, event_emitter);
        ctx.metrics = Some(metrics);
        Ok(Self::from_context(ctx, config))
    }

    fn from_context(ctx: QueueContext, config: QueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let dlq = config.dead_letter_capacity.map(DeadLetterQueue::new);

        tracing::info!(
            queue = %ctx.name,
            max_size = config.max_size,
            "a3s.broker.queue: created"
        );
        ctx.emitter
            .emit(BrokerEvent::empty(events::QUEUE_CREATED, &ctx.name));

        Self {
            ctx: Arc::new(ctx),
            config,
            index: TagIndex::new(),
            global: Rendezvous::new(ChannelKind::Global),
            next_group_id: AtomicU64::new(1),
            shutdown,
            dlq,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn dlq(&self) -> Option<&DeadLetterQueue> {
        self.dlq.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShutdownInProgress);
        }
        Ok(())
    }

    /// Store an item under its exact tag set.
    ///
    /// When the tail item of the tag group is updateable, the payload is
    /// written over it instead and the admission counter is left alone.
    pub async fn enqueue(
        &self,
        tags: TagSet,
        payload: Vec<u8>,
        updateable: bool,
    ) -> Result<Enqueued> {
        self.ensure_running()?;
        tags.validate(self.config.max_tags)?;

        let combination = tags.to_combination();
        let mut payload = payload;
        loop {
            let group = match self.index.tag_group(&combination) {
                Some(group) => group,
                None => self.resolve_group(&tags)?,
            };

            match group.deposit(payload, updateable).await {
                Ok(Deposit::Admitted(id)) => {
                    self.ctx.emitter.emit(BrokerEvent::tag_group(
                        events::ITEM_ENQUEUED,
                        &self.ctx.name,
                        &tags,
                        Some(id),
                    ));
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.record_enqueue(&self.ctx.name).await;
                        metrics
                            .set_queue_total(&self.ctx.name, self.ctx.counter.total())
                            .await;
                    }
                    return Ok(Enqueued::Admitted(id));
                }
                Ok(Deposit::Collapsed(id)) => {
                    self.ctx.emitter.emit(BrokerEvent::tag_group(
                        events::ITEM_COLLAPSED,
                        &self.ctx.name,
                        &tags,
                        Some(id),
                    ));
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.record_collapse(&self.ctx.name).await;
                    }
                    return Ok(Enqueued::Collapsed(id));
                }
                // Collected between lookup and deposit
                Ok(Deposit::Retired(returned)) => payload = returned,
                Err(e) => {
                    if e.is_capacity() {
                        tracing::warn!(
                            queue = %self.ctx.name,
                            tags = %tags,
                            "a3s.broker.queue: full, item rejected"
                        );
                        self.ctx.emitter.emit(BrokerEvent::tag_group(
                            events::ITEM_REJECTED,
                            &self.ctx.name,
                            &tags,
                            None,
                        ));
                        #[cfg(feature = "metrics")]
                        if let Some(metrics) = &self.ctx.metrics {
                            metrics.record_rejected(&self.ctx.name).await;
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Find or build the tag group for `tags`, registering it on every
    /// ancestor combination's general channel.
    fn resolve_group(&self, tags: &TagSet) -> Result<Arc<TagGroup>> {
        let combinations = tags.combinations();
        let (exact, ancestors) = combinations
            .split_last()
            .ok_or_else(|| BrokerError::InvalidTags("tag set is empty".to_string()))?;

        let group_id = self.next_group_id.fetch_add(1, Ordering::SeqCst);
        let wake = Arc::new(Notify::new());

        // Registering inside the index callback pins each ancestor node
        // against collection until the group exists.
        let mut ancestor_channels = Vec::with_capacity(ancestors.len());
        for combination in ancestors {
            let channel = self.index.upsert(combination, |node| {
                let channel = Arc::clone(node.general_channel());
                channel.register_publisher(group_id, Arc::clone(&wake));
                Ok(channel)
            })?;
            ancestor_channels.push(channel);
        }

        let resolved = self.index.upsert(exact, |node| {
            if let Some(existing) = node.tag_group() {
                return Ok((Arc::clone(existing), false));
            }
            let mut channels = Vec::with_capacity(ancestor_channels.len() + 3);
            channels.push(node.strict_channel());
            channels.push(Arc::clone(node.general_channel()));
            channels.extend(ancestor_channels.iter().cloned());
            channels.push(Arc::clone(&self.global));

            let group = TagGroup::new(
                group_id,
                tags.clone(),
                Arc::clone(&wake),
                channels,
                Arc::clone(&self.ctx),
            );
            group.start(self.shutdown.subscribe());
            node.set_tag_group(Arc::clone(&group));
            Ok((group, true))
        });

        let created = matches!(resolved, Ok((_, true)));
        if !created {
            for channel in &ancestor_channels {
                channel.unregister_publisher(group_id);
            }
            if resolved.is_err() {
                for combination in ancestors {
                    self.index.delete(combination, TagNode::is_unreferenced);
                }
            }
        }
        let (group, _) = resolved?;

        if created {
            tracing::debug!(
                queue = %self.ctx.name,
                tags = %tags,
                group_id,
                "a3s.broker.tag_group: created"
            );
            self.ctx.emitter.emit(BrokerEvent::tag_group(
                events::TAG_GROUP_CREATED,
                &self.ctx.name,
                tags,
                None,
            ));
        }
        Ok(group)
    }

    /// Open receivers for a selection.
    ///
    /// `None` or an empty selection subscribes to the global channel. Each
    /// exact entry subscribes to the strict channel of its combination and
    /// each matches entry to the general channel. Channels exist before any
    /// tag group does; an early subscriber waits until one is created.
    pub fn subscribe(&self, selection: Option<&[Selector]>) -> Result<Subscription> {
        self.ensure_running()?;

        let selectors = selection.unwrap_or_default();
        if selectors.is_empty() {
            return Ok(Subscription::new(vec![self.global.subscribe()]));
        }

        for selector in selectors {
            selector
                .tags
                .validate(self.config.max_tags)
                .map_err(|e| BrokerError::InvalidSelection(e.to_string()))?;
        }

        let mut receivers = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let combination = selector.tags.to_combination();
            let receiver = self.index.upsert(&combination, |node| {
                Ok(match selector.mode {
                    MatchMode::Exact => node.strict_channel().subscribe(),
                    MatchMode::Matches => node.general_channel().subscribe(),
                })
            })?;
            receivers.push(receiver);
        }
        Ok(Subscription::new(receivers))
    }

    /// Resolve a delivered item of the tag group whose tag set equals `tags`.
    ///
    /// `passed` removes it. A failure with a requeue location makes it ready
    /// again at that end of the group; a failure without one removes it and
    /// hands it to the dead-letter queue when one is configured.
    pub async fn ack(
        &self,
        tags: &TagSet,
        id: ItemId,
        passed: bool,
        requeue: Option<RequeueLocation>,
    ) -> Result<()> {
        self.ensure_running()?;
        tags.validate(self.config.max_tags)?;

        let group = self
            .index
            .tag_group(&tags.to_combination())
            .ok_or_else(|| BrokerError::TagGroupNotFound(tags.to_string()))?;
        let (outcome, emptied) = group.acknowledge(id, passed, requeue).await?;

        match outcome {
            Acked::Passed => {
                self.ctx.emitter.emit(BrokerEvent::tag_group(
                    events::ITEM_ACKED,
                    &self.ctx.name,
                    tags,
                    Some(id),
                ));
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_ack(&self.ctx.name).await;
                }
            }
            Acked::Requeued(location) => {
                tracing::debug!(
                    queue = %self.ctx.name,
                    tags = %tags,
                    item_id = id,
                    location = ?location,
                    "a3s.broker.ack: requeued"
                );
                self.ctx.emitter.emit(BrokerEvent::tag_group(
                    events::ITEM_REQUEUED,
                    &self.ctx.name,
                    tags,
                    Some(id),
                ));
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_requeue(&self.ctx.name).await;
                }
            }
            Acked::Failed(item) => {
                tracing::warn!(
                    queue = %self.ctx.name,
                    tags = %tags,
                    item_id = id,
                    "a3s.broker.ack: permanently failed"
                );
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_failure(&self.ctx.name).await;
                }
                if let Some(dlq) = &self.dlq {
                    dlq.push(DeadLetter {
                        queue: self.ctx.name.clone(),
                        tags: item.tags,
                        item_id: item.id,
                        payload: item.payload,
                        failed_at: chrono::Utc::now(),
                    })
                    .await;
                    self.ctx.emitter.emit(BrokerEvent::tag_group(
                        events::ITEM_DEAD_LETTERED,
                        &self.ctx.name,
                        tags,
                        Some(id),
                    ));
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.ctx.metrics {
                        metrics.record_dead_letter(&self.ctx.name).await;
                    }
                }
            }
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.ctx.metrics {
            metrics
                .set_queue_total(&self.ctx.name, self.ctx.counter.total())
                .await;
        }

        if emptied {
            self.collect(&group).await;
        }
        Ok(())
    }

    /// Remove an emptied tag group and every index node left unreferenced
    async fn collect(&self, group: &Arc<TagGroup>) {
        let combination = group.tags().to_combination();
        for _ in 0..COLLECT_ATTEMPTS {
            let attempt = self
                .index
                .update(&combination, |node| {
                    let owned = node
                        .tag_group()
                        .map_or(false, |current| Arc::ptr_eq(current, group));
                    if !owned {
                        return Collect::Gone;
                    }
                    if !group.try_retire() {
                        return Collect::Busy;
                    }
                    node.take_tag_group()
                        .map_or(Collect::Gone, Collect::Retired)
                })
                .unwrap_or(Collect::Gone);

            match attempt {
                Collect::Retired(retired) => {
                    self.remove_nodes(&retired);
                    return;
                }
                // Refilled, or the worker holds the lock for a moment
                Collect::Busy => tokio::task::yield_now().await,
                Collect::Gone => return,
            }
        }
        // Still busy: the empty group keeps reporting 0/0 in stats until a
        // later ACK empties it again and collects it.
        tracing::debug!(
            queue = %self.ctx.name,
            tags = %group.tags(),
            "a3s.broker.tag_group: collection deferred"
        );
    }

    fn remove_nodes(&self, group: &Arc<TagGroup>) {
        group.stop();
        let mut removed = 0usize;
        for combination in group.tags().combinations() {
            if self.index.delete(&combination, TagNode::is_unreferenced) {
                removed += 1;
            }
        }
        tracing::debug!(
            queue = %self.ctx.name,
            tags = %group.tags(),
            nodes_removed = removed,
            "a3s.broker.tag_group: removed"
        );
        self.ctx.emitter.emit(BrokerEvent::tag_group(
            events::TAG_GROUP_REMOVED,
            &self.ctx.name,
            group.tags(),
            None,
        ));
    }

    /// Per tag group ready/processing counts plus the queue totals
    pub async fn stats(&self) -> QueueStats {
        let mut tag_groups = Vec::new();
        for group in self.index.tag_groups() {
            tag_groups.push(group.stats().await);
        }
        tag_groups.sort_by_cached_key(|stats| stats.tags.to_combination());

        QueueStats {
            name: self.ctx.name.clone(),
            max: self.ctx.counter.max(),
            total: self.ctx.counter.total(),
            tag_groups,
        }
    }

    /// Outstanding items: ready plus processing across all tag groups
    pub fn total(&self) -> usize {
        self.ctx.counter.total()
    }

    /// Live tag group for an exact tag set
    pub fn tag_group(&self, tags: &TagSet) -> Option<Arc<TagGroup>> {
        self.index.tag_group(&tags.to_combination())
    }

    /// Whether the index holds a node for `combination`
    pub fn has_node(&self, combination: &TagCombination) -> bool {
        self.index.contains(combination)
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    /// Stop every worker and close every channel.
    ///
    /// Consumers blocked on a subscription observe the closure. Later
    /// operations fail with [`BrokerError::ShutdownInProgress`].
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        tracing::info!(queue = %self.ctx.name, "a3s.broker.queue: shutting down");
        self.ctx
            .emitter
            .emit(BrokerEvent::empty(events::QUEUE_SHUTDOWN, &self.ctx.name));

        self.global.close();
        for channel in self.index.channels() {
            channel.close();
        }
        for group in self.index.tag_groups() {
            group.join().await;
        }
    }
}

impl std::fmt::Debug for TagQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagQueue")
            .field("name", &self.ctx.name)
            .field("config", &self.config)
            .field("nodes", &self.index.len())
            .finish()
    }
}
