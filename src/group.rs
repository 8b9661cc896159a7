//! Tag groups: the FIFO store and delivery worker for one exact tag set
//!
//! # Worker protocol
//!
//! Each tag group runs one worker task for its whole lifetime:
//!
//! ```text
//!   Idle ──ready──▶ Offering ──consumer takes offer──▶ Reserved
//!    ▲                                                     │
//!    └──────── commit / abort / offer dropped ─────────────┘
//!   any state ──shutdown or stop──▶ Terminated
//! ```
//!
//! While *offering*, the worker tries to hand a [`Delivery`] to a consumer
//! parked on any of its channels: its own strict and general channels, the
//! general channel of every sub-combination of its tag set, and the queue's
//! global channel. Exactly one consumer wins. The worker then waits until the
//! delivery settles before offering again, so a group has at most one offer
//! in flight and its items leave strictly in FIFO order.
//!
//! Opening a delivery takes the group lock and keeps it inside the returned
//! [`Reservation`] until the consumer commits or aborts. Enqueue and ACK on the
//! same group wait for that window to close.

use crate::error::{BrokerError, Result};
use crate::event::{events, BrokerEvent};
use crate::notifier::ReadinessNotifier;
use crate::queue::QueueContext;
use crate::rendezvous::Rendezvous;
use crate::tags::TagSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Item identifier, unique within one tag group's lifetime
pub type ItemId = u64;

/// Where a failed item goes back into its tag group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueLocation {
    Front,
    End,
}

/// An item handed to a consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub tags: TagSet,
    pub payload: Vec<u8>,
    pub updateable: bool,
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle = 0,
    Offering = 1,
    Reserved = 2,
    Terminated = 3,
}

impl From<u8> for WorkerState {
    fn from(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Offering,
            2 => WorkerState::Reserved,
            _ => WorkerState::Terminated,
        }
    }
}

/// Ready/processing counts for one tag group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagGroupStats {
    pub tags: TagSet,
    pub ready: usize,
    pub processing: usize,
}

struct StoredItem {
    payload: Vec<u8>,
    updateable: bool,
    enqueued_at: Instant,
}

#[derive(Default)]
pub(crate) struct GroupState {
    /// IDs waiting for delivery, head first
    available: VecDeque<ItemId>,
    /// Delivered, awaiting ACK
    in_flight: HashSet<ItemId>,
    items: HashMap<ItemId, StoredItem>,
    next_id: ItemId,
    retired: bool,
}

impl GroupState {
    fn ready(&self) -> usize {
        self.available.len()
    }

    fn processing(&self) -> usize {
        self.in_flight.len()
    }

    fn is_empty(&self) -> bool {
        self.available.is_empty() && self.in_flight.is_empty()
    }
}

/// Result of depositing an item into a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Deposit {
    Admitted(ItemId),
    /// Payload written over the updateable tail item
    Collapsed(ItemId),
    /// Group was garbage-collected after lookup; the payload comes back so
    /// the caller can re-resolve the group
    Retired(Vec<u8>),
}

/// Result of an ACK against a group
#[derive(Debug)]
pub(crate) enum Acked {
    Passed,
    Requeued(RequeueLocation),
    /// Permanently failed; the item left the group
    Failed(Item),
}

/// How an offer ended, reported back to the worker
#[derive(Debug)]
enum Settlement {
    Committed { waited: Duration },
    Aborted,
}

/// FIFO store and worker for one exact tag set
pub struct TagGroup {
    id: u64,
    tags: TagSet,
    state: Arc<Mutex<GroupState>>,
    notifier: ReadinessNotifier,
    wake: Arc<Notify>,
    /// Own strict channel, own general channel, then ancestors and global
    channels: Vec<Arc<Rendezvous>>,
    stop: watch::Sender<bool>,
    phase: AtomicU8,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    ctx: Arc<QueueContext>,
}

impl TagGroup {
    /// Build a group publishing on `channels` and register it on each of them.
    ///
    /// `wake` must be the handle already registered on any channel pinned
    /// before the group existed.
    pub(crate) fn new(
        id: u64,
        tags: TagSet,
        wake: Arc<Notify>,
        channels: Vec<Arc<Rendezvous>>,
        ctx: Arc<QueueContext>,
    ) -> Arc<Self> {
        for channel in &channels {
            channel.register_publisher(id, Arc::clone(&wake));
        }
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            id,
            tags,
            state: Arc::new(Mutex::new(GroupState {
                next_id: 1,
                ..GroupState::default()
            })),
            notifier: ReadinessNotifier::new(),
            wake,
            channels,
            stop,
            phase: AtomicU8::new(WorkerState::Idle as u8),
            worker: parking_lot::Mutex::new(None),
            ctx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn worker_state(&self) -> WorkerState {
        WorkerState::from(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, state: WorkerState) {
        self.phase.store(state as u8, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> TagGroupStats {
        let state = self.state.lock().await;
        TagGroupStats {
            tags: self.tags.clone(),
            ready: state.ready(),
            processing: state.processing(),
        }
    }

    /// Spawn the worker
    pub(crate) fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let handle = tokio::spawn(Arc::clone(self).run(shutdown));
        *self.worker.lock() = Some(handle);
    }

    /// Store an item, collapsing it onto an updateable tail item.
    ///
    /// The collapse test looks at the flag of the item already queued, not
    /// the incoming one.
    pub(crate) async fn deposit(&self, payload: Vec<u8>, updateable: bool) -> Result<Deposit> {
        let mut state = self.state.lock().await;
        if state.retired {
            return Ok(Deposit::Retired(payload));
        }

        let tail = state.available.back().copied();
        if let Some(tail) = tail {
            if let Some(item) = state.items.get_mut(&tail) {
                if item.updateable {
                    item.payload = payload;
                    return Ok(Deposit::Collapsed(tail));
                }
            }
        }

        if !self.ctx.counter.add() {
            return Err(BrokerError::QueueFull {
                name: self.ctx.name.clone(),
                max: self.ctx.counter.max(),
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        state.available.push_back(id);
        state.items.insert(
            id,
            StoredItem {
                payload,
                updateable,
                enqueued_at: Instant::now(),
            },
        );
        drop(state);

        // Only fails once the worker is shutting down.
        let _ = self.notifier.add();
        Ok(Deposit::Admitted(id))
    }

    /// Resolve a delivered item.
    ///
    /// Returns the outcome and whether the group is now empty.
    pub(crate) async fn acknowledge(
        &self,
        id: ItemId,
        passed: bool,
        requeue: Option<RequeueLocation>,
    ) -> Result<(Acked, bool)> {
        let mut state = self.state.lock().await;
        if !state.in_flight.remove(&id) {
            return Err(BrokerError::ItemNotFound {
                id,
                tags: self.tags.to_string(),
            });
        }

        let outcome = match (passed, requeue) {
            (true, _) => {
                state.items.remove(&id);
                self.ctx.counter.decrement();
                Acked::Passed
            }
            (false, Some(location)) => {
                match location {
                    RequeueLocation::Front => state.available.push_front(id),
                    RequeueLocation::End => state.available.push_back(id),
                }
                let _ = self.notifier.add();
                Acked::Requeued(location)
            }
            (false, None) => {
                let stored = state.items.remove(&id);
                self.ctx.counter.decrement();
                let (payload, updateable) = stored
                    .map(|s| (s.payload, s.updateable))
                    .unwrap_or_default();
                Acked::Failed(Item {
                    id,
                    tags: self.tags.clone(),
                    payload,
                    updateable,
                })
            }
        };
        Ok((outcome, state.is_empty()))
    }

    /// Mark the group retired if it holds nothing and nobody holds its lock.
    ///
    /// Synchronous so it can run inside an index predicate.
    pub(crate) fn try_retire(&self) -> bool {
        match self.state.try_lock() {
            Ok(mut state) if state.is_empty() && !state.retired => {
                state.retired = true;
                true
            }
            _ => false,
        }
    }

    /// Withdraw from every channel and stop the worker
    pub(crate) fn stop(&self) {
        for channel in &self.channels {
            channel.unregister_publisher(self.id);
        }
        self.stop.send_replace(true);
    }

    /// Wait for the worker task to exit
    pub(crate) async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn has_ready(&self) -> bool {
        let state = self.state.lock().await;
        !state.retired && !state.available.is_empty()
    }

    fn hand_off(&self, mut delivery: Delivery) -> std::result::Result<(), Delivery> {
        for channel in &self.channels {
            match channel.offer(delivery) {
                Ok(()) => return Ok(()),
                Err(returned) => delivery = returned,
            }
        }
        Err(delivery)
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut stop = self.stop.subscribe();
        tracing::debug!(
            queue = %self.ctx.name,
            tags = %self.tags,
            "a3s.broker.worker: started"
        );

        loop {
            if !self.has_ready().await {
                self.set_phase(WorkerState::Idle);
                let woke = tokio::select! {
                    _ = signalled(&mut shutdown) => false,
                    _ = signalled(&mut stop) => false,
                    ready = self.notifier.ready() => ready,
                };
                if !woke {
                    break;
                }
                continue;
            }

            self.set_phase(WorkerState::Offering);
            let (settled_tx, settled_rx) = oneshot::channel();
            let mut delivery = Delivery {
                group: Arc::clone(&self),
                settled: Some(settled_tx),
            };
            let handed_off = loop {
                match self.hand_off(delivery) {
                    Ok(()) => break true,
                    Err(returned) => delivery = returned,
                }
                let keep_offering = tokio::select! {
                    _ = signalled(&mut shutdown) => false,
                    _ = signalled(&mut stop) => false,
                    _ = self.wake.notified() => true,
                };
                if !keep_offering {
                    break false;
                }
            };
            if !handed_off {
                break;
            }

            self.set_phase(WorkerState::Reserved);
            let settlement = tokio::select! {
                _ = signalled(&mut shutdown) => break,
                _ = signalled(&mut stop) => break,
                settlement = settled_rx => settlement.ok(),
            };
            self.report(settlement).await;
        }

        self.terminate(*shutdown.borrow());
    }

    async fn report(&self, settlement: Option<Settlement>) {
        match settlement {
            Some(Settlement::Committed { waited }) => {
                self.ctx.emitter.emit(BrokerEvent::tag_group(
                    events::ITEM_DELIVERED,
                    &self.ctx.name,
                    &self.tags,
                    None,
                ));
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.ctx.metrics {
                    metrics
                        .record_delivered(&self.ctx.name, waited.as_secs_f64() * 1000.0)
                        .await;
                }
                #[cfg(not(feature = "metrics"))]
                let _ = waited;
            }
            Some(Settlement::Aborted) => {
                self.ctx.emitter.emit(BrokerEvent::tag_group(
                    events::ITEM_REDELIVERY,
                    &self.ctx.name,
                    &self.tags,
                    None,
                ));
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_redelivery(&self.ctx.name).await;
                }
            }
            // Offer dropped unopened, or opened after the head was gone.
            None => {}
        }
    }

    fn terminate(&self, shutting_down: bool) {
        self.set_phase(WorkerState::Terminated);
        for channel in &self.channels {
            channel.unregister_publisher(self.id);
        }
        if shutting_down {
            for own in self.channels.iter().take(2) {
                own.close();
            }
        }
        self.notifier.force_stop();
        tracing::debug!(
            queue = %self.ctx.name,
            tags = %self.tags,
            "a3s.broker.worker: terminated"
        );
    }
}

impl std::fmt::Debug for TagGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagGroup")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("worker", &self.worker_state())
            .finish()
    }
}

/// Resolves once the watched flag is set or its sender is gone
async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// An offer won by a consumer: the head of one tag group, not yet read.
///
/// Opening it locks the group. Dropping it unopened hands the head back to
/// the worker, which offers it again.
pub struct Delivery {
    group: Arc<TagGroup>,
    settled: Option<oneshot::Sender<Settlement>>,
}

impl Delivery {
    /// Tag set of the offering group
    pub fn tags(&self) -> &TagSet {
        &self.group.tags
    }

    /// Lock the group and reserve its head item.
    ///
    /// Returns `Ok(None)` when the head was consumed before the offer was
    /// opened; the consumer should wait for the next offer.
    pub async fn open(mut self) -> Result<Option<Reservation>> {
        let guard = Arc::clone(&self.group.state).lock_owned().await;
        let head = match guard.available.front() {
            Some(&id) if !guard.retired => id,
            _ => return Ok(None),
        };
        let stored = guard.items.get(&head).ok_or_else(|| {
            BrokerError::Internal(format!(
                "head ID {} missing from tag group {}",
                head, self.group.tags
            ))
        })?;

        let item = Item {
            id: head,
            tags: self.group.tags.clone(),
            payload: stored.payload.clone(),
            updateable: stored.updateable,
        };
        let enqueued_at = stored.enqueued_at;
        Ok(Some(Reservation {
            guard: Some(guard),
            group: Arc::clone(&self.group),
            item,
            enqueued_at,
            settled: self.settled.take(),
        }))
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tags", &self.group.tags)
            .finish()
    }
}

/// A head item reserved for transmission.
///
/// Holds the tag group lock until [`commit`](Reservation::commit) or
/// [`abort`](Reservation::abort). Dropping it unresolved aborts.
pub struct Reservation {
    guard: Option<OwnedMutexGuard<GroupState>>,
    group: Arc<TagGroup>,
    item: Item,
    enqueued_at: Instant,
    settled: Option<oneshot::Sender<Settlement>>,
}

impl Reservation {
    pub fn item(&self) -> &Item {
        &self.item
    }

    /// Transmission succeeded: the item moves from ready to processing
    /// and now awaits an ACK.
    pub fn commit(mut self) -> Item {
        if let Some(mut state) = self.guard.take() {
            if let Some(id) = state.available.pop_front() {
                state.in_flight.insert(id);
            }
        }
        if let Some(tx) = self.settled.take() {
            let _ = tx.send(Settlement::Committed {
                waited: self.enqueued_at.elapsed(),
            });
        }
        std::mem::take(&mut self.item)
    }

    /// Transmission failed: the same head item is offered again
    pub fn abort(mut self) {
        self.release_failed();
    }

    fn release_failed(&mut self) {
        if self.guard.take().is_none() {
            return;
        }
        let _ = self.group.notifier.add();
        if let Some(tx) = self.settled.take() {
            let _ = tx.send(Settlement::Aborted);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_failed();
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("item", &self.item)
            .finish()
    }
}
