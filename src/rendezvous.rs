//! Rendezvous channels between tag group workers and consumers
//!
//! A channel never buffers items. Consumers park a *waiter slot* on one or
//! more channels; workers pop slots and try to hand a [`Delivery`] into them.
//! A slot holds a single `oneshot` sender, so when one consumer parks the same
//! slot on several channels, exactly one worker can take it: the first to
//! `take()` the sender wins and the copies left on the other channels become
//! stale and are skipped.
//!
//! Each channel keeps the wake handle of every worker publishing on it. Parking
//! a slot pokes all of them; `Notify::notify_one` stores a permit when the
//! worker is not waiting, so an arrival is never missed.

use crate::error::Result;
use crate::group::{Delivery, Reservation};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// What a channel delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Offers from the one tag group whose tag set equals the node's combination
    Strict,
    /// Offers from every tag group whose tag set contains the node's combination
    General,
    /// Offers from every tag group of the queue
    Global,
}

type Slot = Arc<Mutex<Option<oneshot::Sender<Delivery>>>>;

fn is_stale(slot: &Slot) -> bool {
    slot.lock().as_ref().map_or(true, |tx| tx.is_closed())
}

#[derive(Default)]
struct ChannelState {
    waiters: VecDeque<Slot>,
    publishers: HashMap<u64, Arc<Notify>>,
    closed: bool,
}

/// Unbuffered multi-producer, multi-consumer hand-off point
pub struct Rendezvous {
    kind: ChannelKind,
    state: Mutex<ChannelState>,
    subscribers: AtomicUsize,
}

impl Rendezvous {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(ChannelState::default()),
            subscribers: AtomicUsize::new(0),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Open a receive handle; it counts as live subscriber interest until dropped
    pub fn subscribe(self: &Arc<Self>) -> Receiver {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        Receiver {
            channel: Arc::clone(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn publisher_count(&self) -> usize {
        self.state.lock().publishers.len()
    }

    /// Consumers currently parked (stale slots included until pruned)
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// No receiver handle and no tag group publishing here
    pub fn is_idle(&self) -> bool {
        self.subscriber_count() == 0 && self.publisher_count() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Register a worker's wake handle. Wakes it at once if consumers wait.
    pub(crate) fn register_publisher(&self, group_id: u64, wake: Arc<Notify>) {
        let mut state = self.state.lock();
        let has_waiters = !state.waiters.is_empty();
        state.publishers.insert(group_id, Arc::clone(&wake));
        drop(state);
        if has_waiters {
            wake.notify_one();
        }
    }

    pub(crate) fn unregister_publisher(&self, group_id: u64) {
        self.state.lock().publishers.remove(&group_id);
    }

    /// Close the channel; parked consumers observe the closure
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.clear();
        state.publishers.clear();
    }

    /// Park a waiter slot. Returns false when the channel is closed.
    fn park(&self, slot: &Slot) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.waiters.retain(|w| !is_stale(w));
        state.waiters.push_back(Arc::clone(slot));
        let publishers: Vec<Arc<Notify>> = state.publishers.values().cloned().collect();
        drop(state);

        for wake in publishers {
            wake.notify_one();
        }
        true
    }

    /// Hand a delivery to the first live waiter, or give it back
    pub(crate) fn offer(&self, mut delivery: Delivery) -> std::result::Result<(), Delivery> {
        loop {
            let slot = match self.state.lock().waiters.pop_front() {
                Some(slot) => slot,
                None => return Err(delivery),
            };
            let sender = slot.lock().take();
            if let Some(tx) = sender {
                match tx.send(delivery) {
                    Ok(()) => return Ok(()),
                    Err(returned) => delivery = returned,
                }
            }
        }
    }
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("kind", &self.kind)
            .field("subscribers", &self.subscriber_count())
            .field("publishers", &self.publisher_count())
            .finish()
    }
}

/// Wait on several channels at once; the first offer on any of them wins
async fn receive_any<'a>(channels: impl Iterator<Item = &'a Arc<Rendezvous>>) -> Option<Delivery> {
    let (tx, rx) = oneshot::channel();
    let slot: Slot = Arc::new(Mutex::new(Some(tx)));
    for channel in channels {
        channel.park(&slot);
    }
    // Only the channels may keep the sender alive, so closing all of them
    // resolves `rx` with an error.
    drop(slot);
    rx.await.ok()
}

/// Receive-only handle on one rendezvous channel
#[derive(Debug)]
pub struct Receiver {
    channel: Arc<Rendezvous>,
}

impl Receiver {
    /// Wait for the next offer. `None` once the channel is closed.
    pub async fn recv(&self) -> Option<Delivery> {
        receive_any(std::iter::once(&self.channel)).await
    }

    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.channel.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The receivers returned by a subscription, consumed as one
#[derive(Debug)]
pub struct Subscription {
    receivers: Vec<Receiver>,
}

impl Subscription {
    pub(crate) fn new(receivers: Vec<Receiver>) -> Self {
        Self { receivers }
    }

    pub fn receivers(&self) -> &[Receiver] {
        &self.receivers
    }

    pub fn into_receivers(self) -> Vec<Receiver> {
        self.receivers
    }

    /// Wait for an offer on any of the subscription's channels.
    ///
    /// Returns `None` when every channel is closed.
    pub async fn recv(&self) -> Option<Delivery> {
        receive_any(self.receivers.iter().map(|r| &r.channel)).await
    }

    /// Receive and open offers until one yields a reservation.
    ///
    /// Returns `Ok(None)` when every channel is closed.
    pub async fn reserve(&self) -> Result<Option<Reservation>> {
        while let Some(delivery) = self.recv().await {
            if let Some(reservation) = delivery.open().await? {
                return Ok(Some(reservation));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_subscriber_count_tracks_receivers() {
        let channel = Rendezvous::new(ChannelKind::General);
        assert!(channel.is_idle());

        let a = channel.subscribe();
        let b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);
        assert!(!channel.is_idle());

        drop(a);
        drop(b);
        assert!(channel.is_idle());
    }

    #[test]
    fn test_publisher_registration() {
        let channel = Rendezvous::new(ChannelKind::Strict);
        channel.register_publisher(1, Arc::new(Notify::new()));
        channel.register_publisher(2, Arc::new(Notify::new()));
        assert_eq!(channel.publisher_count(), 2);
        assert!(!channel.is_idle());

        channel.unregister_publisher(1);
        channel.unregister_publisher(2);
        assert!(channel.is_idle());
    }

    #[tokio::test]
    async fn test_park_wakes_publisher() {
        let channel = Rendezvous::new(ChannelKind::General);
        let wake = Arc::new(Notify::new());
        channel.register_publisher(7, Arc::clone(&wake));

        let receiver = channel.subscribe();
        let pending = tokio::spawn(async move { receiver.recv().await.is_some() });

        tokio::time::timeout(Duration::from_secs(1), wake.notified())
            .await
            .expect("publisher woken by parked consumer");
        assert_eq!(channel.waiting(), 1);

        channel.close();
        assert!(!pending.await.unwrap());
    }

    #[tokio::test]
    async fn test_recv_on_closed_channel_returns_none() {
        let channel = Rendezvous::new(ChannelKind::Global);
        let receiver = channel.subscribe();
        channel.close();
        assert!(receiver.is_closed());
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_pruned() {
        let channel = Rendezvous::new(ChannelKind::General);
        let receiver = channel.subscribe();

        let attempt = tokio::time::timeout(Duration::from_millis(10), receiver.recv()).await;
        assert!(attempt.is_err());
        assert_eq!(channel.waiting(), 1);

        // Parking again prunes the slot left by the cancelled wait.
        let _ = tokio::time::timeout(Duration::from_millis(10), receiver.recv()).await;
        assert_eq!(channel.waiting(), 1);
    }
}
