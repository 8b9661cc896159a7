//! Readiness notifier between producers and a tag group worker
//!
//! Level-triggered and coalescing: any number of [`ReadinessNotifier::add`]
//! calls made while the worker is busy collapse into a single pending wake-up.
//! The worker re-checks its own state after every wake-up, so coalescing never
//! loses work.

use crate::error::{BrokerError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Multi-producer, single-consumer wake-up signal
#[derive(Debug, Default)]
pub struct ReadinessNotifier {
    notify: Notify,
    stopped: AtomicBool,
}

impl ReadinessNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal readiness. Fails once the notifier has been stopped.
    pub fn add(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BrokerError::ShutdownInProgress);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next signal. Returns `false` once stopped.
    pub async fn ready(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.notify.notified().await;
        !self.is_stopped()
    }

    /// Refuse further signals; a pending wake-up is still delivered
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Refuse further signals and release a waiter blocked in `ready`
    pub fn force_stop(&self) {
        self.stop();
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
