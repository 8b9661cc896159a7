//! Metrics collection for broker observability.
//!
//! A pluggable [`MetricsBackend`] with an in-memory [`LocalMetrics`] default.
//! [`BrokerMetrics`] records every counter twice: once globally and once
//! suffixed with the queue name (`broker.items.enqueued.orders`).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A pluggable metrics backend trait.
///
/// Implement this trait to bridge into Prometheus, OpenTelemetry or any
/// other metrics system.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn increment_counter(&self, name: &str, value: u64);

    async fn set_gauge(&self, name: &str, value: f64);

    /// Record a histogram observation (milliseconds for latencies)
    async fn record_histogram(&self, name: &str, value: f64);

    async fn get_counter(&self, name: &str) -> Option<u64>;

    async fn get_gauge(&self, name: &str) -> Option<f64>;

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats>;

    async fn reset(&self);

    async fn snapshot(&self) -> MetricsSnapshot;
}

/// Statistics for a histogram metric
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p99: f64,
}

impl HistogramStats {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let sum: f64 = sorted.iter().sum();
        let count = sorted.len();
        let at = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];
        Self {
            count: count as u64,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sum / count as f64,
            p50: at(0.50),
            p99: at(0.99),
        }
    }
}

/// Snapshot of all metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramStats>,
}

#[derive(Default)]
struct LocalStore {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
}

/// Local in-memory metrics backend.
///
/// Histogram observations are kept raw and summarised on read, which suits
/// tests and single-instance deployments.
#[derive(Default)]
pub struct LocalMetrics {
    store: RwLock<LocalStore>,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsBackend for LocalMetrics {
    async fn increment_counter(&self, name: &str, value: u64) {
        let mut store = self.store.write().await;
        *store.counters.entry(name.to_string()).or_insert(0) += value;
    }

    async fn set_gauge(&self, name: &str, value: f64) {
        self.store
            .write()
            .await
            .gauges
            .insert(name.to_string(), value);
    }

    async fn record_histogram(&self, name: &str, value: f64) {
        let mut store = self.store.write().await;
        store
            .histograms
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    async fn get_counter(&self, name: &str) -> Option<u64> {
        self.store.read().await.counters.get(name).copied()
    }

    async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.store.read().await.gauges.get(name).copied()
    }

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats> {
        let store = self.store.read().await;
        store
            .histograms
            .get(name)
            .map(|values| HistogramStats::from_values(values))
    }

    async fn reset(&self) {
        *self.store.write().await = LocalStore::default();
    }

    async fn snapshot(&self) -> MetricsSnapshot {
        let store = self.store.read().await;
        MetricsSnapshot {
            counters: store.counters.clone(),
            gauges: store.gauges.clone(),
            histograms: store
                .histograms
                .iter()
                .map(|(k, v)| (k.clone(), HistogramStats::from_values(v)))
                .collect(),
        }
    }
}

/// Predefined metric names
pub mod metric_names {
    /// Counter: items admitted by the admission counter
    pub const ITEMS_ENQUEUED: &str = "broker.items.enqueued";
    /// Counter: enqueues collapsed onto an updateable tail item
    pub const ITEMS_COLLAPSED: &str = "broker.items.collapsed";
    /// Counter: enqueues refused because the queue was full
    pub const ITEMS_REJECTED: &str = "broker.items.rejected";
    /// Counter: reservations committed by consumers
    pub const ITEMS_DELIVERED: &str = "broker.items.delivered";
    /// Counter: reservations aborted and offered again
    pub const ITEMS_REDELIVERED: &str = "broker.items.redelivered";
    /// Counter: items acknowledged as passed
    pub const ITEMS_ACKED: &str = "broker.items.acked";
    /// Counter: failed items put back on their tag group
    pub const ITEMS_REQUEUED: &str = "broker.items.requeued";
    /// Counter: failed items removed without requeue
    pub const ITEMS_FAILED: &str = "broker.items.failed";
    /// Counter: permanently failed items kept in a dead-letter queue
    pub const ITEMS_DEAD_LETTERED: &str = "broker.items.dead_lettered";

    /// Gauge: admitted items not yet terminally removed, summed over queues;
    /// suffixed with a queue name for that queue alone
    pub const QUEUE_TOTAL: &str = "broker.queue.total";

    /// Histogram: time from enqueue to committed delivery (ms)
    pub const ITEM_WAIT_TIME: &str = "broker.item.wait_time_ms";
}

/// Broker metrics collector wrapping a backend
#[derive(Clone)]
pub struct BrokerMetrics {
    backend: Arc<dyn MetricsBackend>,
    /// Last reported total per queue, summed into the global gauge
    totals: Arc<parking_lot::Mutex<HashMap<String, usize>>>,
}

impl BrokerMetrics {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend,
            totals: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// Collector over a fresh [`LocalMetrics`]
    pub fn local() -> Self {
        Self::new(Arc::new(LocalMetrics::new()))
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    async fn count(&self, name: &str, queue: &str) {
        self.backend.increment_counter(name, 1).await;
        self.backend
            .increment_counter(&format!("{}.{}", name, queue), 1)
            .await;
    }

    pub async fn record_enqueue(&self, queue: &str) {
        self.count(metric_names::ITEMS_ENQUEUED, queue).await;
    }

    pub async fn record_collapse(&self, queue: &str) {
        self.count(metric_names::ITEMS_COLLAPSED, queue).await;
    }

    pub async fn record_rejected(&self, queue: &str) {
        self.count(metric_names::ITEMS_REJECTED, queue).await;
    }

    pub async fn record_delivered(&self, queue: &str, wait_ms: f64) {
        self.count(metric_names::ITEMS_DELIVERED, queue).await;
        self.backend
            .record_histogram(metric_names::ITEM_WAIT_TIME, wait_ms)
            .await;
        self.backend
            .record_histogram(
                &format!("{}.{}", metric_names::ITEM_WAIT_TIME, queue),
                wait_ms,
            )
            .await;
    }

    pub async fn record_redelivery(&self, queue: &str) {
        self.count(metric_names::ITEMS_REDELIVERED, queue).await;
    }

    pub async fn record_ack(&self, queue: &str) {
        self.count(metric_names::ITEMS_ACKED, queue).await;
    }

    pub async fn record_requeue(&self, queue: &str) {
        self.count(metric_names::ITEMS_REQUEUED, queue).await;
    }

    pub async fn record_failure(&self, queue: &str) {
        self.count(metric_names::ITEMS_FAILED, queue).await;
    }

    pub async fn record_dead_letter(&self, queue: &str) {
        self.count(metric_names::ITEMS_DEAD_LETTERED, queue).await;
    }

    /// Drop a deleted queue from the global total
    pub async fn forget_queue(&self, queue: &str) {
        let sum: usize = {
            let mut totals = self.totals.lock();
            totals.remove(queue);
            totals.values().sum()
        };
        self.backend
            .set_gauge(metric_names::QUEUE_TOTAL, sum as f64)
            .await;
    }

    pub async fn set_queue_total(&self, queue: &str, total: usize) {
        let sum: usize = {
            let mut totals = self.totals.lock();
            totals.insert(queue.to_string(), total);
            totals.values().sum()
        };
        self.backend
            .set_gauge(
                &format!("{}.{}", metric_names::QUEUE_TOTAL, queue),
                total as f64,
            )
            .await;
        self.backend
            .set_gauge(metric_names::QUEUE_TOTAL, sum as f64)
            .await;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.backend.snapshot().await
    }

    pub async fn reset(&self) {
        self.totals.lock().clear();
        self.backend.reset().await;
    }
}
