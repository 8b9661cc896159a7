//! Broker lifecycle events
//!
//! Every queue publishes its lifecycle (items admitted, delivered, acknowledged,
//! tag groups created and collected) on a shared broadcast [`EventEmitter`].
//! Slow subscribers lag and drop events; the broker never blocks on them.

use crate::tags::TagSet;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Broker event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEvent {
    /// Event key (e.g., "broker.item.enqueued")
    pub key: EventKey,

    /// Queue the event belongs to
    pub queue: String,

    pub payload: EventPayload,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BrokerEvent {
    pub fn new(key: impl Into<String>, queue: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            queue: queue.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>, queue: impl Into<String>) -> Self {
        Self::new(key, queue, EventPayload::Empty)
    }

    /// Create an event with a map payload
    pub fn with_map(
        key: impl Into<String>,
        queue: impl Into<String>,
        map: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(key, queue, EventPayload::Map(map))
    }

    /// Event about a tag group, optionally naming one of its items
    pub fn tag_group(
        key: impl Into<String>,
        queue: impl Into<String>,
        tags: &TagSet,
        item_id: Option<u64>,
    ) -> Self {
        let mut map = HashMap::from([("tags".to_string(), serde_json::json!(tags))]);
        if let Some(id) = item_id {
            map.insert("item_id".to_string(), serde_json::json!(id));
        }
        Self::with_map(key, queue, map)
    }

    /// Item ID carried in a map payload, if any
    pub fn item_id(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::Map(map) => map.get("item_id").and_then(|v| v.as_u64()),
            _ => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<BrokerEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event; dropped when nobody listens
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to filtered events as an `EventStream` (implements `Stream`)
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&BrokerEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r: Result<BrokerEvent, _>| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }

    /// Subscribe to every event of one queue
    pub fn subscribe_queue(&self, queue: impl Into<String>) -> EventStream {
        let queue = queue.into();
        self.subscribe_filtered(move |e| e.queue == queue)
    }

    /// Subscribe to all events as an `EventStream`
    pub fn subscribe_stream(&self) -> EventStream {
        self.subscribe_filtered(|_| true)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Event stream, implements `futures_core::Stream<Item = BrokerEvent>`.
///
/// Use `.next().await` via `StreamExt` from `tokio_stream`, or the
/// convenience [`EventStream::recv`].
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = BrokerEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = BrokerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Event catalog
pub mod events {
    pub const QUEUE_CREATED: &str = "broker.queue.created";
    pub const QUEUE_SHUTDOWN: &str = "broker.queue.shutdown";
    pub const ITEM_ENQUEUED: &str = "broker.item.enqueued";
    pub const ITEM_COLLAPSED: &str = "broker.item.collapsed";
    pub const ITEM_REJECTED: &str = "broker.item.rejected";
    pub const ITEM_DELIVERED: &str = "broker.item.delivered";
    pub const ITEM_REDELIVERY: &str = "broker.item.redelivery";
    pub const ITEM_ACKED: &str = "broker.item.acked";
    pub const ITEM_REQUEUED: &str = "broker.item.requeued";
    pub const ITEM_DEAD_LETTERED: &str = "broker.item.dead_lettered";
    pub const TAG_GROUP_CREATED: &str = "broker.tag_group.created";
    pub const TAG_GROUP_REMOVED: &str = "broker.tag_group.removed";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_broker_event_empty() {
        let event = BrokerEvent::empty(events::QUEUE_CREATED, "orders");
        assert_eq!(event.key, "broker.queue.created");
        assert_eq!(event.queue, "orders");
        assert!(matches!(event.payload, EventPayload::Empty));
        assert_eq!(event.item_id(), None);
    }

    #[test]
    fn test_tag_group_event_payload() {
        let tags = TagSet::from([("region", "eu")]);
        let event = BrokerEvent::tag_group(events::ITEM_ENQUEUED, "orders", &tags, Some(3));

        assert_eq!(event.item_id(), Some(3));
        if let EventPayload::Map(map) = &event.payload {
            assert_eq!(map["tags"], serde_json::json!({"region": "eu"}));
        } else {
            panic!("Expected map payload");
        }
    }

    #[test]
    fn test_broker_event_timestamp() {
        let before = chrono::Utc::now();
        let event = BrokerEvent::empty("test.event", "q");
        let after = chrono::Utc::now();

        assert!(event.timestamp >= before);
        assert!(event.timestamp <= after);
    }

    #[tokio::test]
    async fn test_event_emitter_multiple_subscribers() {
        let emitter = EventEmitter::new(100);
        let mut receiver1 = emitter.subscribe();
        let mut receiver2 = emitter.subscribe();

        emitter.emit(BrokerEvent::empty(events::QUEUE_SHUTDOWN, "q"));

        assert_eq!(receiver1.recv().await.unwrap().key, events::QUEUE_SHUTDOWN);
        assert_eq!(receiver2.recv().await.unwrap().key, events::QUEUE_SHUTDOWN);
    }

    #[tokio::test]
    async fn test_subscribe_queue_filters_other_queues() {
        let emitter = EventEmitter::new(100);
        let mut stream = emitter.subscribe_queue("a");

        emitter.emit(BrokerEvent::empty(events::QUEUE_CREATED, "b"));
        emitter.emit(BrokerEvent::empty(events::QUEUE_CREATED, "a"));

        let event = tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Stream ended");
        assert_eq!(event.queue, "a");
    }

    #[tokio::test]
    async fn test_event_stream_implements_stream() {
        use tokio_stream::StreamExt;

        let emitter = EventEmitter::new(100);
        let mut stream = emitter.subscribe_stream();

        emitter.emit(BrokerEvent::empty("stream.1", "q"));
        emitter.emit(BrokerEvent::empty("stream.2", "q"));

        for expected in ["stream.1", "stream.2"] {
            let event = tokio::time::timeout(Duration::from_millis(200), stream.next())
                .await
                .expect("Timeout")
                .expect("Stream ended");
            assert_eq!(event.key, expected);
        }
    }

    #[test]
    fn test_broker_event_serialization() {
        let event = BrokerEvent::tag_group(
            events::ITEM_ACKED,
            "orders",
            &TagSet::from([("a", "1")]),
            Some(1),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("broker.item.acked"));
        assert!(json.contains("timestamp"));

        let parsed: BrokerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.queue, "orders");
        assert_eq!(parsed.item_id(), Some(1));
    }
}
