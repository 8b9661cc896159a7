//! Dead letter queue for permanently failed items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::group::ItemId;
use crate::tags::TagSet;

/// An item acknowledged as failed without a requeue location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue the item was enqueued on
    pub queue: String,
    /// Exact tag set of the item's tag group
    pub tags: TagSet,
    /// ID the item carried in its tag group
    pub item_id: ItemId,
    pub payload: Vec<u8>,
    /// When the failing ACK arrived
    pub failed_at: DateTime<Utc>,
}

/// Bounded store of dead letters; the oldest letter is evicted when full
#[derive(Clone)]
pub struct DeadLetterQueue {
    letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            letters: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn push(&self, letter: DeadLetter) {
        let mut letters = self.letters.lock().await;
        if letters.len() >= self.max_size {
            letters.pop_front();
        }
        letters.push_back(letter);
    }

    /// Pop the oldest dead letter
    pub async fn pop(&self) -> Option<DeadLetter> {
        self.letters.lock().await.pop_front()
    }

    /// List all dead letters (returns a copy)
    pub async fn list(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.iter().cloned().collect()
    }

    pub async fn clear(&self) {
        self.letters.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dead_letter(id: ItemId) -> DeadLetter {
        DeadLetter {
            queue: "orders".to_string(),
            tags: TagSet::from([("region", "eu")]),
            item_id: id,
            payload: format!("payload-{}", id).into_bytes(),
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dlq_new() {
        let dlq = DeadLetterQueue::new(100);
        assert_eq!(dlq.max_size(), 100);
        assert!(dlq.is_empty().await);
    }

    #[tokio::test]
    async fn test_dlq_pop_in_order() {
        let dlq = DeadLetterQueue::new(10);
        dlq.push(make_dead_letter(1)).await;
        dlq.push(make_dead_letter(2)).await;
        assert_eq!(dlq.len().await, 2);

        assert_eq!(dlq.pop().await.unwrap().item_id, 1);
        assert_eq!(dlq.pop().await.unwrap().item_id, 2);
        assert!(dlq.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_dlq_list_does_not_remove() {
        let dlq = DeadLetterQueue::new(10);
        for id in 1..=3 {
            dlq.push(make_dead_letter(id)).await;
        }

        let ids: Vec<ItemId> = dlq.list().await.iter().map(|l| l.item_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(dlq.len().await, 3);

        dlq.clear().await;
        assert!(dlq.is_empty().await);
    }

    #[tokio::test]
    async fn test_dlq_evicts_oldest() {
        let dlq = DeadLetterQueue::new(3);
        for id in 1..=4 {
            dlq.push(make_dead_letter(id)).await;
        }

        let ids: Vec<ItemId> = dlq.list().await.iter().map(|l| l.item_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_dlq_clone_shares_letters() {
        let dlq1 = DeadLetterQueue::new(10);
        let dlq2 = dlq1.clone();

        dlq2.push(make_dead_letter(1)).await;
        assert_eq!(dlq1.len().await, 1);
    }

    #[test]
    fn test_dead_letter_serialization() {
        let letter = make_dead_letter(7);
        let json = serde_json::to_string(&letter).unwrap();
        let parsed: DeadLetter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, letter);
    }
}
