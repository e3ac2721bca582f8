//! Pending withdrawal queue
//!
//! Ordered by sequence number and deduplicated. Fed by the chain watcher and
//! the finality checker, drained by the submission processor. The container
//! is never exposed; every operation takes the lock for the duration of a
//! map operation only.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::U256;
use tokio::sync::Mutex;

use crate::metrics::Metrics;
use crate::types::UnlockEvent;

pub struct WithdrawalQueue {
    events: Mutex<BTreeMap<U256, UnlockEvent>>,
    metrics: Arc<Metrics>,
}

impl WithdrawalQueue {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            events: Mutex::new(BTreeMap::new()),
            metrics,
        }
    }

    /// Add an event. Returns `false` if an event with the same sequence number
    /// is already queued.
    pub async fn enqueue(&self, event: UnlockEvent) -> bool {
        let mut events = self.events.lock().await;
        if events.contains_key(&event.sequence_number) {
            return false;
        }
        events.insert(event.sequence_number, event);
        self.metrics.queue_depth.set(events.len() as i64);
        self.metrics.events_enqueued_total.inc();
        true
    }

    /// Put back an event that failed processing
    pub async fn requeue(&self, event: UnlockEvent) -> bool {
        let inserted = self.enqueue(event).await;
        if inserted {
            self.metrics.events_requeued_total.inc();
        }
        inserted
    }

    /// Remove and return the event with the lowest sequence number
    pub async fn dequeue(&self) -> Option<UnlockEvent> {
        let mut events = self.events.lock().await;
        let event = events.pop_first().map(|(_, event)| event);
        self.metrics.queue_depth.set(events.len() as i64);
        event
    }

    /// Remove every queued event, in ascending sequence order
    pub async fn drain(&self) -> Vec<UnlockEvent> {
        let mut events = self.events.lock().await;
        let drained = std::mem::take(&mut *events).into_values().collect();
        self.metrics.queue_depth.set(0);
        drained
    }

    /// Copy of the queued events, in ascending sequence order
    pub async fn snapshot(&self) -> Vec<UnlockEvent> {
        self.events.lock().await.values().cloned().collect()
    }

    pub async fn contains(&self, sequence_number: &U256) -> bool {
        self.events.lock().await.contains_key(sequence_number)
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unlock_event;

    fn queue() -> WithdrawalQueue {
        WithdrawalQueue::new(Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_dequeue_in_sequence_order() {
        let queue = queue();
        for seq in [3u64, 1, 2] {
            assert!(queue.enqueue(unlock_event(seq)).await);
        }

        let mut order = Vec::new();
        while let Some(event) = queue.dequeue().await {
            order.push(event.sequence_number);
        }
        assert_eq!(
            order,
            vec![U256::from(1u64), U256::from(2u64), U256::from(3u64)]
        );
    }

    #[tokio::test]
    async fn test_dequeue_empty_returns_none() {
        let queue = queue();
        assert_eq!(queue.dequeue().await, None);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicates_are_rejected() {
        let queue = queue();
        assert!(queue.enqueue(unlock_event(5)).await);
        assert!(!queue.enqueue(unlock_event(5)).await);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_requeue_after_dequeue() {
        let metrics = Arc::new(Metrics::new());
        let queue = WithdrawalQueue::new(metrics.clone());
        queue.enqueue(unlock_event(9)).await;

        let event = queue.dequeue().await.unwrap();
        assert!(!queue.contains(&event.sequence_number).await);

        assert!(queue.requeue(event.clone()).await);
        assert!(queue.contains(&event.sequence_number).await);
        assert_eq!(metrics.events_requeued_total.get(), 1);
        assert_eq!(metrics.queue_depth.get(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_consume() {
        let queue = queue();
        queue.enqueue(unlock_event(2)).await;
        queue.enqueue(unlock_event(1)).await;

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].sequence_number, U256::from(1u64));
        assert_eq!(queue.len().await, 2);

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty().await);
    }
}
