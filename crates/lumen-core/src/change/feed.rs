use tokio::sync::mpsc;

use super::types::ResourceChange;
use crate::error::{CoreError, Result};

/// Default ingress queue capacity.
pub const DEFAULT_INGRESS_CAPACITY: usize = 1024;

/// Bounded change feed connecting the resource store to the event generator.
pub struct ChangeFeed;

impl ChangeFeed {
    /// Create a bounded feed with the given capacity.
    pub fn bounded(capacity: usize) -> (ChangePublisher, ChangeIngress) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChangePublisher { tx }, ChangeIngress { rx })
    }

    pub fn with_default_capacity() -> (ChangePublisher, ChangeIngress) {
        Self::bounded(DEFAULT_INGRESS_CAPACITY)
    }
}

/// Producer half, held by the store. `publish` completes only once the
/// change is enqueued, so callers that await it before acknowledging a
/// write get ordering between the write's response and event emission.
#[derive(Clone)]
pub struct ChangePublisher {
    tx: mpsc::Sender<ResourceChange>,
}

impl ChangePublisher {
    /// Enqueue a change, blocking (asynchronously) while the feed is full.
    pub async fn publish(&self, change: ResourceChange) -> Result<()> {
        self.tx.send(change).await.map_err(|_| CoreError::FeedClosed)
    }

    /// Number of additional changes the feed can accept without blocking.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half, held by the event generator.
pub struct ChangeIngress {
    rx: mpsc::Receiver<ResourceChange>,
}

impl ChangeIngress {
    /// Receive the next change; `None` once all publishers are dropped.
    pub async fn recv(&mut self) -> Option<ResourceChange> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_and_receive_in_order() {
        let (publisher, mut ingress) = ChangeFeed::bounded(8);

        for i in 0..3 {
            publisher
                .publish(ResourceChange::created(
                    "Patient",
                    format!("p{i}"),
                    json!({"id": format!("p{i}")}),
                ))
                .await
                .unwrap();
        }

        for i in 0..3 {
            let change = ingress.recv().await.unwrap();
            assert_eq!(change.resource_id, format!("p{i}"));
        }
    }

    #[tokio::test]
    async fn test_full_feed_blocks_producer() {
        let (publisher, mut ingress) = ChangeFeed::bounded(1);

        publisher
            .publish(ResourceChange::created("Patient", "p1", json!({})))
            .await
            .unwrap();

        // Second publish must park until the consumer drains one slot.
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            publisher.publish(ResourceChange::created("Patient", "p2", json!({}))),
        )
        .await;
        assert!(blocked.is_err(), "publish should block on a full feed");

        ingress.recv().await.unwrap();
        publisher
            .publish(ResourceChange::created("Patient", "p2", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_ingress_dropped() {
        let (publisher, ingress) = ChangeFeed::bounded(1);
        drop(ingress);

        let err = publisher
            .publish(ResourceChange::created("Patient", "p1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::FeedClosed));
    }
}
