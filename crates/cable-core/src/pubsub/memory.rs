//! In-process pub/sub bus.
//!
//! Good for a single node and for tests; several servers sharing one
//! `Arc<InMemoryPubSub>` behave like processes on a shared bus.

use super::{validate_topic, PubSubAdapter, PubSubError, Subscriber, SubscriberMap, SubscriberMapStats};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// In-memory [`PubSubAdapter`].
#[derive(Debug, Default)]
pub struct InMemoryPubSub {
    subscribers: SubscriberMap,
    closed: AtomicBool,
}

impl InMemoryPubSub {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.subscriber_count(topic)
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriberMapStats {
        self.subscribers.stats()
    }

    fn ensure_open(&self) -> Result<(), PubSubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubAdapter for InMemoryPubSub {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn subscribe(&self, topic: &str, subscriber: Subscriber) -> Result<(), PubSubError> {
        self.ensure_open()?;
        validate_topic(topic)?;
        if self.subscribers.add(topic, subscriber) {
            debug!(topic = %topic, "First subscriber on topic");
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, subscriber: &Subscriber) -> Result<(), PubSubError> {
        if self.subscribers.remove(topic, subscriber) {
            debug!(topic = %topic, "Last subscriber left topic");
        }
        Ok(())
    }

    async fn broadcast(&self, topic: &str, payload: &str) -> Result<(), PubSubError> {
        self.ensure_open()?;
        validate_topic(topic)?;
        self.subscribers.deliver(topic, payload);
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.subscribers.clear();
            info!("In-memory pub/sub shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording() -> (Subscriber, Arc<Mutex<Vec<String>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let subscriber = Subscriber::new(move |payload: Arc<str>| {
            sink.lock().unwrap().push(payload.to_string());
        });
        (subscriber, received)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let bus = InMemoryPubSub::new();
        let (a, a_received) = recording();
        let (b, b_received) = recording();

        bus.subscribe("news", a).await.unwrap();
        bus.subscribe("sports", b).await.unwrap();
        bus.broadcast("news", r#"{"headline":"hi"}"#).await.unwrap();

        assert_eq!(*a_received.lock().unwrap(), vec![r#"{"headline":"hi"}"#]);
        assert!(b_received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryPubSub::new();
        let (a, received) = recording();

        bus.subscribe("news", a.clone()).await.unwrap();
        bus.unsubscribe("news", &a).await.unwrap();
        bus.broadcast("news", "1").await.unwrap();

        assert!(received.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn test_invalid_topic() {
        let bus = InMemoryPubSub::new();
        assert!(matches!(
            bus.broadcast("", "x").await,
            Err(PubSubError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let bus = InMemoryPubSub::new();
        let (a, _) = recording();
        bus.subscribe("news", a.clone()).await.unwrap();

        bus.shutdown().await;

        assert_eq!(bus.stats().subscriber_count, 0);
        assert!(matches!(bus.broadcast("news", "x").await, Err(PubSubError::Closed)));
        assert!(matches!(bus.subscribe("news", a).await, Err(PubSubError::Closed)));
    }
}
