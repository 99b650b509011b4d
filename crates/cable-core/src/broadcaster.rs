//! Broadcasting to topics.
//!
//! A broadcast serializes the message to JSON and hands it to the pub/sub
//! adapter. Every subscription streaming the topic, in any process attached
//! to the same bus, receives it as channel data. Delivery is exactly as
//! reliable as the bus.

use crate::pubsub::{PubSubAdapter, PubSubError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Broadcast errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The message could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The bus refused the publish.
    #[error("Pub/sub error: {0}")]
    PubSub(#[from] PubSubError),
}

/// Name of the topic for a channel and a model key, `<channel>:<key>`.
#[must_use]
pub fn broadcasting_for(channel: &str, key: &str) -> String {
    format!("{channel}:{key}")
}

/// Publishes messages on the pub/sub bus.
#[derive(Clone)]
pub struct Broadcaster {
    pubsub: Arc<dyn PubSubAdapter>,
}

impl Broadcaster {
    /// Create a broadcaster on an adapter.
    #[must_use]
    pub fn new(pubsub: Arc<dyn PubSubAdapter>) -> Self {
        Self { pubsub }
    }

    /// Serialize and publish a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the publish fails.
    pub async fn broadcast<T>(&self, topic: &str, message: &T) -> Result<(), BroadcastError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(message)?;
        self.broadcast_raw(topic, &payload).await
    }

    /// Publish an already-encoded JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the publish fails.
    pub async fn broadcast_raw(&self, topic: &str, payload: &str) -> Result<(), BroadcastError> {
        self.pubsub.broadcast(topic, payload).await?;
        debug!(topic = %topic, bytes = payload.len(), "Broadcast");
        Ok(())
    }

    /// Publish to the topic of a channel and model key.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the publish fails.
    pub async fn broadcast_to<T>(
        &self,
        channel: &str,
        key: &str,
        message: &T,
    ) -> Result<(), BroadcastError>
    where
        T: Serialize + ?Sized,
    {
        self.broadcast(&broadcasting_for(channel, key), message).await
    }

    /// Get a broadcaster bound to one topic.
    #[must_use]
    pub fn for_topic(&self, topic: impl Into<String>) -> TopicBroadcaster {
        TopicBroadcaster {
            topic: topic.into(),
            broadcaster: self.clone(),
        }
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("pubsub", &self.pubsub.name())
            .finish()
    }
}

/// A [`Broadcaster`] bound to a single topic.
#[derive(Debug, Clone)]
pub struct TopicBroadcaster {
    topic: String,
    broadcaster: Broadcaster,
}

impl TopicBroadcaster {
    /// Get the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a message to the bound topic.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the publish fails.
    pub async fn broadcast<T>(&self, message: &T) -> Result<(), BroadcastError>
    where
        T: Serialize + ?Sized,
    {
        self.broadcaster.broadcast(&self.topic, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{InMemoryPubSub, Subscriber};
    use serde_json::json;
    use std::sync::Mutex;

    async fn listen(bus: &InMemoryPubSub, topic: &str) -> Arc<Mutex<Vec<String>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bus.subscribe(
            topic,
            Subscriber::new(move |payload: Arc<str>| sink.lock().unwrap().push(payload.to_string())),
        )
        .await
        .unwrap();
        received
    }

    #[tokio::test]
    async fn test_broadcast_serializes() {
        let bus = Arc::new(InMemoryPubSub::new());
        let received = listen(&bus, "chat:lobby").await;
        let broadcaster = Broadcaster::new(bus.clone());

        broadcaster
            .broadcast("chat:lobby", &json!({"body": "hi"}))
            .await
            .unwrap();
        broadcaster
            .broadcast_to("chat", "lobby", "plain")
            .await
            .unwrap();

        assert_eq!(
            *received.lock().unwrap(),
            vec![r#"{"body":"hi"}"#.to_string(), r#""plain""#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_topic_broadcaster() {
        let bus = Arc::new(InMemoryPubSub::new());
        let received = listen(&bus, "news").await;
        let news = Broadcaster::new(bus.clone()).for_topic("news");

        assert_eq!(news.topic(), "news");
        news.broadcast(&42).await.unwrap();
        assert_eq!(*received.lock().unwrap(), vec!["42".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_error() {
        let bus = Arc::new(InMemoryPubSub::new());
        let broadcaster = Broadcaster::new(bus.clone());
        bus.shutdown().await;

        assert!(matches!(
            broadcaster.broadcast("news", "x").await,
            Err(BroadcastError::PubSub(PubSubError::Closed))
        ));
    }

    #[test]
    fn test_broadcasting_for() {
        assert_eq!(broadcasting_for("chat", "lobby"), "chat:lobby");
    }
}
