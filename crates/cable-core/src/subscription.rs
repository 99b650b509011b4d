//! Subscriptions: one client's interest in a channel.
//!
//! A subscription is keyed by the raw identifier the client sent and owns
//! the set of topics it streams from. Stream callbacks hop onto the
//! connection's worker before transmitting, so deliveries are serialized
//! with every other callback of that connection.

use crate::broadcaster::{broadcasting_for, BroadcastError, Broadcaster};
use crate::channel::ChannelError;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::identity::Identity;
use crate::pubsub::Subscriber;
use crate::worker::WorkerPool;
use cable_protocol::{ChannelIdentifier, ServerFrame};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// A live subscription on a connection.
pub struct Subscription {
    identifier: ChannelIdentifier,
    handle: ConnectionHandle,
    streams: Mutex<HashMap<String, Subscriber>>,
    active: Arc<AtomicBool>,
    rejected: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(identifier: ChannelIdentifier, handle: ConnectionHandle) -> Self {
        Self {
            identifier,
            handle,
            streams: Mutex::new(HashMap::new()),
            active: Arc::new(AtomicBool::new(true)),
            rejected: AtomicBool::new(false),
        }
    }

    /// Get the raw identifier, as sent by the client.
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.identifier.as_str()
    }

    /// Get the channel name from the identifier.
    #[must_use]
    pub fn channel_name(&self) -> &str {
        self.identifier.channel()
    }

    /// Get the identifier parameters.
    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        self.identifier.params()
    }

    /// Get one identifier parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.identifier.param(key)
    }

    /// Get a string identifier parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    /// Get the identity of the owning connection.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.handle.identity
    }

    /// Get the id of the owning connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Get the broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.handle.broadcaster
    }

    /// Start streaming a topic to the client.
    ///
    /// Streaming a topic twice is a no-op, so each broadcast is delivered once.
    ///
    /// # Errors
    ///
    /// Returns an error if the pub/sub adapter refuses the subscription.
    pub async fn stream_from(&self, topic: impl Into<String>) -> Result<(), ChannelError> {
        let topic = topic.into();
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&topic) {
            trace!(identifier = %self.identifier(), topic = %topic, "Already streaming");
            return Ok(());
        }

        let subscriber = self.stream_subscriber(&topic);
        self.handle
            .pubsub
            .subscribe(&topic, subscriber.clone())
            .await?;
        debug!(
            connection = %self.handle.id,
            identifier = %self.identifier(),
            topic = %topic,
            "Streaming"
        );
        streams.insert(topic, subscriber);
        Ok(())
    }

    /// Stream the topic for a model key of this channel, `<channel>:<key>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pub/sub adapter refuses the subscription.
    pub async fn stream_for(&self, key: &str) -> Result<(), ChannelError> {
        self.stream_from(broadcasting_for(self.channel_name(), key))
            .await
    }

    /// Stream several topics.
    ///
    /// # Errors
    ///
    /// Stops at the first topic the adapter refuses.
    pub async fn stream_from_all<I, T>(&self, topics: I) -> Result<(), ChannelError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for topic in topics {
            self.stream_from(topic).await?;
        }
        Ok(())
    }

    /// Stop streaming a topic. Returns `true` if it was being streamed.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter fails to unsubscribe.
    pub async fn stop_stream_from(&self, topic: &str) -> Result<bool, ChannelError> {
        let Some(subscriber) = self.streams.lock().await.remove(topic) else {
            return Ok(false);
        };
        self.handle.pubsub.unsubscribe(topic, &subscriber).await?;
        debug!(identifier = %self.identifier(), topic = %topic, "Stopped streaming");
        Ok(true)
    }

    /// Stop streaming every topic.
    pub async fn stop_all_streams(&self) {
        let streams: Vec<(String, Subscriber)> = self.streams.lock().await.drain().collect();
        for (topic, subscriber) in streams {
            if let Err(error) = self.handle.pubsub.unsubscribe(&topic, &subscriber).await {
                warn!(
                    identifier = %self.identifier(),
                    topic = %topic,
                    error = %error,
                    "Failed to stop stream"
                );
            }
        }
    }

    /// Get the streamed topics, sorted.
    pub async fn streams(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        topics.sort_unstable();
        topics
    }

    /// Send data to the client, tagged with this subscription's identifier.
    pub fn transmit(&self, message: Value) -> bool {
        self.handle
            .outbox
            .send(ServerFrame::message(self.identifier(), message))
    }

    /// Broadcast a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the publish fails.
    pub async fn broadcast<T>(&self, topic: &str, message: &T) -> Result<(), BroadcastError>
    where
        T: Serialize + ?Sized,
    {
        self.handle.broadcaster.broadcast(topic, message).await
    }

    /// Refuse the subscription. Takes effect when called from
    /// [`Channel::build`](crate::Channel::build) or
    /// [`Channel::subscribed`](crate::Channel::subscribed).
    pub fn reject(&self) {
        self.rejected.store(true, Ordering::Release);
    }

    /// Check if the subscription was refused.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }

    /// Check if the subscription is still live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn workers(&self) -> &WorkerPool {
        &self.handle.workers
    }

    fn stream_subscriber(&self, topic: &str) -> Subscriber {
        let id = self.handle.id;
        let workers = self.handle.workers.clone();
        let outbox = self.handle.outbox.clone();
        let active = Arc::clone(&self.active);
        let identifier: Arc<str> = Arc::from(self.identifier());
        let topic: Arc<str> = Arc::from(topic);

        Subscriber::new(move |payload: Arc<str>| {
            let outbox = outbox.clone();
            let active = Arc::clone(&active);
            let identifier = Arc::clone(&identifier);
            let topic = Arc::clone(&topic);

            let delivery = async move {
                if !active.load(Ordering::Acquire) {
                    trace!(topic = %topic, "Dropping delivery for inactive subscription");
                    return;
                }
                let message = decode_payload(&topic, &payload);
                outbox.send(ServerFrame::message(identifier.as_ref(), message));
            };

            if workers.submit(&id, delivery).is_err() {
                trace!(connection = %id, "Worker pool gone, delivery dropped");
            }
        })
    }
}

fn decode_payload(topic: &str, payload: &str) -> Value {
    match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(error) => {
            warn!(topic = %topic, error = %error, "Broadcast payload is not JSON");
            Value::String(payload.to_string())
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("identifier", &self.identifier())
            .field("connection", &self.handle.id)
            .field("active", &self.is_active())
            .finish()
    }
}
