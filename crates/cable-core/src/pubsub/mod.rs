//! Publish/subscribe adapter boundary.
//!
//! The core only needs three operations from a bus: subscribe a callback to
//! a topic, unsubscribe it, and publish a payload. Any bus that can do that
//! (in-process, Redis, NATS) plugs in through [`PubSubAdapter`].
//!
//! Delivery guarantees are whatever the bus provides. The core does not
//! deduplicate, so an at-least-once bus yields at-least-once frames.

mod memory;
mod subscriber_map;

pub use memory::InMemoryPubSub;
pub use subscriber_map::{SubscriberMap, SubscriberMapStats};

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Pub/sub errors.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The bus could not be reached.
    #[error("Pub/sub unavailable: {0}")]
    Unavailable(String),

    /// Topic name rejected.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// The adapter was shut down.
    #[error("Pub/sub adapter is shut down")]
    Closed,
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error if the topic is empty, too long, or contains control characters.
pub fn validate_topic(topic: &str) -> Result<(), PubSubError> {
    if topic.is_empty() {
        return Err(PubSubError::InvalidTopic("Topic cannot be empty"));
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(PubSubError::InvalidTopic("Topic too long"));
    }
    if topic.chars().any(char::is_control) {
        return Err(PubSubError::InvalidTopic("Topic contains control characters"));
    }
    Ok(())
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

type Callback = Arc<dyn Fn(Arc<str>) + Send + Sync>;

/// A message callback registered on a topic.
///
/// Subscribers compare by identity, so the handle returned from
/// [`Subscriber::new`] (or any clone of it) is what unsubscribes it.
#[derive(Clone)]
pub struct Subscriber {
    id: u64,
    callback: Callback,
}

impl Subscriber {
    /// Wrap a callback.
    pub fn new(callback: impl Fn(Arc<str>) + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invoke the callback with a payload.
    pub fn deliver(&self, payload: Arc<str>) {
        (self.callback)(payload);
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

/// A publish/subscribe bus.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait PubSubAdapter: Send + Sync {
    /// Adapter name, for logs.
    fn name(&self) -> &'static str;

    /// Register a subscriber on a topic.
    ///
    /// Resolves once the subscription is live on the bus.
    async fn subscribe(&self, topic: &str, subscriber: Subscriber) -> Result<(), PubSubError>;

    /// Remove a subscriber from a topic. Unknown subscribers are ignored.
    async fn unsubscribe(&self, topic: &str, subscriber: &Subscriber) -> Result<(), PubSubError>;

    /// Publish a payload to every subscriber of a topic.
    async fn broadcast(&self, topic: &str, payload: &str) -> Result<(), PubSubError>;

    /// Release bus resources. Further calls fail with [`PubSubError::Closed`].
    async fn shutdown(&self);
}
