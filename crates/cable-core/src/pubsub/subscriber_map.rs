//! Concurrent topic to subscriber bookkeeping.
//!
//! Shared by adapters: the in-memory bus delivers straight from it, and a
//! network bus would use the first/last transitions to manage its upstream
//! subscription.

use super::Subscriber;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Topic to subscriber map.
#[derive(Debug, Default)]
pub struct SubscriberMap {
    topics: DashMap<String, Vec<Subscriber>>,
}

impl SubscriberMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to a topic.
    ///
    /// Adding the same subscriber twice is a no-op. Returns `true` if this
    /// was the first subscriber on the topic.
    pub fn add(&self, topic: &str, subscriber: Subscriber) -> bool {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let first = entry.is_empty();
        if !entry.contains(&subscriber) {
            entry.push(subscriber);
        }
        first
    }

    /// Remove a subscriber from a topic.
    ///
    /// Returns `true` if the topic has no subscribers left.
    pub fn remove(&self, topic: &str, subscriber: &Subscriber) -> bool {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            return false;
        };
        entry.retain(|s| s != subscriber);
        let empty = entry.is_empty();
        drop(entry);

        if empty {
            self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
        }
        empty
    }

    /// Invoke every subscriber of a topic.
    ///
    /// Subscribers are snapshotted first and called without holding the
    /// shard lock, so callbacks may subscribe or unsubscribe freely.
    /// Returns the number of subscribers invoked.
    pub fn deliver(&self, topic: &str, payload: &str) -> usize {
        let subscribers = match self.topics.get(topic) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };

        let payload: Arc<str> = Arc::from(payload);
        for subscriber in &subscribers {
            subscriber.deliver(Arc::clone(&payload));
        }

        trace!(topic = %topic, recipients = subscribers.len(), "Delivered payload");
        subscribers.len()
    }

    /// Get the number of subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |entry| entry.len())
    }

    /// Remove every subscriber.
    pub fn clear(&self) {
        self.topics.clear();
    }

    /// Get map statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriberMapStats {
        SubscriberMapStats {
            topic_count: self.topics.len(),
            subscriber_count: self.topics.iter().map(|entry| entry.len()).sum(),
        }
    }
}

/// Subscriber map statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberMapStats {
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Total registrations across topics.
    pub subscriber_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Subscriber, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let subscriber = Subscriber::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (subscriber, hits)
    }

    #[test]
    fn test_add_is_idempotent() {
        let map = SubscriberMap::new();
        let (subscriber, hits) = counting();

        assert!(map.add("t", subscriber.clone()));
        assert!(!map.add("t", subscriber.clone()));
        assert_eq!(map.subscriber_count("t"), 1);

        assert_eq!(map.deliver("t", "payload"), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove() {
        let map = SubscriberMap::new();
        let (a, _) = counting();
        let (b, _) = counting();

        map.add("t", a.clone());
        map.add("t", b.clone());

        assert!(!map.remove("t", &a));
        assert!(map.remove("t", &b));
        assert_eq!(map.stats().topic_count, 0);
        assert!(!map.remove("missing", &a));
    }

    #[test]
    fn test_deliver_only_to_topic() {
        let map = SubscriberMap::new();
        let (a, a_hits) = counting();
        let (b, b_hits) = counting();

        map.add("one", a);
        map.add("two", b);

        map.deliver("one", "x");
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 0);
        assert_eq!(map.deliver("three", "x"), 0);
    }

    #[test]
    fn test_unsubscribe_from_callback() {
        let map = Arc::new(SubscriberMap::new());
        let slot: Arc<std::sync::Mutex<Option<Subscriber>>> = Arc::default();

        let inner_map = Arc::clone(&map);
        let inner_slot = Arc::clone(&slot);
        let subscriber = Subscriber::new(move |_| {
            if let Some(me) = inner_slot.lock().unwrap().take() {
                inner_map.remove("t", &me);
            }
        });
        *slot.lock().unwrap() = Some(subscriber.clone());
        map.add("t", subscriber);

        assert_eq!(map.deliver("t", "x"), 1);
        assert_eq!(map.subscriber_count("t"), 0);
    }

    #[test]
    fn test_stats() {
        let map = SubscriberMap::new();
        map.add("a", counting().0);
        map.add("a", counting().0);
        map.add("b", counting().0);

        let stats = map.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.subscriber_count, 3);

        map.clear();
        assert_eq!(map.stats().subscriber_count, 0);
    }
}
