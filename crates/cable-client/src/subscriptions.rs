//! Client-side channel subscriptions.
//!
//! [`Subscriptions`] tracks every channel the application subscribed to,
//! routes server frames to them as [`SubscriptionEvent`]s and keeps
//! re-sending `subscribe` until the server confirms or rejects.

use cable_protocol::{ActionPayload, Command};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::{debug, info, trace};

use crate::connection::ClientError;

/// Interval between `subscribe` retries for unconfirmed subscriptions.
pub const GUARANTEE_INTERVAL: Duration = Duration::from_millis(500);

/// What happened to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The server confirmed the subscription.
    Connected,
    /// The socket closed.
    Disconnected {
        /// Whether the monitor will try to reconnect.
        will_attempt_reconnect: bool,
    },
    /// The server rejected the subscription. No further events follow.
    Rejected,
    /// A channel message.
    Received(Value),
}

/// Where subscriptions send their commands.
pub(crate) trait CommandSink: Send + Sync {
    /// Send a command if the socket is open.
    fn send_command(&self, command: &Command) -> bool;
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

struct Entry {
    key: u64,
    identifier: String,
    events: UnboundedSender<SubscriptionEvent>,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    pending: Vec<String>,
    guaranteeing: bool,
}

/// Every subscription of one consumer.
pub struct Subscriptions {
    sink: Weak<dyn CommandSink>,
    state: Mutex<State>,
}

impl Subscriptions {
    pub(crate) fn new(sink: Weak<dyn CommandSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(State::default()),
        }
    }

    /// Subscribe to a channel identifier.
    ///
    /// The `subscribe` command is sent right away if the socket is open and
    /// retried until the server answers.
    pub fn create(self: &Arc<Self>, identifier: impl Into<String>) -> Subscription {
        let identifier = identifier.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);

        self.state().entries.push(Entry {
            key,
            identifier: identifier.clone(),
            events: tx,
        });
        debug!(identifier = %identifier, "Created subscription");
        self.subscribe(&identifier);

        Subscription {
            key,
            identifier,
            events: rx,
            subscriptions: Arc::clone(self),
        }
    }

    /// Get the identifiers of every subscription, in creation order.
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        self.state()
            .entries
            .iter()
            .map(|entry| entry.identifier.clone())
            .collect()
    }

    /// Get the number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Check if there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Check if a `subscribe` for the identifier is still unanswered.
    #[must_use]
    pub fn is_pending(&self, identifier: &str) -> bool {
        self.state().pending.iter().any(|p| p == identifier)
    }

    /// Re-send `subscribe` for every subscription, e.g. after a reconnect.
    pub(crate) fn reload(self: &Arc<Self>) {
        let mut seen = HashSet::new();
        for identifier in self.identifiers() {
            if seen.insert(identifier.clone()) {
                self.subscribe(&identifier);
            }
        }
    }

    /// Handle a `confirm_subscription` frame.
    pub(crate) fn confirm(&self, identifier: &str) {
        self.forget_pending(identifier);
        info!(identifier = %identifier, "Subscription confirmed");
        self.notify(identifier, &SubscriptionEvent::Connected);
    }

    /// Handle a `reject_subscription` frame.
    pub(crate) fn reject(&self, identifier: &str) {
        let rejected: Vec<Entry> = {
            let mut state = self.state();
            state.pending.retain(|p| p != identifier);
            let (rejected, kept) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|entry| entry.identifier == identifier);
            state.entries = kept;
            rejected
        };

        info!(identifier = %identifier, count = rejected.len(), "Subscription rejected");
        for entry in rejected {
            let _ = entry.events.send(SubscriptionEvent::Rejected);
        }
    }

    /// Deliver an event to every subscription with the identifier.
    pub(crate) fn notify(&self, identifier: &str, event: &SubscriptionEvent) {
        let state = self.state();
        let mut delivered = 0;
        for entry in state.entries.iter().filter(|e| e.identifier == identifier) {
            if entry.events.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            trace!(identifier = %identifier, "No live subscription for event");
        }
    }

    /// Deliver an event to every subscription.
    pub(crate) fn notify_all(&self, event: &SubscriptionEvent) {
        for entry in &self.state().entries {
            let _ = entry.events.send(event.clone());
        }
    }

    fn remove(&self, key: u64) {
        let (identifier, last) = {
            let mut state = self.state();
            let Some(index) = state.entries.iter().position(|e| e.key == key) else {
                return;
            };
            let entry = state.entries.remove(index);
            let last = !state
                .entries
                .iter()
                .any(|e| e.identifier == entry.identifier);
            if last {
                state.pending.retain(|p| *p != entry.identifier);
            }
            (entry.identifier, last)
        };

        if last {
            self.send(&Command::unsubscribe(identifier.as_str()));
            debug!(identifier = %identifier, "Unsubscribed");
        }
    }

    fn subscribe(self: &Arc<Self>, identifier: &str) {
        self.guarantee(identifier);
        self.send(&Command::subscribe(identifier));
    }

    fn send(&self, command: &Command) -> bool {
        match self.sink.upgrade() {
            Some(sink) => sink.send_command(command),
            None => false,
        }
    }

    fn guarantee(self: &Arc<Self>, identifier: &str) {
        let start = {
            let mut state = self.state();
            if !state.pending.iter().any(|p| p == identifier) {
                state.pending.push(identifier.to_string());
            }
            !std::mem::replace(&mut state.guaranteeing, true)
        };

        if start {
            tokio::spawn(retry_pending(Arc::downgrade(self)));
        }
    }

    fn forget_pending(&self, identifier: &str) {
        self.state().pending.retain(|p| p != identifier);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Subscriptions")
            .field("count", &state.entries.len())
            .field("pending", &state.pending)
            .finish()
    }
}

async fn retry_pending(subscriptions: Weak<Subscriptions>) {
    loop {
        time::sleep(GUARANTEE_INTERVAL).await;
        let Some(subscriptions) = subscriptions.upgrade() else {
            return;
        };

        let pending = {
            let mut state = subscriptions.state();
            if state.pending.is_empty() {
                state.guaranteeing = false;
                return;
            }
            state.pending.clone()
        };

        for identifier in pending {
            trace!(identifier = %identifier, "Retrying subscribe");
            subscriptions.send(&Command::subscribe(identifier));
        }
    }
}

/// One channel subscription held by the application.
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    key: u64,
    identifier: String,
    events: UnboundedReceiver<SubscriptionEvent>,
    subscriptions: Arc<Subscriptions>,
}

impl Subscription {
    /// Get the channel identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Wait for the next event. Returns `None` after rejection or unsubscribe.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Take an event if one is queued.
    pub fn try_next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.try_recv().ok()
    }

    /// Call a channel action. Returns `false` if the socket is not open.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is neither an object nor null.
    pub fn perform(&self, action: &str, data: Value) -> Result<bool, ClientError> {
        let data = ActionPayload::encode(action, data)?;
        Ok(self
            .subscriptions
            .send(&Command::message(self.identifier.as_str(), data)))
    }

    /// Send raw data to the channel's default action.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be serialized.
    pub fn send(&self, data: &Value) -> Result<bool, ClientError> {
        let data = serde_json::to_string(data).map_err(cable_protocol::ProtocolError::from)?;
        Ok(self
            .subscriptions
            .send(&Command::message(self.identifier.as_str(), data)))
    }

    /// Stop receiving events. The server is told once the last subscription
    /// with this identifier is gone.
    pub fn unsubscribe(self) {
        self.subscriptions.remove(self.key);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("identifier", &self.identifier)
            .finish()
    }
}
