//! Channels: application logic behind subscriptions.
//!
//! A channel type is instantiated once per subscription. Its actions are
//! registered in an explicit [`ActionTable`], mapping the `action` name of a
//! client `message` to a handler, plus any periodic timers.
//!
//! ```rust,ignore
//! struct ChatChannel { room: String }
//!
//! #[async_trait]
//! impl Channel for ChatChannel {
//!     fn build(subscription: &Subscription) -> Result<Self, ChannelError> {
//!         let room = subscription.param_str("room").ok_or(ChannelError::Rejected)?;
//!         Ok(Self { room: room.to_string() })
//!     }
//!
//!     fn actions() -> ActionTable<Self> {
//!         ActionTable::new().action("speak", speak)
//!     }
//!
//!     async fn subscribed(&self, subscription: &Subscription) -> Result<(), ChannelError> {
//!         subscription.stream_for(&self.room).await
//!     }
//! }
//! ```

use crate::broadcaster::BroadcastError;
use crate::pubsub::PubSubError;
use crate::subscription::Subscription;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The subscription was refused.
    #[error("Subscription rejected")]
    Rejected,

    /// No handler is registered for the action.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Identifier parameters are missing or malformed.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Action data is missing or malformed.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Stream registration failed.
    #[error("Stream error: {0}")]
    Stream(#[from] PubSubError),

    /// Broadcasting from an action failed.
    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    /// A channel callback panicked.
    #[error("Channel callback panicked: {0}")]
    Panicked(String),

    /// Application error.
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl ChannelError {
    /// Wrap an application error.
    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ChannelError::Custom(error.into())
    }
}

/// Future returned by action and timer handlers.
pub type ActionFuture = BoxFuture<'static, Result<(), ChannelError>>;

type ActionFn<C> = Arc<dyn Fn(Arc<C>, Arc<Subscription>, Value) -> ActionFuture + Send + Sync>;
type TimerFn<C> = Arc<dyn Fn(Arc<C>, Arc<Subscription>) -> ActionFuture + Send + Sync>;

/// Action and timer registrations for a channel type.
pub struct ActionTable<C> {
    actions: HashMap<String, ActionFn<C>>,
    timers: Vec<(Duration, TimerFn<C>)>,
}

impl<C> Default for ActionTable<C> {
    fn default() -> Self {
        Self {
            actions: HashMap::new(),
            timers: Vec::new(),
        }
    }
}

impl<C: Send + Sync + 'static> ActionTable<C> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `name`.
    ///
    /// The handler receives the full message data, `action` key included.
    #[must_use]
    pub fn action<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<C>, Arc<Subscription>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        let handler: ActionFn<C> = Arc::new(
            move |channel: Arc<C>, subscription: Arc<Subscription>, data: Value| -> ActionFuture {
                handler(channel, subscription, data).boxed()
            },
        );
        self.actions.insert(name.to_string(), handler);
        self
    }

    /// Run `handler` every `every` while the subscription is live.
    ///
    /// Ticks run on the connection's worker like any other callback.
    #[must_use]
    pub fn periodically<F, Fut>(mut self, every: Duration, handler: F) -> Self
    where
        F: Fn(Arc<C>, Arc<Subscription>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        let handler: TimerFn<C> = Arc::new(
            move |channel: Arc<C>, subscription: Arc<Subscription>| -> ActionFuture {
                handler(channel, subscription).boxed()
            },
        );
        self.timers.push((every.max(Duration::from_millis(1)), handler));
        self
    }

    /// Check if an action is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Get the registered action names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of periodic timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

/// Application logic for one kind of subscription.
#[async_trait]
pub trait Channel: Send + Sync + Sized + 'static {
    /// Instantiate the channel for a new subscription.
    ///
    /// Returning an error rejects the subscription.
    fn build(subscription: &Subscription) -> Result<Self, ChannelError>;

    /// Actions and timers for this channel type. Called once at registration.
    fn actions() -> ActionTable<Self> {
        ActionTable::new()
    }

    /// Called after the subscription is created, before it is confirmed.
    ///
    /// Returning an error, or calling [`Subscription::reject`], rejects it.
    async fn subscribed(&self, _subscription: &Subscription) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Called exactly once when the subscription is torn down.
    async fn unsubscribed(&self, _subscription: &Subscription) {}
}

/// Object-safe view of a channel instance.
#[async_trait]
pub(crate) trait ErasedChannel: Send + Sync {
    async fn subscribed(&self, subscription: &Subscription) -> Result<(), ChannelError>;

    async fn unsubscribed(&self, subscription: &Subscription);

    async fn perform(
        &self,
        subscription: &Arc<Subscription>,
        action: &str,
        data: Value,
    ) -> Result<(), ChannelError>;

    fn start_timers(&self, subscription: &Arc<Subscription>) -> Vec<JoinHandle<()>>;
}

struct Bound<C> {
    channel: Arc<C>,
    table: Arc<ActionTable<C>>,
}

#[async_trait]
impl<C: Channel> ErasedChannel for Bound<C> {
    async fn subscribed(&self, subscription: &Subscription) -> Result<(), ChannelError> {
        self.channel.subscribed(subscription).await
    }

    async fn unsubscribed(&self, subscription: &Subscription) {
        self.channel.unsubscribed(subscription).await;
    }

    async fn perform(
        &self,
        subscription: &Arc<Subscription>,
        action: &str,
        data: Value,
    ) -> Result<(), ChannelError> {
        let handler = self
            .table
            .actions
            .get(action)
            .ok_or_else(|| ChannelError::UnknownAction(action.to_string()))?;

        trace!(
            connection = %subscription.connection_id(),
            identifier = %subscription.identifier(),
            action = %action,
            "Performing action"
        );
        handler(Arc::clone(&self.channel), Arc::clone(subscription), data).await
    }

    fn start_timers(&self, subscription: &Arc<Subscription>) -> Vec<JoinHandle<()>> {
        self.table
            .timers
            .iter()
            .map(|(every, handler)| {
                tokio::spawn(run_timer(
                    *every,
                    Arc::clone(handler),
                    Arc::clone(&self.channel),
                    Arc::clone(subscription),
                ))
            })
            .collect()
    }
}

async fn run_timer<C: Send + Sync + 'static>(
    every: Duration,
    handler: TimerFn<C>,
    channel: Arc<C>,
    subscription: Arc<Subscription>,
) {
    let mut ticker = time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !subscription.is_active() {
            break;
        }

        let job = handler(Arc::clone(&channel), Arc::clone(&subscription));
        let target = Arc::clone(&subscription);
        let submitted = subscription.workers().submit(
            &subscription.connection_id(),
            async move {
                if !target.is_active() {
                    return;
                }
                if let Err(error) = job.await {
                    warn!(
                        connection = %target.connection_id(),
                        identifier = %target.identifier(),
                        error = %error,
                        "Periodic timer failed"
                    );
                }
            },
        );

        if submitted.is_err() {
            break;
        }
    }

    debug!(identifier = %subscription.identifier(), "Periodic timer stopped");
}

/// Builds channel instances of one type.
pub(crate) trait ChannelFactory: Send + Sync {
    fn build(&self, subscription: &Subscription) -> Result<Arc<dyn ErasedChannel>, ChannelError>;
}

struct TypedFactory<C> {
    table: Arc<ActionTable<C>>,
}

impl<C: Channel> ChannelFactory for TypedFactory<C> {
    fn build(&self, subscription: &Subscription) -> Result<Arc<dyn ErasedChannel>, ChannelError> {
        let channel = C::build(subscription)?;
        Ok(Arc::new(Bound {
            channel: Arc::new(channel),
            table: Arc::clone(&self.table),
        }))
    }
}

/// Channel types by the name clients put in the identifier's `channel` key.
#[derive(Default)]
pub struct ChannelRegistry {
    factories: HashMap<String, Arc<dyn ChannelFactory>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel type under `name`, replacing any previous one.
    pub fn register<C: Channel>(&mut self, name: impl Into<String>) {
        let name = name.into();
        let table = Arc::new(C::actions());
        debug!(
            channel = %name,
            actions = table.actions.len(),
            timers = table.timers.len(),
            "Registered channel"
        );
        self.factories
            .insert(name, Arc::new(TypedFactory::<C> { table }));
    }

    /// Check if a channel name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Get the registered channel names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ChannelFactory>> {
        self.factories.get(name).cloned()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.names())
            .finish()
    }
}
