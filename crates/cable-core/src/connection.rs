//! Connections: one client session.
//!
//! A connection is created by [`Server::connect`](crate::Server::connect)
//! once the client is identified. Inbound frames, stream deliveries, timers
//! and the close path all run as jobs on the connection's worker, so the
//! subscription map is only ever touched by one job at a time.

use crate::broadcaster::Broadcaster;
use crate::channel::{ChannelError, ChannelFactory, ErasedChannel};
use crate::identity::Identity;
use crate::outbox::Outbox;
use crate::pubsub::{PubSubAdapter, PubSubError, Subscriber};
use crate::server::Server;
use crate::subscription::Subscription;
use crate::worker::{panic_message, WorkerPool};
use cable_protocol::{
    codec, ActionPayload, ChannelIdentifier, Command, ControlMessage, DisconnectReason,
    ProtocolError, ServerFrame,
};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

/// Errors raised while handling a client frame.
#[derive(Debug, Error)]
pub enum CableError {
    /// The frame could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A message or command referenced a subscription that does not exist.
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    /// The identifier named a channel that is not registered.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// A channel callback failed.
    #[error("Channel error on {identifier}: {source}")]
    Channel {
        /// Identifier of the subscription.
        identifier: String,
        /// Underlying error.
        #[source]
        source: ChannelError,
    },
}

/// What subscriptions need from their connection.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub(crate) id: ConnectionId,
    pub(crate) identity: Arc<Identity>,
    pub(crate) outbox: Outbox,
    pub(crate) workers: WorkerPool,
    pub(crate) pubsub: Arc<dyn PubSubAdapter>,
    pub(crate) broadcaster: Broadcaster,
}

struct Entry {
    subscription: Arc<Subscription>,
    channel: Arc<dyn ErasedChannel>,
    timers: Vec<JoinHandle<()>>,
}

impl Entry {
    /// Abort timers, run `unsubscribed` and drop every stream. A panicking
    /// hook is logged and the streams are still released.
    async fn teardown(self, connection: ConnectionId) {
        for timer in &self.timers {
            timer.abort();
        }
        let hook = AssertUnwindSafe(self.channel.unsubscribed(&self.subscription));
        if let Err(panic) = hook.catch_unwind().await {
            error!(
                connection = %connection,
                identifier = %self.subscription.identifier(),
                panic = %panic_message(panic.as_ref()),
                "unsubscribed callback panicked"
            );
        }
        self.subscription.deactivate();
        self.subscription.stop_all_streams().await;
    }
}

/// Snapshot of a connection for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatistics {
    /// Connection id.
    pub id: String,
    /// Identity string, if identified.
    pub identifier: Option<String>,
    /// Unix time the connection opened, in seconds.
    pub started_at: u64,
    /// Raw identifiers of live subscriptions, sorted.
    pub subscriptions: Vec<String>,
}

/// A live client session.
pub struct Connection {
    handle: ConnectionHandle,
    server: Server,
    started_at: u64,
    open: AtomicBool,
    subscriptions: Mutex<HashMap<String, Entry>>,
    internal: Mutex<Option<(String, Subscriber)>>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(handle: ConnectionHandle, server: Server) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            handle,
            server,
            started_at: unix_now(),
            open: AtomicBool::new(true),
            subscriptions: Mutex::new(HashMap::new()),
            internal: Mutex::new(None),
            closed,
        }
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Get the resolved identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.handle.identity
    }

    /// Check if the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a frame for the client. Returns `false` if the writer is gone.
    pub fn transmit(&self, frame: ServerFrame) -> bool {
        self.handle.outbox.send(frame)
    }

    /// Send a heartbeat ping carrying the current unix time.
    pub fn beat(&self) -> bool {
        self.transmit(ServerFrame::ping(unix_now()))
    }

    /// Handle a raw inbound frame.
    ///
    /// Returns immediately; the frame is dispatched on the connection's worker.
    pub fn receive(self: &Arc<Self>, raw: impl Into<String>) {
        if !self.is_open() {
            debug!(connection = %self.id(), "Frame received after close, ignoring");
            return;
        }

        let raw = raw.into();
        let connection = Arc::clone(self);
        self.schedule(async move {
            connection.handle_frame(&raw).await;
        });
    }

    /// Close the connection without notifying the client, e.g. after the
    /// transport went away.
    pub fn close(self: &Arc<Self>) {
        let connection = Arc::clone(self);
        self.schedule(async move {
            connection.finish(None).await;
        });
    }

    /// Send a `disconnect` frame, then close.
    pub fn disconnect(self: &Arc<Self>, reason: DisconnectReason, reconnect: bool) {
        let connection = Arc::clone(self);
        self.schedule(async move {
            connection
                .finish(Some(ServerFrame::disconnect(reason, reconnect)))
                .await;
        });
    }

    /// Wait until the connection has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Wait until every job queued so far for this connection has run.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker pool is shut down.
    pub async fn flush(&self) -> Result<(), crate::worker::WorkerError> {
        self.handle.workers.run(&self.handle.id, async {}).await
    }

    /// Get a diagnostics snapshot.
    pub async fn statistics(&self) -> ConnectionStatistics {
        let mut subscriptions: Vec<String> =
            self.subscriptions.lock().await.keys().cloned().collect();
        subscriptions.sort_unstable();

        ConnectionStatistics {
            id: self.id().to_string(),
            identifier: self.identity().connection_identifier(),
            started_at: self.started_at,
            subscriptions,
        }
    }

    /// Get the raw identifiers of live subscriptions, sorted.
    pub async fn subscription_identifiers(&self) -> Vec<String> {
        self.statistics().await.subscriptions
    }

    /// Listen for control messages on the identity's internal topic.
    pub(crate) async fn listen_internal(self: &Arc<Self>, topic: String) -> Result<(), PubSubError> {
        let weak: Weak<Connection> = Arc::downgrade(self);
        let subscriber = Subscriber::new(move |payload: Arc<str>| {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let target = Arc::clone(&connection);
            connection.schedule(async move {
                target.handle_internal(&payload).await;
            });
        });

        self.handle.pubsub.subscribe(&topic, subscriber.clone()).await?;
        debug!(connection = %self.id(), topic = %topic, "Listening on internal topic");
        *self.internal.lock().await = Some((topic, subscriber));
        Ok(())
    }

    fn schedule<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(error) = self.handle.workers.submit(&self.handle.id, job) {
            warn!(connection = %self.id(), error = %error, "Could not schedule connection job");
        }
    }

    async fn handle_frame(&self, raw: &str) {
        if !self.is_open() {
            return;
        }

        match self.dispatch(raw).await {
            Ok(()) => {}
            Err(CableError::UnknownSubscription(identifier)) => {
                error!(
                    connection = %self.id(),
                    identifier = %identifier,
                    "Message for unknown subscription"
                );
            }
            Err(CableError::Channel { identifier, source }) => {
                error!(
                    connection = %self.id(),
                    identifier = %identifier,
                    error = %source,
                    "Channel error"
                );
            }
            Err(error) => {
                warn!(connection = %self.id(), error = %error, "Could not process frame");
            }
        }
    }

    async fn dispatch(&self, raw: &str) -> Result<(), CableError> {
        match codec::decode_command(raw)? {
            Command::Subscribe { identifier } => self.subscribe(identifier).await,
            Command::Unsubscribe { identifier } => {
                self.unsubscribe(&identifier).await;
                Ok(())
            }
            Command::Message { identifier, data } => self.perform(&identifier, &data).await,
        }
    }

    async fn subscribe(&self, raw: String) -> Result<(), CableError> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&raw) {
            debug!(connection = %self.id(), identifier = %raw, "Already subscribed");
            self.transmit(ServerFrame::confirm(raw));
            return Ok(());
        }

        let identifier = match ChannelIdentifier::parse(&raw) {
            Ok(identifier) => identifier,
            Err(error) => {
                self.transmit(ServerFrame::reject(raw));
                return Err(error.into());
            }
        };

        let Some(factory) = self.server.channels().get(identifier.channel()) else {
            let channel = identifier.channel().to_string();
            self.transmit(ServerFrame::reject(raw));
            return Err(CableError::UnknownChannel(channel));
        };

        let subscription = Arc::new(Subscription::new(identifier, self.handle.clone()));
        let started = AssertUnwindSafe(start_subscription(factory.as_ref(), &subscription))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ChannelError::Panicked(panic_message(panic.as_ref()).to_string()))
            });
        match started {
            Ok(channel) => {
                let timers = channel.start_timers(&subscription);
                subscriptions.insert(
                    raw.clone(),
                    Entry {
                        subscription,
                        channel,
                        timers,
                    },
                );
                info!(connection = %self.id(), identifier = %raw, "Subscribed");
                self.transmit(ServerFrame::confirm(raw));
                Ok(())
            }
            Err(ChannelError::Rejected) => {
                subscription.deactivate();
                subscription.stop_all_streams().await;
                info!(connection = %self.id(), identifier = %raw, "Subscription rejected");
                self.transmit(ServerFrame::reject(raw));
                Ok(())
            }
            Err(source) => {
                subscription.deactivate();
                subscription.stop_all_streams().await;
                self.transmit(ServerFrame::reject(raw.clone()));
                Err(CableError::Channel {
                    identifier: raw,
                    source,
                })
            }
        }
    }

    async fn unsubscribe(&self, identifier: &str) {
        let entry = self.subscriptions.lock().await.remove(identifier);
        match entry {
            Some(entry) => {
                entry.teardown(self.id()).await;
                info!(connection = %self.id(), identifier = %identifier, "Unsubscribed");
            }
            None => {
                debug!(
                    connection = %self.id(),
                    identifier = %identifier,
                    "Unsubscribe for unknown subscription"
                );
            }
        }
    }

    async fn perform(&self, identifier: &str, data: &str) -> Result<(), CableError> {
        let (subscription, channel) = {
            let subscriptions = self.subscriptions.lock().await;
            let entry = subscriptions
                .get(identifier)
                .ok_or_else(|| CableError::UnknownSubscription(identifier.to_string()))?;
            (Arc::clone(&entry.subscription), Arc::clone(&entry.channel))
        };

        let payload = ActionPayload::parse(data)?;
        channel
            .perform(&subscription, &payload.action, payload.data)
            .await
            .map_err(|source| CableError::Channel {
                identifier: identifier.to_string(),
                source,
            })
    }

    async fn handle_internal(&self, payload: &str) {
        match serde_json::from_str::<ControlMessage>(payload) {
            Ok(ControlMessage::Disconnect { reconnect }) => {
                info!(connection = %self.id(), reconnect, "Remote disconnect");
                self.finish(Some(ServerFrame::disconnect(
                    DisconnectReason::Remote,
                    reconnect,
                )))
                .await;
            }
            Err(error) => {
                warn!(
                    connection = %self.id(),
                    error = %error,
                    "Unrecognized internal message"
                );
            }
        }
    }

    /// Tear the connection down. Runs at most once.
    pub(crate) async fn finish(&self, farewell: Option<ServerFrame>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(frame) = farewell {
            self.transmit(frame);
        }

        let entries: Vec<Entry> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.teardown(self.id()).await;
        }

        if let Some((topic, subscriber)) = self.internal.lock().await.take() {
            if let Err(error) = self.handle.pubsub.unsubscribe(&topic, &subscriber).await {
                warn!(
                    connection = %self.id(),
                    topic = %topic,
                    error = %error,
                    "Failed to leave internal topic"
                );
            }
        }

        self.server.registry().remove(self.id());
        self.handle.outbox.close();
        let hook = AssertUnwindSafe(self.server.hooks().disconnected(self));
        if let Err(panic) = hook.catch_unwind().await {
            error!(
                connection = %self.id(),
                panic = %panic_message(panic.as_ref()),
                "disconnected hook panicked"
            );
        }
        self.closed.send_replace(true);

        info!(connection = %self.id(), "Connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("identity", self.identity())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Build the channel and run its `subscribed` callback.
async fn start_subscription(
    factory: &dyn ChannelFactory,
    subscription: &Arc<Subscription>,
) -> Result<Arc<dyn ErasedChannel>, ChannelError> {
    let channel = factory.build(subscription)?;
    if !subscription.is_rejected() {
        channel.subscribed(subscription).await?;
    }
    if subscription.is_rejected() {
        return Err(ChannelError::Rejected);
    }
    Ok(channel)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outgoing;
    use crate::pubsub::InMemoryPubSub;
    use crate::testing::{fragile, room, server, Client};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_connection_id_display() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
        assert_eq!(ConnectionId(255).to_string(), "conn_ff");
    }

    #[tokio::test]
    async fn test_subscribe_confirms() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let lobby = room("lobby");
        assert_eq!(client.subscribe(&lobby).await, ServerFrame::confirm(&lobby));
        assert_eq!(
            client.connection.subscription_identifiers().await,
            vec![lobby]
        );
        assert_eq!(pubsub.subscriber_count("room:lobby"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_keeps_one_subscription() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let lobby = room("lobby");
        assert_eq!(client.subscribe(&lobby).await, ServerFrame::confirm(&lobby));
        assert_eq!(client.subscribe(&lobby).await, ServerFrame::confirm(&lobby));
        assert_eq!(client.connection.subscription_identifiers().await.len(), 1);
        assert_eq!(pubsub.subscriber_count("room:lobby"), 1);

        server.broadcast("room:lobby", &json!({"n": 1})).await.unwrap();
        client.flush().await;

        assert_eq!(client.messages(), vec![(lobby, json!({"n": 1}))]);
    }

    #[tokio::test]
    async fn test_subscribe_rejections() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let unknown = ChannelIdentifier::new("NopeChannel").into_string();
        assert_eq!(client.subscribe(&unknown).await, ServerFrame::reject(&unknown));

        let no_room = ChannelIdentifier::new("RoomChannel").into_string();
        assert_eq!(client.subscribe(&no_room).await, ServerFrame::reject(&no_room));

        let forbidden = room("forbidden");
        assert_eq!(
            client.subscribe(&forbidden).await,
            ServerFrame::reject(&forbidden)
        );
        assert_eq!(pubsub.subscriber_count("room:forbidden"), 0);

        let admin = ChannelIdentifier::new("AdminChannel").into_string();
        assert_eq!(client.subscribe(&admin).await, ServerFrame::reject(&admin));
        assert_eq!(pubsub.subscriber_count("admin"), 0);

        assert_eq!(client.subscribe("not json").await, ServerFrame::reject("not json"));

        assert!(client.connection.subscription_identifiers().await.is_empty());
        assert!(client.connection.is_open());
    }

    #[tokio::test]
    async fn test_admin_channel_accepts_admin() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "admin").await;

        let admin = ChannelIdentifier::new("AdminChannel").into_string();
        assert_eq!(client.subscribe(&admin).await, ServerFrame::confirm(&admin));
        assert_eq!(pubsub.subscriber_count("admin"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let lobby = room("lobby");
        client.subscribe(&lobby).await;
        client.send(Command::unsubscribe(&lobby)).await;

        assert_eq!(client.messages(), vec![(lobby.clone(), json!({"left": "lobby"}))]);
        assert!(client.connection.subscription_identifiers().await.is_empty());
        assert_eq!(pubsub.subscriber_count("room:lobby"), 0);

        server.broadcast("room:lobby", "after").await.unwrap();
        client.flush().await;
        assert!(client.drain().is_empty());

        client.send(Command::unsubscribe(&lobby)).await;
        assert!(client.drain().is_empty());
        assert!(client.connection.is_open());
    }

    #[tokio::test]
    async fn test_message_dispatches_action() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let lobby = room("lobby");
        client.subscribe(&lobby).await;
        client.perform(&lobby, "echo", json!({"x": 1})).await;

        assert_eq!(
            client.messages(),
            vec![(lobby, json!({"action": "echo", "x": 1}))]
        );
    }

    #[tokio::test]
    async fn test_message_for_unknown_subscription() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        client.perform(&room("nowhere"), "echo", json!({})).await;

        assert!(client.drain().is_empty());
        assert!(client.connection.is_open());
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_open() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        client.connection.receive("garbage");
        client.connection.receive(r#"{"command":"dance","identifier":"x"}"#);
        client.flush().await;

        assert!(client.drain().is_empty());
        assert!(client.connection.is_open());
    }

    #[tokio::test]
    async fn test_failing_action_is_isolated() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let a = room("a");
        let b = room("b");
        client.subscribe(&a).await;
        client.subscribe(&b).await;

        client.perform(&a, "fail", json!({})).await;
        client.perform(&a, "explode", json!({})).await;
        client.perform(&a, "missing", json!({})).await;
        assert!(client.connection.is_open());

        server.broadcast("room:b", &json!({"still": "here"})).await.unwrap();
        client.flush().await;
        assert_eq!(client.messages(), vec![(b, json!({"still": "here"}))]);

        client.perform(&a, "echo", json!({})).await;
        assert_eq!(client.messages(), vec![(a, json!({"action": "echo"}))]);
    }

    #[tokio::test]
    async fn test_close_cleans_up() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        client.subscribe(&room("a")).await;
        client.subscribe(&room("b")).await;
        assert_eq!(pubsub.subscriber_count("internal/ada"), 1);

        client.connection.close();
        client.connection.closed().await;

        let items = client.drain();
        assert_eq!(items.last(), Some(&Outgoing::Close));
        let left = items
            .iter()
            .filter(|item| matches!(item, Outgoing::Frame(ServerFrame::Message { .. })))
            .count();
        assert_eq!(left, 2);

        assert!(!client.connection.is_open());
        assert!(client.connection.subscription_identifiers().await.is_empty());
        assert!(!server.registry().contains(client.connection.id()));
        assert_eq!(pubsub.stats().subscriber_count, 0);

        server.broadcast("room:a", "again").await.unwrap();
        client
            .connection
            .receive(codec::encode_command(&Command::subscribe(room("c"))).unwrap());
        server.workers().run(&client.connection.id(), async {}).await.unwrap();
        assert!(client.drain().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        client
            .connection
            .disconnect(DisconnectReason::ServerRestart, true);
        client.connection.close();
        client.connection.close();
        client.connection.closed().await;
        client.flush().await;

        assert_eq!(
            client.drain(),
            vec![
                Outgoing::Frame(ServerFrame::disconnect(DisconnectReason::ServerRestart, true)),
                Outgoing::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_subscribed_releases_streams() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let identifier = fragile("subscribed");
        for _ in 0..2 {
            assert_eq!(
                client.subscribe(&identifier).await,
                ServerFrame::reject(identifier.as_str())
            );
        }
        assert_eq!(pubsub.subscriber_count("fragile"), 0);
        assert!(client.connection.subscription_identifiers().await.is_empty());
        assert!(client.connection.is_open());

        server.broadcast("fragile", "leaked").await.unwrap();
        client.flush().await;
        assert!(client.drain().is_empty());

        assert_eq!(
            client.subscribe(&room("a")).await,
            ServerFrame::confirm(room("a"))
        );
    }

    #[tokio::test]
    async fn test_panicking_unsubscribed_still_unsubscribes() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let identifier = fragile("unsubscribed");
        client.subscribe(&identifier).await;
        assert_eq!(pubsub.subscriber_count("fragile"), 1);

        client.send(Command::unsubscribe(&identifier)).await;
        assert_eq!(pubsub.subscriber_count("fragile"), 0);
        assert!(client.connection.subscription_identifiers().await.is_empty());
        assert!(client.connection.is_open());
    }

    #[tokio::test]
    async fn test_panicking_unsubscribed_still_closes() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        client.subscribe(&fragile("unsubscribed")).await;
        client.subscribe(&room("a")).await;

        client.connection.close();
        tokio::time::timeout(Duration::from_secs(2), client.connection.closed())
            .await
            .unwrap();

        let items = client.drain();
        assert_eq!(items.last(), Some(&Outgoing::Close));
        assert!(items.contains(&Outgoing::Frame(ServerFrame::message(
            room("a"),
            json!({"left": "a"})
        ))));
        assert!(!server.registry().contains(client.connection.id()));
        assert_eq!(pubsub.stats().subscriber_count, 0);

        tokio::time::timeout(Duration::from_secs(2), server.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_statistics() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;
        client.subscribe(&room("lobby")).await;

        let stats = client.connection.statistics().await;
        assert_eq!(stats.id, client.connection.id().to_string());
        assert_eq!(stats.identifier.as_deref(), Some("ada"));
        assert_eq!(stats.subscriptions, vec![room("lobby")]);
        assert!(stats.started_at > 0);
    }

    #[tokio::test]
    async fn test_beat() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        assert!(client.connection.beat());
        assert!(matches!(client.next_frame(), Some(ServerFrame::Ping { message }) if message > 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let mut client = Client::connect(&server, "ada").await;

        let ticker = ChannelIdentifier::new("TickerChannel").into_string();
        assert_eq!(client.subscribe(&ticker).await, ServerFrame::confirm(&ticker));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        client.flush().await;
        assert_eq!(
            client.messages(),
            vec![
                (ticker.clone(), json!({"tick": true})),
                (ticker.clone(), json!({"tick": true})),
            ]
        );

        client.send(Command::unsubscribe(&ticker)).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        client.flush().await;
        assert!(client.messages().is_empty());
    }
}
