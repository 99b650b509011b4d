//! Fixtures shared by connection and server tests.

use crate::{
    ActionTable, Channel, ChannelError, Connection, IdentificationError, Identity, InMemoryPubSub,
    Outbox, Outgoing, Server, ServerConfig, Subscription,
};
use async_trait::async_trait;
use cable_protocol::{codec, ActionPayload, ChannelIdentifier, Command, Handshake, ServerFrame};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Streams `room:<room>`; rooms named `forbidden` are rejected.
pub(crate) struct RoomChannel {
    room: String,
}

impl RoomChannel {
    fn topic(&self) -> String {
        format!("room:{}", self.room)
    }
}

async fn speak(
    channel: Arc<RoomChannel>,
    subscription: Arc<Subscription>,
    data: Value,
) -> Result<(), ChannelError> {
    let body = data.get("body").cloned().unwrap_or(Value::Null);
    subscription
        .broadcast(&channel.topic(), &json!({ "body": body }))
        .await?;
    Ok(())
}

async fn echo(
    _: Arc<RoomChannel>,
    subscription: Arc<Subscription>,
    data: Value,
) -> Result<(), ChannelError> {
    subscription.transmit(data);
    Ok(())
}

async fn fail(_: Arc<RoomChannel>, _: Arc<Subscription>, _: Value) -> Result<(), ChannelError> {
    Err(ChannelError::other("action failed"))
}

async fn explode(_: Arc<RoomChannel>, _: Arc<Subscription>, _: Value) -> Result<(), ChannelError> {
    panic!("action exploded")
}

#[async_trait]
impl Channel for RoomChannel {
    fn build(subscription: &Subscription) -> Result<Self, ChannelError> {
        let room = subscription
            .param_str("room")
            .ok_or_else(|| ChannelError::InvalidParams("room is required".into()))?;
        if room == "forbidden" {
            subscription.reject();
        }
        Ok(Self {
            room: room.to_string(),
        })
    }

    fn actions() -> ActionTable<Self> {
        ActionTable::new()
            .action("speak", speak)
            .action("echo", echo)
            .action("fail", fail)
            .action("explode", explode)
    }

    async fn subscribed(&self, subscription: &Subscription) -> Result<(), ChannelError> {
        subscription.stream_from(self.topic()).await
    }

    async fn unsubscribed(&self, subscription: &Subscription) {
        subscription.transmit(json!({ "left": self.room }));
    }
}

/// Streams `admin`, then rejects anyone but the `admin` user.
pub(crate) struct AdminChannel;

#[async_trait]
impl Channel for AdminChannel {
    fn build(_: &Subscription) -> Result<Self, ChannelError> {
        Ok(AdminChannel)
    }

    async fn subscribed(&self, subscription: &Subscription) -> Result<(), ChannelError> {
        subscription.stream_from("admin").await?;
        if subscription.identity().get_str("user") != Some("admin") {
            subscription.reject();
        }
        Ok(())
    }
}

async fn tick(_: Arc<TickerChannel>, subscription: Arc<Subscription>) -> Result<(), ChannelError> {
    subscription.transmit(json!({ "tick": true }));
    Ok(())
}

/// Transmits `{"tick": true}` every second.
pub(crate) struct TickerChannel;

#[async_trait]
impl Channel for TickerChannel {
    fn build(_: &Subscription) -> Result<Self, ChannelError> {
        Ok(TickerChannel)
    }

    fn actions() -> ActionTable<Self> {
        ActionTable::new().periodically(Duration::from_secs(1), tick)
    }
}

/// Streams `fragile`, then panics in the callback named by the `panic_in`
/// parameter.
pub(crate) struct FragileChannel {
    panic_in: String,
}

#[async_trait]
impl Channel for FragileChannel {
    fn build(subscription: &Subscription) -> Result<Self, ChannelError> {
        Ok(Self {
            panic_in: subscription.param_str("panic_in").unwrap_or_default().to_string(),
        })
    }

    async fn subscribed(&self, subscription: &Subscription) -> Result<(), ChannelError> {
        subscription.stream_from("fragile").await?;
        if self.panic_in == "subscribed" {
            panic!("subscribed exploded");
        }
        Ok(())
    }

    async fn unsubscribed(&self, _: &Subscription) {
        if self.panic_in == "unsubscribed" {
            panic!("unsubscribed exploded");
        }
    }
}

pub(crate) fn fragile(panic_in: &str) -> String {
    ChannelIdentifier::new("FragileChannel")
        .with_param("panic_in", panic_in)
        .into_string()
}

/// Identifies clients by the `user` query parameter.
pub(crate) fn resolve_user(handshake: &Handshake) -> Result<Identity, IdentificationError> {
    match handshake.query_param("user") {
        Some(user) => Ok(Identity::new().with("user", user)),
        None => Err(IdentificationError::Unauthorized("missing user".into())),
    }
}

pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        heartbeat_interval: None,
        ..ServerConfig::default()
    }
}

pub(crate) fn server(pubsub: &Arc<InMemoryPubSub>) -> Server {
    Server::builder(pubsub.clone())
        .channel::<RoomChannel>("RoomChannel")
        .channel::<AdminChannel>("AdminChannel")
        .channel::<TickerChannel>("TickerChannel")
        .channel::<FragileChannel>("FragileChannel")
        .resolver(resolve_user)
        .config(test_config())
        .build()
}

pub(crate) fn room(name: &str) -> String {
    ChannelIdentifier::new("RoomChannel")
        .with_param("room", name)
        .into_string()
}

/// A connected test client reading the connection's outbox.
pub(crate) struct Client {
    pub(crate) connection: Arc<Connection>,
    rx: UnboundedReceiver<Outgoing>,
}

impl Client {
    pub(crate) async fn connect(server: &Server, user: &str) -> Self {
        let (outbox, rx) = Outbox::channel();
        let handshake = Handshake::new(&format!("/cable?user={user}"));
        let connection = server.connect(&handshake, outbox).await.unwrap();

        let mut client = Self { connection, rx };
        assert_eq!(client.next_frame(), Some(ServerFrame::Welcome));
        client
    }

    /// Feed a command and wait until it has been processed.
    pub(crate) async fn send(&self, command: Command) {
        self.connection
            .receive(codec::encode_command(&command).unwrap());
        self.flush().await;
    }

    pub(crate) async fn subscribe(&mut self, identifier: &str) -> ServerFrame {
        self.send(Command::subscribe(identifier)).await;
        self.next_frame().expect("no reply to subscribe")
    }

    pub(crate) async fn perform(&self, identifier: &str, action: &str, data: Value) {
        let data = ActionPayload::encode(action, data).unwrap();
        self.send(Command::message(identifier, data)).await;
    }

    pub(crate) async fn flush(&self) {
        self.connection.flush().await.unwrap();
    }

    pub(crate) fn next_frame(&mut self) -> Option<ServerFrame> {
        match self.rx.try_recv() {
            Ok(Outgoing::Frame(frame)) => Some(frame),
            _ => None,
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<Outgoing> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Channel data frames received so far, as `(identifier, message)`.
    pub(crate) fn messages(&mut self) -> Vec<(String, Value)> {
        self.drain()
            .into_iter()
            .filter_map(|item| match item {
                Outgoing::Frame(ServerFrame::Message {
                    identifier,
                    message,
                }) => Some((identifier, message)),
                _ => None,
            })
            .collect()
    }
}
