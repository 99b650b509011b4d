//! The demo application served by the binary: a chat channel and a
//! header or query based identity.

use async_trait::async_trait;
use cable_protocol::Handshake;
use serde_json::{json, Value};
use std::sync::Arc;
use tenvis_cable_core::{
    ActionTable, Channel, ChannelError, IdentificationError, Identity, PubSubAdapter, Server,
    ServerConfig, Subscription,
};

/// Header carrying the user name when no `user` query parameter is given.
pub const USER_HEADER: &str = "x-cable-user";

/// Topic a chat room streams from.
#[must_use]
pub fn chat_topic(room: &str) -> String {
    format!("chat:{room}")
}

/// One chat room subscription. Requires a `room` parameter.
pub struct ChatChannel {
    room: String,
}

async fn speak(
    channel: Arc<ChatChannel>,
    subscription: Arc<Subscription>,
    data: Value,
) -> Result<(), ChannelError> {
    let body = data
        .get("body")
        .and_then(Value::as_str)
        .ok_or_else(|| ChannelError::InvalidData("body must be a string".into()))?;
    let user = subscription
        .identity()
        .get("user")
        .cloned()
        .unwrap_or(Value::Null);

    subscription
        .broadcast(&chat_topic(&channel.room), &json!({ "user": user, "body": body }))
        .await?;
    Ok(())
}

#[async_trait]
impl Channel for ChatChannel {
    fn build(subscription: &Subscription) -> Result<Self, ChannelError> {
        let room = subscription
            .param_str("room")
            .filter(|room| !room.is_empty())
            .ok_or_else(|| ChannelError::InvalidParams("room is required".into()))?;
        Ok(Self {
            room: room.to_string(),
        })
    }

    fn actions() -> ActionTable<Self> {
        ActionTable::new().action("speak", speak)
    }

    async fn subscribed(&self, subscription: &Subscription) -> Result<(), ChannelError> {
        subscription.stream_from(chat_topic(&self.room)).await
    }
}

/// Identify by `user` query parameter or [`USER_HEADER`].
///
/// Clients naming neither stay anonymous.
pub fn resolve_user(handshake: &Handshake) -> Result<Identity, IdentificationError> {
    let user = handshake
        .query_param("user")
        .or_else(|| handshake.header(USER_HEADER))
        .map(str::trim);

    match user {
        Some("") => Err(IdentificationError::Unauthorized("empty user".into())),
        Some(user) => Ok(Identity::new().with("user", user)),
        None => Ok(Identity::new()),
    }
}

/// Build the demo server.
#[must_use]
pub fn build_server(pubsub: Arc<dyn PubSubAdapter>, config: ServerConfig) -> Server {
    Server::builder(pubsub)
        .channel::<ChatChannel>("ChatChannel")
        .resolver(resolve_user)
        .config(config)
        .build()
}
