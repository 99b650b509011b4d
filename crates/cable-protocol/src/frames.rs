//! Frame types for the cable protocol.
//!
//! Inbound frames are client commands; outbound frames are everything the
//! server pushes to a client. Both are JSON objects sent as text messages.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Command names as they appear on the wire.
pub mod command {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const MESSAGE: &str = "message";
}

/// Outbound control frame types.
pub mod kind {
    pub const WELCOME: &str = "welcome";
    pub const PING: &str = "ping";
    pub const CONFIRM: &str = "confirm_subscription";
    pub const REJECT: &str = "reject_subscription";
    pub const DISCONNECT: &str = "disconnect";
}

/// Action invoked when a message carries no `action` key.
pub const DEFAULT_ACTION: &str = "receive";

/// The raw command envelope sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command name.
    pub command: String,
    /// Opaque channel identifier (a JSON-encoded object).
    #[serde(default)]
    pub identifier: String,
    /// JSON-encoded action data, only present on `message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// A client command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "CommandEnvelope", try_from = "CommandEnvelope")]
pub enum Command {
    /// Subscribe to the channel named by the identifier.
    Subscribe {
        /// Opaque channel identifier.
        identifier: String,
    },

    /// Drop the subscription for the identifier.
    Unsubscribe {
        /// Opaque channel identifier.
        identifier: String,
    },

    /// Perform an action on an existing subscription.
    Message {
        /// Opaque channel identifier.
        identifier: String,
        /// JSON-encoded action data.
        data: String,
    },
}

impl Command {
    /// Create a subscribe command.
    #[must_use]
    pub fn subscribe(identifier: impl Into<String>) -> Self {
        Command::Subscribe {
            identifier: identifier.into(),
        }
    }

    /// Create an unsubscribe command.
    #[must_use]
    pub fn unsubscribe(identifier: impl Into<String>) -> Self {
        Command::Unsubscribe {
            identifier: identifier.into(),
        }
    }

    /// Create a message command.
    #[must_use]
    pub fn message(identifier: impl Into<String>, data: impl Into<String>) -> Self {
        Command::Message {
            identifier: identifier.into(),
            data: data.into(),
        }
    }

    /// Get the command name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Subscribe { .. } => command::SUBSCRIBE,
            Command::Unsubscribe { .. } => command::UNSUBSCRIBE,
            Command::Message { .. } => command::MESSAGE,
        }
    }

    /// Get the identifier the command targets.
    #[must_use]
    pub fn identifier(&self) -> &str {
        match self {
            Command::Subscribe { identifier }
            | Command::Unsubscribe { identifier }
            | Command::Message { identifier, .. } => identifier,
        }
    }
}

impl From<Command> for CommandEnvelope {
    fn from(command: Command) -> Self {
        let name = command.name().to_string();
        match command {
            Command::Subscribe { identifier } | Command::Unsubscribe { identifier } => Self {
                command: name,
                identifier,
                data: None,
            },
            Command::Message { identifier, data } => Self {
                command: name,
                identifier,
                data: Some(data),
            },
        }
    }
}

impl TryFrom<CommandEnvelope> for Command {
    type Error = ProtocolError;

    fn try_from(envelope: CommandEnvelope) -> Result<Self, Self::Error> {
        if envelope.identifier.is_empty() {
            return Err(ProtocolError::MissingField("identifier"));
        }

        match envelope.command.as_str() {
            command::SUBSCRIBE => Ok(Command::Subscribe {
                identifier: envelope.identifier,
            }),
            command::UNSUBSCRIBE => Ok(Command::Unsubscribe {
                identifier: envelope.identifier,
            }),
            command::MESSAGE => Ok(Command::Message {
                identifier: envelope.identifier,
                data: envelope.data.ok_or(ProtocolError::MissingField("data"))?,
            }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// The action and data carried by a `message` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPayload {
    /// Action name to dispatch.
    pub action: String,
    /// The full data object, `action` key included.
    pub data: Value,
}

impl ActionPayload {
    /// Parse the JSON-encoded `data` of a message command.
    ///
    /// A missing `action` key selects [`DEFAULT_ACTION`].
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not a JSON object or `action` is not a string.
    pub fn parse(data: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(data)?;
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::Invalid("message data must be an object".into()))?;

        let action = match object.get("action") {
            None | Some(Value::Null) => DEFAULT_ACTION.to_string(),
            Some(Value::String(action)) if !action.is_empty() => action.clone(),
            Some(_) => return Err(ProtocolError::Invalid("action must be a string".into())),
        };

        Ok(Self {
            action,
            data: value,
        })
    }

    /// Encode an action call as the `data` string of a message command.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is neither an object nor null.
    pub fn encode(action: &str, data: Value) -> Result<String, ProtocolError> {
        let mut object = match data {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            _ => return Err(ProtocolError::Invalid("action data must be an object".into())),
        };
        object.insert("action".to_string(), Value::String(action.to_string()));
        Ok(serde_json::to_string(&Value::Object(object))?)
    }
}

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Identification failed.
    Unauthorized,
    /// The upgrade request was not acceptable.
    InvalidRequest,
    /// The server is restarting.
    ServerRestart,
    /// Another process asked for the disconnect.
    Remote,
}

impl DisconnectReason {
    /// Wire name of the reason.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Unauthorized => "unauthorized",
            DisconnectReason::InvalidRequest => "invalid_request",
            DisconnectReason::ServerRestart => "server_restart",
            DisconnectReason::Remote => "remote",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat wire representation shared by all outbound frames.
///
/// Control frames carry a `type`; channel data frames carry only
/// `identifier` and `message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DisconnectReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireFrame", try_from = "WireFrame")]
pub enum ServerFrame {
    /// Sent once identification succeeded.
    Welcome,

    /// Heartbeat carrying the server's unix time in seconds.
    Ping {
        /// Unix timestamp in seconds.
        message: u64,
    },

    /// The subscription was accepted.
    Confirm {
        /// Identifier of the subscription.
        identifier: String,
    },

    /// The subscription was refused.
    Reject {
        /// Identifier of the refused subscription.
        identifier: String,
    },

    /// The server is closing the connection.
    Disconnect {
        /// Why the connection is closed.
        reason: DisconnectReason,
        /// Whether the client should try to reconnect.
        reconnect: bool,
    },

    /// Channel data for one subscription.
    Message {
        /// Identifier of the subscription.
        identifier: String,
        /// Arbitrary JSON payload.
        message: Value,
    },
}

impl ServerFrame {
    /// Create a ping frame.
    #[must_use]
    pub fn ping(timestamp: u64) -> Self {
        ServerFrame::Ping { message: timestamp }
    }

    /// Create a confirmation frame.
    #[must_use]
    pub fn confirm(identifier: impl Into<String>) -> Self {
        ServerFrame::Confirm {
            identifier: identifier.into(),
        }
    }

    /// Create a rejection frame.
    #[must_use]
    pub fn reject(identifier: impl Into<String>) -> Self {
        ServerFrame::Reject {
            identifier: identifier.into(),
        }
    }

    /// Create a disconnect frame.
    #[must_use]
    pub fn disconnect(reason: DisconnectReason, reconnect: bool) -> Self {
        ServerFrame::Disconnect { reason, reconnect }
    }

    /// Create a channel data frame.
    #[must_use]
    pub fn message(identifier: impl Into<String>, message: Value) -> Self {
        ServerFrame::Message {
            identifier: identifier.into(),
            message,
        }
    }

    /// Get the wire type, `None` for channel data.
    #[must_use]
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            ServerFrame::Welcome => Some(kind::WELCOME),
            ServerFrame::Ping { .. } => Some(kind::PING),
            ServerFrame::Confirm { .. } => Some(kind::CONFIRM),
            ServerFrame::Reject { .. } => Some(kind::REJECT),
            ServerFrame::Disconnect { .. } => Some(kind::DISCONNECT),
            ServerFrame::Message { .. } => None,
        }
    }
}

impl From<ServerFrame> for WireFrame {
    fn from(frame: ServerFrame) -> Self {
        let kind = frame.kind().map(str::to_string);
        match frame {
            ServerFrame::Welcome => WireFrame {
                kind,
                ..Default::default()
            },
            ServerFrame::Ping { message } => WireFrame {
                kind,
                message: Some(Value::from(message)),
                ..Default::default()
            },
            ServerFrame::Confirm { identifier } | ServerFrame::Reject { identifier } => {
                WireFrame {
                    kind,
                    identifier: Some(identifier),
                    ..Default::default()
                }
            }
            ServerFrame::Disconnect { reason, reconnect } => WireFrame {
                kind,
                reason: Some(reason),
                reconnect: Some(reconnect),
                ..Default::default()
            },
            ServerFrame::Message {
                identifier,
                message,
            } => WireFrame {
                identifier: Some(identifier),
                message: Some(message),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireFrame> for ServerFrame {
    type Error = ProtocolError;

    fn try_from(wire: WireFrame) -> Result<Self, Self::Error> {
        let Some(frame_kind) = wire.kind.as_deref() else {
            let identifier = wire
                .identifier
                .ok_or(ProtocolError::MissingField("identifier"))?;
            return Ok(ServerFrame::Message {
                identifier,
                message: wire.message.unwrap_or(Value::Null),
            });
        };

        match frame_kind {
            kind::WELCOME => Ok(ServerFrame::Welcome),
            kind::PING => {
                let message = wire
                    .message
                    .as_ref()
                    .and_then(Value::as_u64)
                    .ok_or(ProtocolError::MissingField("message"))?;
                Ok(ServerFrame::Ping { message })
            }
            kind::CONFIRM => Ok(ServerFrame::Confirm {
                identifier: wire
                    .identifier
                    .ok_or(ProtocolError::MissingField("identifier"))?,
            }),
            kind::REJECT => Ok(ServerFrame::Reject {
                identifier: wire
                    .identifier
                    .ok_or(ProtocolError::MissingField("identifier"))?,
            }),
            kind::DISCONNECT => Ok(ServerFrame::Disconnect {
                reason: wire.reason.ok_or(ProtocolError::MissingField("reason"))?,
                reconnect: wire.reconnect.unwrap_or(true),
            }),
            other => Err(ProtocolError::Invalid(format!("unknown frame type: {other}"))),
        }
    }
}

/// Control messages published on a connection's internal topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Close every connection listening on the topic.
    Disconnect {
        /// Whether the client may reconnect afterwards.
        #[serde(default = "default_reconnect")]
        reconnect: bool,
    },
}

fn default_reconnect() -> bool {
    true
}
