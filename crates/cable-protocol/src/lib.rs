//! # cable-protocol
//!
//! Wire protocol definitions for the Cable realtime server.
//!
//! Cable speaks the Action Cable v1 JSON protocol: clients send JSON
//! command envelopes, the server answers with typed JSON frames, all as
//! WebSocket text messages.
//!
//! ## Frame Types
//!
//! - `subscribe` / `unsubscribe` / `message` - Client commands
//! - `welcome` / `ping` / `disconnect` - Connection control
//! - `confirm_subscription` / `reject_subscription` - Subscription replies
//! - `{identifier, message}` - Channel data
//!
//! ## Example
//!
//! ```rust
//! use cable_protocol::{codec, ChannelIdentifier, Command, ServerFrame};
//!
//! let identifier = ChannelIdentifier::new("ChatChannel").with_param("room", "lobby");
//! let command = Command::subscribe(identifier.as_str());
//!
//! let text = codec::encode_command(&command).unwrap();
//! assert_eq!(codec::decode_command(&text).unwrap(), command);
//!
//! let frame = ServerFrame::confirm(identifier.as_str());
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod handshake;
pub mod identifier;
pub mod version;

pub use codec::{decode, decode_command, encode, encode_command, ProtocolError};
pub use frames::{ActionPayload, Command, ControlMessage, DisconnectReason, ServerFrame};
pub use handshake::Handshake;
pub use identifier::ChannelIdentifier;
pub use version::{negotiate, PROTOCOLS, PROTOCOL_UNSUPPORTED, PROTOCOL_V1_JSON};
