//! # cable-transport
//!
//! Transport layer for the Cable realtime server.
//!
//! Action Cable speaks JSON text frames, so every transport here exposes a
//! socket as a stream of `String` frames through the [`Connection`] trait:
//!
//! - **WebSocket** - A standalone tokio-tungstenite listener, also used by
//!   the client crate to wrap outgoing sockets
//! - **Axum** - Adapter for sockets upgraded by an axum handler
//!
//! ```rust,ignore
//! use tenvis_cable_transport::{Connection, Transport};
//!
//! async fn pump(transport: impl Transport) {
//!     let mut accepted = transport.accept().await?;
//!     while let Some(text) = accepted.connection.recv().await? {
//!         // Feed the frame to the cable connection
//!     }
//! }
//! ```

pub mod axum;
pub mod handshake;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use self::axum::AxumConnection;
pub use handshake::from_request_parts;
pub use traits::{Accepted, Connection, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection, WebSocketTransport};
