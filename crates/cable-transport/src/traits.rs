//! Transport abstraction traits for Cable.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the server to be transport-agnostic.

use async_trait::async_trait;
use cable_protocol::Handshake;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The WebSocket handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A frame exceeded the configured limit.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A binary frame was not valid UTF-8.
    #[error("Binary frame is not valid UTF-8")]
    InvalidUtf8,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport that can accept connections.
///
/// Transports are responsible for handling the underlying protocol
/// and providing a uniform interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a client completed its handshake or an error occurs.
    async fn accept(&self) -> Result<Accepted, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// A freshly accepted connection and the request that opened it.
pub struct Accepted {
    /// The open connection.
    pub connection: Box<dyn Connection>,
    /// Request metadata for identification and origin checks.
    pub handshake: Handshake,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("protocol", &self.connection.protocol())
            .field("handshake", &self.handshake)
            .finish()
    }
}

/// An active text-frame connection.
///
/// `recv` is cancel safe, so it can sit in a `select!` next to an outbox.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next text frame.
    ///
    /// Returns `None` if the connection is closed cleanly. Control frames are
    /// handled internally and never surface here.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send a text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the negotiated subprotocol, if any.
    fn protocol(&self) -> Option<&str>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
