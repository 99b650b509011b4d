//! WebSocket transport implementation.
//!
//! This module provides a WebSocket-based transport using tokio-tungstenite.
//! [`WebSocketConnection`] is generic over the byte stream so the same type
//! wraps accepted server sockets and outgoing client sockets.

use async_trait::async_trait;
use cable_protocol::version;
use futures_util::{SinkExt, StreamExt};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::WebSocketConfig as TungsteniteConfig,
        Error as WsError, Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::handshake::from_request_parts;
use crate::traits::{Accepted, Connection, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Standalone WebSocket transport.
///
/// Negotiates the Action Cable subprotocol during the handshake and captures
/// the request as a [`Handshake`](cable_protocol::Handshake).
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;

        info!(addr = %config.bind_addr, "WebSocket transport listening");

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, addr) = self.listener.accept().await?;

        debug!(remote = %addr, "Accepted TCP connection");

        let mut captured = None;
        let mut protocol = None;
        let callback = |request: &Request, mut response: Response| {
            captured = Some(from_request_parts(
                request.uri(),
                request.headers(),
                Some(addr),
            ));

            let offered = request
                .headers()
                .get_all(SEC_WEBSOCKET_PROTOCOL)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(version::parse_header);
            if let Some(chosen) = version::negotiate(offered) {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(chosen));
                protocol = Some(chosen.to_string());
            }
            Ok::<Response, ErrorResponse>(response)
        };

        let mut ws_config = TungsteniteConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
            .map_err(|e| {
                error!(remote = %addr, error = %e, "WebSocket handshake failed");
                TransportError::Handshake(e.to_string())
            })?;

        let handshake = captured
            .ok_or_else(|| TransportError::Handshake("request was not captured".into()))?;

        debug!(remote = %addr, protocol = ?protocol, "WebSocket handshake completed");

        let connection = WebSocketConnection::new(ws_stream, self.config.max_message_size)
            .with_protocol(protocol)
            .with_remote_addr(addr);
        Ok(Accepted {
            connection: Box::new(connection),
            handshake,
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A WebSocket connection over any byte stream.
pub struct WebSocketConnection<S> {
    stream: WebSocketStream<S>,
    protocol: Option<String>,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    max_message_size: usize,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>, max_message_size: usize) -> Self {
        Self {
            stream,
            protocol: None,
            remote_addr: None,
            is_open: true,
            max_message_size,
        }
    }

    /// Record the negotiated subprotocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Option<String>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.max_message_size {
            warn!(size, max = self.max_message_size, "Message too large");
            return Err(TransportError::FrameTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    // Some clients send JSON in binary frames
                    self.check_size(data.len())?;
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|_| TransportError::InvalidUtf8);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // tungstenite queues the pong itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {e}"))),
        }
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
