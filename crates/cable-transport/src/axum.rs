//! Adapter for WebSockets upgraded by an axum handler.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, TransportError};

/// A WebSocket accepted through axum's `WebSocketUpgrade`.
pub struct AxumConnection {
    socket: WebSocket,
    protocol: Option<String>,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    max_message_size: usize,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        let protocol = socket
            .protocol()
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Self {
            socket,
            protocol,
            remote_addr: None,
            is_open: true,
            max_message_size,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }
}

#[async_trait]
impl Connection for AxumConnection {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let text = match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => {
                    String::from_utf8(data).map_err(|_| TransportError::InvalidUtf8)?
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Axum socket closed");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Axum socket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            };

            if text.len() > self.max_message_size {
                return Err(TransportError::FrameTooLarge {
                    size: text.len(),
                    max: self.max_message_size,
                });
            }
            return Ok(Some(text));
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }

        // The peer may already be gone; there is nothing left to report then.
        if let Err(e) = self.socket.send(Message::Close(None)).await {
            debug!(error = %e, "Close frame not delivered");
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::WebSocketUpgrade;
    use axum::routing::get;
    use axum::Router;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn echo(ws: WebSocketUpgrade) -> axum::response::Response {
        ws.protocols(["actioncable-v1-json"])
            .on_upgrade(|socket| async move {
                let mut connection = AxumConnection::new(socket, 16);
                let protocol = connection.protocol().unwrap_or("none").to_string();
                while let Ok(Some(text)) = connection.recv().await {
                    let reply = format!("{protocol}:{text}");
                    if connection.send(reply).await.is_err() {
                        break;
                    }
                }
                let _ = connection.close().await;
            })
    }

    #[tokio::test]
    async fn test_axum_connection_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/cable", get(echo));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut request = format!("ws://{addr}/cable").into_client_request().unwrap();
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("actioncable-v1-json"),
        );
        let (mut socket, _) = connect_async(request).await.unwrap();

        socket.send(WsMessage::Text("hi".into())).await.unwrap();
        assert_eq!(
            socket.next().await.unwrap().unwrap(),
            WsMessage::Text("actioncable-v1-json:hi".into())
        );

        socket.send(WsMessage::Binary(b"yo".to_vec())).await.unwrap();
        assert_eq!(
            socket.next().await.unwrap().unwrap(),
            WsMessage::Text("actioncable-v1-json:yo".into())
        );

        // Oversized frames end the session.
        socket
            .send(WsMessage::Text("x".repeat(32)))
            .await
            .unwrap();
        assert!(matches!(
            socket.next().await,
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None
        ));
    }
}
