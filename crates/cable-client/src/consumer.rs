//! The client entry point.

use cable_protocol::Command;
use std::sync::Arc;
use tracing::warn;

use crate::connection::{ClientConfig, ClientConnection, ClientError};
use crate::monitor::{ConnectionMonitor, MonitoredConnection, Visibility};
use crate::subscriptions::{Subscription, Subscriptions};

/// One client session with a cable server.
///
/// Dropping the consumer closes the socket for good.
#[derive(Debug)]
pub struct Consumer {
    connection: Arc<ClientConnection>,
}

impl Consumer {
    /// Create a consumer for an endpoint URL. Nothing is opened yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(url: &str) -> Result<Self, ClientError> {
        Ok(Self::with_config(ClientConfig::new(url)?))
    }

    /// Create a consumer from a full configuration.
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            connection: ClientConnection::new(config),
        }
    }

    /// Open the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket is already active or connecting fails.
    /// The monitor keeps retrying after a failed connect.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.open().await
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        self.connection.close(false);
    }

    /// Open the connection unless a socket is already open or opening.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting fails.
    pub async fn ensure_active_connection(&self) -> Result<(), ClientError> {
        if self.connection.is_active() {
            return Ok(());
        }
        match self.connection.open().await {
            Ok(()) | Err(ClientError::AlreadyActive) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Subscribe to a channel identifier, opening the connection if needed.
    ///
    /// A failed connect is logged; the subscription is sent once the
    /// monitor gets a socket open.
    pub async fn subscribe(&self, identifier: impl Into<String>) -> Subscription {
        if let Err(error) = self.ensure_active_connection().await {
            warn!(error = %error, "Subscribing while disconnected");
        }
        self.connection.subscriptions().create(identifier)
    }

    /// Get the subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        self.connection.subscriptions()
    }

    /// Send a raw command. Returns `false` if no socket is open.
    pub fn send(&self, command: &Command) -> bool {
        self.connection.send(command)
    }

    /// Get the heartbeat monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        self.connection.monitor()
    }

    /// Get the underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Check if a socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Forward a foreground/background change to the monitor.
    pub fn visibility_changed(&self, visibility: Visibility) {
        self.connection.monitor().visibility_changed(visibility);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.connection.close(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::SubscriptionEvent;
    use cable_protocol::{codec, ServerFrame};
    use tenvis_cable_transport::{Connection, Transport, WebSocketTransport};
    use std::net::SocketAddr;

    #[test]
    fn test_new_rejects_bad_url() {
        assert!(matches!(
            Consumer::new("mailto:someone@example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_opens_connection() {
        let transport = WebSocketTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let url = format!("ws://{}/cable", transport.local_addr().unwrap());
        let consumer = Consumer::new(&url).unwrap();
        assert!(!consumer.is_open());

        let (mut subscription, accepted) =
            tokio::join!(consumer.subscribe("lobby"), transport.accept());
        let mut accepted = accepted.unwrap();
        assert!(consumer.is_open());
        assert!(consumer.monitor().is_running());

        let text = accepted.connection.recv().await.unwrap().unwrap();
        assert_eq!(
            codec::decode_command(&text).unwrap(),
            Command::subscribe("lobby")
        );

        consumer.ensure_active_connection().await.unwrap();
        let confirm = codec::encode(&ServerFrame::confirm("lobby")).unwrap();
        accepted.connection.send(confirm).await.unwrap();
        assert_eq!(
            subscription.next_event().await,
            Some(SubscriptionEvent::Connected)
        );

        consumer.disconnect();
        assert!(!consumer.monitor().is_running());
        assert_eq!(accepted.connection.recv().await.unwrap(), None);
    }
}
