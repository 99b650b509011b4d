//! Disconnecting connections that may live in other processes.
//!
//! Every identified connection listens on `internal/<identifier>`. Publishing
//! a disconnect control message there closes all of them, wherever they are.

use crate::broadcaster::{BroadcastError, Broadcaster};
use crate::identity::{internal_topic, Identity};
use cable_protocol::ControlMessage;
use thiserror::Error;
use tracing::info;

/// Remote connection errors.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The identity has no claims, so no connection can match it.
    #[error("Remote connections need at least one identity claim")]
    InvalidIdentifiers,

    /// Publishing the control message failed.
    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),
}

/// Entry point for addressing connections fleet-wide.
#[derive(Debug, Clone)]
pub struct RemoteConnections {
    broadcaster: Broadcaster,
}

impl RemoteConnections {
    pub(crate) fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }

    /// Address every connection with this identity.
    #[must_use]
    pub fn matching(&self, identity: Identity) -> RemoteConnection {
        RemoteConnection {
            broadcaster: self.broadcaster.clone(),
            identity,
        }
    }
}

/// Connections sharing one identity, in any process on the bus.
#[derive(Debug, Clone)]
pub struct RemoteConnection {
    broadcaster: Broadcaster,
    identity: Identity,
}

impl RemoteConnection {
    /// Get the targeted identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Ask every matching connection to close.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is empty or the publish fails.
    pub async fn disconnect(&self, reconnect: bool) -> Result<(), RemoteError> {
        let identifier = self
            .identity
            .connection_identifier()
            .ok_or(RemoteError::InvalidIdentifiers)?;

        self.broadcaster
            .broadcast(
                &internal_topic(&identifier),
                &ControlMessage::Disconnect { reconnect },
            )
            .await?;

        info!(identifier = %identifier, reconnect, "Requested remote disconnect");
        Ok(())
    }
}
