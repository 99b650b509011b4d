//! Registry of live connections.
//!
//! Owned by a [`Server`](crate::Server), not a process global. Connections
//! are indexed by id and, when identified, by their identity string.

use crate::connection::{Connection, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The connection is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),
}

/// Concurrent map of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    by_identifier: DashMap<String, DashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection with the same id is registered.
    pub fn add(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let id = connection.id();
        match self.connections.entry(id) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
            }
        }

        if let Some(identifier) = connection.identity().connection_identifier() {
            self.by_identifier.entry(identifier).or_default().insert(id);
        }

        debug!(connection = %id, total = self.connections.len(), "Registered connection");
        Ok(())
    }

    /// Remove a connection. Removing an unknown id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let Some((_, connection)) = self.connections.remove(&id) else {
            trace!(connection = %id, "Remove for unregistered connection");
            return None;
        };

        if let Some(identifier) = connection.identity().connection_identifier() {
            let emptied = self
                .by_identifier
                .get(&identifier)
                .map_or(false, |ids| {
                    ids.remove(&id);
                    ids.is_empty()
                });
            if emptied {
                self.by_identifier
                    .remove_if(&identifier, |_, ids| ids.is_empty());
            }
        }

        debug!(connection = %id, total = self.connections.len(), "Unregistered connection");
        Some(connection)
    }

    /// Get a connection by id.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Get the number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot every live connection.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot the connections with the given identity string.
    #[must_use]
    pub fn identified_by(&self, identifier: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.by_identifier.get(identifier) {
            Some(ids) => ids.iter().map(|id| *id).collect(),
            None => return Vec::new(),
        };
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::pubsub::InMemoryPubSub;
    use crate::testing::{server, Client};
    use crate::{ConnectionId, RegistryError};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_twice_is_an_error() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let client = Client::connect(&server, "ada").await;

        let result = server.registry().add(Arc::clone(&client.connection));
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(id)) if id == client.connection.id()));
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let client = Client::connect(&server, "ada").await;

        assert!(server.registry().remove(ConnectionId::next()).is_none());
        assert_eq!(server.registry().len(), 1);

        assert!(server.registry().remove(client.connection.id()).is_some());
        assert!(server.registry().remove(client.connection.id()).is_none());
        assert!(server.registry().identified_by("ada").is_empty());
    }

    #[tokio::test]
    async fn test_identity_index() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let server = server(&pubsub);
        let one = Client::connect(&server, "ada").await;
        let _two = Client::connect(&server, "ada").await;
        let _bob = Client::connect(&server, "bob").await;

        assert_eq!(server.registry().identified_by("ada").len(), 2);
        assert_eq!(server.registry().identified_by("bob").len(), 1);
        assert!(server.registry().identified_by("eve").is_empty());
        assert_eq!(server.registry().all().len(), 3);

        server.registry().remove(one.connection.id());
        assert_eq!(server.registry().identified_by("ada").len(), 1);
    }
}
