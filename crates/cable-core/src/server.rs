//! The cable server.
//!
//! A [`Server`] owns everything process-wide: the pub/sub adapter, the
//! channel registry, the connection registry and the worker pool. Transports
//! hand it upgraded sockets through [`Server::connect`].

use crate::broadcaster::{BroadcastError, Broadcaster};
use crate::channel::{Channel, ChannelRegistry};
use crate::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionStatistics};
use crate::identity::{
    internal_topic, Anonymous, ConnectionHooks, IdentificationError, IdentityResolver, NoopHooks,
};
use crate::outbox::Outbox;
use crate::pubsub::{PubSubAdapter, PubSubError};
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::remote::RemoteConnections;
use crate::worker::{panic_message, WorkerError, WorkerPool, DEFAULT_WORKER_POOL_SIZE};
use cable_protocol::{DisconnectReason, Handshake, ServerFrame};
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default interval between server pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Errors from [`Server::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Identification failed; the client was told not to reconnect.
    #[error("Identification failed: {0}")]
    Unauthorized(#[from] IdentificationError),

    /// Registration failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Listening on the internal topic failed.
    #[error("Pub/sub error: {0}")]
    PubSub(#[from] PubSubError),

    /// The worker pool is shut down.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of worker tasks.
    pub worker_pool_size: usize,
    /// Interval between pings to every connection, `None` to disable.
    pub heartbeat_interval: Option<Duration>,
    /// Refuse connections whose resolved identity is empty.
    pub require_identity: bool,
    /// Accepted `Origin` header values. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            require_identity: false,
            allowed_origins: Vec::new(),
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    pubsub: Arc<dyn PubSubAdapter>,
    broadcaster: Broadcaster,
    channels: ChannelRegistry,
    resolver: Arc<dyn IdentityResolver>,
    hooks: Arc<dyn ConnectionHooks>,
    registry: ConnectionRegistry,
    workers: WorkerPool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    pubsub: Arc<dyn PubSubAdapter>,
    channels: ChannelRegistry,
    resolver: Arc<dyn IdentityResolver>,
    hooks: Arc<dyn ConnectionHooks>,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Register a channel type under the name clients use.
    #[must_use]
    pub fn channel<C: Channel>(mut self, name: &str) -> Self {
        self.channels.register::<C>(name);
        self
    }

    /// Set the identity resolver. Defaults to [`Anonymous`].
    #[must_use]
    pub fn resolver(mut self, resolver: impl IdentityResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Set lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl ConnectionHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the server, spawning its workers and heartbeat.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Server {
        let workers = WorkerPool::new(self.config.worker_pool_size);
        let heartbeat_interval = self.config.heartbeat_interval;

        info!(
            pubsub = self.pubsub.name(),
            channels = ?self.channels.names(),
            workers = workers.size(),
            "Creating cable server"
        );

        let server = Server {
            inner: Arc::new(ServerInner {
                broadcaster: Broadcaster::new(Arc::clone(&self.pubsub)),
                pubsub: self.pubsub,
                channels: self.channels,
                resolver: self.resolver,
                hooks: self.hooks,
                registry: ConnectionRegistry::new(),
                workers,
                heartbeat: Mutex::new(None),
                config: self.config,
            }),
        };

        if let Some(every) = heartbeat_interval {
            let task = tokio::spawn(run_heartbeat(Arc::downgrade(&server.inner), every));
            if let Ok(mut slot) = server.inner.heartbeat.lock() {
                *slot = Some(task);
            }
        }

        server
    }
}

/// Process-wide cable server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Start building a server on a pub/sub adapter.
    #[must_use]
    pub fn builder(pubsub: Arc<dyn PubSubAdapter>) -> ServerBuilder {
        ServerBuilder {
            pubsub,
            channels: ChannelRegistry::new(),
            resolver: Arc::new(Anonymous),
            hooks: Arc::new(NoopHooks),
            config: ServerConfig::default(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Check the handshake's `Origin` against the allowed origins.
    #[must_use]
    pub fn allow_request_origin(&self, handshake: &Handshake) -> bool {
        let allowed = &self.inner.config.allowed_origins;
        if allowed.is_empty() {
            return true;
        }
        match handshake.origin() {
            Some(origin) => allowed.iter().any(|a| a == origin),
            None => false,
        }
    }

    /// Identify and register a new connection.
    ///
    /// On success the client has been sent `welcome`. On identification
    /// failure it is sent `disconnect` with reason `unauthorized` and
    /// `reconnect: false`, the outbox is closed, and nothing is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if identification, registration or the internal
    /// topic subscription fails.
    pub async fn connect(
        &self,
        handshake: &Handshake,
        outbox: Outbox,
    ) -> Result<Arc<Connection>, ConnectError> {
        let identity = match self.inner.resolver.resolve(handshake).await {
            Ok(identity) if identity.is_empty() && self.inner.config.require_identity => {
                Err(IdentificationError::Missing)
            }
            other => other,
        };

        let identity = match identity {
            Ok(identity) => identity,
            Err(error) => {
                warn!(path = %handshake.path(), error = %error, "Connection refused");
                outbox.send(ServerFrame::disconnect(DisconnectReason::Unauthorized, false));
                outbox.close();
                return Err(error.into());
            }
        };

        let handle = ConnectionHandle {
            id: ConnectionId::next(),
            identity: Arc::new(identity),
            outbox: outbox.clone(),
            workers: self.inner.workers.clone(),
            pubsub: Arc::clone(&self.inner.pubsub),
            broadcaster: self.inner.broadcaster.clone(),
        };
        let connection = Arc::new(Connection::new(handle, self.clone()));
        self.inner.registry.add(Arc::clone(&connection))?;

        if let Some(identifier) = connection.identity().connection_identifier() {
            if let Err(error) = connection.listen_internal(internal_topic(&identifier)).await {
                warn!(
                    connection = %connection.id(),
                    identifier = %identifier,
                    error = %error,
                    "Could not listen on internal topic"
                );
                self.inner.registry.remove(connection.id());
                outbox.send(ServerFrame::disconnect(DisconnectReason::InvalidRequest, false));
                outbox.close();
                return Err(error.into());
            }
        }

        // Welcome on the connection's worker so a remote disconnect that
        // arrived meanwhile is ordered before it.
        let welcome = {
            let connection = Arc::clone(&connection);
            let hooks = Arc::clone(&self.inner.hooks);
            async move {
                if !connection.is_open() {
                    return false;
                }
                connection.transmit(ServerFrame::Welcome);
                let hook = AssertUnwindSafe(hooks.connected(&connection));
                if let Err(panic) = hook.catch_unwind().await {
                    error!(
                        connection = %connection.id(),
                        panic = %panic_message(panic.as_ref()),
                        "connected hook panicked"
                    );
                }
                true
            }
        };
        let welcomed = match self.inner.workers.run(&connection.id(), welcome).await {
            Ok(welcomed) => welcomed,
            Err(error) => {
                connection.finish(None).await;
                return Err(error.into());
            }
        };

        if welcomed {
            info!(
                connection = %connection.id(),
                identifier = ?connection.identity().connection_identifier(),
                "Connection opened"
            );
        } else {
            debug!(connection = %connection.id(), "Connection closed before welcome");
        }
        Ok(connection)
    }

    /// Broadcast a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the publish fails.
    pub async fn broadcast<T>(&self, topic: &str, message: &T) -> Result<(), BroadcastError>
    where
        T: Serialize + ?Sized,
    {
        self.inner.broadcaster.broadcast(topic, message).await
    }

    /// Get the broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// Address connections by identity across every process on the bus.
    #[must_use]
    pub fn remote_connections(&self) -> RemoteConnections {
        RemoteConnections::new(self.inner.broadcaster.clone())
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Get the worker pool.
    #[must_use]
    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    /// Get the pub/sub adapter.
    #[must_use]
    pub fn pubsub(&self) -> &Arc<dyn PubSubAdapter> {
        &self.inner.pubsub
    }

    /// Statistics for every open connection.
    pub async fn open_connections_statistics(&self) -> Vec<ConnectionStatistics> {
        let connections = self.inner.registry.all();
        let mut stats =
            futures_util::future::join_all(connections.iter().map(|c| c.statistics())).await;
        stats.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        stats
    }

    /// Disconnect every connection with `server_restart`, allowing clients
    /// to reconnect. The server keeps running.
    pub fn restart(&self) {
        let connections = self.inner.registry.all();
        info!(connections = connections.len(), "Restarting connections");
        for connection in connections {
            connection.disconnect(DisconnectReason::ServerRestart, true);
        }
    }

    /// Disconnect everyone, then stop the heartbeat, workers and pub/sub.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.inner.heartbeat.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        let connections = self.inner.registry.all();
        for connection in &connections {
            connection.disconnect(DisconnectReason::ServerRestart, true);
        }
        for connection in &connections {
            connection.closed().await;
        }

        self.inner.workers.shutdown().await;
        self.inner.pubsub.shutdown().await;
        info!("Cable server shut down");
    }

    pub(crate) fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn ConnectionHooks> {
        &self.inner.hooks
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("channels", &self.inner.channels)
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

async fn run_heartbeat(server: Weak<ServerInner>, every: Duration) {
    let mut ticker = time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = server.upgrade() else {
            break;
        };
        for connection in inner.registry.all() {
            connection.beat();
        }
    }

    debug!("Heartbeat stopped");
}
