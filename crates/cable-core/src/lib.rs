//! # cable-core
//!
//! Connections, channels and pub/sub fan-out for the Cable realtime server.
//!
//! This crate provides the server-side building blocks:
//!
//! - **Server** - Identification, connection registry, heartbeat
//! - **Connection** - One client session and its subscriptions
//! - **Channel** - Application logic behind a subscription
//! - **Broadcaster** - Publishing to topics on the pub/sub bus
//! - **WorkerPool** - Per-connection serialized execution
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Transport  │────▶│  Connection  │────▶│   Channel   │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        ▲                   │                    │
//!        │                   ▼                    ▼
//!        │            ┌──────────────┐     ┌─────────────┐
//!        └────────────│ Subscription │◀────│   PubSub    │
//!                     └──────────────┘     └─────────────┘
//! ```
//!
//! Every callback for a connection runs on the same worker, in order.

pub mod broadcaster;
pub mod channel;
pub mod connection;
pub mod identity;
pub mod outbox;
pub mod pubsub;
pub mod registry;
pub mod remote;
pub mod server;
pub mod subscription;
pub mod worker;

#[cfg(test)]
mod testing;

pub use broadcaster::{broadcasting_for, BroadcastError, Broadcaster, TopicBroadcaster};
pub use channel::{ActionFuture, ActionTable, Channel, ChannelError, ChannelRegistry};
pub use connection::{CableError, Connection, ConnectionId, ConnectionStatistics};
pub use identity::{
    internal_topic, Anonymous, ConnectionHooks, IdentificationError, Identity, IdentityResolver,
    NoopHooks,
};
pub use outbox::{Outbox, Outgoing};
pub use pubsub::{InMemoryPubSub, PubSubAdapter, PubSubError, Subscriber};
pub use registry::{ConnectionRegistry, RegistryError};
pub use remote::{RemoteConnection, RemoteConnections, RemoteError};
pub use server::{ConnectError, Server, ServerBuilder, ServerConfig};
pub use subscription::Subscription;
pub use worker::{WorkerError, WorkerPool};
