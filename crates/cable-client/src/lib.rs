//! # cable-client
//!
//! A reconnecting client for Cable servers.
//!
//! - **Consumer** - Entry point owning one connection and its subscriptions
//! - **ClientConnection** - The socket, frame routing and reopen mechanics
//! - **ConnectionMonitor** - Heartbeat watchdog that reopens stale sockets
//! - **Subscriptions** - Channel subscriptions with guaranteed `subscribe`
//!
//! ```rust,ignore
//! use tenvis_cable_client::{Consumer, SubscriptionEvent};
//!
//! let consumer = Consumer::new("https://example.com/cable")?;
//! let mut chat = consumer.subscribe(r#"{"channel":"ChatChannel","room":"lobby"}"#).await;
//! while let Some(event) = chat.next_event().await {
//!     if let SubscriptionEvent::Received(message) = event {
//!         println!("{message}");
//!     }
//! }
//! ```

pub mod connection;
pub mod consumer;
pub mod monitor;
pub mod subscriptions;

pub use connection::{ClientConfig, ClientConnection, ClientError};
pub use consumer::Consumer;
pub use monitor::{ConnectionMonitor, MonitorConfig, MonitoredConnection, Visibility};
pub use subscriptions::{Subscription, SubscriptionEvent, Subscriptions};
