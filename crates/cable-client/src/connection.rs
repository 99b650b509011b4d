//! The client's WebSocket connection.
//!
//! A [`ClientConnection`] owns at most one socket at a time. Each socket
//! runs in its own session task that routes server frames to the monitor
//! and the subscriptions. Reconnecting is driven by the
//! [`ConnectionMonitor`].

use async_trait::async_trait;
use cable_protocol::{codec, version, Command, ProtocolError, ServerFrame};
use tenvis_cable_transport::{Connection as _, WebSocketConnection};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue};
use tracing::{debug, info, warn};
use url::Url;

use crate::monitor::{ConnectionMonitor, MonitorConfig, MonitoredConnection};
use crate::subscriptions::{CommandSink, SubscriptionEvent, Subscriptions};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The URL could not be parsed or has an unusable scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Opening the socket failed.
    #[error("Connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server answered with a subprotocol this client cannot speak.
    #[error("Unsupported subprotocol: {0:?}")]
    UnsupportedProtocol(Option<String>),

    /// A socket is already open or opening.
    #[error("Connection is already active")]
    AlreadyActive,

    /// Encoding a command failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the cable endpoint.
    pub url: Url,
    /// Pause between closing and reopening a socket.
    pub reopen_delay: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Heartbeat monitor tuning.
    pub monitor: MonitorConfig,
}

impl ClientConfig {
    /// Create a configuration for an endpoint.
    ///
    /// `http` and `https` URLs are rewritten to `ws` and `wss`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or not an HTTP or WebSocket URL.
    pub fn new(url: &str) -> Result<Self, ClientError> {
        let mut url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(ClientError::InvalidUrl(format!("unsupported scheme: {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::InvalidUrl(format!("cannot use scheme {scheme}")))?;

        Ok(Self {
            url,
            reopen_delay: Duration::from_millis(500),
            max_message_size: 1024 * 1024,
            monitor: MonitorConfig::default(),
        })
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct Session {
    outgoing: UnboundedSender<Outbound>,
    protocol: Option<String>,
    open: Arc<AtomicBool>,
}

/// A reconnecting Action Cable client socket.
pub struct ClientConnection {
    config: ClientConfig,
    this: Weak<ClientConnection>,
    monitor: Arc<ConnectionMonitor>,
    subscriptions: Arc<Subscriptions>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    connecting: AtomicBool,
    disconnected: AtomicBool,
}

impl ClientConnection {
    /// Create a closed connection with its monitor and subscriptions.
    #[must_use]
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ClientConnection>| {
            let monitored: Weak<dyn MonitoredConnection> = this.clone();
            let sink: Weak<dyn CommandSink> = this.clone();
            Self {
                monitor: Arc::new(ConnectionMonitor::new(monitored, config.monitor.clone())),
                subscriptions: Arc::new(Subscriptions::new(sink)),
                config,
                this: this.clone(),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                connecting: AtomicBool::new(false),
                disconnected: AtomicBool::new(true),
            }
        })
    }

    /// Get the heartbeat monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    /// Get the subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<Subscriptions> {
        &self.subscriptions
    }

    /// Get the subprotocol the server picked for the current socket.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.session().as_ref().and_then(|s| s.protocol.clone())
    }

    /// Check if a socket is open or being opened.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.connecting.load(Ordering::Acquire) || self.is_open()
    }

    /// Open a socket and start the monitor.
    ///
    /// The monitor is started even when connecting fails, so it keeps
    /// retrying in the background. A socket that never opened does not
    /// count as a disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket is already active, the connect fails, or
    /// the server does not speak a supported subprotocol.
    pub async fn open(&self) -> Result<(), ClientError> {
        if self.is_open() || self.connecting.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyActive);
        }

        self.monitor.start();
        let result = self.connect().await;
        self.connecting.store(false, Ordering::Release);

        if let Err(error) = &result {
            warn!(url = %self.config.url, error = %error, "Could not open cable connection");
        }
        result
    }

    /// Close the socket. Without `allow_reconnect` the monitor is stopped too.
    pub fn close(&self, allow_reconnect: bool) {
        if !allow_reconnect {
            self.monitor.stop();
        }

        if let Some(session) = self.session().as_ref() {
            if session.open.swap(false, Ordering::AcqRel) {
                let _ = session.outgoing.send(Outbound::Close);
            }
        }
    }

    /// Send a command. Returns `false` if no socket is open.
    pub fn send(&self, command: &Command) -> bool {
        let text = match codec::encode_command(command) {
            Ok(text) => text,
            Err(error) => {
                warn!(error = %error, "Could not encode command");
                return false;
            }
        };

        match self.session().as_ref() {
            Some(session) if session.open.load(Ordering::Acquire) => {
                session.outgoing.send(Outbound::Text(text)).is_ok()
            }
            _ => false,
        }
    }

    async fn connect(&self) -> Result<(), ClientError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let offered = version::PROTOCOLS.join(", ");
        let offered = HeaderValue::from_str(&offered)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);

        let (stream, response) = connect_async(request).await?;
        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut socket = WebSocketConnection::new(stream, self.config.max_message_size)
            .with_protocol(protocol.clone());

        if !protocol.as_deref().is_some_and(version::is_supported) {
            info!(protocol = ?protocol, "Protocol is unsupported, stopping monitor and disconnecting");
            self.monitor.stop();
            let _ = socket.close().await;
            return Err(ClientError::UnsupportedProtocol(protocol));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        *self.session() = Some(Session {
            outgoing: tx,
            protocol: protocol.clone(),
            open: Arc::clone(&open),
        });
        self.disconnected.store(false, Ordering::Release);

        tokio::spawn(run_session(self.this.clone(), generation, socket, rx, open));
        info!(url = %self.config.url, protocol = ?protocol, "Cable connection opened");
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        if !self.is_current(generation) {
            return;
        }

        let frame = match codec::decode(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(error = %error, "Ignoring undecodable server frame");
                return;
            }
        };

        match frame {
            ServerFrame::Welcome => {
                debug!("Welcome received");
                self.monitor.connected();
                self.subscriptions.reload();
            }
            ServerFrame::Ping { .. } => self.monitor.received(),
            ServerFrame::Confirm { identifier } => self.subscriptions.confirm(&identifier),
            ServerFrame::Reject { identifier } => self.subscriptions.reject(&identifier),
            ServerFrame::Disconnect { reason, reconnect } => {
                info!(reason = ?reason, reconnect, "Server requested disconnect");
                self.close(reconnect);
            }
            ServerFrame::Message {
                identifier,
                message,
            } => self
                .subscriptions
                .notify(&identifier, &SubscriptionEvent::Received(message)),
        }
    }

    fn session_closed(&self, generation: u64) {
        if !self.is_current(generation) || self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }

        self.monitor.disconnected();
        let will_attempt_reconnect = self.monitor.is_running();
        info!(will_attempt_reconnect, "Cable connection closed");
        self.subscriptions
            .notify_all(&SubscriptionEvent::Disconnected {
                will_attempt_reconnect,
            });
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("url", &self.config.url.as_str())
            .field("open", &self.is_open())
            .field("monitor", &self.monitor)
            .finish()
    }
}

#[async_trait]
impl MonitoredConnection for ClientConnection {
    fn is_open(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|s| s.open.load(Ordering::Acquire))
    }

    async fn reopen(&self) {
        if self.is_active() {
            info!("Reopening cable connection");
            self.close(true);
            time::sleep(self.config.reopen_delay).await;
        }
        if let Err(error) = self.open().await {
            debug!(error = %error, "Reopen failed");
        }
    }
}

impl CommandSink for ClientConnection {
    fn send_command(&self, command: &Command) -> bool {
        self.send(command)
    }
}

async fn run_session<S>(
    owner: Weak<ClientConnection>,
    generation: u64,
    mut socket: WebSocketConnection<S>,
    mut outgoing: UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Ok(Some(text)) => {
                    let Some(owner) = owner.upgrade() else {
                        break;
                    };
                    owner.handle_frame(generation, &text);
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(error = %error, "Cable socket failed");
                    break;
                }
            },
            command = outgoing.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(error) = socket.send(text).await {
                        warn!(error = %error, "Could not send to cable socket");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = socket.close().await;
                    break;
                }
            },
        }
    }

    open.store(false, Ordering::Release);
    if let Some(owner) = owner.upgrade() {
        owner.session_closed(generation);
    }
}
