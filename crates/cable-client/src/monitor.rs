//! Client-side heartbeat watchdog.
//!
//! A socket can look open while being silently dead. The monitor decides,
//! purely from elapsed time since the last server ping, whether the
//! connection is stale and asks it to reopen, backing off logarithmically
//! between checks.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info};

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// A connection without pings for longer than this is stale.
    pub stale_threshold: Duration,
    /// Shortest interval between staleness checks.
    pub min_poll_interval: Duration,
    /// Longest interval between staleness checks.
    pub max_poll_interval: Duration,
    /// Scale of the logarithmic backoff, in seconds.
    pub reconnection_multiplier: f64,
    /// Settle time after the application becomes visible again.
    pub visibility_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(6),
            min_poll_interval: Duration::from_secs(3),
            max_poll_interval: Duration::from_secs(30),
            reconnection_multiplier: 5.0,
            visibility_delay: Duration::from_millis(200),
        }
    }
}

/// The connection a monitor watches.
#[async_trait]
pub trait MonitoredConnection: Send + Sync {
    /// Check if the transport reports the socket as open.
    fn is_open(&self) -> bool;

    /// Close the socket, if any, and open a new one.
    async fn reopen(&self);
}

/// Whether the application is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Foregrounded.
    Visible,
    /// Backgrounded or suspended.
    Hidden,
}

#[derive(Debug, Default)]
struct MonitorState {
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    pinged_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    reconnect_attempts: u32,
    stop: Option<watch::Sender<bool>>,
}

/// Heartbeat watchdog for one client connection.
pub struct ConnectionMonitor {
    config: MonitorConfig,
    connection: Weak<dyn MonitoredConnection>,
    state: Mutex<MonitorState>,
}

impl ConnectionMonitor {
    /// Create a stopped monitor for a connection.
    #[must_use]
    pub fn new(connection: Weak<dyn MonitoredConnection>, config: MonitorConfig) -> Self {
        Self {
            config,
            connection,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start polling. Does nothing if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let (tx, rx) = watch::channel(false);
        {
            let mut state = self.state();
            if state.started_at.is_some() && state.stopped_at.is_none() {
                return;
            }
            state.reconnect_attempts = 0;
            state.started_at = Some(Instant::now());
            state.stopped_at = None;
            state.stop = Some(tx);
        }

        tokio::spawn(Arc::clone(self).poll(rx));
        info!(
            stale_threshold = ?self.config.stale_threshold,
            "Connection monitor started"
        );
    }

    /// Stop polling and ignore visibility changes until started again.
    pub fn stop(&self) {
        let mut state = self.state();
        if state.stopped_at.is_some() || state.started_at.is_none() {
            return;
        }
        state.stopped_at = Some(Instant::now());
        if let Some(stop) = state.stop.take() {
            let _ = stop.send(true);
        }
        drop(state);
        info!("Connection monitor stopped");
    }

    /// Check if the poll loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let state = self.state();
        state.started_at.is_some() && state.stopped_at.is_none()
    }

    /// Record a successful connect.
    pub fn connected(&self) {
        let mut state = self.state();
        state.reconnect_attempts = 0;
        state.pinged_at = Some(Instant::now());
        state.disconnected_at = None;
        debug!("Monitor recorded connect");
    }

    /// Record a transport close.
    pub fn disconnected(&self) {
        self.state().disconnected_at = Some(Instant::now());
        debug!("Monitor recorded disconnect");
    }

    /// Record a server ping.
    pub fn received(&self) {
        self.state().pinged_at = Some(Instant::now());
    }

    /// Get the time of the last server ping.
    #[must_use]
    pub fn pinged_at(&self) -> Option<Instant> {
        self.state().pinged_at
    }

    /// Get the number of reconnect attempts since the last connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.state().reconnect_attempts
    }

    /// Interval before the next staleness check.
    ///
    /// `multiplier * ln(attempts + 1)` seconds, clamped to the configured
    /// bounds.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        interval_for(&self.config, self.reconnect_attempts())
    }

    /// Check if no ping arrived within the stale threshold.
    ///
    /// Before the first ping, time is measured from `start()`.
    #[must_use]
    pub fn connection_is_stale(&self) -> bool {
        let state = self.state();
        match state.pinged_at.or(state.started_at) {
            Some(since) => since.elapsed() > self.config.stale_threshold,
            None => false,
        }
    }

    /// Check if the transport closed within the stale threshold.
    #[must_use]
    pub fn disconnected_recently(&self) -> bool {
        self.state()
            .disconnected_at
            .is_some_and(|at| at.elapsed() < self.config.stale_threshold)
    }

    /// Count an attempt and reopen the connection if it is stale.
    ///
    /// A recent disconnect is already being handled by the transport, so the
    /// attempt is counted but the reopen is skipped.
    pub async fn reconnect_if_stale(&self) {
        if !self.connection_is_stale() {
            return;
        }

        let attempts = {
            let mut state = self.state();
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };

        if self.disconnected_recently() {
            debug!(
                attempts,
                "Connection is stale but disconnected recently, not reopening"
            );
            return;
        }

        info!(
            attempts,
            threshold = ?self.config.stale_threshold,
            "Connection is stale, reopening"
        );
        if let Some(connection) = self.connection.upgrade() {
            connection.reopen().await;
        }
    }

    /// React to the application moving between foreground and background.
    ///
    /// When it becomes visible while running, waits for the configured delay
    /// and then reopens a stale or closed connection.
    pub fn visibility_changed(self: &Arc<Self>, visibility: Visibility) {
        if visibility != Visibility::Visible || !self.is_running() {
            return;
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep(monitor.config.visibility_delay).await;
            let Some(connection) = monitor.connection.upgrade() else {
                return;
            };
            if monitor.connection_is_stale() || !connection.is_open() {
                info!("Visibility changed to visible, reopening");
                connection.reopen().await;
            }
        });
    }

    async fn poll(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            let interval = self.poll_interval();
            tokio::select! {
                _ = time::sleep(interval) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
            self.reconnect_if_stale().await;
        }
        debug!("Monitor poll loop exited");
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

fn interval_for(config: &MonitorConfig, attempts: u32) -> Duration {
    let secs = config.reconnection_multiplier * (f64::from(attempts) + 1.0).ln();
    let secs = secs.clamp(
        config.min_poll_interval.as_secs_f64(),
        config.max_poll_interval.as_secs_f64(),
    );
    Duration::from_secs_f64(secs)
}
