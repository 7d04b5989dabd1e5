//! Async client for one pub/sub hub.
//!
//! [`PubSubClient`] is a cheap, cloneable handle over shared state: the
//! [`ConnectionManager`] that owns the transport, the registered handler, and
//! the slot holding the background receive loop.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = PubSubConfig::new("chat", "https://example.com/negotiate");
//! let client = PubSubClient::builder(config)
//!     .with_handler(handler_fn(|_client, event| async move {
//!         println!("{}: {}", event.message.group, event.message.data);
//!         Ok::<_, HandlerError>(())
//!     }))
//!     .build()?;
//!
//! client.join_group("lobby").await?;
//! client.send_to_group("lobby", "hello").await?;
//! // …
//! client.close("done").await?;
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatch::{self, Dispatcher, MessageHandler};
use crate::error::{PubSubError, Result};
use crate::negotiate::Negotiator;
use crate::protocol;
use crate::receive;
use crate::tls::MinTlsVersion;
use crate::transport::Connector;

/// Default delay between receive loop iterations.
const DEFAULT_PACING: Duration = Duration::from_millis(300);

// ── Configuration ───────────────────────────────────────────────────

/// Delay applied after every receive loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePacing {
    /// The same delay after every iteration, successful or not.
    Fixed(Duration),
    /// `initial` after a success; doubled per consecutive failure up to `max`.
    Backoff { initial: Duration, max: Duration },
}

impl Default for ReceivePacing {
    fn default() -> Self {
        ReceivePacing::Fixed(DEFAULT_PACING)
    }
}

impl ReceivePacing {
    /// Delay to wait given the number of consecutive failed iterations.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match *self {
            ReceivePacing::Fixed(delay) => delay,
            ReceivePacing::Backoff { initial, max } => {
                let factor = 1u32
                    .checked_shl(consecutive_failures.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max.max(initial))
            }
        }
    }
}

/// When the background receive loop is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveStart {
    /// After the first successful [`PubSubClient::send`], which joining and
    /// leaving a group go through. [`PubSubClient::send_to_group`] does not
    /// start it. Messages pushed by the service before that are not observed.
    #[default]
    FirstSend,
    /// As soon as the connection is opened by [`PubSubClient::connect`] or any
    /// successful send, whichever comes first.
    OnOpen,
}

/// Configuration for a [`PubSubClient`].
///
/// # Example
///
/// ```
/// use web_pubsub_client::client::{PubSubConfig, ReceivePacing, ReceiveStart};
/// use std::time::Duration;
///
/// let config = PubSubConfig::new("chat", "https://example.com/negotiate")
///     .with_pacing(ReceivePacing::Fixed(Duration::from_millis(100)))
///     .with_receive_start(ReceiveStart::OnOpen);
/// assert_eq!(config.hub, "chat");
/// ```
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Hub this client is bound to.
    pub hub: String,
    /// Endpoint that returns the access URL. Used by the default negotiator.
    pub negotiate_url: String,
    /// Delay between receive loop iterations.
    ///
    /// Defaults to a fixed **300 ms**.
    pub pacing: ReceivePacing,
    /// When to start the receive loop.
    pub receive_start: ReceiveStart,
    /// Minimum TLS version for negotiation and the WebSocket.
    pub min_tls_version: MinTlsVersion,
}

impl PubSubConfig {
    /// Create a configuration with default tuning.
    pub fn new(hub: impl Into<String>, negotiate_url: impl Into<String>) -> Self {
        Self {
            hub: hub.into(),
            negotiate_url: negotiate_url.into(),
            pacing: ReceivePacing::default(),
            receive_start: ReceiveStart::default(),
            min_tls_version: MinTlsVersion::default(),
        }
    }

    /// Read `PUBSUB_HUB`, `PUBSUB_NEGOTIATE_URL` and optionally
    /// `PUBSUB_PACING_MS` from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] if a required variable is missing or
    /// the pacing is not a number.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PubSubError::Config(format!("{key} is not set")))
        };
        let mut config = Self::new(required("PUBSUB_HUB")?, required("PUBSUB_NEGOTIATE_URL")?);
        if let Some(ms) = lookup("PUBSUB_PACING_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| PubSubError::Config(format!("PUBSUB_PACING_MS: {e}")))?;
            config.pacing = ReceivePacing::Fixed(Duration::from_millis(ms));
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_pacing(mut self, pacing: ReceivePacing) -> Self {
        self.pacing = pacing;
        self
    }

    #[must_use]
    pub fn with_receive_start(mut self, start: ReceiveStart) -> Self {
        self.receive_start = start;
        self
    }

    #[must_use]
    pub fn with_min_tls_version(mut self, version: MinTlsVersion) -> Self {
        self.min_tls_version = version;
        self
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// Builder for [`PubSubClient`]. Obtain one from [`PubSubClient::builder`].
pub struct PubSubClientBuilder {
    config: PubSubConfig,
    handler: Option<Arc<dyn MessageHandler>>,
    negotiator: Option<Arc<dyn Negotiator>>,
    connector: Option<Arc<dyn Connector>>,
    cancel: Option<CancellationToken>,
}

impl PubSubClientBuilder {
    /// Register the consumer of inbound messages.
    #[must_use]
    pub fn with_handler(self, handler: impl MessageHandler) -> Self {
        self.with_shared_handler(Arc::new(handler))
    }

    /// Register an already shared handler.
    #[must_use]
    pub fn with_shared_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replace the default HTTP negotiator.
    #[must_use]
    pub fn with_negotiator(self, negotiator: impl Negotiator) -> Self {
        self.with_shared_negotiator(Arc::new(negotiator))
    }

    #[must_use]
    pub fn with_shared_negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Replace the default WebSocket connector.
    #[must_use]
    pub fn with_connector(self, connector: impl Connector) -> Self {
        self.with_shared_connector(Arc::new(connector))
    }

    #[must_use]
    pub fn with_shared_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Link the receive loop to a parent token; cancelling it stops the loop.
    #[must_use]
    pub fn with_cancellation(mut self, parent: CancellationToken) -> Self {
        self.cancel = Some(parent);
        self
    }

    /// Build the client. No I/O happens until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] if the hub name is blank, or if no
    /// negotiator/connector was supplied and the default one is unavailable.
    pub fn build(self) -> Result<PubSubClient> {
        if self.config.hub.trim().is_empty() {
            return Err(PubSubError::Config("hub name must not be empty".into()));
        }

        let negotiator = match self.negotiator {
            Some(n) => n,
            None => default_negotiator(&self.config)?,
        };
        let connector = match self.connector {
            Some(c) => c,
            None => default_connector(&self.config)?,
        };

        let dispatcher = Dispatcher::new(self.handler);
        if !dispatcher.has_handler() {
            warn!(
                hub = %self.config.hub,
                "no message handler registered; inbound messages will be dropped"
            );
        }

        let connection = ConnectionManager::new(self.config.hub.clone(), negotiator, connector);
        Ok(PubSubClient {
            shared: Arc::new(ClientShared {
                config: self.config,
                connection,
                dispatcher,
                parent_cancel: self.cancel,
                receiver: Mutex::new(LoopSlot::default()),
            }),
        })
    }
}

#[cfg(feature = "negotiate-http")]
fn default_negotiator(config: &PubSubConfig) -> Result<Arc<dyn Negotiator>> {
    if config.negotiate_url.trim().is_empty() {
        return Err(PubSubError::Config("negotiate URL must not be empty".into()));
    }
    Ok(Arc::new(crate::negotiate::HttpNegotiator::new(
        config.negotiate_url.clone(),
        config.min_tls_version,
    )?))
}

#[cfg(not(feature = "negotiate-http"))]
fn default_negotiator(_config: &PubSubConfig) -> Result<Arc<dyn Negotiator>> {
    Err(PubSubError::Config(
        "no negotiator supplied and the `negotiate-http` feature is disabled".into(),
    ))
}

#[cfg(feature = "transport-websocket")]
fn default_connector(config: &PubSubConfig) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(crate::transports::WebSocketConnector::new(
        config.min_tls_version,
    )?))
}

#[cfg(not(feature = "transport-websocket"))]
fn default_connector(_config: &PubSubConfig) -> Result<Arc<dyn Connector>> {
    Err(PubSubError::Config(
        "no connector supplied and the `transport-websocket` feature is disabled".into(),
    ))
}

// ── Shared state ────────────────────────────────────────────────────

struct ReceiveLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct LoopSlot {
    active: Option<ReceiveLoop>,
    /// Loop cancelled from inside its own handler and not yet joined.
    retiring: Option<JoinHandle<()>>,
}

pub(crate) struct ClientShared {
    pub(crate) config: PubSubConfig,
    pub(crate) connection: ConnectionManager,
    pub(crate) dispatcher: Dispatcher,
    parent_cancel: Option<CancellationToken>,
    receiver: Mutex<LoopSlot>,
}

impl ClientShared {
    fn slot(&self) -> MutexGuard<'_, LoopSlot> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a pub/sub hub connection.
///
/// Clones share the same connection and receive loop. Call
/// [`close`](Self::close) to shut down; dropping handles does not stop the
/// background loop.
#[derive(Clone)]
pub struct PubSubClient {
    shared: Arc<ClientShared>,
}

impl PubSubClient {
    /// Start building a client for `config`.
    pub fn builder(config: PubSubConfig) -> PubSubClientBuilder {
        PubSubClientBuilder {
            config,
            handler: None,
            negotiator: None,
            connector: None,
            cancel: None,
        }
    }

    pub(crate) fn from_shared(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    // ── Public API methods ──────────────────────────────────────────

    /// Negotiate and open the connection if it is not already open.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Connection`] on negotiation or handshake failure.
    pub async fn connect(&self) -> Result<()> {
        self.shared.connection.connect().await?;
        if self.shared.config.receive_start == ReceiveStart::OnOpen {
            self.ensure_receive_loop();
        }
        Ok(())
    }

    /// Join `group`.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Validation`] for a blank group name (before any
    /// I/O), or a connection/transport error.
    pub async fn join_group(&self, group: &str) -> Result<()> {
        let frame = protocol::encode_join(group)?;
        self.send(frame).await?;
        info!(hub = %self.hub(), group, "joined group");
        Ok(())
    }

    /// Leave `group`.
    ///
    /// # Errors
    ///
    /// Same as [`join_group`](Self::join_group).
    pub async fn leave_group(&self, group: &str) -> Result<()> {
        let frame = protocol::encode_leave(group)?;
        self.send(frame).await?;
        info!(hub = %self.hub(), group, "left group");
        Ok(())
    }

    /// Broadcast `data` to every member of `group`.
    ///
    /// Unlike [`send`](Self::send) this does not start the receive loop,
    /// except under [`ReceiveStart::OnOpen`].
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Validation`] for a blank group or payload
    /// (before any I/O), or a connection/transport error.
    pub async fn send_to_group(&self, group: &str, data: &str) -> Result<()> {
        let frame = protocol::encode_send_to_group(group, data)?;
        self.shared.connection.send(frame).await?;
        if self.shared.config.receive_start == ReceiveStart::OnOpen {
            self.ensure_receive_loop();
        }
        debug!(hub = %self.hub(), group, bytes = data.len(), "sent to group");
        Ok(())
    }

    /// Write a raw text frame, reconnecting first if necessary.
    ///
    /// The first successful send starts the receive loop. Joining and
    /// leaving a group go through here.
    ///
    /// # Errors
    ///
    /// Returns a connection or transport error.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        self.shared.connection.send(text.into()).await?;
        self.ensure_receive_loop();
        Ok(())
    }

    /// Stop the receive loop, then close the connection with `reason`.
    ///
    /// Safe to call repeatedly and from inside the message handler. Called
    /// from this client's own handler, the loop is told to stop and exits once
    /// the handler returns; it is joined by the next `close` made from
    /// elsewhere. Called from another client's handler, it waits for this
    /// client's loop to finish like any other caller.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the close handshake fails.
    pub async fn close(&self, reason: &str) -> Result<()> {
        if dispatch::dispatching_for(self.dispatch_id()) {
            let mut slot = self.shared.slot();
            if let Some(running) = slot.active.take() {
                running.cancel.cancel();
                debug!(hub = %self.hub(), "close requested from the handler");
                slot.retiring = Some(running.task);
            }
        } else {
            let (active, retiring) = {
                let mut slot = self.shared.slot();
                (slot.active.take(), slot.retiring.take())
            };
            if let Some(running) = active {
                running.cancel.cancel();
                join_loop(running.task).await;
            }
            if let Some(task) = retiring {
                join_loop(task).await;
            }
        }

        self.shared.connection.close(reason).await
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The hub this client is bound to.
    pub fn hub(&self) -> &str {
        self.shared.connection.hub()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.shared.connection.watch_state()
    }

    /// Returns `true` while a receive loop is started and not cancelled.
    pub fn is_receiving(&self) -> bool {
        self.shared
            .slot()
            .active
            .as_ref()
            .is_some_and(|l| !l.cancel.is_cancelled() && !l.task.is_finished())
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &PubSubConfig {
        &self.shared.config
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Identifies this client's shared state, and so every clone of it.
    pub(crate) fn dispatch_id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Start the receive loop unless one is already active.
    fn ensure_receive_loop(&self) {
        let mut slot = self.shared.slot();
        if slot.active.is_some() {
            return;
        }

        let cancel = self
            .shared
            .parent_cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let previous = slot.retiring.take();
        let task = tokio::spawn(receive::run(
            Arc::clone(&self.shared),
            cancel.clone(),
            previous,
        ));
        debug!(hub = %self.hub(), "receive loop spawned");
        slot.active = Some(ReceiveLoop { cancel, task });
    }
}

async fn join_loop(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        if !e.is_cancelled() {
            warn!("receive loop terminated abnormally: {e}");
        }
    }
}

impl std::fmt::Debug for PubSubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubClient")
            .field("hub", &self.hub())
            .field("state", &self.state())
            .field("receiving", &self.is_receiving())
            .finish()
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Mints clients for different hubs that share one negotiation endpoint, one
/// HTTP client and one TLS policy.
#[cfg(all(feature = "negotiate-http", feature = "transport-websocket"))]
#[derive(Debug, Clone)]
pub struct PubSubClientFactory {
    template: PubSubConfig,
    negotiator: crate::negotiate::HttpNegotiator,
    connector: Arc<crate::transports::WebSocketConnector>,
}

#[cfg(all(feature = "negotiate-http", feature = "transport-websocket"))]
impl PubSubClientFactory {
    /// Create a factory. The template's `hub` is replaced on every
    /// [`create`](Self::create).
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] if the HTTP or TLS client cannot be
    /// built.
    pub fn new(template: PubSubConfig) -> Result<Self> {
        let negotiator = crate::negotiate::HttpNegotiator::new(
            template.negotiate_url.clone(),
            template.min_tls_version,
        )?;
        let connector = Arc::new(crate::transports::WebSocketConnector::new(
            template.min_tls_version,
        )?);
        Ok(Self {
            template,
            negotiator,
            connector,
        })
    }

    /// Build a client bound to `hub`.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] for a blank hub name.
    pub fn create(
        &self,
        hub: impl Into<String>,
        handler: impl MessageHandler,
    ) -> Result<PubSubClient> {
        let config = PubSubConfig {
            hub: hub.into(),
            ..self.template.clone()
        };
        PubSubClient::builder(config)
            .with_negotiator(self.negotiator.clone())
            .with_shared_connector(self.connector.clone())
            .with_handler(handler)
            .build()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_defaults() {
        let config = PubSubConfig::new("hub1", "http://localhost/negotiate");
        assert_eq!(config.hub, "hub1");
        assert_eq!(config.pacing, ReceivePacing::Fixed(Duration::from_millis(300)));
        assert_eq!(config.receive_start, ReceiveStart::FirstSend);
        assert_eq!(config.min_tls_version, MinTlsVersion::Tls12);
    }

    #[test]
    fn fixed_pacing_ignores_failures() {
        let pacing = ReceivePacing::Fixed(Duration::from_millis(300));
        assert_eq!(pacing.delay(0), Duration::from_millis(300));
        assert_eq!(pacing.delay(50), Duration::from_millis(300));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let pacing = ReceivePacing::Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(pacing.delay(0), Duration::from_millis(100));
        assert_eq!(pacing.delay(1), Duration::from_millis(100));
        assert_eq!(pacing.delay(2), Duration::from_millis(200));
        assert_eq!(pacing.delay(3), Duration::from_millis(400));
        assert_eq!(pacing.delay(5), Duration::from_secs(1));
        assert_eq!(pacing.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn from_lookup_reads_required_and_optional_keys() {
        let env: HashMap<&str, &str> = [
            ("PUBSUB_HUB", "chat"),
            ("PUBSUB_NEGOTIATE_URL", "https://x/negotiate"),
            ("PUBSUB_PACING_MS", " 50 "),
        ]
        .into_iter()
        .collect();
        let config = PubSubConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.hub, "chat");
        assert_eq!(config.negotiate_url, "https://x/negotiate");
        assert_eq!(config.pacing, ReceivePacing::Fixed(Duration::from_millis(50)));
    }

    #[test]
    fn from_lookup_requires_hub() {
        let err = PubSubConfig::from_lookup(|k| {
            (k == "PUBSUB_NEGOTIATE_URL").then(|| "https://x".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, PubSubError::Config(msg) if msg.contains("PUBSUB_HUB")));
    }

    #[test]
    fn from_lookup_rejects_bad_pacing() {
        let err = PubSubConfig::from_lookup(|k| match k {
            "PUBSUB_PACING_MS" => Some("soon".into()),
            _ => Some("x".into()),
        })
        .unwrap_err();
        assert!(matches!(err, PubSubError::Config(_)));
    }

    #[cfg(all(feature = "negotiate-http", feature = "transport-websocket"))]
    #[tokio::test]
    async fn default_stack_builds_without_io() {
        let config = PubSubConfig::new("hub1", "http://127.0.0.1:1/negotiate");
        let client = PubSubClient::builder(config).build().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_receiving());
    }

    #[cfg(all(feature = "negotiate-http", feature = "transport-websocket"))]
    #[tokio::test]
    async fn factory_binds_each_client_to_its_hub() {
        let factory =
            PubSubClientFactory::new(PubSubConfig::new("", "http://127.0.0.1:1/negotiate")).unwrap();
        let (h1, _rx1) = crate::dispatch::ChannelHandler::new(4);
        let (h2, _rx2) = crate::dispatch::ChannelHandler::new(4);
        let a = factory.create("alpha", h1).unwrap();
        let b = factory.create("beta", h2).unwrap();
        assert_eq!(a.hub(), "alpha");
        assert_eq!(b.hub(), "beta");

        let (h3, _rx3) = crate::dispatch::ChannelHandler::new(4);
        assert!(matches!(factory.create("  ", h3), Err(PubSubError::Config(_))));
    }

    #[cfg(feature = "negotiate-http")]
    #[test]
    fn blank_negotiate_url_is_rejected_by_default_negotiator() {
        let err = PubSubClient::builder(PubSubConfig::new("hub1", " ")).build().unwrap_err();
        assert!(matches!(err, PubSubError::Config(_)));
    }

    #[test]
    fn blank_hub_is_rejected() {
        let err = PubSubClient::builder(PubSubConfig::new("  ", "http://x")).build().unwrap_err();
        assert!(matches!(err, PubSubError::Config(_)));
    }
}
