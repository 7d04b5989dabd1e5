//! Connection manager: owns the transport halves and the connection state.
//!
//! Every state transition and every outbound write happens while holding one
//! async mutex, so two callers can never race a handshake and frames are
//! written whole. The read half is handed to the receive loop, which owns it
//! for as long as that connection generation lives.

use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{PubSubError, Result};
use crate::negotiate::Negotiator;
use crate::transport::{Connector, FrameSink, FrameStream};

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Initial state, or after a failed handshake or a lost connection.
    #[default]
    Disconnected,
    /// Negotiation or handshake in flight.
    Connecting,
    /// Ready for send and receive.
    Open,
    /// Shutdown requested.
    Closing,
    /// Closed by the client.
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal edge.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected | Closed, Connecting)
                | (Connecting, Open | Disconnected | Closing)
                | (Open, Closing | Disconnected)
                | (Closing, Closed)
        )
    }

    /// `true` for `Open` and `Connecting`.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Read half taken over by the receive loop, tagged with its generation.
pub(crate) struct HeldStream {
    pub(crate) generation: u64,
    pub(crate) stream: Box<dyn FrameStream>,
}

struct Inner {
    state: ConnectionState,
    /// Bumped on every successful handshake.
    generation: u64,
    sink: Option<Box<dyn FrameSink>>,
    /// Present until the receive loop takes it.
    stream: Option<Box<dyn FrameStream>>,
}

/// Owns one hub connection and is the only writer of its state.
pub struct ConnectionManager {
    hub: String,
    negotiator: Arc<dyn Negotiator>,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    /// Generation of the open connection, `None` while not open.
    live_tx: watch::Sender<Option<u64>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        hub: String,
        negotiator: Arc<dyn Negotiator>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (live_tx, _) = watch::channel(None);
        Self {
            hub,
            negotiator,
            connector,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                sink: None,
                stream: None,
            }),
            state_tx,
            live_tx,
        }
    }

    /// The hub this connection serves.
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Last published state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Establish the connection unless it is already open.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Connection`] if negotiation or the handshake
    /// fails; the state reverts to `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    /// Connect unless the state is already `Open`.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.connect().await
    }

    /// Ensure the connection, then write `text` as one final text frame.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Connection`] if a reconnect was needed and
    /// failed, or the transport's send error. A send error marks the
    /// connection lost so the next operation reconnects.
    pub async fn send(&self, text: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await?;

        let result = match inner.sink.as_mut() {
            Some(sink) => sink.send_text(text).await,
            None => Err(PubSubError::TransportClosed),
        };
        if let Err(e) = &result {
            warn!(hub = %self.hub, "send failed: {e}");
            let generation = inner.generation;
            self.drop_link_locked(&mut inner, generation);
        }
        result
    }

    /// Close the connection with a normal-closure handshake.
    ///
    /// Only acts when the state is `Open` or `Connecting`; otherwise any
    /// leftover transport halves are released and the call is a no-op.
    pub async fn close(&self, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.stream = None;

        if !inner.state.is_active() {
            inner.sink = None;
            return Ok(());
        }

        self.transition(&mut inner, ConnectionState::Closing);
        let result = match inner.sink.take() {
            Some(mut sink) => sink.close(reason).await,
            None => Ok(()),
        };
        self.transition(&mut inner, ConnectionState::Closed);
        info!(hub = %self.hub, reason, "connection closed");

        if let Err(e) = &result {
            warn!(hub = %self.hub, "close handshake failed: {e}");
        }
        result
    }

    /// Make sure the loop holds the read half of the current connection.
    ///
    /// Connects if needed. Replaces `held` when a newer generation is
    /// available.
    pub(crate) async fn acquire_stream(&self, held: &mut Option<HeldStream>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await?;

        if let Some(stream) = inner.stream.take() {
            *held = Some(HeldStream {
                generation: inner.generation,
                stream,
            });
        }
        match held {
            Some(h) if h.generation == inner.generation => Ok(()),
            _ => Err(PubSubError::TransportClosed),
        }
    }

    /// Watch the generation of the open connection.
    pub(crate) fn live_generation(&self) -> watch::Receiver<Option<u64>> {
        self.live_tx.subscribe()
    }

    /// Report that the read half of `generation` ended or failed.
    pub(crate) async fn mark_lost(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        self.drop_link_locked(&mut inner, generation);
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn connect_locked(&self, inner: &mut MutexGuard<'_, Inner>) -> Result<()> {
        let state = inner.state;
        match state {
            ConnectionState::Open => return Ok(()),
            // Only observable under the lock if an earlier attempt was dropped
            // mid-flight.
            ConnectionState::Connecting | ConnectionState::Closing => {
                warn!(hub = %self.hub, %state, "abandoned transition; starting over");
                self.force(inner, ConnectionState::Disconnected);
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {}
        }

        info!(hub = %self.hub, state = %inner.state, "connecting");
        self.transition(inner, ConnectionState::Connecting);

        let url = match self.negotiator.access_url().await {
            Ok(url) => url,
            Err(e) => {
                self.transition(inner, ConnectionState::Disconnected);
                return Err(into_connection_error(e));
            }
        };

        let link = match self.connector.connect(&url).await {
            Ok(link) => link,
            Err(e) => {
                warn!(hub = %self.hub, "handshake failed: {e}");
                self.transition(inner, ConnectionState::Disconnected);
                return Err(into_connection_error(e));
            }
        };

        inner.generation = inner.generation.wrapping_add(1);
        inner.sink = Some(link.sink);
        inner.stream = Some(link.stream);
        self.transition(inner, ConnectionState::Open);
        info!(hub = %self.hub, generation = inner.generation, "connected");
        Ok(())
    }

    fn drop_link_locked(&self, inner: &mut Inner, generation: u64) {
        if inner.generation != generation || inner.state != ConnectionState::Open {
            return;
        }
        inner.sink = None;
        inner.stream = None;
        self.transition(inner, ConnectionState::Disconnected);
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        if !inner.state.can_transition_to(next) {
            warn!(hub = %self.hub, from = %inner.state, to = %next, "unexpected state transition");
        }
        self.force(inner, next);
    }

    fn force(&self, inner: &mut Inner, next: ConnectionState) {
        debug!(hub = %self.hub, from = %inner.state, to = %next, "state transition");
        inner.state = next;
        self.state_tx.send_replace(next);
        let live = (next == ConnectionState::Open).then_some(inner.generation);
        self.live_tx.send_replace(live);
    }
}

fn into_connection_error(e: PubSubError) -> PubSubError {
    match e {
        PubSubError::Connection(_) => e,
        other => PubSubError::Connection(other.to_string()),
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("hub", &self.hub)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

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
    use crate::transport::{Frame, Link};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // ── Mocks ───────────────────────────────────────────────────────

    struct FixedNegotiator {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Negotiator for FixedNegotiator {
        async fn access_url(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PubSubError::Connection("negotiation returned HTTP 500".into()))
            } else {
                Ok("ws://mock/client".into())
            }
        }
    }

    struct RecordingSink {
        sent: Arc<StdMutex<Vec<String>>>,
        closed_with: Arc<StdMutex<Option<String>>>,
        fail_sends: bool,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> Result<()> {
            if self.fail_sends {
                return Err(PubSubError::TransportSend("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&mut self, reason: &str) -> Result<()> {
            *self.closed_with.lock().unwrap() = Some(reason.to_owned());
            Ok(())
        }
    }

    struct SilentStream;

    #[async_trait]
    impl FrameStream for SilentStream {
        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            std::future::pending().await
        }
    }

    struct RecordingConnector {
        handshakes: Arc<AtomicUsize>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed_with: Arc<StdMutex<Option<String>>>,
        fail_sends: bool,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(&self, url: &str) -> Result<Link> {
            assert_eq!(url, "ws://mock/client");
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(Link::new(
                RecordingSink {
                    sent: Arc::clone(&self.sent),
                    closed_with: Arc::clone(&self.closed_with),
                    fail_sends: self.fail_sends,
                },
                SilentStream,
            ))
        }
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        negotiations: Arc<AtomicUsize>,
        handshakes: Arc<AtomicUsize>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed_with: Arc<StdMutex<Option<String>>>,
    }

    fn harness(fail_negotiation: bool, fail_sends: bool) -> Harness {
        let negotiations = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed_with = Arc::new(StdMutex::new(None));
        let manager = Arc::new(ConnectionManager::new(
            "hub1".into(),
            Arc::new(FixedNegotiator {
                calls: Arc::clone(&negotiations),
                fail: fail_negotiation,
            }),
            Arc::new(RecordingConnector {
                handshakes: Arc::clone(&handshakes),
                sent: Arc::clone(&sent),
                closed_with: Arc::clone(&closed_with),
                fail_sends,
            }),
        ));
        Harness {
            manager,
            negotiations,
            handshakes,
            sent,
            closed_with,
        }
    }

    // ── State machine ───────────────────────────────────────────────

    #[test]
    fn lifecycle_edges_are_monotone() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Connecting));

        assert!(!Open.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Disconnected.can_transition_to(Open));
    }

    // ── Manager ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_opens_and_is_idempotent() {
        let h = harness(false, false);
        h.manager.connect().await.unwrap();
        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Open);
        assert_eq!(h.negotiations.load(Ordering::SeqCst), 1);
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_handshake() {
        let h = harness(false, false);
        let m = &h.manager;
        let (a, b, c) = tokio::join!(m.connect(), m.connect(), m.ensure_connected());
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_negotiation_reverts_to_disconnected() {
        let h = harness(true, false);
        let err = h.manager.connect().await.unwrap_err();
        assert!(matches!(err, PubSubError::Connection(_)));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_connects_lazily_and_writes() {
        let h = harness(false, false);
        h.manager.send("hello".into()).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Open);
        assert_eq!(*h.sent.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn send_failure_marks_connection_lost() {
        let h = harness(false, true);
        let err = h.manager.send("hello".into()).await.unwrap_err();
        assert!(matches!(err, PubSubError::TransportSend(_)));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);

        // The next send reconnects.
        let _ = h.manager.send("again".into()).await;
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_runs_handshake_once() {
        let h = harness(false, false);
        h.manager.connect().await.unwrap();
        h.manager.close("done").await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Closed);
        assert_eq!(h.closed_with.lock().unwrap().as_deref(), Some("done"));

        *h.closed_with.lock().unwrap() = None;
        h.manager.close("again").await.unwrap();
        assert!(h.closed_with.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn close_when_never_connected_is_noop() {
        let h = harness(false, false);
        h.manager.close("done").await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_after_close_reconnects() {
        let h = harness(false, false);
        h.manager.connect().await.unwrap();
        h.manager.close("done").await.unwrap();
        h.manager.send("back".into()).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Open);
        assert_eq!(h.handshakes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn acquire_stream_follows_generations() {
        let h = harness(false, false);
        let mut held = None;
        h.manager.acquire_stream(&mut held).await.unwrap();
        let first = held.as_ref().map(|s| s.generation).unwrap();

        // Same generation: keeps the held stream.
        h.manager.acquire_stream(&mut held).await.unwrap();
        assert_eq!(held.as_ref().map(|s| s.generation), Some(first));

        h.manager.mark_lost(first).await;
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        h.manager.acquire_stream(&mut held).await.unwrap();
        assert_eq!(held.as_ref().map(|s| s.generation), Some(first + 1));
    }

    #[tokio::test]
    async fn stale_loss_report_is_ignored() {
        let h = harness(false, false);
        h.manager.connect().await.unwrap();
        h.manager.mark_lost(0).await;
        assert_eq!(h.manager.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn watch_observes_transitions() {
        let h = harness(false, false);
        let mut rx = h.manager.watch_state();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Disconnected);
        h.manager.connect().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Open);
    }
}
