#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the pub/sub client integration tests.
//!
//! Provides an in-memory [`MockHub`] that plays the service: it hands out
//! access URLs, accepts handshakes, records every frame the client writes and
//! lets a test push frames down the current connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use web_pubsub_client::transport::{Connector, Frame, FrameSink, FrameStream, Link};
use web_pubsub_client::{
    MessageHandler, Negotiator, PubSubClient, PubSubConfig, PubSubError, ReceivePacing,
    Result, WireMessage,
};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(2);

type FrameTx = mpsc::UnboundedSender<Result<Frame>>;

// ── MockHub ─────────────────────────────────────────────────────────

#[derive(Default)]
struct HubState {
    negotiations: AtomicUsize,
    handshakes: AtomicUsize,
    /// Negotiations beyond this count are refused.
    negotiation_limit: AtomicUsize,
    fail_sends: AtomicBool,
    handshake_delay: StdMutex<Duration>,
    sent: StdMutex<Vec<String>>,
    close_reasons: StdMutex<Vec<String>>,
    /// Push side of the most recent connection.
    current: StdMutex<Option<FrameTx>>,
}

/// In-memory stand-in for the negotiation endpoint and the service.
#[derive(Clone)]
pub struct MockHub {
    state: Arc<HubState>,
}

impl Default for MockHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHub {
    pub fn new() -> Self {
        let state = HubState::default();
        state.negotiation_limit.store(usize::MAX, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    /// Delay every handshake by `delay`.
    pub fn with_handshake_delay(self, delay: Duration) -> Self {
        *self.state.handshake_delay.lock().unwrap() = delay;
        self
    }

    /// Refuse every negotiation after the first `n`.
    pub fn refuse_negotiations_after(&self, n: usize) {
        self.state.negotiation_limit.store(n, Ordering::SeqCst);
    }

    /// Make every write on the current and future connections fail.
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn negotiator(&self) -> MockNegotiator {
        MockNegotiator {
            state: Arc::clone(&self.state),
        }
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            state: Arc::clone(&self.state),
        }
    }

    pub fn negotiations(&self) -> usize {
        self.state.negotiations.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Every frame the client has written, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    /// Reasons of every close handshake received.
    pub fn close_reasons(&self) -> Vec<String> {
        self.state.close_reasons.lock().unwrap().clone()
    }

    /// Push one complete text message down the current connection.
    pub fn push(&self, text: &str) {
        self.push_frame(Ok(Frame::complete(text)));
    }

    /// Push `parts` as fragments of one message; the last one ends it.
    pub fn push_fragments(&self, parts: &[&str]) {
        let last = parts.len().saturating_sub(1);
        for (i, part) in parts.iter().enumerate() {
            let frame = if i == last {
                Frame::complete(*part)
            } else {
                Frame::fragment(*part)
            };
            self.push_frame(Ok(frame));
        }
    }

    /// Push a transport error down the current connection.
    pub fn push_error(&self, message: &str) {
        self.push_frame(Err(PubSubError::TransportReceive(message.into())));
    }

    /// Close the current connection from the service side.
    pub fn drop_connection(&self) {
        self.state.current.lock().unwrap().take();
    }

    fn push_frame(&self, frame: Result<Frame>) {
        let current = self.state.current.lock().unwrap();
        let tx = current.as_ref().expect("no open connection to push to");
        tx.send(frame).expect("client dropped the read half");
    }
}

// ── Negotiator / Connector ──────────────────────────────────────────

pub struct MockNegotiator {
    state: Arc<HubState>,
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn access_url(&self) -> Result<String> {
        let n = self.state.negotiations.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.state.negotiation_limit.load(Ordering::SeqCst) {
            return Err(PubSubError::Connection("negotiation refused".into()));
        }
        Ok(format!("wss://mock.local/client/hubs/chat?access_token=t{n}"))
    }
}

pub struct MockConnector {
    state: Arc<HubState>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        assert!(url.starts_with("wss://mock.local/"), "unexpected access URL {url}");
        let delay = *self.state.handshake_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.handshakes.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.current.lock().unwrap() = Some(tx);
        Ok(Link::new(
            MockSink {
                state: Arc::clone(&self.state),
                closed: false,
            },
            MockStream { rx },
        ))
    }
}

struct MockSink {
    state: Arc<HubState>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(PubSubError::TransportClosed);
        }
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(PubSubError::TransportSend("broken pipe".into()));
        }
        self.state.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&mut self, reason: &str) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.close_reasons.lock().unwrap().push(reason.to_owned());
        }
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<Frame>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await
    }
}

// ── Client helpers ──────────────────────────────────────────────────

/// Configuration with a short pacing delay so tests run quickly.
pub fn test_config() -> PubSubConfig {
    PubSubConfig::new("chat", "http://mock.local/negotiate")
        .with_pacing(ReceivePacing::Fixed(Duration::from_millis(10)))
}

/// Build a client wired to `hub`.
pub fn client_for(
    hub: &MockHub,
    config: PubSubConfig,
    handler: impl MessageHandler,
) -> PubSubClient {
    PubSubClient::builder(config)
        .with_negotiator(hub.negotiator())
        .with_connector(hub.connector())
        .with_handler(handler)
        .build()
        .expect("client should build")
}

/// Receive the next delivered message or panic after [`WAIT`].
pub async fn next_delivery(rx: &mut mpsc::Receiver<WireMessage>) -> WireMessage {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("handler channel closed")
}

/// Poll `condition` until it holds or panic after [`WAIT`].
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── JSON helper functions ───────────────────────────────────────────

/// A group broadcast as the service delivers it.
pub fn group_message_json(group: &str, data: &str) -> String {
    serde_json::json!({
        "type": "message",
        "from": "group",
        "fromUserId": "user-1",
        "group": group,
        "dataType": "text",
        "data": data,
    })
    .to_string()
}

/// The `connected` system event.
pub fn connected_event_json() -> String {
    serde_json::json!({
        "type": "system",
        "event": "connected",
        "userId": "user-1",
        "connectionId": "conn-abc",
    })
    .to_string()
}
