//! Transport abstraction for the pub/sub client.
//!
//! A live connection is split into a write half ([`FrameSink`]) and a read
//! half ([`FrameStream`]) so that the receive loop can block on reads while
//! callers keep writing. A [`Connector`] performs the handshake against an
//! access URL and hands back both halves as a [`Link`].
//!
//! Reads are frame-oriented: a logical message may arrive as several
//! [`Frame`]s, the last of which has `end_of_message` set. The receive loop
//! concatenates payloads until it sees that marker.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use web_pubsub_client::error::Result;
//! use web_pubsub_client::transport::{Connector, Frame, FrameSink, FrameStream, Link};
//!
//! struct MySink;
//! struct MyStream;
//! struct MyConnector;
//!
//! #[async_trait]
//! impl FrameSink for MySink {
//!     async fn send_text(&mut self, text: String) -> Result<()> { Ok(()) }
//!     async fn close(&mut self, reason: &str) -> Result<()> { Ok(()) }
//! }
//!
//! #[async_trait]
//! impl FrameStream for MyStream {
//!     async fn next_frame(&mut self) -> Option<Result<Frame>> { None }
//! }
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, url: &str) -> Result<Link> {
//!         Ok(Link::new(MySink, MyStream))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::Result;

/// One transport-level unit of an inbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// UTF-8 payload of this fragment.
    pub payload: String,
    /// Set on the last fragment of a logical message.
    pub end_of_message: bool,
}

impl Frame {
    /// A complete, unfragmented message.
    pub fn complete(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            end_of_message: true,
        }
    }

    /// A non-final fragment.
    pub fn fragment(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            end_of_message: false,
        }
    }
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete text message as a single final frame.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::TransportSend`](crate::PubSubError::TransportSend)
    /// or [`PubSubError::TransportClosed`](crate::PubSubError::TransportClosed).
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Perform a normal-closure handshake carrying `reason`.
    ///
    /// Must be idempotent.
    async fn close(&mut self, reason: &str) -> Result<()>;
}

/// Read half of a connection.
///
/// # Cancel Safety
///
/// [`next_frame`](FrameStream::next_frame) is raced against cancellation
/// inside `tokio::select!`, so dropping it before completion must not lose
/// data that a later call would have returned.
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Receive the next frame.
    ///
    /// Returns:
    /// - `Some(Ok(frame))` — a text frame or fragment
    /// - `Some(Err(e))` — a transport error
    /// - `None` — the peer closed the connection
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Both halves of a freshly established connection.
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl Link {
    /// Box up a sink and a stream.
    pub fn new(sink: impl FrameSink, stream: impl FrameStream) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Performs the transport handshake against a negotiated access URL.
///
/// Implementations are expected to offer the
/// [`SUB_PROTOCOL`](crate::protocol::SUB_PROTOCOL) identifier.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Connection`](crate::PubSubError::Connection) if
    /// the URL is invalid or the handshake is rejected.
    async fn connect(&self, url: &str) -> Result<Link>;
}
