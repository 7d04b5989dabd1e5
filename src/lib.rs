//! # Web PubSub Client
//!
//! Async Rust client for cloud real-time pub/sub hubs speaking the
//! `json.webpubsub.azure.v1` WebSocket sub-protocol.
//!
//! A [`PubSubClient`] is bound to one hub. It negotiates a short-lived access
//! URL over HTTP before every handshake and reconnects on demand. It joins and
//! leaves groups and broadcasts to them. A background receive loop
//! reassembles fragmented frames and hands decoded [`WireMessage`]s to a
//! [`MessageHandler`].
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Connector`](transport::Connector) for any backend
//! - **WebSocket built-in**: the default `transport-websocket` feature provides [`WebSocketConnector`]
//! - **HTTP negotiation built-in**: the default `negotiate-http` feature provides [`HttpNegotiator`]
//! - **Self-healing**: the receive loop retries forever at a configurable pace
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use web_pubsub_client::{handler_fn, HandlerError, PubSubClient, PubSubConfig};
//!
//! # async fn example() -> Result<(), web_pubsub_client::PubSubError> {
//! let client = PubSubClient::builder(PubSubConfig::new("chat", "https://example.com/negotiate"))
//!     .with_handler(handler_fn(|_client, event| async move {
//!         println!("[{}] {}", event.message.group, event.message.data);
//!         Ok::<(), HandlerError>(())
//!     }))
//!     .build()?;
//!
//! client.join_group("lobby").await?;
//! client.send_to_group("lobby", "hello").await?;
//! client.close("done").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod negotiate;
pub mod protocol;
mod receive;
pub mod tls;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{PubSubClient, PubSubConfig, ReceivePacing, ReceiveStart};
pub use connection::ConnectionState;
pub use dispatch::{handler_fn, ChannelHandler, FanOut, HandlerError, MessageHandler, ReceiveEvent};
pub use error::{PubSubError, Result};
pub use negotiate::Negotiator;
pub use protocol::{ClientMessage, WireMessage, SUB_PROTOCOL};
pub use tls::MinTlsVersion;
pub use transport::{Connector, Frame, FrameSink, FrameStream, Link};

#[cfg(all(feature = "negotiate-http", feature = "transport-websocket"))]
pub use client::PubSubClientFactory;
#[cfg(feature = "negotiate-http")]
pub use negotiate::HttpNegotiator;
#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketConnector;
