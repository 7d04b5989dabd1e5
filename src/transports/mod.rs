//! Transport implementations for the pub/sub client.
//!
//! This module provides concrete [`Connector`](crate::transport::Connector)
//! implementations behind feature gates:
//!
//! | Feature                | Connector              |
//! |------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketConnector`] |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example() -> Result<(), web_pubsub_client::PubSubError> {
//! use web_pubsub_client::transport::Connector;
//! use web_pubsub_client::{MinTlsVersion, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new(MinTlsVersion::Tls12)?;
//! let mut link = connector.connect("wss://example.com/client/hubs/chat?access_token=…").await?;
//! link.sink.send_text(r#"{"type":"joinGroup","group":"lobby"}"#.to_string()).await?;
//! link.sink.close("done").await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketConnector;
