//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] performs the handshake offering the
//! `json.webpubsub.azure.v1` sub-protocol and splits the stream into a
//! [`FrameSink`] and a [`FrameStream`]. Both `ws://` and `wss://` URLs are
//! supported; TLS uses a per-connector `rustls` configuration so the minimum
//! protocol version is never process-global.
//!
//! `tungstenite` reassembles continuation frames itself, so every text
//! message surfaces here as one complete [`Frame`].
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is
//! enabled (it is enabled by default).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::error::{PubSubError, Result};
use crate::protocol::SUB_PROTOCOL;
use crate::tls::{self, MinTlsVersion};
use crate::transport::{Connector, Frame, FrameSink, FrameStream, Link};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Connector`] that opens WebSocket connections.
#[derive(Clone)]
pub struct WebSocketConnector {
    tls: Arc<rustls::ClientConfig>,
    min_tls: MinTlsVersion,
}

impl WebSocketConnector {
    /// Create a connector that accepts at least `min_tls`.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] if the TLS configuration is rejected.
    pub fn new(min_tls: MinTlsVersion) -> Result<Self> {
        Ok(Self {
            tls: tls::rustls_client_config(min_tls)?,
            min_tls,
        })
    }

    /// The minimum TLS version this connector accepts.
    pub fn min_tls_version(&self) -> MinTlsVersion {
        self.min_tls
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("min_tls", &self.min_tls)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let mut request = url
            .into_client_request()
            .map_err(|e| PubSubError::Connection(format!("invalid access URL: {e}")))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUB_PROTOCOL));

        tracing::debug!(host = ?request.uri().host(), "opening WebSocket");

        let (stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(tokio_tungstenite::Connector::Rustls(Arc::clone(&self.tls))),
        )
        .await
        .map_err(|e| PubSubError::Connection(format!("WebSocket handshake failed: {e}")))?;

        tracing::info!(protocol = SUB_PROTOCOL, "WebSocket connection established");
        Ok(split(stream))
    }
}

/// Split an established stream into a [`Link`].
///
/// Useful when the stream was opened with custom headers or proxies.
pub fn split(stream: WsStream) -> Link {
    let (sink, stream) = stream.split();
    Link::new(
        WebSocketSink {
            sink,
            closed: false,
        },
        WebSocketFrames { stream },
    )
}

/// Write half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(PubSubError::TransportClosed);
        }
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| PubSubError::TransportSend(e.to_string()))
    }

    async fn close(&mut self, reason: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_owned().into(),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(PubSubError::TransportSend(e.to_string())),
        }
    }
}

/// Read half of a WebSocket connection.
///
/// # Cancel Safety
///
/// [`next_frame`](FrameStream::next_frame) is cancel-safe: the underlying
/// stream only yields complete messages.
pub struct WebSocketFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(PubSubError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(Frame::complete(text.to_string()))),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite queues the pong reply itself.
                }
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
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
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn connector() -> WebSocketConnector {
        WebSocketConnector::new(MinTlsVersion::Tls12).unwrap()
    }

    /// Start a local server that accepts one connection, echoes the offered
    /// sub-protocol back, and then runs `handler`.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let offered = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
                assert_eq!(offered.as_ref().and_then(|v| v.to_str().ok()), Some(SUB_PROTOCOL));
                if let Some(protocol) = offered {
                    resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
                }
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}/client/hubs/chat")
    }

    #[test]
    fn connector_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WebSocketConnector>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = connector().connect("not-a-valid-url").await.unwrap_err();
        assert!(matches!(err, PubSubError::Connection(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = connector().connect("ws://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, PubSubError::Connection(_)));
    }

    #[tokio::test]
    async fn send_and_receive_text() {
        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut link = connector().connect(&url).await.unwrap();
        link.sink
            .send_text(r#"{"type":"joinGroup","group":"g1"}"#.into())
            .await
            .unwrap();

        let frame = link.stream.next_frame().await.unwrap().unwrap();
        assert!(frame.end_of_message);
        assert_eq!(frame.payload, r#"{"type":"joinGroup","group":"g1"}"#);
    }

    #[tokio::test]
    async fn binary_frames_are_skipped() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into())).await.unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut link = connector().connect(&url).await.unwrap();
        let frame = link.stream.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload, "after_binary");
    }

    #[tokio::test]
    async fn server_close_ends_stream() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut link = connector().connect(&url).await.unwrap();
        assert!(link.stream.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn close_sends_reason_and_is_idempotent() {
        let (reason_tx, reason_rx) = tokio::sync::oneshot::channel();
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(Some(frame)) = msg {
                    let _ = reason_tx.send((frame.code, frame.reason.as_str().to_owned()));
                    break;
                }
            }
        })
        .await;

        let mut link = connector().connect(&url).await.unwrap();
        link.sink.close("done").await.unwrap();
        link.sink.close("again").await.unwrap();

        let (code, reason) = reason_rx.await.unwrap();
        assert_eq!(code, CloseCode::Normal);
        assert_eq!(reason, "done");

        let err = link.sink.send_text("late".into()).await.unwrap_err();
        assert!(matches!(err, PubSubError::TransportClosed));
    }
}
