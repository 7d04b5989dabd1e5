//! Background receive loop.
//!
//! One task per client runs until its cancellation token fires. Every
//! iteration reconnects if needed, reads frames until end-of-message, decodes
//! the joined payload and hands it to the dispatcher, then sleeps for the
//! configured pacing delay. Failures are logged and retried forever.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{ClientShared, PubSubClient};
use crate::connection::{ConnectionManager, HeldStream};
use crate::error::{PubSubError, Result};
use crate::protocol::{self, WireMessage};
use crate::transport::FrameStream;

/// Run the loop until `cancel` fires.
///
/// `previous` is a loop that was cancelled but not joined; it is awaited
/// first so two loop bodies never overlap.
pub(crate) async fn run(
    shared: Arc<ClientShared>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let client = PubSubClient::from_shared(Arc::clone(&shared));
    let hub = shared.connection.hub();
    info!(hub, "receive loop running");

    let mut held: Option<HeldStream> = None;
    let mut failures: u32 = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = next_message(&shared.connection, &mut held) => next,
        };

        // Dispatch runs to completion; the handler sees `cancel` itself.
        let outcome = match next {
            Ok(message) => shared
                .dispatcher
                .dispatch(&client, message, cancel.clone())
                .await
                .map_err(|e| PubSubError::Handler(e.to_string())),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => failures = 0,
            Err(e) => {
                failures = failures.saturating_add(1);
                let state = shared.connection.state();
                error!(hub, %state, failures, "receive iteration failed: {e}");
            }
        }

        let delay = shared.config.pacing.delay(failures);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    info!(hub, "receive loop stopped");
}

/// Ensure connectivity, read one logical message and decode it.
async fn next_message(
    connection: &ConnectionManager,
    held: &mut Option<HeldStream>,
) -> Result<WireMessage> {
    connection.acquire_stream(held).await?;
    let Some(current) = held.as_mut() else {
        return Err(PubSubError::TransportClosed);
    };
    let generation = current.generation;

    let read = tokio::select! {
        read = read_message(current.stream.as_mut()) => read,
        () = superseded(connection.live_generation(), generation) => {
            debug!(hub = connection.hub(), generation, "connection replaced while reading");
            Err(PubSubError::TransportClosed)
        }
    };

    match read {
        Ok(text) => {
            debug!(hub = connection.hub(), bytes = text.len(), "received: {text}");
            protocol::decode(text.as_bytes())
        }
        Err(e) => {
            *held = None;
            connection.mark_lost(generation).await;
            Err(e)
        }
    }
}

/// Read frames until end-of-message and join their payloads in order.
///
/// Not cancel-safe: a partially read message is lost if this is dropped.
pub(crate) async fn read_message(stream: &mut dyn FrameStream) -> Result<String> {
    let mut buffer = String::new();
    loop {
        match stream.next_frame().await {
            Some(Ok(frame)) => {
                buffer.push_str(&frame.payload);
                if frame.end_of_message {
                    return Ok(buffer);
                }
            }
            Some(Err(e)) => return Err(e),
            None => return Err(PubSubError::TransportClosed),
        }
    }
}

/// Resolves once `generation` is no longer the open connection.
async fn superseded(mut live: watch::Receiver<Option<u64>>, generation: u64) {
    // An error means the manager is gone, which also ends this generation.
    let _ = live.wait_for(|g| *g != Some(generation)).await;
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
    use crate::transport::Frame;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedStream(VecDeque<Option<Result<Frame>>>);

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            self.0.pop_front().flatten()
        }
    }

    #[tokio::test]
    async fn fragments_are_joined_in_order() {
        let mut stream = ScriptedStream(VecDeque::from(vec![
            Some(Ok(Frame::fragment(r#"{"type":"mess"#))),
            Some(Ok(Frame::fragment(r#"age","group":"#))),
            Some(Ok(Frame::complete(r#""g1","data":"hi"}"#))),
            Some(Ok(Frame::complete(r#"{"type":"event"}"#))),
        ]));

        let text = read_message(&mut stream).await.unwrap();
        assert_eq!(text, r#"{"type":"message","group":"g1","data":"hi"}"#);
        let msg = protocol::decode(text.as_bytes()).unwrap();
        assert_eq!(msg.group, "g1");

        // The next read starts a fresh message.
        let text = read_message(&mut stream).await.unwrap();
        assert_eq!(text, r#"{"type":"event"}"#);
    }

    #[tokio::test]
    async fn close_mid_message_is_an_error() {
        let mut stream = ScriptedStream(VecDeque::from(vec![
            Some(Ok(Frame::fragment(r#"{"type":"#))),
            None,
        ]));
        let err = read_message(&mut stream).await.unwrap_err();
        assert!(matches!(err, PubSubError::TransportClosed));
    }

    #[tokio::test]
    async fn transport_error_is_propagated() {
        let mut stream = ScriptedStream(VecDeque::from(vec![Some(Err(
            PubSubError::TransportReceive("reset".into()),
        ))]));
        let err = read_message(&mut stream).await.unwrap_err();
        assert!(matches!(err, PubSubError::TransportReceive(_)));
    }
}
