//! Delivery of decoded messages to the consumer.
//!
//! The consumer is a single [`MessageHandler`] injected when the client is
//! built. Each call is awaited before the receive loop reads the next message,
//! so handling is strictly sequential. Use [`FanOut`] to deliver to more than
//! one handler, or [`ChannelHandler`] to hand messages to another task.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::PubSubClient;
use crate::protocol::WireMessage;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A decoded inbound message plus the receive loop's cancellation token.
#[derive(Debug, Clone)]
pub struct ReceiveEvent {
    pub message: WireMessage,
    /// Cancelled when the client is closed.
    pub cancel: CancellationToken,
}

/// Consumer of inbound messages.
///
/// Errors are logged by the receive loop and do not stop it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        client: &PubSubClient,
        event: ReceiveEvent,
    ) -> Result<(), HandlerError>;
}

// ── Adapters ────────────────────────────────────────────────────────

/// Handler built from an async closure. See [`handler_fn`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```
/// use web_pubsub_client::dispatch::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|_client, event| async move {
///     println!("{} from {}", event.message.data, event.message.group);
///     Ok::<(), HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(PubSubClient, ReceiveEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(PubSubClient, ReceiveEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        client: &PubSubClient,
        event: ReceiveEvent,
    ) -> Result<(), HandlerError> {
        (self.0)(client.clone(), event).await
    }
}

/// Forwards every message into a bounded channel.
///
/// Sending waits for capacity, which applies back-pressure to the receive
/// loop. A closed receiver is reported as a handler error.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<WireMessage>,
}

impl ChannelHandler {
    /// Create a handler and the receiver it feeds. Capacity is clamped to 1.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(
        &self,
        _client: &PubSubClient,
        event: ReceiveEvent,
    ) -> Result<(), HandlerError> {
        tokio::select! {
            res = self.tx.send(event.message) => {
                res.map_err(|_| HandlerError::from("message receiver dropped"))
            }
            () = event.cancel.cancelled() => Ok(()),
        }
    }
}

/// Delivers each message to several handlers in registration order.
///
/// All handlers run even if an earlier one fails; the first error is
/// returned.
#[derive(Default)]
pub struct FanOut {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler to the end of the delivery order.
    #[must_use]
    pub fn with(mut self, handler: impl MessageHandler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl MessageHandler for FanOut {
    async fn handle(
        &self,
        client: &PubSubClient,
        event: ReceiveEvent,
    ) -> Result<(), HandlerError> {
        let mut first_err = None;
        for handler in &self.handlers {
            if let Err(e) = handler.handle(client, event.clone()).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

tokio::task_local! {
    /// Identity of the client whose handler is running on this task.
    static IN_DISPATCH: usize;
}

/// Returns `true` when called from inside a handler running on the receive
/// loop of the client identified by `owner`.
pub(crate) fn dispatching_for(owner: usize) -> bool {
    IN_DISPATCH.try_with(|id| *id == owner).unwrap_or(false)
}

/// Holds the registered handler, if any.
#[derive(Clone, Default)]
pub(crate) struct Dispatcher {
    handler: Option<Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub(crate) fn new(handler: Option<Arc<dyn MessageHandler>>) -> Self {
        Self { handler }
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Invoke the handler and wait for it to finish.
    pub(crate) async fn dispatch(
        &self,
        client: &PubSubClient,
        message: WireMessage,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        let Some(handler) = self.handler.as_ref() else {
            debug!(kind = %message.kind, "no handler registered, dropping message");
            return Ok(());
        };
        let event = ReceiveEvent { message, cancel };
        IN_DISPATCH
            .scope(client.dispatch_id(), handler.handle(client, event))
            .await
    }
}
