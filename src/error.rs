//! Error types for the pub/sub client.

use thiserror::Error;

/// Errors that can occur when using the pub/sub client.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// A group operation was given an empty or whitespace-only argument.
    ///
    /// Raised before any negotiation or transport I/O takes place.
    #[error("invalid {field}: must not be empty or whitespace")]
    Validation {
        /// Name of the offending argument (`"group"` or `"data"`).
        field: &'static str,
    },

    /// Access-URL negotiation or the transport handshake failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A wire message could not be encoded or decoded as JSON.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Failed to write a frame to the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to read a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// The registered message handler returned an error.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// The client was built without a required collaborator.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PubSubError {
    /// Shorthand for a [`PubSubError::Validation`] on `field`.
    pub(crate) fn invalid(field: &'static str) -> Self {
        Self::Validation { field }
    }
}

/// A specialized [`Result`] type for pub/sub client operations.
pub type Result<T> = std::result::Result<T, PubSubError>;
