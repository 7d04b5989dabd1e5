//! Access-URL negotiation.
//!
//! Before every handshake the client asks a caller-supplied endpoint for a
//! connection URL carrying a short-lived credential. [`HttpNegotiator`] does
//! this with a plain `GET`; any other mechanism can implement [`Negotiator`].

use async_trait::async_trait;

use crate::error::Result;

/// Produces the URL to hand to the transport handshake.
#[async_trait]
pub trait Negotiator: Send + Sync + 'static {
    /// Fetch a fresh access URL.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Connection`](crate::PubSubError::Connection) on
    /// any failure.
    async fn access_url(&self) -> Result<String>;
}

/// Extract the access URL from a negotiation response body.
///
/// The body is the URL itself, a JSON string holding it, or a JSON object
/// with a `url` field.
pub(crate) fn parse_access_url(body: &str) -> Option<String> {
    let body = body.trim();
    if body.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        return value
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_owned);
    }
    // Some endpoints return the URL as a JSON string literal, possibly with
    // escapes such as `\u0026`.
    if body.starts_with('"') {
        let url: String = serde_json::from_str(body).ok()?;
        let url = url.trim();
        return (!url.is_empty()).then(|| url.to_owned());
    }
    if body.is_empty() {
        None
    } else {
        Some(body.to_owned())
    }
}

#[cfg(feature = "negotiate-http")]
pub use http::HttpNegotiator;

#[cfg(feature = "negotiate-http")]
mod http {
    use async_trait::async_trait;
    use tracing::{debug, warn};

    use super::{parse_access_url, Negotiator};
    use crate::error::{PubSubError, Result};
    use crate::tls::MinTlsVersion;

    /// [`Negotiator`] that issues an HTTP `GET` to a fixed endpoint.
    ///
    /// A non-2xx status is a hard failure. The response body is the access URL.
    #[derive(Debug, Clone)]
    pub struct HttpNegotiator {
        client: reqwest::Client,
        endpoint: String,
    }

    impl HttpNegotiator {
        /// Build a negotiator with its own HTTP client.
        ///
        /// # Errors
        ///
        /// Returns [`PubSubError::Config`] if the HTTP client cannot be built.
        pub fn new(endpoint: impl Into<String>, min_tls: MinTlsVersion) -> Result<Self> {
            let client = reqwest::Client::builder()
                .min_tls_version(min_tls.into())
                .build()
                .map_err(|e| PubSubError::Config(format!("HTTP client: {e}")))?;
            Ok(Self::with_client(client, endpoint))
        }

        /// Build a negotiator around an existing HTTP client.
        pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
            Self {
                client,
                endpoint: endpoint.into(),
            }
        }

        /// The configured endpoint.
        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    #[async_trait]
    impl Negotiator for HttpNegotiator {
        async fn access_url(&self) -> Result<String> {
            debug!(endpoint = %self.endpoint, "negotiating access URL");

            let response = self.client.get(&self.endpoint).send().await.map_err(|e| {
                warn!(endpoint = %self.endpoint, "negotiation request failed: {e}");
                PubSubError::Connection(format!("negotiation request failed: {e}"))
            })?;

            let status = response.status();
            if !status.is_success() {
                warn!(endpoint = %self.endpoint, %status, "negotiation rejected");
                return Err(PubSubError::Connection(format!(
                    "negotiation returned HTTP {status}"
                )));
            }

            let body = response
                .text()
                .await
                .map_err(|e| PubSubError::Connection(format!("negotiation body: {e}")))?;

            parse_access_url(&body).ok_or_else(|| {
                PubSubError::Connection("negotiation returned no access URL".into())
            })
        }
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

    #[test]
    fn plain_body_is_trimmed() {
        assert_eq!(
            parse_access_url("  wss://hub.example/client?access_token=abc\n").as_deref(),
            Some("wss://hub.example/client?access_token=abc")
        );
    }

    #[test]
    fn json_object_body_uses_url_field() {
        let body = r#"{"baseUrl":"wss://x","url":"wss://x/client?access_token=t","token":"t"}"#;
        assert_eq!(
            parse_access_url(body).as_deref(),
            Some("wss://x/client?access_token=t")
        );
    }

    #[test]
    fn json_string_body_is_unquoted() {
        assert_eq!(
            parse_access_url(r#""wss://x/client""#).as_deref(),
            Some("wss://x/client")
        );
    }

    #[test]
    fn json_string_body_is_unescaped() {
        assert_eq!(
            parse_access_url(r#""wss://x/client?a=1\u0026b=2""#).as_deref(),
            Some("wss://x/client?a=1&b=2")
        );
        assert_eq!(
            parse_access_url(r#""wss:\/\/x\/client""#).as_deref(),
            Some("wss://x/client")
        );
    }

    #[test]
    fn unterminated_json_string_body_is_rejected() {
        assert_eq!(parse_access_url(r#""wss://x/client"#), None);
    }

    #[test]
    fn empty_bodies_yield_nothing() {
        assert_eq!(parse_access_url(""), None);
        assert_eq!(parse_access_url("   "), None);
        assert_eq!(parse_access_url(r#""""#), None);
        assert_eq!(parse_access_url(r#"{"token":"t"}"#), None);
    }
}
