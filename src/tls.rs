//! Connection-scoped TLS policy.
//!
//! The minimum protocol version is chosen per client at construction time and
//! applied both to the negotiation HTTP client and to the WebSocket handshake.

/// Lowest TLS version a client will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinTlsVersion {
    /// TLS 1.2 and 1.3.
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

#[cfg(feature = "negotiate-http")]
impl From<MinTlsVersion> for reqwest::tls::Version {
    fn from(version: MinTlsVersion) -> Self {
        match version {
            MinTlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
            MinTlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

#[cfg(feature = "transport-websocket")]
static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Protocol versions a client offers for the given minimum.
#[cfg(feature = "transport-websocket")]
pub(crate) fn protocol_versions(
    version: MinTlsVersion,
) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match version {
        MinTlsVersion::Tls12 => rustls::ALL_VERSIONS,
        MinTlsVersion::Tls13 => TLS13_ONLY,
    }
}

#[cfg(feature = "transport-websocket")]
pub(crate) fn rustls_client_config(
    version: MinTlsVersion,
) -> crate::error::Result<std::sync::Arc<rustls::ClientConfig>> {
    use std::sync::Arc;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(protocol_versions(version))
        .map_err(|e| crate::error::PubSubError::Config(format!("TLS configuration: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
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
    use rustls::ProtocolVersion;

    fn offered(version: MinTlsVersion) -> Vec<ProtocolVersion> {
        protocol_versions(version).iter().map(|v| v.version).collect()
    }

    #[test]
    fn tls13_minimum_offers_only_tls13() {
        assert_eq!(offered(MinTlsVersion::Tls13), vec![ProtocolVersion::TLSv1_3]);
    }

    #[test]
    fn default_minimum_offers_tls12_and_tls13() {
        let versions = offered(MinTlsVersion::default());
        assert!(versions.contains(&ProtocolVersion::TLSv1_2));
        assert!(versions.contains(&ProtocolVersion::TLSv1_3));
    }

    #[test]
    fn both_minimums_build_a_client_config() {
        for version in [MinTlsVersion::Tls12, MinTlsVersion::Tls13] {
            let config = rustls_client_config(version).unwrap();
            assert!(config.alpn_protocols.is_empty(), "{version:?}");
        }
    }
}
