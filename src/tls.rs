//! Shared rustls presets for the daemon.

use std::sync::{Arc, LazyLock};

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ServerConfig};

/// ALPN identifier for HTTP/1.1.
pub static ALPN_HTTP1: &[u8] = b"http/1.1";
/// ALPN identifier for the TLS-ALPN-01 challenge protocol (RFC 8737).
pub static ALPN_ACME_TLS1: &[u8] = b"acme-tls/1";

/// The listener speaks TLS 1.3 only.
pub static TLS_PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13];

/// The daemon's [`CryptoProvider`]: ring with its default suites.
pub static CRYPTO_PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Helper to get a [`ServerConfig`] builder with the daemon's presets.
pub fn server_config_builder(
) -> rustls::ConfigBuilder<ServerConfig, rustls::WantsVerifier> {
    ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(TLS_PROTOCOL_VERSIONS)
        .expect("The ring provider supports TLS 1.3")
}

/// Helper to get a [`ClientConfig`] builder with the daemon's provider.
/// Used for outbound connections (the ACME directory), which accept any
/// TLS version the server offers.
pub fn client_config_builder(
) -> rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier> {
    ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        .expect("The ring provider supports the default TLS versions")
}

/// Mozilla's webpki roots, used for outbound TLS when no custom CA bundle
/// is configured.
pub static WEBPKI_ROOT_CERTS: LazyLock<Arc<rustls::RootCertStore>> =
    LazyLock::new(|| {
        let roots = webpki_roots::TLS_SERVER_ROOTS.to_vec();
        Arc::new(rustls::RootCertStore { roots })
    });
