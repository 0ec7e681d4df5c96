//! SNI certificate selection for the TLS listener.

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::warn;

use super::store::CertificateStore;

/// ALPN protocols offered by the TLS listener.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Implements rustls `ResolvesServerCert` on top of [`CertificateStore`].
///
/// Returning `None` aborts the handshake immediately.
#[derive(Debug)]
pub struct SniCertResolver {
    store: Arc<CertificateStore>,
}

impl SniCertResolver {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }

    /// Resolve by server name, logging the failure case.
    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        match self.store.resolve(server_name) {
            Ok(entry) => Some(Arc::clone(&entry.certified_key)),
            Err(e) => {
                warn!(error = %e, "Rejecting TLS handshake");
                None
            }
        }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}

/// Build the TLS listener's server configuration.
pub fn server_config(store: Arc<CertificateStore>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(store)));
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    Ok(Arc::new(config))
}
