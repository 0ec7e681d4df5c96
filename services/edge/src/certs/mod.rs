//! Certificate management.
//!
//! - [`CertificateStore`] loads per-domain key material into immutable
//!   generations and swaps them atomically.
//! - [`SniCertResolver`] picks a certificate at handshake time from the
//!   client's SNI, falling back to the default domain.

mod resolver;
mod store;

pub use resolver::{server_config, SniCertResolver, ALPN_HTTP11};
pub use store::{
    domain_from_dir_name, CertificateEntry, CertificateStore, Generation,
    CERTIFICATE_CHAIN_FILE, PRIVATE_KEY_FILE,
};
