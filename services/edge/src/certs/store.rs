//! Certificate store with whole-generation atomic replacement.
//!
//! Certificates are loaded from a certbot-style `live/` directory:
//!
//! ```text
//! live/
//! ├── example.com/
//! │   ├── fullchain.pem
//! │   └── privkey.pem
//! └── example.org-0001/      # renewal lineage, served as example.org
//!     ├── fullchain.pem
//!     └── privkey.pem
//! ```
//!
//! A load builds a complete [`Generation`] off to the side, including the
//! rustls signing key for every domain. [`CertificateStore::swap`] publishes
//! it with a single pointer store, so a handshake sees either the old set or
//! the new one and never a mixture.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;
use tracing::{debug, info, warn};

use crate::error::{CertificateError, LoadError};
use crate::host::normalize_hostname;

/// Private key file inside a domain directory.
pub const PRIVATE_KEY_FILE: &str = "privkey.pem";

/// Certificate chain file inside a domain directory.
pub const CERTIFICATE_CHAIN_FILE: &str = "fullchain.pem";

/// Key and chain material for one domain, with its prepared handshake context.
pub struct CertificateEntry {
    pub domain: String,
    pub private_key: Vec<u8>,
    pub certificate_chain: Vec<u8>,
    pub certified_key: Arc<CertifiedKey>,
}

impl CertificateEntry {
    /// Build an entry from PEM material.
    ///
    /// The signing key is prepared here so handshakes never parse key
    /// material.
    pub fn from_pem(
        domain: &str,
        private_key: Vec<u8>,
        certificate_chain: Vec<u8>,
    ) -> Result<Self, CertificateError> {
        let certified_key = build_certified_key(domain, &private_key, &certificate_chain)?;

        Ok(Self {
            domain: domain.to_string(),
            private_key,
            certificate_chain,
            certified_key: Arc::new(certified_key),
        })
    }

    /// DER of the leaf certificate presented to clients.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.certified_key.cert.first()
    }
}

impl fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("domain", &self.domain)
            .field("chain_len", &self.certified_key.cert.len())
            .finish_non_exhaustive()
    }
}

/// One immutable snapshot of the domain → certificate mapping.
#[derive(Debug, Default)]
pub struct Generation {
    entries: HashMap<String, Arc<CertificateEntry>>,
}

impl Generation {
    /// Build a generation from prepared entries. Later entries for the same
    /// domain replace earlier ones.
    pub fn from_entries(entries: impl IntoIterator<Item = Arc<CertificateEntry>>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.domain.clone(), entry))
            .collect();

        Self { entries }
    }

    /// Exact lookup by normalized domain.
    pub fn get(&self, domain: &str) -> Option<&Arc<CertificateEntry>> {
        self.entries.get(domain)
    }

    /// All domains in this generation, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.entries.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derive the served domain from a certificate directory name.
///
/// Lowercases, trims a trailing dot, and strips a renewal-sequence suffix
/// (`example.com-0001` → `example.com`).
pub fn domain_from_dir_name(dir_name: &str) -> String {
    split_lineage(dir_name).0
}

/// Domain and renewal sequence of a directory name; a bare name is sequence 0.
fn split_lineage(dir_name: &str) -> (String, u16) {
    let name = normalize_hostname(dir_name);

    match name.rsplit_once('-') {
        Some((base, seq))
            if !base.is_empty() && seq.len() == 4 && seq.bytes().all(|b| b.is_ascii_digit()) =>
        {
            match seq.parse() {
                Ok(seq) => (base.to_string(), seq),
                Err(_) => (name, 0),
            }
        }
        _ => (name, 0),
    }
}

/// Certificate store holding exactly one current generation.
#[derive(Debug)]
pub struct CertificateStore {
    /// Atomically swappable generation.
    current: ArcSwap<Generation>,
    /// Domain whose certificate is served when SNI does not match.
    default_domain: Option<String>,
    /// Root directory scanned on reload.
    cert_dir: PathBuf,
}

impl CertificateStore {
    /// Create a store around an already loaded generation.
    pub fn new(generation: Generation, cert_dir: PathBuf, default_domain: Option<String>) -> Self {
        let default_domain = default_domain.map(|d| normalize_hostname(&d));

        if let Some(domain) = &default_domain {
            if generation.get(domain).is_none() {
                warn!(
                    default_domain = %domain,
                    "Default domain has no certificate; unmatched handshakes will fail"
                );
            }
        }

        Self {
            current: ArcSwap::from_pointee(generation),
            default_domain,
            cert_dir,
        }
    }

    /// Load the initial generation from `cert_dir` and create the store.
    pub async fn open(cert_dir: PathBuf, default_domain: Option<String>) -> Result<Self, LoadError> {
        let generation = Self::load_blocking(cert_dir.clone()).await?;
        Ok(Self::new(generation, cert_dir, default_domain))
    }

    /// Scan `dir` and build a complete generation.
    ///
    /// Domains with missing or malformed material are logged and skipped.
    /// Fails if the directory is unreadable or nothing loads.
    pub fn load(dir: &Path) -> Result<Generation, LoadError> {
        let read_dir = fs::read_dir(dir).map_err(|source| LoadError::Unreadable {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut domain_dirs: Vec<(String, PathBuf)> = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|source| LoadError::Unreadable {
                path: dir.to_path_buf(),
                source,
            })?;

            let path = dir_entry.path();
            if !path.is_dir() {
                continue;
            }

            match dir_entry.file_name().into_string() {
                Ok(name) => domain_dirs.push((name, path)),
                Err(name) => {
                    warn!(dir_name = ?name, "Skipping certificate directory with non UTF-8 name");
                }
            }
        }

        // Ascending sequence per domain: the newest lineage is inserted last.
        domain_dirs.sort_by_cached_key(|(name, _)| {
            let (domain, seq) = split_lineage(name);
            (domain, seq, name.clone())
        });

        let mut entries: HashMap<String, Arc<CertificateEntry>> = HashMap::new();
        for (dir_name, path) in domain_dirs {
            let domain = domain_from_dir_name(&dir_name);

            match load_domain(&domain, &path) {
                Ok(entry) => {
                    let replaced = entries.insert(domain.clone(), Arc::new(entry)).is_some();
                    debug!(domain = %domain, dir_name = %dir_name, replaced, "Certificate loaded");
                }
                Err(e) => {
                    warn!(dir_name = %dir_name, error = %e, "Skipping certificate directory");
                }
            }
        }

        if entries.is_empty() {
            return Err(LoadError::Empty {
                path: dir.to_path_buf(),
            });
        }

        info!(
            cert_dir = %dir.display(),
            domain_count = entries.len(),
            "Certificate generation loaded"
        );

        Ok(Generation { entries })
    }

    /// Run [`CertificateStore::load`] on the blocking pool.
    pub async fn load_blocking(dir: PathBuf) -> Result<Generation, LoadError> {
        tokio::task::spawn_blocking(move || Self::load(&dir)).await?
    }

    /// Reload from the configured directory and swap on success.
    ///
    /// On failure the current generation stays in service.
    pub async fn reload(&self) -> Result<usize, LoadError> {
        let generation = Self::load_blocking(self.cert_dir.clone()).await?;
        let domain_count = generation.len();
        self.swap(generation);
        Ok(domain_count)
    }

    /// Install `generation` as current in a single pointer swap.
    ///
    /// The previous generation is dropped once the last in-flight reader
    /// releases it.
    pub fn swap(&self, generation: Generation) {
        let domain_count = generation.len();
        let previous = self.current.swap(Arc::new(generation));

        info!(
            domain_count,
            previous_domain_count = previous.len(),
            "Certificate generation swapped"
        );
    }

    /// Snapshot of the current generation.
    pub fn current(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Look up the certificate for `hostname` in the current generation.
    pub fn lookup(&self, hostname: &str) -> Option<Arc<CertificateEntry>> {
        let generation = self.current.load();
        generation.get(&normalize_hostname(hostname)).cloned()
    }

    /// Pick the certificate for a handshake.
    ///
    /// Exact match first, then the default domain, both answered from the
    /// same generation.
    pub fn resolve(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertificateEntry>, CertificateError> {
        let generation = self.current.load();

        if let Some(name) = server_name {
            let hostname = normalize_hostname(name);
            if let Some(entry) = generation.get(&hostname) {
                debug!(hostname = %hostname, "SNI matched certificate");
                return Ok(Arc::clone(entry));
            }
        }

        match self
            .default_domain
            .as_deref()
            .and_then(|domain| generation.get(domain))
        {
            Some(entry) => {
                debug!(
                    sni = server_name.unwrap_or(""),
                    default_domain = %entry.domain,
                    "Using default certificate"
                );
                Ok(Arc::clone(entry))
            }
            None => Err(CertificateError::NoDefault {
                hostname: server_name.unwrap_or("").to_string(),
            }),
        }
    }

    pub fn default_domain(&self) -> Option<&str> {
        self.default_domain.as_deref()
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn domains(&self) -> Vec<String> {
        self.current.load().domains()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

fn load_domain(domain: &str, dir: &Path) -> Result<CertificateEntry, CertificateError> {
    let private_key = read_material(domain, &dir.join(PRIVATE_KEY_FILE))?;
    let certificate_chain = read_material(domain, &dir.join(CERTIFICATE_CHAIN_FILE))?;
    CertificateEntry::from_pem(domain, private_key, certificate_chain)
}

fn read_material(domain: &str, path: &Path) -> Result<Vec<u8>, CertificateError> {
    fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => CertificateError::MissingFile {
            domain: domain.to_string(),
            path: path.to_path_buf(),
        },
        _ => CertificateError::Io {
            domain: domain.to_string(),
            path: path.to_path_buf(),
            source,
        },
    })
}

fn build_certified_key(
    domain: &str,
    private_key: &[u8],
    certificate_chain: &[u8],
) -> Result<CertifiedKey, CertificateError> {
    let malformed = |message: String| CertificateError::Malformed {
        domain: domain.to_string(),
        message,
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &certificate_chain[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| malformed(format!("certificate chain: {e}")))?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificates {
            domain: domain.to_string(),
        });
    }

    let key = rustls_pemfile::private_key(&mut &private_key[..])
        .map_err(|e| malformed(format!("private key: {e}")))?
        .ok_or_else(|| CertificateError::NoPrivateKey {
            domain: domain.to_string(),
        })?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| malformed(format!("unsupported private key: {e}")))?;

    let certified_key = CertifiedKey::new(certs, signing_key);
    match certified_key.keys_match() {
        Ok(()) => {}
        // The signer cannot expose its public key; nothing to compare.
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            debug!(domain = %domain, "Key type cannot be checked against the certificate");
        }
        Err(e) => {
            return Err(CertificateError::KeyMismatch {
                domain: domain.to_string(),
                message: e.to_string(),
            })
        }
    }

    Ok(certified_key)
}
