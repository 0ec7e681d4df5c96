//! Error types for the edge service.
//!
//! Per-connection errors ([`CertificateError::NoDefault`], [`ForwardError`])
//! are isolated to the connection that hit them. [`LoadError`] is fatal only
//! at startup; during renewal it leaves the current certificates in service.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors for a single domain's certificate material, or for a handshake
/// that cannot be given any certificate at all.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// A required PEM file does not exist.
    #[error("{domain}: missing {}", .path.display())]
    MissingFile { domain: String, path: PathBuf },

    /// A PEM file exists but could not be read.
    #[error("{domain}: failed to read {}: {source}", .path.display())]
    Io {
        domain: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The certificate chain file holds no certificates.
    #[error("{domain}: no certificates found in chain")]
    NoCertificates { domain: String },

    /// The key file holds no private key.
    #[error("{domain}: no private key found")]
    NoPrivateKey { domain: String },

    /// The material is not valid PEM or the key was rejected by the signer.
    #[error("{domain}: malformed certificate material: {message}")]
    Malformed { domain: String, message: String },

    /// The private key does not belong to the leaf certificate.
    #[error("{domain}: private key does not match certificate: {message}")]
    KeyMismatch { domain: String, message: String },

    /// Neither the requested hostname nor the default domain has a certificate.
    #[error("no certificate for '{hostname}' and no default certificate loaded")]
    NoDefault { hostname: String },
}

/// Errors loading a whole certificate generation.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The certificate root directory could not be read.
    #[error("certificate directory {} is unreadable: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The scan finished but no domain loaded successfully.
    #[error("no usable certificates found under {}", .path.display())]
    Empty { path: PathBuf },

    /// The blocking load task panicked or was cancelled.
    #[error("certificate load task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors forwarding a request to a backend.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The backend refused the connection, reset it, or sent garbage.
    #[error("backend {target} unreachable: {source}")]
    Unreachable {
        target: SocketAddr,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    /// The request could not be rewritten to target the backend.
    #[error("cannot build request for backend {target}: {message}")]
    InvalidTarget { target: SocketAddr, message: String },
}

/// Errors from a renewal attempt. The current generation stays in service.
#[derive(Debug, Error)]
pub enum RenewalError {
    /// The external tool could not be started.
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The external tool exited unsuccessfully.
    #[error("renewal tool exited with status {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    ExitStatus { code: Option<i32>, stderr: String },

    /// The configured command line could not be split into arguments.
    #[error("invalid renewal command: {message}")]
    InvalidCommand { message: String },

    /// The tool succeeded but the new generation failed to load.
    #[error("reloading certificates failed: {0}")]
    Reload(#[from] LoadError),
}
