//! Edge configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::{DEFAULT_IDENTITY, DEFAULT_MAX_CONNECTIONS};

#[derive(Debug, Clone)]
pub struct Config {
    /// Plaintext listener address.
    pub http_bind: SocketAddr,

    /// TLS listener address.
    pub https_bind: SocketAddr,

    /// Root of the per-domain certificate directories.
    pub cert_dir: PathBuf,

    /// Domain whose certificate is served when SNI does not match.
    pub default_domain: Option<String>,

    /// JSON route file.
    pub routes_file: PathBuf,

    /// Local port of the ACME challenge responder.
    pub challenge_port: u16,

    /// Renewal tool command line.
    pub renew_command: String,

    pub renew_interval: Duration,

    pub handshake_timeout: Duration,

    /// Per-listener connection cap.
    pub max_connections: usize,

    /// Value of the identification response header.
    pub identity: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let http_bind = parse_var(&lookup, "TOLLGATE_HTTP_BIND", "a socket address")?
            .unwrap_or_else(|| SocketAddr::from(([0u16; 8], 80)));

        let https_bind = parse_var(&lookup, "TOLLGATE_HTTPS_BIND", "a socket address")?
            .unwrap_or_else(|| SocketAddr::from(([0u16; 8], 443)));

        let cert_dir = lookup("TOLLGATE_CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/letsencrypt/live"));

        let default_domain = lookup("TOLLGATE_DEFAULT_DOMAIN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let routes_file = lookup("TOLLGATE_ROUTES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/tollgate/routes.json"));

        let challenge_port: u16 =
            parse_var(&lookup, "TOLLGATE_CHALLENGE_PORT", "a port number")?.unwrap_or(8888);

        let renew_command = lookup("TOLLGATE_RENEW_COMMAND")
            .unwrap_or_else(|| "certbot renew --quiet".to_string());
        if renew_command.trim().is_empty() {
            bail!("TOLLGATE_RENEW_COMMAND must not be empty.");
        }

        let renew_interval_secs: u64 =
            parse_var(&lookup, "TOLLGATE_RENEW_INTERVAL_SECS", "an integer (seconds)")?
                .unwrap_or(86_400);
        let renew_interval = Duration::from_secs(renew_interval_secs.max(60));

        let handshake_timeout_ms: u64 = parse_var(
            &lookup,
            "TOLLGATE_HANDSHAKE_TIMEOUT_MS",
            "an integer (milliseconds)",
        )?
        .unwrap_or(10_000);
        let handshake_timeout = Duration::from_millis(handshake_timeout_ms.max(100));

        let max_connections: usize =
            parse_var(&lookup, "TOLLGATE_MAX_CONNECTIONS", "an integer")?
                .unwrap_or(DEFAULT_MAX_CONNECTIONS)
                .max(1);

        let identity = lookup("TOLLGATE_IDENTITY").unwrap_or_else(|| DEFAULT_IDENTITY.to_string());

        let log_level = lookup("TOLLGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            http_bind,
            https_bind,
            cert_dir,
            default_domain,
            routes_file,
            challenge_port,
            renew_command,
            renew_interval,
            handshake_timeout,
            max_connections,
            identity,
            log_level,
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    expected: &str,
) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}
