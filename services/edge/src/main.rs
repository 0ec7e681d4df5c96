//! tollgate edge
//!
//! TLS-terminating HTTP edge for a single host.
//!
//! This service:
//! - Redirects plaintext traffic to HTTPS, except ACME challenges, which go
//!   to the local challenge responder
//! - Terminates TLS with a per-domain certificate chosen by SNI
//! - Routes requests by host and path prefix to local backend ports
//! - Applies a fixed set of security headers to every response
//! - Renews certificates periodically and swaps them in without restarting

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tollgate_edge::certs::{server_config, CertificateStore};
use tollgate_edge::proxy::{
    ForwardingGateway, Listener, ListenerConfig, ListenerKind, RequestHandler, ResponsePolicy,
    RouteTable,
};
use tollgate_edge::renewal::{CommandTool, RenewalScheduler};
use tollgate_edge::route_config::load_routes;
use tollgate_edge::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TOLLGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tollgate edge");
    info!(
        http_bind = %config.http_bind,
        https_bind = %config.https_bind,
        cert_dir = %config.cert_dir.display(),
        default_domain = config.default_domain.as_deref().unwrap_or("-"),
        routes_file = %config.routes_file.display(),
        challenge_port = config.challenge_port,
        renew_interval_secs = config.renew_interval.as_secs(),
        "Configuration loaded"
    );

    let routes = Arc::new(RouteTable::new(load_routes(&config.routes_file)?));

    let store = Arc::new(
        CertificateStore::open(config.cert_dir.clone(), config.default_domain.clone())
            .await
            .context("Failed to load certificates")?,
    );

    let tls_config =
        server_config(Arc::clone(&store)).context("Failed to build TLS configuration")?;

    let policy = ResponsePolicy::new(&config.identity)
        .context("TOLLGATE_IDENTITY is not a valid header value")?;

    let handler = Arc::new(RequestHandler::new(
        routes,
        ForwardingGateway::new(),
        policy,
        config.challenge_port,
    ));

    let http_handle = spawn_listener(
        &config,
        config.http_bind,
        ListenerKind::Plaintext,
        Arc::clone(&handler),
    )
    .await?;

    let https_handle = spawn_listener(
        &config,
        config.https_bind,
        ListenerKind::Tls {
            acceptor: TlsAcceptor::from(tls_config),
            handshake_timeout: config.handshake_timeout,
        },
        Arc::clone(&handler),
    )
    .await?;

    // Start renewal worker in background
    let tool = CommandTool::from_command_line(&config.renew_command)
        .context("TOLLGATE_RENEW_COMMAND is not a valid command line")?;
    let scheduler = Arc::new(
        RenewalScheduler::new(Arc::clone(&store), Arc::new(tool))
            .with_interval(config.renew_interval),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let renewal_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move {
            scheduler.run(shutdown_rx).await;
        }
    });

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(Arc::clone(&scheduler)));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = http_handle => log_listener_exit("plaintext", result),
        result = https_handle => log_listener_exit("tls", result),
    }

    // Signal shutdown to the renewal worker
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(10), renewal_handle)
        .await
        .is_err()
    {
        warn!("Renewal worker did not shut down in time");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn spawn_listener(
    config: &Config,
    bind_addr: std::net::SocketAddr,
    kind: ListenerKind,
    handler: Arc<RequestHandler>,
) -> Result<JoinHandle<std::io::Result<()>>> {
    let mut listener_config = ListenerConfig::new(bind_addr);
    listener_config.max_connections = config.max_connections;

    let listener = Listener::bind(listener_config, kind, handler)
        .await
        .with_context(|| format!("Failed to bind listener on {bind_addr}"))?;

    Ok(tokio::spawn(Arc::new(listener).run()))
}

fn log_listener_exit(name: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(listener = name, "Listener exited"),
        Ok(Err(e)) => error!(listener = name, error = %e, "Listener error"),
        Err(e) => error!(listener = name, error = %e, "Listener task panicked"),
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Reload certificates from disk on SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(scheduler: Arc<RenewalScheduler>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGHUP; reload on signal disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading certificates");
        match scheduler.reload().await {
            Ok(outcome) => info!(outcome = %outcome, "Certificate reload complete"),
            Err(e) => error!(error = %e, "Certificate reload failed; keeping current certificates"),
        }
    }
}
