//! TCP listener and connection handling.
//!
//! One [`Listener`] type serves both frontends:
//! - Plaintext: connections are served as HTTP/1.1 directly
//! - TLS: connections complete a bounded rustls handshake first, with the
//!   certificate chosen by SNI, then are served as HTTP/1.1
//!
//! Each connection runs in its own task. A failure in one connection
//! (handshake, protocol error, unreachable backend) never affects others.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::handler::{RequestHandler, Scheme};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default bound on the TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// How accepted connections are turned into HTTP.
#[derive(Clone)]
pub enum ListenerKind {
    Plaintext,
    Tls {
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    },
}

impl ListenerKind {
    pub fn scheme(&self) -> Scheme {
        match self {
            Self::Plaintext => Scheme::Http,
            Self::Tls { .. } => Scheme::Https,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    pub handshakes_completed: AtomicU64,
    /// Handshakes that failed or timed out.
    pub handshakes_failed: AtomicU64,
}

/// A TCP listener for one frontend.
pub struct Listener {
    listener: TcpListener,
    kind: ListenerKind,
    handler: Arc<RequestHandler>,
    /// Limits concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(
        config: ListenerConfig,
        kind: ListenerKind,
        handler: Arc<RequestHandler>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            scheme = %kind.scheme(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            kind,
            handler,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, scheme = %self.kind.scheme(), "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);
                    let span = tracing::info_span!(
                        "connection",
                        peer = %peer_addr,
                        scheme = %self.kind.scheme()
                    );

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Back off on persistent errors such as fd exhaustion
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let _ = stream.set_nodelay(true);

        match &self.kind {
            ListenerKind::Plaintext => self.serve_http(stream, peer_addr, Scheme::Http).await,
            ListenerKind::Tls {
                acceptor,
                handshake_timeout,
            } => {
                let tls_stream =
                    match tokio::time::timeout(*handshake_timeout, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => tls_stream,
                        Ok(Err(e)) => {
                            self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                            return Err(e);
                        }
                        Err(_) => {
                            self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "TLS handshake timed out",
                            ));
                        }
                    };

                self.stats
                    .handshakes_completed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    server_name = tls_stream.get_ref().1.server_name().unwrap_or("-"),
                    "TLS handshake completed"
                );

                self.serve_http(tls_stream, peer_addr, Scheme::Https).await
            }
        }
    }

    async fn serve_http<S>(&self, stream: S, peer_addr: SocketAddr, scheme: Scheme) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let service = service_fn(move |request| {
            let handler = Arc::clone(&handler);
            async move { handler.handle(request, peer_addr, scheme).await }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .keep_alive(true)
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(io::Error::other)
    }
}
