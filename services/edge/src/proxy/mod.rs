//! HTTP(S) edge proxy.
//!
//! This module provides:
//! - TCP listeners for the plaintext and TLS frontends
//! - Host/path routing to local backend ports or redirects
//! - Request forwarding over pooled backend connections
//! - The response header policy applied to every response
//!
//! ## Architecture
//!
//! ```text
//! :80  Client -> Listener -> RequestHandler -> ACME challenge responder
//!                                   |
//!                                   +-> 301 https://host/path
//!
//! :443 Client -> Listener -> TLS (SNI cert) -> RequestHandler -> RouteTable
//!                                                    |
//!                     ForwardingGateway / 301 / 404 -+-> ResponsePolicy
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let routes = Arc::new(RouteTable::new(entries));
//! let handler = Arc::new(RequestHandler::new(
//!     routes,
//!     ForwardingGateway::new(),
//!     ResponsePolicy::default(),
//!     8888,
//! ));
//!
//! let config = ListenerConfig::new("[::]:80".parse()?);
//! let listener = Arc::new(Listener::bind(config, ListenerKind::Plaintext, handler).await?);
//! listener.run().await?;
//! ```

mod forward;
mod handler;
mod headers;
mod listener;
mod router;

pub use forward::{full_body, strip_hop_by_hop, ForwardingGateway, ProxyBody};
pub use handler::{
    https_location, request_host, RequestHandler, RequestStats, Scheme, CHALLENGE_PREFIX,
    NOT_FOUND_BODY,
};
pub use headers::{ResponsePolicy, DEFAULT_IDENTITY, IDENTIFICATION_HEADER};
pub use listener::{
    Listener, ListenerConfig, ListenerKind, ListenerStats, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS,
};
pub use router::{RouteDecision, RouteEntry, RouteTable, RouteTarget, SharedRouteTable};
