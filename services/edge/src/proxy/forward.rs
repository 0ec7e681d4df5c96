//! Request forwarding to local backends.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::ForwardError;

/// Body type of every response the edge produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Timeout for establishing a backend connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Wrap a complete in-memory body.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Streams requests to backends over pooled HTTP/1.1 connections.
#[derive(Debug, Clone)]
pub struct ForwardingGateway {
    client: Client<HttpConnector, Incoming>,
}

impl ForwardingGateway {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }

    /// Forward `request` to `target`, preserving method, path, headers and
    /// body. Hop-by-hop headers are dropped in both directions.
    pub async fn forward(
        &self,
        mut request: Request<Incoming>,
        target: SocketAddr,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());

        let uri: Uri = format!("http://{target}{path_and_query}")
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::InvalidTarget {
                target,
                message: e.to_string(),
            })?;
        *request.uri_mut() = uri;
        strip_hop_by_hop(request.headers_mut());

        debug!(
            target = %target,
            method = %request.method(),
            uri = %request.uri(),
            "Forwarding request"
        );

        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| ForwardError::Unreachable { target, source })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for ForwardingGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
