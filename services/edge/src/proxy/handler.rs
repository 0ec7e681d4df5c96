//! Per-request handling for both listeners.
//!
//! The plaintext side only answers ACME challenges and upgrades everything
//! else to HTTPS. The TLS side consults the route table. Every response,
//! local or forwarded, is decorated by the [`ResponsePolicy`] on the way out.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, warn};

use super::forward::{full_body, ForwardingGateway, ProxyBody};
use super::headers::ResponsePolicy;
use super::router::{RouteDecision, SharedRouteTable};
use crate::error::ForwardError;
use crate::host::{normalize_hostname, strip_port};

/// Path prefix served by the local challenge responder.
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Body of the response sent when no route matches.
pub const NOT_FOUND_BODY: &str = "404 Not Found\n";

const BAD_REQUEST_BODY: &str = "400 Bad Request\n";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Which listener a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counters.
#[derive(Debug, Default)]
pub struct RequestStats {
    pub forwarded: AtomicU64,
    pub redirected: AtomicU64,
    pub not_found: AtomicU64,
    pub challenges: AtomicU64,
    pub bad_requests: AtomicU64,
    pub forward_failures: AtomicU64,
}

/// Turns requests into responses.
#[derive(Debug)]
pub struct RequestHandler {
    routes: SharedRouteTable,
    gateway: ForwardingGateway,
    policy: ResponsePolicy,
    challenge_addr: SocketAddr,
    stats: RequestStats,
}

impl RequestHandler {
    pub fn new(
        routes: SharedRouteTable,
        gateway: ForwardingGateway,
        policy: ResponsePolicy,
        challenge_port: u16,
    ) -> Self {
        Self {
            routes,
            gateway,
            policy,
            challenge_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, challenge_port)),
            stats: RequestStats::default(),
        }
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn challenge_addr(&self) -> SocketAddr {
        self.challenge_addr
    }

    /// Handle one request. An `Err` terminates the client connection.
    pub async fn handle(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let response = match scheme {
            Scheme::Http => self.handle_plaintext(request, peer).await?,
            Scheme::Https => self.handle_tls(request, peer).await?,
        };

        Ok(self.policy.decorate(response))
    }

    async fn handle_plaintext(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        if request.uri().path().starts_with(CHALLENGE_PREFIX) {
            self.stats.challenges.fetch_add(1, Ordering::Relaxed);
            debug!(path = %request.uri().path(), "Forwarding ACME challenge");
            return self
                .forward(request, self.challenge_addr, peer, Scheme::Http)
                .await;
        }

        let Some(location) = https_location(&request) else {
            self.stats.bad_requests.fetch_add(1, Ordering::Relaxed);
            debug!("Plaintext request without a host");
            return Ok(text_response(StatusCode::BAD_REQUEST, BAD_REQUEST_BODY));
        };

        self.stats.redirected.fetch_add(1, Ordering::Relaxed);
        Ok(redirect(&location))
    }

    async fn handle_tls(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let hostname = request_host(&request)
            .map(|host| normalize_hostname(strip_port(host)))
            .unwrap_or_default();

        match self.routes.resolve(&hostname, request.uri().path()) {
            RouteDecision::Forward(port) => {
                let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                self.forward(request, target, peer, Scheme::Https).await
            }
            RouteDecision::Redirect(location) => {
                self.stats.redirected.fetch_add(1, Ordering::Relaxed);
                Ok(redirect(&format!("https://{location}")))
            }
            RouteDecision::NotFound => {
                self.stats.not_found.fetch_add(1, Ordering::Relaxed);
                Ok(text_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY))
            }
        }
    }

    async fn forward(
        &self,
        mut request: Request<Incoming>,
        target: SocketAddr,
        peer: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        add_forwarded_headers(&mut request, peer, scheme);

        match self.gateway.forward(request, target).await {
            Ok(response) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(response)
            }
            Err(e) => {
                self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Forwarding failed; closing client connection");
                Err(e)
            }
        }
    }
}

/// Host the client asked for: the `Host` header, else the URI authority.
pub fn request_host<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .filter(|host| !host.is_empty())
}

/// `https://host/path?query` for a plaintext request, without the port.
pub fn https_location<B>(request: &Request<B>) -> Option<String> {
    let host = strip_port(request_host(request)?);
    if host.is_empty() {
        return None;
    }

    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    Some(format!("https://{host}{path_and_query}"))
}

fn add_forwarded_headers<B>(request: &mut Request<B>, peer: SocketAddr, scheme: Scheme) {
    let headers = request.headers_mut();
    let peer_ip = peer.ip().to_string();

    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {peer_ip}"),
        None => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
}

fn redirect(location: &str) -> Response<ProxyBody> {
    let Ok(value) = HeaderValue::from_str(location) else {
        debug!(location = %location, "Redirect target is not a valid header value");
        return text_response(StatusCode::BAD_REQUEST, BAD_REQUEST_BODY);
    };

    let mut response = Response::new(full_body(""));
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    response.headers_mut().insert(LOCATION, value);
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    fn request(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = request("http://authority.test/x", Some("header.test"));
        assert_eq!(request_host(&req), Some("header.test"));

        let req = request("http://authority.test/x", None);
        assert_eq!(request_host(&req), Some("authority.test"));

        let req = request("/x", None);
        assert_eq!(request_host(&req), None);

        let req = request("/x", Some(""));
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_https_location() {
        let req = request("/path/page?q=1&r=2", Some("example.com"));
        assert_eq!(
            https_location(&req).as_deref(),
            Some("https://example.com/path/page?q=1&r=2")
        );

        let req = request("/", Some("example.com:8080"));
        assert_eq!(https_location(&req).as_deref(), Some("https://example.com/"));

        let req = request("/", Some("[::1]:80"));
        assert_eq!(https_location(&req).as_deref(), Some("https://[::1]/"));

        let req = request("/", None);
        assert_eq!(https_location(&req), None);
    }

    #[test]
    fn test_forwarded_headers_append() {
        let peer: SocketAddr = "203.0.113.9:50000".parse().unwrap();

        let mut req = request("/", Some("a.test"));
        add_forwarded_headers(&mut req, peer, Scheme::Https);
        assert_eq!(req.headers()[X_FORWARDED_FOR], "203.0.113.9");
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "https");

        let mut req = request("/", Some("a.test"));
        req.headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1"));
        req.headers_mut()
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        add_forwarded_headers(&mut req, peer, Scheme::Http);
        assert_eq!(req.headers()[X_FORWARDED_FOR], "198.51.100.1, 203.0.113.9");
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn test_redirect_response() {
        let response = redirect("https://example.com/a");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "https://example.com/a");
    }

    #[test]
    fn test_redirect_rejects_invalid_location() {
        let response = redirect("https://bad\nhost");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(LOCATION).is_none());
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let response = text_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], NOT_FOUND_BODY.as_bytes());
    }

    #[test]
    fn test_challenge_responder_is_local() {
        let handler = RequestHandler::new(
            std::sync::Arc::new(crate::proxy::RouteTable::default()),
            ForwardingGateway::new(),
            ResponsePolicy::default(),
            8888,
        );

        assert_eq!(handler.challenge_addr(), "127.0.0.1:8888".parse().unwrap());
        assert_eq!(handler.stats().forwarded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_scheme_display() {
        assert_eq!(Scheme::Http.to_string(), "http");
        assert_eq!(Scheme::Https.to_string(), "https");
    }
}
