//! Route table and routing decisions.
//!
//! The table is an ordered list of entries mapping `host` or
//! `host/path-prefix` patterns to a backend port or a redirect target.
//!
//! Matching rules:
//! - The request path is normalized to end in `/`
//! - An entry matches if its pattern equals the hostname, or, for non-root
//!   paths, if the pattern (with a trailing `/`) prefixes `host + path`
//! - The last matching entry in table order wins; appending an entry
//!   overrides earlier ones
//! - Hostnames are normalized by the caller (lowercase, no port, no
//!   trailing dot)
//!
//! The table is loaded once at startup and never mutated.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::debug;

use crate::host::normalize_hostname;

/// Where a matching request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Forward to `127.0.0.1:port`.
    Backend { port: u16 },
    /// Redirect to `https://location`.
    Redirect { location: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub pattern: String,
    pub target: RouteTarget,
}

impl RouteEntry {
    /// Entry forwarding matches to a local backend port.
    pub fn backend(pattern: &str, port: u16) -> Self {
        Self {
            pattern: Self::normalize_pattern(pattern),
            target: RouteTarget::Backend { port },
        }
    }

    /// Entry redirecting matches to another host (and optional path).
    pub fn redirect(pattern: &str, location: &str) -> Self {
        Self {
            pattern: Self::normalize_pattern(pattern),
            target: RouteTarget::Redirect {
                location: location.to_string(),
            },
        }
    }

    /// Normalize the host part of a pattern; the path part is case-sensitive.
    pub fn normalize_pattern(pattern: &str) -> String {
        match pattern.split_once('/') {
            Some((host, path)) => format!("{}/{}", normalize_hostname(host), path),
            None => normalize_hostname(pattern),
        }
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward to the backend on this local port.
    Forward(u16),
    /// Redirect to `https://` + this location.
    Redirect(String),
    /// No entry matched.
    NotFound,
}

/// An entry with its prefix form precomputed.
#[derive(Debug)]
struct CompiledRoute {
    entry: RouteEntry,
    /// Pattern guaranteed to end in `/`.
    prefix: String,
}

impl CompiledRoute {
    fn new(entry: RouteEntry) -> Self {
        let prefix = with_trailing_slash(&entry.pattern).into_owned();
        Self { entry, prefix }
    }

    fn matches(&self, hostname: &str, request_target: &str, is_root: bool) -> bool {
        self.entry.pattern == hostname || (!is_root && request_target.starts_with(&self.prefix))
    }
}

/// Ordered, immutable route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Create a route table; `entries` order is significant.
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self {
            routes: entries.into_iter().map(CompiledRoute::new).collect(),
        }
    }

    /// Make a routing decision for a request.
    pub fn resolve(&self, hostname: &str, path: &str) -> RouteDecision {
        let path = with_trailing_slash(path);
        let is_root = path == "/";
        let request_target = format!("{hostname}{path}");

        // Later entries override earlier ones.
        let winner = self
            .routes
            .iter()
            .rev()
            .find(|route| route.matches(hostname, &request_target, is_root));

        let Some(route) = winner else {
            debug!(hostname = %hostname, path = %path, "No route matched");
            return RouteDecision::NotFound;
        };

        debug!(
            hostname = %hostname,
            path = %path,
            pattern = %route.entry.pattern,
            "Route matched"
        );

        match &route.entry.target {
            RouteTarget::Backend { port } => RouteDecision::Forward(*port),
            RouteTarget::Redirect { location } => RouteDecision::Redirect(location.clone()),
        }
    }

    /// Entries in table order.
    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.iter().map(|route| &route.entry)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;

fn with_trailing_slash(path: &str) -> Cow<'_, str> {
    if path.ends_with('/') {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(format!("{path}/"))
    }
}
