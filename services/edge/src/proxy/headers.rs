//! Response header policy.
//!
//! Every response leaving the edge, whether forwarded, redirected, or
//! generated locally, passes through [`ResponsePolicy::decorate`] exactly
//! once. Policy headers replace whatever the backend set.

use hyper::header::{
    HeaderName, HeaderValue, InvalidHeaderValue, CONTENT_SECURITY_POLICY,
    STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use hyper::Response;

/// Header carrying the edge identification.
pub const IDENTIFICATION_HEADER: &str = "x-powered-by";

/// Default identification value.
pub const DEFAULT_IDENTITY: &str = "tollgate";

pub const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains; preload";
pub const FRAME_OPTIONS_VALUE: &str = "SAMEORIGIN";
pub const XSS_PROTECTION_VALUE: &str = "1";
pub const CONTENT_TYPE_OPTIONS_VALUE: &str = "nosniff";
pub const CSP_VALUE: &str = "default-src * 'unsafe-inline' 'unsafe-eval' data: blob:";

/// Fixed set of headers overridden on every response.
#[derive(Debug, Clone)]
pub struct ResponsePolicy {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ResponsePolicy {
    /// Create a policy identifying responses with `identity`.
    pub fn new(identity: &str) -> Result<Self, InvalidHeaderValue> {
        Ok(Self::with_identity(HeaderValue::from_str(identity)?))
    }

    fn with_identity(identity: HeaderValue) -> Self {
        Self {
            headers: vec![
                (HeaderName::from_static(IDENTIFICATION_HEADER), identity),
                (
                    STRICT_TRANSPORT_SECURITY,
                    HeaderValue::from_static(HSTS_VALUE),
                ),
                (X_FRAME_OPTIONS, HeaderValue::from_static(FRAME_OPTIONS_VALUE)),
                (
                    X_XSS_PROTECTION,
                    HeaderValue::from_static(XSS_PROTECTION_VALUE),
                ),
                (
                    X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static(CONTENT_TYPE_OPTIONS_VALUE),
                ),
                (CONTENT_SECURITY_POLICY, HeaderValue::from_static(CSP_VALUE)),
            ],
        }
    }

    /// Override the policy headers on `response`.
    pub fn decorate<B>(&self, mut response: Response<B>) -> Response<B> {
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            // insert() drops every existing value for the name.
            headers.insert(name.clone(), value.clone());
        }
        response
    }

    /// The headers this policy sets, in application order.
    pub fn headers(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.headers.iter().map(|(name, value)| (name, value))
    }
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self::with_identity(HeaderValue::from_static(DEFAULT_IDENTITY))
    }
}
