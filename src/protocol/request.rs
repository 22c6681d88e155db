//! HTTP request handling implementation.
//!
//! This module provides the core abstraction for a completely parsed HTTP
//! request. It wraps the standard `http::Request` type with the request body
//! already collected, since handlers are dispatched with complete requests.

use bytes::Bytes;
use http::{header, HeaderMap, Method, Request, Uri, Version};

/// A completely parsed HTTP request.
///
/// Wraps a `http::Request<Bytes>` to provide:
/// - Access to standard HTTP header fields with case-insensitive lookup
/// - Convenience accessors for connection and upgrade semantics
/// - The collected request body (empty unless Content-Length framing applied)
///
/// Immutable once parsed.
#[derive(Debug)]
pub struct HttpRequest {
    inner: Request<Bytes>,
}

impl AsRef<Request<Bytes>> for HttpRequest {
    fn as_ref(&self) -> &Request<Bytes> {
        &self.inner
    }
}

impl HttpRequest {
    /// Consumes the request and returns the inner `Request<Bytes>`.
    pub fn into_inner(self) -> Request<Bytes> {
        self.inner
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's path component.
    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Returns the named header value as a string, if present and visible
    /// ASCII. Lookup is case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers().get(name).and_then(|value| value.to_str().ok())
    }

    /// Returns the collected request body.
    pub fn body(&self) -> &Bytes {
        self.inner.body()
    }

    /// Returns true when the peer asked for the connection to be torn down
    /// after this request completes.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is present.
    pub fn close_after_response(&self) -> bool {
        let connection = self.header(header::CONNECTION.as_str());
        match self.version() {
            Version::HTTP_11 => {
                connection.map(|value| token_present(value, "close")).unwrap_or(false)
            }
            _ => !connection.map(|value| token_present(value, "keep-alive")).unwrap_or(false),
        }
    }

    /// Returns true when the request carries a WebSocket upgrade intent
    /// (`Upgrade: websocket` plus `Connection: Upgrade`).
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header(header::UPGRADE.as_str()).map(|value| token_present(value, "websocket")).unwrap_or(false)
            && self
                .header(header::CONNECTION.as_str())
                .map(|value| token_present(value, "upgrade"))
                .unwrap_or(false)
    }
}

impl From<Request<Bytes>> for HttpRequest {
    #[inline]
    fn from(inner: Request<Bytes>) -> Self {
        Self { inner }
    }
}

/// Comma-separated header values compare per token, case-insensitively.
fn token_present(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}
