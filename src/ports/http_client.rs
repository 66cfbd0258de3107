use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;

/// Custom error type for HTTP client operations.
///
/// This is the only error shape that crosses from the forwarding client into the
/// dispatcher; the classifier turns it into an `ErrorKind`.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HttpClientError {
    /// TCP connect refused, reset, TLS failure and similar transport problems
    #[error("Connection error: {0}")]
    Connection(String),

    /// Host name could not be resolved
    #[error("DNS resolution error: {0}")]
    Dns(String),

    /// No complete response within the per-call timeout
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// The outbound request could not be constructed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response headers arrived but the body stream failed
    #[error("Body error: {0}")]
    Body(String),

    #[error("Unexpected client error: {0}")]
    Other(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// A fully buffered request addressed to an upstream service.
///
/// Cloning is cheap (`Bytes` body), so each retry attempt re-sends the same value.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Absolute upstream URI (scheme, authority, path and query).
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// HttpClient defines the port (interface) for calling upstream services
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request to an upstream service
    ///
    /// # Arguments
    /// * `req` - The buffered request, already addressed to the upstream
    /// * `timeout` - Bound on the whole exchange including the response body
    ///
    /// # Returns
    /// The upstream's response (any status) or a transport-level error
    async fn send_request(
        &self,
        req: ForwardRequest,
        timeout: Duration,
    ) -> HttpClientResult<ForwardResponse>;

    /// Probe a health endpoint
    ///
    /// # Arguments
    /// * `url` - The URL to probe
    /// * `timeout` - Probe timeout
    ///
    /// # Returns
    /// The status code the endpoint answered with
    async fn health_check(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode>;
}
