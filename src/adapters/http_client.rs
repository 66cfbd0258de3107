use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, Request, StatusCode, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{
    ForwardRequest, ForwardResponse, HttpClient, HttpClientError, HttpClientResult,
};

/// Headers that describe a single transport hop and must not be forwarded as-is.
const HOP_BY_HOP_HEADERS: &[header::HeaderName] = &[
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
];

/// Remove hop-by-hop headers; framing and `Host` are recomputed for the next hop.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Re-addresses each buffered request and recomputes `Host`
/// * Bounds the whole exchange (connect, headers, body) by the caller's timeout
/// * Maps transport failures onto the typed `HttpClientError` taxonomy
///
/// Retries and circuit breaking live in `core`; this adapter makes exactly one call.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(https_connector);

        tracing::info!("Created upstream HTTP client");
        Ok(Self { client })
    }

    fn build_request(req: ForwardRequest) -> HttpClientResult<Request<Full<Bytes>>> {
        let ForwardRequest {
            method,
            uri,
            mut headers,
            body,
        } = req;

        let Some(host_str) = uri.host() else {
            tracing::error!("Outgoing URI has no host: {}", uri);
            return Err(HttpClientError::InvalidRequest(format!(
                "outgoing URI '{uri}' has no host"
            )));
        };
        let host_value = match uri.port() {
            Some(port) => HeaderValue::from_str(&format!("{host_str}:{}", port.as_u16())),
            None => HeaderValue::from_str(host_str),
        }
        .map_err(|e| HttpClientError::InvalidRequest(format!("invalid host header: {e}")))?;

        strip_hop_by_hop(&mut headers);
        headers.insert(header::HOST, host_value);

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(Full::new(body))
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// Map a hyper-util client error onto the transport taxonomy.
    fn map_transport_error(err: &hyper_util::client::legacy::Error) -> HttpClientError {
        let mut chain = Vec::new();
        let mut source: Option<&(dyn StdError + 'static)> = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        let detail = if chain.is_empty() {
            err.to_string()
        } else {
            format!("{err}: {}", chain.join(": "))
        };

        // Resets and premature closes after connecting count as connection failures too
        if chain.iter().any(|msg| msg.contains("dns error")) {
            HttpClientError::Dns(detail)
        } else {
            HttpClientError::Connection(detail)
        }
    }

    async fn exchange(&self, request: Request<Full<Bytes>>) -> HttpClientResult<ForwardResponse> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Self::map_transport_error(&e))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| HttpClientError::Body(e.to_string()))?
            .to_bytes();

        let mut headers = parts.headers;
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);

        Ok(ForwardResponse {
            status: parts.status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        req: ForwardRequest,
        call_timeout: Duration,
    ) -> HttpClientResult<ForwardResponse> {
        let upstream = format!(
            "{}://{}",
            req.uri.scheme_str().unwrap_or("http"),
            req.uri
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let method = req.method.clone();
        let path = req.uri.path().to_string();

        let request = Self::build_request(req)?;
        tracing::debug!("Outgoing request headers: {:?}", request.headers());

        match timeout(call_timeout, self.exchange(request)).await {
            Ok(Ok(response)) => {
                tracing::debug!(
                    upstream = %upstream,
                    %method,
                    %path,
                    status = response.status.as_u16(),
                    bytes = response.body.len(),
                    "upstream responded"
                );
                Ok(response)
            }
            Ok(Err(err)) => {
                tracing::warn!(upstream = %upstream, %method, %path, error = %err, "upstream call failed");
                Err(err)
            }
            Err(_) => {
                tracing::warn!(
                    upstream = %upstream,
                    %method,
                    %path,
                    timeout_ms = call_timeout.as_millis() as u64,
                    "upstream call timed out"
                );
                Err(HttpClientError::Timeout(call_timeout))
            }
        }
    }

    async fn health_check(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<StatusCode> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(Full::new(Bytes::new()))
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Health checking URL: {}", url);

        match timeout(probe_timeout, self.exchange(request)).await {
            Ok(Ok(response)) => {
                tracing::debug!("Health check for {} answered {}", url, response.status);
                Ok(response.status)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health check error for {}: {}", url, err);
                Err(err)
            }
            Err(_) => {
                tracing::debug!("Health check timeout for {}", url);
                Err(HttpClientError::Timeout(probe_timeout))
            }
        }
    }
}
