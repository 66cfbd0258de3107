use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::{Body as AxumBody, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header, request::Parts},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use http_body_util::LengthLimitError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::Instrument;

use crate::{
    adapters::{
        health_checker::HealthAggregator,
        http_client::strip_hop_by_hop,
        middleware::{
            CorrelationId, REQUEST_ID_HEADER, correlation_id_middleware, request_timing_middleware,
        },
    },
    core::{
        GatewayService,
        cache::CacheEntry,
        classifier::ErrorKind,
        dispatcher::{DispatchError, DispatchOutcome, DispatchRequest, Dispatcher, StaleResponse},
    },
    metrics,
    ports::http_client::{ForwardRequest, ForwardResponse},
    tracing_setup,
};

const GATEWAY_NAME: &str = "hospital-gateway";
const UNMATCHED_SERVICE: &str = "unmatched";

pub const DATA_SOURCE_HEADER: HeaderName = HeaderName::from_static("x-data-source");
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache-status");

/// JSON body of every error the gateway produces itself.
#[derive(Debug, Serialize)]
pub struct GatewayErrorBody {
    pub error: &'static str,
    pub message: String,
    pub service: Option<String>,
    pub route: String,
    pub method: String,
    pub correlation_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
}

/// Per-request facts needed to render an error.
struct RequestContext {
    service: Option<String>,
    route: String,
    method: Method,
    correlation_id: CorrelationId,
}

impl RequestContext {
    fn error(&self, status: StatusCode, error: &'static str, message: String) -> Response {
        self.error_with(status, error, message, None, None)
    }

    fn error_with(
        &self,
        status: StatusCode,
        error: &'static str,
        message: String,
        upstream_status: Option<StatusCode>,
        retry_after_secs: Option<u64>,
    ) -> Response {
        let body = GatewayErrorBody {
            error,
            message,
            service: self.service.clone(),
            route: self.route.clone(),
            method: self.method.to_string(),
            correlation_id: self.correlation_id.0.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            upstream_status: upstream_status.map(|s| s.as_u16()),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn failure_message(kind: ErrorKind, service: &str) -> String {
    match kind {
        ErrorKind::Network => format!("Service '{service}' is unreachable"),
        ErrorKind::Timeout => format!("Service '{service}' did not respond in time"),
        ErrorKind::UpstreamServer => format!("Service '{service}' failed to handle the request"),
        ErrorKind::UpstreamClient => format!("Service '{service}' rejected the request"),
        ErrorKind::CircuitOpen => {
            format!("Service '{service}' is temporarily unavailable, try again later")
        }
        ErrorKind::Unknown => format!("Request to service '{service}' failed"),
    }
}

/// Add `"stale": true` to a JSON object body.
///
/// Arrays, scalars and non-JSON bodies keep their exact shape so clients parsing a list
/// endpoint such as `/admin/hospitals` still get a list. For those the `x-cache-status`
/// and `x-data-source` headers are the only stale marker.
pub fn mark_stale_body(entry: &CacheEntry) -> Bytes {
    let json_like = entry
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_none_or(|ct| ct.contains("json"));
    if !json_like {
        return entry.body.clone();
    }

    match serde_json::from_slice::<serde_json::Value>(&entry.body) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert("stale".to_string(), serde_json::Value::Bool(true));
            serde_json::to_vec(&map)
                .map(Bytes::from)
                .unwrap_or_else(|_| entry.body.clone())
        }
        _ => entry.body.clone(),
    }
}

fn live_response(upstream: ForwardResponse) -> Response {
    let mut response = Response::new(AxumBody::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}

fn stale_response(stale: StaleResponse) -> Response {
    let body = mark_stale_body(&stale.entry);
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.extend(stale.entry.headers);
    headers.insert(DATA_SOURCE_HEADER, HeaderValue::from_static("cache"));
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("stale"));
    headers.insert(header::AGE, HeaderValue::from(stale.age.as_secs()));
    if let Some(retry_after) = stale.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
    }
    response
}

/// Headers sent upstream: hop-by-hop removed, correlation and forwarding info added.
fn forward_headers(
    inbound: &HeaderMap,
    correlation_id: &CorrelationId,
    client_addr: Option<SocketAddr>,
) -> HeaderMap {
    let mut headers = inbound.clone();
    let inbound_host = headers.get(header::HOST).cloned();
    strip_hop_by_hop(&mut headers);
    // Cached bodies keep no content-encoding, so upstreams must answer uncompressed
    headers.remove(header::ACCEPT_ENCODING);

    if let Some(host) = inbound_host {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );

    if let Some(addr) = client_addr {
        let forwarded_for = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {}", addr.ip()),
            None => addr.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers
}

/// HTTP surface of the gateway: status endpoints plus the proxy fallback.
pub struct HttpHandler {
    gateway_service: Arc<GatewayService>,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthAggregator>,
    /// Root shutdown token; every dispatch runs under a child of it.
    shutdown: CancellationToken,
    started_at: Instant,
}

impl HttpHandler {
    pub fn new(
        gateway_service: Arc<GatewayService>,
        dispatcher: Arc<Dispatcher>,
        health: Arc<HealthAggregator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gateway_service,
            dispatcher,
            health,
            shutdown,
            started_at: Instant::now(),
        }
    }

    /// Gateway liveness plus the last aggregated upstream snapshot.
    pub async fn handle_health(&self) -> Response {
        let snapshot = self.health.latest();
        let healthy = snapshot.iter().filter(|h| h.healthy).count();

        Json(serde_json::json!({
            "status": "ok",
            "service": GATEWAY_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "upstreams": {
                "healthy": healthy,
                "total": snapshot.len(),
                "services": &*snapshot,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response()
    }

    /// Probe every service now. 200 when all are healthy, 503 otherwise.
    pub async fn handle_service_health(&self) -> Response {
        let snapshot = self.health.refresh().await;
        let healthy = snapshot.iter().filter(|h| h.healthy).count();
        let all_healthy = healthy == snapshot.len();

        let status = if all_healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        let body = serde_json::json!({
            "status": if all_healthy { "healthy" } else { "degraded" },
            "healthy": healthy,
            "total": snapshot.len(),
            "services": &*snapshot,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }

    /// Breaker state per service and cache statistics.
    pub async fn handle_status(&self) -> Response {
        let mut services = Vec::with_capacity(self.gateway_service.service_count());
        for route in self.gateway_service.services() {
            let breaker = self.dispatcher.breakers().get(&route.name).await;
            services.push(serde_json::json!({
                "name": route.name,
                "prefix": route.prefix,
                "upstream": route.base_url.as_str(),
                "circuit": breaker.snapshot(),
            }));
        }

        let config = self.gateway_service.config();
        Json(serde_json::json!({
            "service": GATEWAY_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "services": services,
            "cache": self.dispatcher.cache().stats(),
            "configuration": {
                "listen_addr": &config.listen_addr,
                "upstream_timeout_ms": config.timeouts.upstream_ms,
                "gateway_timeout_ms": config.timeouts.gateway_ms,
                "retry_max_attempts": config.retry.max_attempts,
                "cache_enabled": config.cache.enabled,
                "health_check_enabled": config.health_check.enabled,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response()
    }

    /// Route, buffer and dispatch a request to its service.
    pub async fn handle_proxy(&self, req: Request) -> Response {
        let correlation_id = req
            .extensions()
            .get::<CorrelationId>()
            .cloned()
            .unwrap_or_else(|| CorrelationId::from_headers(req.headers()));
        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let span = tracing_setup::create_request_span(
            req.method().as_str(),
            req.uri().path(),
            correlation_id.as_str(),
        );

        async move {
            let (parts, body) = req.into_parts();
            let method = parts.method.clone();
            let mut ctx = RequestContext {
                service: None,
                route: parts.uri.path().to_string(),
                method: method.clone(),
                correlation_id,
            };

            let response = self.proxy(parts, body, &mut ctx, client_addr).await;

            let service = ctx.service.as_deref().unwrap_or(UNMATCHED_SERVICE);
            let span = tracing::Span::current();
            span.record("service", service);
            span.record("http.status_code", response.status().as_u16());
            metrics::increment_request_total(service, method.as_str(), response.status().as_u16());
            response
        }
        .instrument(span)
        .await
    }

    async fn proxy(
        &self,
        parts: Parts,
        body: AxumBody,
        ctx: &mut RequestContext,
        client_addr: Option<SocketAddr>,
    ) -> Response {
        let Some(matched) = self.gateway_service.find_matching_route(&ctx.route) else {
            tracing::debug!(path = %ctx.route, "no service prefix matched");
            return ctx.error(
                StatusCode::NOT_FOUND,
                "ROUTE_NOT_FOUND",
                format!("No service is registered for path '{}'", ctx.route),
            );
        };
        let service = matched.route.name.clone();
        ctx.service = Some(service.clone());
        let _timer = metrics::RequestTimer::new(&service, ctx.method.as_str());

        let config = self.gateway_service.config();
        let body = match axum::body::to_bytes(body, config.max_body_bytes).await {
            Ok(body) => body,
            Err(err) => {
                if err.into_inner().is::<LengthLimitError>() {
                    return ctx.error(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "PAYLOAD_TOO_LARGE",
                        format!("Request body exceeds {} bytes", config.max_body_bytes),
                    );
                }
                return ctx.error(
                    StatusCode::BAD_REQUEST,
                    "INVALID_REQUEST_BODY",
                    "Request body could not be read".to_string(),
                );
            }
        };

        let uri = match matched.upstream_uri(parts.uri.query()) {
            Ok(uri) => uri,
            Err(err) => {
                return ctx.error(StatusCode::BAD_REQUEST, "INVALID_PATH", err.to_string());
            }
        };

        let mut request = ForwardRequest::new(ctx.method.clone(), uri);
        request.headers = forward_headers(&parts.headers, &ctx.correlation_id, client_addr);
        request.body = body;

        // Retries stop on gateway shutdown, or when the client goes away and this future is dropped
        let cancel = self.shutdown.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let dispatch = self.dispatcher.dispatch(
            DispatchRequest {
                service: service.clone(),
                request,
            },
            &cancel,
        );

        match tokio::time::timeout(config.timeouts.gateway(), dispatch).await {
            Ok(DispatchOutcome::Delivered(delivered)) => live_response(delivered.response),
            Ok(DispatchOutcome::StaleFallback(stale)) => stale_response(stale),
            Ok(DispatchOutcome::HardFailure(failure)) => self.failure_response(ctx, failure),
            Err(_) => {
                tracing::warn!(service = %service, "gateway deadline elapsed during dispatch");
                ctx.error(
                    StatusCode::GATEWAY_TIMEOUT,
                    "GATEWAY_TIMEOUT",
                    format!("Service '{service}' did not answer within the gateway deadline"),
                )
            }
        }
    }

    fn failure_response(&self, ctx: &RequestContext, failure: DispatchError) -> Response {
        tracing::warn!(
            service = %failure.service,
            kind = %failure.kind,
            detail = %failure.detail,
            attempts = failure.attempts,
            "request failed without fallback"
        );
        ctx.error_with(
            StatusCode::SERVICE_UNAVAILABLE,
            failure.kind.code(),
            failure_message(failure.kind, &failure.service),
            failure.upstream_status,
            failure.retry_after.map(|d| d.as_secs()),
        )
    }
}

async fn health(State(handler): State<Arc<HttpHandler>>) -> Response {
    handler.handle_health().await
}

async fn service_health(State(handler): State<Arc<HttpHandler>>) -> Response {
    handler.handle_service_health().await
}

async fn status(State(handler): State<Arc<HttpHandler>>) -> Response {
    handler.handle_status().await
}

async fn proxy(State(handler): State<Arc<HttpHandler>>, req: Request) -> Response {
    handler.handle_proxy(req).await
}

/// Assemble the full router with tracing, compression and correlation ids.
pub fn build_router(handler: Arc<HttpHandler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/services", get(service_health))
        .route("/status", get(status))
        .fallback(proxy)
        .with_state(handler)
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(middleware::from_fn(correlation_id_middleware))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}
