//! Axum middleware shared by every route.
//!
//! Correlation ids are resolved once here and handed to handlers through request
//! extensions, so the proxy, the upstream call and the response all carry the same id.
use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

/// Correlation id of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Use the caller's `x-request-id` or `x-correlation-id`, or mint a UUID v4.
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        [&REQUEST_ID_HEADER, &CORRELATION_ID_HEADER]
            .into_iter()
            .filter_map(|name| headers.get(name))
            .filter_map(|value| value.to_str().ok())
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(|value| Self(value.to_string()))
            .unwrap_or_else(|| Self(uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolve the correlation id, expose it to handlers and echo it on the response.
pub async fn correlation_id_middleware(mut req: Request, next: Next) -> Response {
    let correlation_id = CorrelationId::from_headers(req.headers());
    req.extensions_mut().insert(correlation_id.clone());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Log completion of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        correlation_id = %correlation_id,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use axum::{
        Extension, Router,
        body::Body,
        http::{HeaderMap, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route(
                "/",
                get(|Extension(id): Extension<CorrelationId>| async move { id.0 }),
            )
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(middleware::from_fn(correlation_id_middleware))
    }

    #[tokio::test]
    async fn reuses_inbound_request_id() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc-123");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"abc-123");
    }

    #[tokio::test]
    async fn falls_back_to_correlation_header_then_uuid() {
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", HeaderValue::from_static("corr-9"));
        assert_eq!(CorrelationId::from_headers(&headers).as_str(), "corr-9");

        headers.insert("x-request-id", HeaderValue::from_static("  "));
        assert_eq!(CorrelationId::from_headers(&headers).as_str(), "corr-9");

        let minted = CorrelationId::from_headers(&HeaderMap::new());
        assert!(uuid::Uuid::parse_str(minted.as_str()).is_ok());
    }

    #[tokio::test]
    async fn mints_and_echoes_id_when_absent() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }
}
