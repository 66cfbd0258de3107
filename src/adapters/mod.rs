pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use health_checker::{HealthAggregator, ServiceHealth};
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, build_router};
pub use middleware::{CorrelationId, correlation_id_middleware, request_timing_middleware};
