pub mod cache;
pub mod circuit_breaker;
pub mod classifier;
pub mod dispatcher;
pub mod gateway;
pub mod retry;
pub mod service;

pub use cache::{CacheKey, CacheLookup, CacheSettings, ResponseCache};
pub use circuit_breaker::{BreakerRegistry, BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use classifier::{AttemptOutcome, Classification, ErrorKind, UpstreamFailure};
pub use dispatcher::{
    DispatchError, DispatchOutcome, DispatchRequest, Delivered, Dispatcher, StaleResponse,
};
pub use gateway::{GatewayService, RouteMatch, ServiceRoute};
pub use retry::{RetryExecutor, RetryPolicy};
pub use service::{ServiceError, ServiceUrl};
