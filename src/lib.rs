//! Hospital gateway: a resilient request-dispatch layer in front of the hospital
//! administration services.
//!
//! Every inbound request is matched to a logical service by path prefix and handed to
//! the [`Dispatcher`], which combines three mechanisms:
//!
//! - a per-service **circuit breaker** that stops calling a failing upstream and probes
//!   it again after a cooldown,
//! - a **retry executor** that re-sends idempotent requests (GET/HEAD) with exponential
//!   backoff,
//! - an LRU **response cache** that serves the last good GET response when the upstream
//!   is unavailable (stale-if-error).
//!
//! A separate [`HealthAggregator`] probes each upstream's health endpoints for
//! observability. It never feeds the breakers.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use hospital_gateway::{
//!     Dispatcher, GatewayService, HttpClientAdapter,
//!     config::load_config,
//!     ports::{HttpClient, SystemClock},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(load_config("config.toml").await?);
//! let gateway = GatewayService::new(config.clone())?;
//! let client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new()?);
//! let dispatcher = Dispatcher::from_config(&config, client, Arc::new(SystemClock));
//! # let _ = (gateway, dispatcher);
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! **Ports** (traits for the HTTP client and the clock) are kept apart from **adapters**
//! (hyper client, axum handlers, health prober) while the resilience logic lives in
//! `core` and performs no I/O of its own beyond the injected client.
//!
//! # Error Handling
//! Domain errors are `thiserror` enums; startup and plumbing code returns
//! `eyre::Result<T>` with context attached through `WrapErr`. A dispatch never returns a
//! raw error: it always ends in a delivered response, a stale fallback or a normalized
//! [`core::DispatchError`].
//!
//! # Concurrency & Data Structures
//! Breakers live in an `scc::HashMap` keyed by service name. Each breaker and the cache
//! keep their state behind a short-lived `std::sync::Mutex` that is never held across
//! an `.await`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HealthAggregator, HttpClientAdapter, HttpHandler, build_router},
    core::{Dispatcher, GatewayService},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
