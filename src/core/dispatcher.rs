//! Per-request orchestration of breaker, retries and stale-if-error fallback.
//!
//! ```text
//! START → BREAKER_CHECK → REJECTED   → STALE_FALLBACK | HARD_FAILURE
//!                       → ATTEMPTING → DELIVERED | STALE_FALLBACK | HARD_FAILURE
//! ```
//!
//! Breaker outcomes are recorded synchronously inside the retry loop, so by the time
//! `dispatch` returns the next request already sees the updated breaker state.
use std::{sync::Arc, time::Duration};

use hyper::{Method, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::GatewayConfig,
    core::{
        cache::{CacheEntry, CacheKey, CacheSettings, ResponseCache},
        circuit_breaker::{BreakerRegistry, BreakerSettings},
        classifier::{AttemptOutcome, ErrorKind},
        retry::{RetryExecutor, RetryPolicy},
    },
    metrics,
    ports::{
        Clock,
        http_client::{ForwardRequest, ForwardResponse, HttpClient},
    },
    tracing_setup,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchPhase {
    BreakerCheck,
    Rejected,
    Attempting,
    Delivered,
    StaleFallback,
    HardFailure,
}

impl DispatchPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::BreakerCheck => "BREAKER_CHECK",
            Self::Rejected => "REJECTED",
            Self::Attempting => "ATTEMPTING",
            Self::Delivered => "DELIVERED",
            Self::StaleFallback => "STALE_FALLBACK",
            Self::HardFailure => "HARD_FAILURE",
        }
    }
}

fn enter(service: &str, phase: DispatchPhase) {
    tracing::debug!(service, phase = phase.as_str(), "dispatch phase");
}

/// An inbound request resolved to a logical service.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub service: String,
    pub request: ForwardRequest,
}

/// Live upstream response, returned to the caller as-is (4xx included).
#[derive(Debug, Clone)]
pub struct Delivered {
    pub response: ForwardResponse,
    pub attempts: u32,
}

/// Cached response served because the live path failed or was blocked.
#[derive(Debug, Clone)]
pub struct StaleResponse {
    pub entry: CacheEntry,
    pub age: Duration,
    /// Why the live path was not used.
    pub reason: ErrorKind,
    pub retry_after: Option<Duration>,
}

/// Normalized failure for a request that could not be answered.
#[derive(Debug, Clone, Error)]
#[error("{kind} from service '{service}': {detail}")]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub service: String,
    pub detail: String,
    /// Last status the upstream answered with, if any.
    pub upstream_status: Option<StatusCode>,
    pub retry_after: Option<Duration>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Delivered(Delivered),
    StaleFallback(StaleResponse),
    HardFailure(DispatchError),
}

pub struct Dispatcher {
    client: Arc<dyn HttpClient>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<ResponseCache>,
    retry: RetryExecutor,
    upstream_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn HttpClient>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<ResponseCache>,
        retry: RetryExecutor,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            client,
            breakers,
            cache,
            retry,
            upstream_timeout,
        }
    }

    /// Wire breakers, cache and retry policy from configuration.
    pub fn from_config(
        config: &GatewayConfig,
        client: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breakers = BreakerRegistry::new(
            BreakerSettings::from(&config.circuit_breaker),
            clock.clone(),
        );
        let cache = ResponseCache::new(CacheSettings::from(&config.cache), clock);
        Self::new(
            client,
            Arc::new(breakers),
            Arc::new(cache),
            RetryExecutor::new(RetryPolicy::from(&config.retry)),
            config.timeouts.upstream(),
        )
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Dispatch one request. Always terminates with an outcome, never a raw error.
    pub async fn dispatch(
        &self,
        req: DispatchRequest,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let DispatchRequest { service, request } = req;
        let breaker = self.breakers.get(&service).await;
        let cache_key = if request.method == Method::GET {
            Some(CacheKey::new(&service, &request.method, &request.uri))
        } else {
            None
        };

        enter(&service, DispatchPhase::BreakerCheck);
        if !breaker.can_pass() {
            enter(&service, DispatchPhase::Rejected);
            let failure = DispatchError {
                kind: ErrorKind::CircuitOpen,
                detail: format!("circuit breaker for '{service}' is open"),
                service,
                upstream_status: None,
                retry_after: breaker.retry_after(),
                attempts: 0,
            };
            return self.fallback(cache_key.as_ref(), failure);
        }

        enter(&service, DispatchPhase::Attempting);
        let report = self
            .retry
            .run(&request.method, &breaker, cancel, |attempt| {
                let client = self.client.clone();
                let outgoing = request.clone();
                let timeout = self.upstream_timeout;
                let span = tracing_setup::create_upstream_span(
                    &service,
                    outgoing.method.as_str(),
                    &outgoing.uri.to_string(),
                    attempt,
                );
                let timer = metrics::UpstreamRequestTimer::new(&service, outgoing.method.as_str());
                async move {
                    let outcome =
                        AttemptOutcome::from_result(client.send_request(outgoing, timeout).await);
                    drop(timer);
                    outcome
                }
                .instrument(span)
            })
            .await;

        match report.outcome {
            AttemptOutcome::Success(response) => {
                if let Some(key) = cache_key {
                    if response.status.is_success() {
                        // Rejections (oversized bodies and the like) are expected and logged inside
                        let _ = self.cache.store(key, &request.method, &response);
                    }
                }
                enter(&service, DispatchPhase::Delivered);
                DispatchOutcome::Delivered(Delivered {
                    response,
                    attempts: report.attempts,
                })
            }
            AttemptOutcome::Failure(failure) => {
                let failure = DispatchError {
                    kind: failure.kind,
                    service,
                    detail: failure.detail,
                    upstream_status: failure.status,
                    retry_after: breaker.retry_after(),
                    attempts: report.attempts,
                };
                tracing::warn!(
                    service = %failure.service,
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    cancelled = report.cancelled,
                    "upstream attempts exhausted"
                );
                self.fallback(cache_key.as_ref(), failure)
            }
        }
    }

    /// Serve a cached GET response if one is still within its staleness budget.
    fn fallback(&self, key: Option<&CacheKey>, failure: DispatchError) -> DispatchOutcome {
        if let Some((entry, age)) = key.and_then(|key| self.cache.lookup(key).into_usable()) {
            enter(&failure.service, DispatchPhase::StaleFallback);
            metrics::increment_stale_responses(&failure.service);
            tracing::info!(
                service = %failure.service,
                reason = %failure.kind,
                age_secs = age.as_secs(),
                "serving cached response"
            );
            return DispatchOutcome::StaleFallback(StaleResponse {
                entry,
                age,
                reason: failure.kind,
                retry_after: failure.retry_after,
            });
        }

        enter(&failure.service, DispatchPhase::HardFailure);
        DispatchOutcome::HardFailure(failure)
    }
}
