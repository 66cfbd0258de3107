#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use hospital_gateway::{
    adapters::{HealthAggregator, HttpHandler, build_router},
    config::{CircuitBreakerConfig, GatewayConfig, RetryConfig, ServiceConfig},
    core::{Dispatcher, GatewayService},
    ports::{
        Clock, ForwardRequest, ForwardResponse, HttpClient, HttpClientError, HttpClientResult,
        MockClock,
    },
};
use hyper::{StatusCode, header};
use tokio_util::sync::CancellationToken;

/// Upstream stand-in: replays queued results, then repeats a default one.
pub struct ScriptedClient {
    queue: Mutex<VecDeque<HttpClientResult<ForwardResponse>>>,
    default: Mutex<HttpClientResult<ForwardResponse>>,
    delay: Mutex<Duration>,
    health_status: Mutex<StatusCode>,
    requests: Mutex<Vec<ForwardRequest>>,
    call_times: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedClient {
    pub fn always(result: HttpClientResult<ForwardResponse>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            default: Mutex::new(result),
            delay: Mutex::new(Duration::ZERO),
            health_status: Mutex::new(StatusCode::OK),
            requests: Mutex::new(Vec::new()),
            call_times: Mutex::new(Vec::new()),
        })
    }

    /// Queue results consumed one per call before falling back to the default.
    pub fn enqueue(&self, results: impl IntoIterator<Item = HttpClientResult<ForwardResponse>>) {
        self.queue.lock().unwrap().extend(results);
    }

    pub fn set_default(&self, result: HttpClientResult<ForwardResponse>) {
        *self.default.lock().unwrap() = result;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_health_status(&self, status: StatusCode) {
        *self.health_status.lock().unwrap() = status;
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ForwardRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn send_request(
        &self,
        req: ForwardRequest,
        _timeout: Duration,
    ) -> HttpClientResult<ForwardResponse> {
        self.requests.lock().unwrap().push(req);
        self.call_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = self.queue.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }

    async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
        Ok(*self.health_status.lock().unwrap())
    }
}

pub fn json(status: u16, body: &str) -> HttpClientResult<ForwardResponse> {
    let mut response = ForwardResponse::new(StatusCode::from_u16(status).unwrap(), body.to_string());
    response.headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

pub fn refused() -> HttpClientResult<ForwardResponse> {
    Err(HttpClientError::Connection("connection refused".into()))
}

/// What the real client reports once the per-call timeout has run out.
pub fn timed_out(after: Duration) -> HttpClientResult<ForwardResponse> {
    Err(HttpClientError::Timeout(after))
}

/// Two services, no jitter, breaker tuned per test.
pub fn config(retry_attempts: u32, breaker: CircuitBreakerConfig) -> GatewayConfig {
    GatewayConfig::builder()
        .service("admin", ServiceConfig::new("/admin", "http://admin-service:3001"))
        .service("medico", ServiceConfig::new("/medico", "http://medico-service:3002"))
        .retry(RetryConfig {
            max_attempts: retry_attempts,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter_ratio: 0.0,
        })
        .circuit_breaker(breaker)
        .build()
        .unwrap()
}

pub struct Harness {
    pub clock: Arc<MockClock>,
    pub client: Arc<ScriptedClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub gateway: Arc<GatewayService>,
    /// Root shutdown token handed to the router.
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new(config: GatewayConfig, client: Arc<ScriptedClient>) -> Self {
        let clock = Arc::new(MockClock::new());
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let shared_client: Arc<dyn HttpClient> = client.clone();
        let dispatcher = Arc::new(Dispatcher::from_config(&config, shared_client, shared_clock));
        let gateway = Arc::new(GatewayService::new(Arc::new(config)).unwrap());
        Self {
            clock,
            client,
            dispatcher,
            gateway,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn router(&self) -> axum::Router {
        let health = Arc::new(HealthAggregator::new(
            self.gateway.clone(),
            self.client.clone(),
        ));
        let handler = Arc::new(HttpHandler::new(
            self.gateway.clone(),
            self.dispatcher.clone(),
            health,
            self.shutdown.clone(),
        ));
        build_router(handler)
    }
}
