use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    config::HealthCheckConfig,
    core::{GatewayService, ServiceRoute},
    metrics,
    ports::http_client::HttpClient,
};

/// Result of probing one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub healthy: bool,
    /// Path that answered below 400.
    pub endpoint: Option<String>,
    pub status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Probes upstream health endpoints for observability.
///
/// Probe traffic never reaches a circuit breaker: a service can be breaker-open
/// while still answering its health path, and that divergence is reported as-is.
pub struct HealthAggregator {
    gateway_service: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
    timeout: Duration,
    latest: ArcSwap<Vec<ServiceHealth>>,
}

impl HealthAggregator {
    pub fn new(gateway_service: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        let timeout = Duration::from_millis(gateway_service.config().health_check.timeout_ms);
        Self {
            gateway_service,
            http_client,
            timeout,
            latest: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Last snapshot produced by [`HealthAggregator::refresh`].
    pub fn latest(&self) -> Arc<Vec<ServiceHealth>> {
        self.latest.load_full()
    }

    /// Probe every service concurrently, store and return the snapshot.
    pub async fn refresh(&self) -> Arc<Vec<ServiceHealth>> {
        let services = self.gateway_service.services();
        let results = join_all(services.into_iter().map(|route| self.probe_service(route))).await;

        for health in &results {
            metrics::set_service_health(&health.service, health.healthy);
        }

        let snapshot = Arc::new(results);
        self.latest.store(snapshot.clone());
        snapshot
    }

    /// Try each candidate path in order; the first status below 400 wins.
    pub async fn probe_service(&self, route: &ServiceRoute) -> ServiceHealth {
        let mut last_status = None;
        let mut last_error = None;

        for path in &route.health_paths {
            let url = match route.base_url.join(path) {
                Ok(uri) => uri.to_string(),
                Err(err) => {
                    last_error = Some(err.to_string());
                    continue;
                }
            };

            let started = Instant::now();
            match self.http_client.health_check(&url, self.timeout).await {
                Ok(status) if status.as_u16() < 400 => {
                    let latency = started.elapsed();
                    tracing::debug!(
                        service = %route.name,
                        endpoint = %path,
                        status = status.as_u16(),
                        latency_ms = latency.as_millis() as u64,
                        "health probe succeeded"
                    );
                    return ServiceHealth {
                        service: route.name.clone(),
                        healthy: true,
                        endpoint: Some(path.clone()),
                        status: Some(status.as_u16()),
                        latency_ms: Some(latency.as_millis() as u64),
                        error: None,
                        checked_at: Utc::now(),
                    };
                }
                Ok(status) => {
                    last_status = Some(status.as_u16());
                    last_error = Some(format!("{path} answered {status}"));
                }
                Err(err) => {
                    last_error = Some(format!("{path}: {err}"));
                }
            }
        }

        tracing::info!(
            service = %route.name,
            error = last_error.as_deref().unwrap_or("no health paths configured"),
            "service failed all health probes"
        );
        ServiceHealth {
            service: route.name.clone(),
            healthy: false,
            endpoint: None,
            status: last_status,
            latency_ms: None,
            error: last_error.or_else(|| Some("no health paths configured".to_string())),
            checked_at: Utc::now(),
        }
    }

    /// Refresh on the configured interval until `shutdown` fires.
    pub async fn run(&self, config: &HealthCheckConfig, shutdown: CancellationToken) {
        if !config.enabled {
            tracing::info!("Health checking is disabled");
            return;
        }

        let interval = Duration::from_secs(config.interval_secs);
        tracing::info!(
            interval_secs = config.interval_secs,
            timeout_ms = config.timeout_ms,
            "Starting health aggregator"
        );

        loop {
            let snapshot = self.refresh().await;
            let healthy = snapshot.iter().filter(|h| h.healthy).count();
            tracing::debug!(healthy, total = snapshot.len(), "Health check cycle completed");

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Health aggregator stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hyper::StatusCode;

    use super::*;
    use crate::{
        config::{GatewayConfig, ServiceConfig},
        ports::http_client::{ForwardRequest, ForwardResponse, HttpClientError, HttpClientResult},
    };

    /// Answers health probes from a fixed url → result table and records the order.
    struct ProbeTable {
        answers: Vec<(&'static str, HttpClientResult<StatusCode>)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpClient for ProbeTable {
        async fn send_request(
            &self,
            _req: ForwardRequest,
            _timeout: Duration,
        ) -> HttpClientResult<ForwardResponse> {
            Err(HttpClientError::Other("not used".into()))
        }

        async fn health_check(&self, url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            self.seen.lock().unwrap().push(url.to_string());
            self.answers
                .iter()
                .find(|(candidate, _)| *candidate == url)
                .map(|(_, result)| result.clone())
                .unwrap_or(Err(HttpClientError::Connection("refused".into())))
        }
    }

    fn aggregator(answers: Vec<(&'static str, HttpClientResult<StatusCode>)>) -> (HealthAggregator, Arc<ProbeTable>) {
        let config = GatewayConfig::builder()
            .service("admin", ServiceConfig::new("/admin", "http://admin:3001"))
            .service("medico", ServiceConfig::new("/medico", "http://medico:3002"))
            .build()
            .unwrap();
        let gateway = Arc::new(GatewayService::new(Arc::new(config)).unwrap());
        let client = Arc::new(ProbeTable {
            answers,
            seen: Mutex::new(Vec::new()),
        });
        (HealthAggregator::new(gateway, client.clone()), client)
    }

    #[tokio::test]
    async fn first_path_below_400_wins() {
        let (aggregator, client) = aggregator(vec![
            ("http://admin:3001/health", Ok(StatusCode::NOT_FOUND)),
            ("http://admin:3001/api/health", Ok(StatusCode::OK)),
        ]);
        let gateway = aggregator.gateway_service.clone();
        let health = aggregator.probe_service(gateway.service("admin").unwrap()).await;

        assert!(health.healthy);
        assert_eq!(health.endpoint.as_deref(), Some("/api/health"));
        assert_eq!(health.status, Some(200));
        assert!(health.latency_ms.is_some());
        assert_eq!(
            *client.seen.lock().unwrap(),
            vec!["http://admin:3001/health", "http://admin:3001/api/health"]
        );
    }

    #[tokio::test]
    async fn all_paths_failing_reports_unhealthy_with_last_error() {
        let (aggregator, _) = aggregator(vec![("http://medico:3002/", Ok(StatusCode::BAD_GATEWAY))]);
        let gateway = aggregator.gateway_service.clone();
        let health = aggregator.probe_service(gateway.service("medico").unwrap()).await;

        assert!(!health.healthy);
        assert_eq!(health.endpoint, None);
        assert_eq!(health.status, Some(502));
        assert!(health.error.unwrap().contains("answered"));
    }

    #[tokio::test]
    async fn refresh_updates_snapshot_for_every_service() {
        let (aggregator, _) = aggregator(vec![("http://admin:3001/health", Ok(StatusCode::OK))]);
        assert!(aggregator.latest().is_empty());

        aggregator.refresh().await;
        let snapshot = aggregator.latest();
        assert_eq!(snapshot.len(), 2);
        let admin = snapshot.iter().find(|h| h.service == "admin").unwrap();
        let medico = snapshot.iter().find(|h| h.service == "medico").unwrap();
        assert!(admin.healthy);
        assert!(!medico.healthy);
    }

    #[tokio::test]
    async fn run_returns_once_cancelled() {
        let (aggregator, _) = aggregator(Vec::new());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let config = HealthCheckConfig::default();
        aggregator.run(&config, shutdown).await;
        assert_eq!(aggregator.latest().len(), 2);
    }
}
