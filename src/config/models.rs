//! Configuration data structures for the gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to
//! `GATEWAY__*` environment variables. Every section carries serde defaults so that an
//! environment-only deployment only needs to name its services.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

/// Candidate health paths probed in order when a service does not list its own.
pub fn default_health_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/api/health".to_string(),
        "/".to_string(),
    ]
}

/// A logical upstream service reachable behind a path prefix.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Inbound path prefix, e.g. `/admin`. Stripped before forwarding.
    pub prefix: String,
    /// Base URL of the upstream, e.g. `http://admin-service:3001`.
    pub base_url: String,
    /// Ordered candidate health paths. Empty means the global defaults.
    #[serde(default)]
    pub health_paths: Vec<String>,
}

impl ServiceConfig {
    pub fn new(prefix: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            base_url: base_url.into(),
            health_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Fixed timeout applied to every single upstream attempt.
    pub upstream_ms: u64,
    /// Outward-facing bound on the whole dispatch, retries included. Must exceed
    /// [`GatewayConfig::worst_case_dispatch`] or the stale fallback never gets to run.
    pub gateway_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_ms: 5_000,
            gateway_ms: 20_000,
        }
    }
}

impl TimeoutConfig {
    pub fn upstream(&self) -> Duration {
        Duration::from_millis(self.upstream_ms)
    }

    pub fn gateway(&self) -> Duration {
        Duration::from_millis(self.gateway_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts for idempotent methods. Mutating methods always get exactly one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction (0.0..=1.0) of each delay added as random jitter.
    pub jitter_ratio: f64,
}

impl RetryConfig {
    /// Longest total time a fully retried request spends in backoff, jitter included.
    pub fn max_total_backoff(&self) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let cap = Duration::from_millis(self.max_delay_ms);
        let jitter = if (0.0..=1.0).contains(&self.jitter_ratio) {
            self.jitter_ratio
        } else {
            1.0
        };
        let with_jitter = |delay: Duration| delay.saturating_add(delay.mul_f64(jitter));

        let attempts = self.max_attempts.max(1);
        let mut total = Duration::ZERO;
        for k in 1..attempts {
            let delay = base.saturating_mul(2u32.saturating_pow(k - 1)).min(cap);
            if delay == cap {
                // Every remaining gap sleeps the capped delay
                return total.saturating_add(with_jitter(cap).saturating_mul(attempts - k));
            }
            total = total.saturating_add(with_jitter(delay));
        }
        total
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter_ratio: 0.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub window_ms: u64,
    pub failure_threshold_percent: u32,
    pub minimum_samples: u32,
    pub half_open_after_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            failure_threshold_percent: 50,
            minimum_samples: 5,
            half_open_after_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub fresh_ttl_ms: u64,
    pub stale_ttl_ms: u64,
    pub max_entry_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            fresh_ttl_ms: 60_000,
            stale_ttl_ms: 300_000,
            max_entry_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub paths: Vec<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_ms: 2_000,
            paths: default_health_paths(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Address for the Prometheus scrape endpoint. Disabled when unset.
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Services keyed by logical name (e.g. `admin`, `medico`).
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Upper bound of one dispatch: every attempt runs into the upstream timeout and
    /// every backoff sleeps its longest delay.
    pub fn worst_case_dispatch(&self) -> Duration {
        self.timeouts
            .upstream()
            .saturating_mul(self.retry.max_attempts.max(1))
            .saturating_add(self.retry.max_total_backoff())
    }

    /// Health paths for a service, falling back to the global list.
    pub fn health_paths_for<'a>(&'a self, service: &'a ServiceConfig) -> &'a [String] {
        if service.health_paths.is_empty() {
            &self.health_check.paths
        } else {
            &service.health_paths
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
            services: HashMap::new(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            health_check: HealthCheckConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by embedders and tests.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    listen_addr: Option<String>,
    services: HashMap<String, ServiceConfig>,
    timeouts: Option<TimeoutConfig>,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    cache: Option<CacheConfig>,
    health_check: Option<HealthCheckConfig>,
}

impl GatewayConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Register a service under `name`
    pub fn service(mut self, name: impl Into<String>, config: ServiceConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }

    pub fn timeouts(mut self, config: TimeoutConfig) -> Self {
        self.timeouts = Some(config);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.services.is_empty() {
            return Err("At least one service must be configured".to_string());
        }

        Ok(GatewayConfig {
            listen_addr: self.listen_addr.unwrap_or_else(default_listen_addr),
            max_body_bytes: default_max_body_bytes(),
            services: self.services,
            timeouts: self.timeouts.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            health_check: self.health_check.unwrap_or_default(),
            observability: ObservabilityConfig::default(),
        })
    }
}
