#![allow(clippy::collapsible_if)]

use std::{collections::HashMap, net::SocketAddr};

use eyre::Result;

use crate::config::models::{
    CacheConfig, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig, RetryConfig,
    ServiceConfig, TimeoutConfig,
};

/// Paths answered by the gateway itself; no service may claim them.
const RESERVED_PREFIXES: &[&str] = &["/health", "/status"];

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Prefix conflict detected: {message}")]
    PrefixConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        } else {
            let mut names: Vec<&String> = config.services.keys().collect();
            names.sort();
            for name in names {
                if let Err(mut service_errors) =
                    Self::validate_service(name, &config.services[name])
                {
                    errors.append(&mut service_errors);
                }
            }
            errors.extend(Self::check_prefix_conflicts(&config.services));
        }

        if config.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_body_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        errors.extend(Self::validate_timeouts(&config.timeouts));
        if config.timeouts.upstream_ms > 0
            && config.timeouts.gateway() <= config.worst_case_dispatch()
        {
            errors.push(ValidationError::InvalidField {
                field: "timeouts.gateway_ms".to_string(),
                message: format!(
                    "Must exceed the worst-case retry budget of {} ms ({} attempts of {} ms plus backoff)",
                    config.worst_case_dispatch().as_millis(),
                    config.retry.max_attempts.max(1),
                    config.timeouts.upstream_ms
                ),
            });
        }
        errors.extend(Self::validate_retry(&config.retry));
        errors.extend(Self::validate_circuit_breaker(&config.circuit_breaker));
        errors.extend(Self::validate_cache(&config.cache));
        errors.extend(Self::validate_health_check_config(&config.health_check));

        if let Some(addr) = &config.observability.metrics_addr {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "observability.metrics_addr".to_string(),
                    message: format!("'{addr}' is not in 'IP:PORT' format"),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(name: &str, service: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !service.prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{name}.prefix"),
                message: format!("Prefix '{}' must start with '/'", service.prefix),
            });
        } else if service.prefix.trim_end_matches('/').is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{name}.prefix"),
                message: "Prefix must name a path segment, '/' alone is reserved".to_string(),
            });
        } else if RESERVED_PREFIXES.contains(&service.prefix.trim_end_matches('/')) {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{name}.prefix"),
                message: format!("Prefix '{}' is served by the gateway itself", service.prefix),
            });
        }

        if let Err(e) = Self::validate_url(&service.base_url, &format!("services.{name}.base_url"))
        {
            errors.push(e);
        }

        for path in &service.health_paths {
            if !path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("services.{name}.health_paths"),
                    message: format!("Health path '{path}' must start with '/'"),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_timeouts(config: &TimeoutConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.upstream_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "timeouts.upstream_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.upstream_ms >= config.gateway_ms {
            errors.push(ValidationError::InvalidField {
                field: "timeouts.gateway_ms".to_string(),
                message: format!(
                    "Must be greater than timeouts.upstream_ms ({} ms)",
                    config.upstream_ms
                ),
            });
        }
        errors
    }

    fn validate_retry(config: &RetryConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.max_attempts == 0 {
            errors.push(ValidationError::InvalidField {
                field: "retry.max_attempts".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        if config.max_delay_ms < config.base_delay_ms {
            errors.push(ValidationError::InvalidField {
                field: "retry.max_delay_ms".to_string(),
                message: "Must not be smaller than retry.base_delay_ms".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&config.jitter_ratio) {
            errors.push(ValidationError::InvalidField {
                field: "retry.jitter_ratio".to_string(),
                message: "Must be between 0.0 and 1.0".to_string(),
            });
        }
        errors
    }

    fn validate_circuit_breaker(config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(1..=100).contains(&config.failure_threshold_percent) {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.failure_threshold_percent".to_string(),
                message: "Must be between 1 and 100".to_string(),
            });
        }
        if config.minimum_samples == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.minimum_samples".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }
        if config.window_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.window_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.half_open_after_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.half_open_after_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_cache(config: &CacheConfig) -> Vec<ValidationError> {
        if !config.enabled {
            return Vec::new();
        }

        let mut errors = Vec::new();
        if config.capacity == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.capacity".to_string(),
                message: "Must be at least 1 when the cache is enabled".to_string(),
            });
        }
        if config.fresh_ttl_ms > config.stale_ttl_ms {
            errors.push(ValidationError::InvalidField {
                field: "cache.stale_ttl_ms".to_string(),
                message: format!(
                    "Must be at least cache.fresh_ttl_ms ({} ms)",
                    config.fresh_ttl_ms
                ),
            });
        }
        if config.max_entry_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.max_entry_bytes".to_string(),
                message: "Must be greater than 0 when the cache is enabled".to_string(),
            });
        }
        errors
    }

    fn validate_health_check_config(config: &HealthCheckConfig) -> Vec<ValidationError> {
        if !config.enabled {
            return Vec::new();
        }

        let mut errors = Vec::new();

        if config.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.timeout_ms".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.paths.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "health_check.paths".to_string(),
                message: "At least one candidate path is required".to_string(),
            });
        }

        for path in &config.paths {
            if !path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: "health_check.paths".to_string(),
                    message: format!("Health path '{path}' must start with '/'"),
                });
            }
        }

        errors
    }

    /// Two services may not claim the same normalized prefix
    fn check_prefix_conflicts(services: &HashMap<String, ServiceConfig>) -> Vec<ValidationError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut names: Vec<&String> = services.keys().collect();
        names.sort();

        let mut errors = Vec::new();
        for name in names {
            let prefix = services[name].prefix.trim_end_matches('/');
            if let Some(other) = seen.insert(prefix, name) {
                errors.push(ValidationError::PrefixConflict {
                    message: format!(
                        "services '{other}' and '{name}' both use prefix '{prefix}'"
                    ),
                });
            }
        }
        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
