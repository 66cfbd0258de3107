//! Core gateway routing.
//!
//! The `GatewayService` turns the immutable `GatewayConfig` into a prefix table of
//! logical services. It provides:
//! * Longest-prefix lookup on path-segment boundaries
//! * Upstream URI construction with the prefix stripped
//! * Enumeration of services for health probing and status reporting
//!
//! This layer avoids I/O so it stays fast and easily testable in isolation.
use std::sync::Arc;

use hyper::Uri;

use crate::{
    config::GatewayConfig,
    core::service::{ServiceResult, ServiceUrl},
};

/// A logical upstream as seen by the router.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub name: String,
    /// Normalized prefix without trailing slash, e.g. `/admin`.
    pub prefix: String,
    pub base_url: ServiceUrl,
    pub health_paths: Vec<String>,
}

/// Result of matching an inbound path.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    pub route: &'a ServiceRoute,
    /// Upstream path after stripping the prefix, always starting with `/`.
    pub upstream_path: String,
}

impl RouteMatch<'_> {
    /// Absolute upstream URI, carrying over the inbound query string.
    pub fn upstream_uri(&self, query: Option<&str>) -> ServiceResult<Uri> {
        match query {
            Some(q) if !q.is_empty() => self
                .route
                .base_url
                .join(&format!("{}?{q}", self.upstream_path)),
            _ => self.route.base_url.join(&self.upstream_path),
        }
    }
}

/// Prefix router over the configured services.
///
/// Construct with [`GatewayService::new`]; invalid base URLs are reported as errors
/// rather than silently dropped.
pub struct GatewayService {
    config: Arc<GatewayConfig>,
    /// Sorted by prefix length, longest first.
    routes: Vec<ServiceRoute>,
}

impl GatewayService {
    pub fn new(config: Arc<GatewayConfig>) -> ServiceResult<Self> {
        let mut routes = Vec::with_capacity(config.services.len());
        for (name, service) in &config.services {
            let base_url = ServiceUrl::new(&service.base_url)?;
            let prefix = service.prefix.trim_end_matches('/').to_string();
            routes.push(ServiceRoute {
                name: name.clone(),
                prefix,
                base_url,
                health_paths: config.health_paths_for(service).to_vec(),
            });
        }
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.name.cmp(&b.name))
        });

        for route in &routes {
            tracing::info!(
                service = %route.name,
                prefix = %route.prefix,
                upstream = %route.base_url,
                "configured service route"
            );
        }

        Ok(Self { config, routes })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Longest-prefix match. `/admin` matches `/admin` and `/admin/x`, not `/administrator`.
    pub fn find_matching_route(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            let rest = path.strip_prefix(route.prefix.as_str())?;
            if rest.is_empty() {
                Some(RouteMatch {
                    route,
                    upstream_path: "/".to_string(),
                })
            } else if rest.starts_with('/') {
                Some(RouteMatch {
                    route,
                    upstream_path: rest.to_string(),
                })
            } else {
                None
            }
        })
    }

    pub fn service(&self, name: &str) -> Option<&ServiceRoute> {
        self.routes.iter().find(|route| route.name == name)
    }

    /// All services, ordered by name.
    pub fn services(&self) -> Vec<&ServiceRoute> {
        let mut services: Vec<&ServiceRoute> = self.routes.iter().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn service_count(&self) -> usize {
        self.routes.len()
    }
}
