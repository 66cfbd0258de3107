use std::{fmt, str::FromStr};

use hyper::Uri;
use thiserror::Error;

/// Errors related to upstream service addressing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("Invalid service URL: {0}")]
    InvalidUrl(String),

    #[error("Cannot address upstream path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Result type for service addressing operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// A type-safe upstream base URL (`http` or `https`, no trailing slash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceUrl {
    url: String,
    is_secure: bool,
}

impl ServiceUrl {
    /// Creates a new ServiceUrl if the provided string is an absolute http(s) URL
    pub fn new(url: &str) -> ServiceResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ServiceError::InvalidUrl(format!("{url}: {e}")))?;

        let is_secure = match parsed.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(ServiceError::InvalidUrl(format!(
                    "Service URL must use http:// or https://, got '{other}' in {url}"
                )));
            }
        };
        if parsed.host().is_none() {
            return Err(ServiceError::InvalidUrl(format!("{url} has no host")));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(ServiceError::InvalidUrl(format!(
                "{url} must not carry a query or fragment"
            )));
        }

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            is_secure,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Absolute URI for `path_and_query` (must start with `/`) under this base.
    pub fn join(&self, path_and_query: &str) -> ServiceResult<Uri> {
        if !path_and_query.starts_with('/') {
            return Err(ServiceError::InvalidPath {
                path: path_and_query.to_string(),
                reason: "must start with '/'".to_string(),
            });
        }
        format!("{}{}", self.url, path_and_query)
            .parse::<Uri>()
            .map_err(|e| ServiceError::InvalidPath {
                path: path_and_query.to_string(),
                reason: e.to_string(),
            })
    }
}

impl FromStr for ServiceUrl {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceUrl::new(s)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        let plain = ServiceUrl::new("http://admin-service:3001/").unwrap();
        assert_eq!(plain.as_str(), "http://admin-service:3001");
        assert!(!plain.is_secure());

        let secure: ServiceUrl = "https://medico.example.org/api".parse().unwrap();
        assert!(secure.is_secure());
        assert_eq!(secure.to_string(), "https://medico.example.org/api");
    }

    #[test]
    fn rejects_other_schemes_and_queries() {
        assert!(ServiceUrl::new("ftp://files.local").is_err());
        assert!(ServiceUrl::new("admin-service:3001").is_err());
        assert!(ServiceUrl::new("http://admin?x=1").is_err());
    }

    #[test]
    fn join_appends_path_and_query() {
        let base = ServiceUrl::new("http://medico:3002/api").unwrap();
        let uri = base.join("/physicians?specialty=3").unwrap();
        assert_eq!(uri.to_string(), "http://medico:3002/api/physicians?specialty=3");
        assert!(base.join("physicians").is_err());
    }
}
