//! Failure classification for upstream attempts.
//!
//! Every attempt ends as an [`AttemptOutcome`]: either a response the caller should see,
//! or an [`UpstreamFailure`] tagged with an [`ErrorKind`]. The breaker and the retry loop
//! only ever look at the [`Classification`] derived from it.
use std::fmt;

use hyper::StatusCode;
use serde::Serialize;

use crate::ports::http_client::{ForwardResponse, HttpClientError, HttpClientResult};

/// Verdict used for breaker accounting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    RetryableFailure,
    NonRetryableFailure,
}

impl Classification {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableFailure)
    }
}

/// Normalized failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// DNS, connect, reset
    Network,
    Timeout,
    /// 5xx and 429
    UpstreamServer,
    /// 4xx; a valid application answer, never a health signal
    UpstreamClient,
    /// Raised without any network attempt
    CircuitOpen,
    Unknown,
}

impl ErrorKind {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(self) -> &'static str {
        match self {
            Self::Network => "UPSTREAM_UNAVAILABLE",
            Self::Timeout => "UPSTREAM_TIMEOUT",
            Self::UpstreamServer => "UPSTREAM_ERROR",
            Self::UpstreamClient => "UPSTREAM_CLIENT_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A failed attempt, carrying whatever the upstream managed to say.
#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    pub kind: ErrorKind,
    pub detail: String,
    /// Status of the failing response, when one was received.
    pub status: Option<StatusCode>,
    pub retryable: bool,
}

impl UpstreamFailure {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status: None,
            retryable: true,
        }
    }

    pub fn classification(&self) -> Classification {
        if self.retryable {
            Classification::RetryableFailure
        } else {
            Classification::NonRetryableFailure
        }
    }
}

/// Result of a single upstream attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success(ForwardResponse),
    Failure(UpstreamFailure),
}

impl AttemptOutcome {
    /// Classify the raw client result of one attempt.
    pub fn from_result(result: HttpClientResult<ForwardResponse>) -> Self {
        match result {
            Ok(response) => match classify_status(response.status) {
                Classification::Success => Self::Success(response),
                _ => {
                    let kind = status_error_kind(response.status);
                    Self::Failure(UpstreamFailure {
                        kind,
                        detail: format!("upstream answered {}", response.status),
                        status: Some(response.status),
                        retryable: true,
                    })
                }
            },
            Err(err) => Self::Failure(UpstreamFailure {
                kind: error_kind(&err),
                detail: err.to_string(),
                status: None,
                retryable: classify_error(&err).is_retryable(),
            }),
        }
    }

    pub fn classification(&self) -> Classification {
        match self {
            Self::Success(_) => Classification::Success,
            Self::Failure(failure) => failure.classification(),
        }
    }
}

/// Classify a received HTTP status.
///
/// 408, 429 and every 5xx are retryable; any other status is a success for accounting,
/// 4xx included.
pub fn classify_status(status: StatusCode) -> Classification {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Classification::RetryableFailure
        }
        s if s.is_server_error() => Classification::RetryableFailure,
        _ => Classification::Success,
    }
}

/// Classify a transport-level error.
pub fn classify_error(err: &HttpClientError) -> Classification {
    match err {
        HttpClientError::Connection(_)
        | HttpClientError::Dns(_)
        | HttpClientError::Timeout(_)
        | HttpClientError::Body(_) => Classification::RetryableFailure,
        // The request itself is malformed; sending it again cannot help
        HttpClientError::InvalidRequest(_) => Classification::NonRetryableFailure,
        _ => Classification::RetryableFailure,
    }
}

/// Error kind for a received status.
pub fn status_error_kind(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::UpstreamServer,
        s if s.is_server_error() => ErrorKind::UpstreamServer,
        s if s.is_client_error() => ErrorKind::UpstreamClient,
        _ => ErrorKind::Unknown,
    }
}

/// Error kind for a transport-level error.
pub fn error_kind(err: &HttpClientError) -> ErrorKind {
    match err {
        HttpClientError::Connection(_) | HttpClientError::Dns(_) | HttpClientError::Body(_) => {
            ErrorKind::Network
        }
        HttpClientError::Timeout(_) => ErrorKind::Timeout,
        _ => ErrorKind::Unknown,
    }
}
