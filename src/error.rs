//! Error taxonomy for the broker
//!
//! `UpstreamError` covers a single call to an external service and is always
//! scoped to one candidate during selection. `BrokerError` is what callers of
//! the broker see.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;

use crate::broker::selector::CandidateFailure;

/// Failure of one call to an external collaborator (geocoder, rate service,
/// inference service, provider execution API).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamError {
    #[error("{service} unreachable: {message}")]
    Unreachable {
        service: &'static str,
        message: String,
    },

    #[error("{service} timed out after {timeout:?}")]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },

    #[error("{service} returned HTTP {status}")]
    Status { service: &'static str, status: u16 },

    #[error("{service} returned a malformed response: {message}")]
    Malformed {
        service: &'static str,
        message: String,
    },

    #[error("no location found for postal code {0:05}")]
    UnknownLocation(u32),
}

impl UpstreamError {
    /// Whether retrying the same call might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Unreachable { .. } | UpstreamError::Timeout { .. } => true,
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::Malformed { .. } | UpstreamError::UnknownLocation(_) => false,
        }
    }

    /// Classify a reqwest failure for `service`
    pub fn from_reqwest(service: &'static str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout { service, timeout }
        } else if let Some(status) = err.status() {
            UpstreamError::Status {
                service,
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            UpstreamError::Malformed {
                service,
                message: err.to_string(),
            }
        } else {
            UpstreamError::Unreachable {
                service,
                message: err.to_string(),
            }
        }
    }
}

/// Which of the two provider round-trips failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    OpenSession,
    SubmitRun,
}

impl std::fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchStage::OpenSession => write!(f, "open session"),
            DispatchStage::SubmitRun => write!(f, "submit run"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("dispatch to provider {provider_id} failed during {stage}: {source}")]
pub struct DispatchError {
    pub provider_id: String,
    pub stage: DispatchStage,
    #[source]
    pub source: UpstreamError,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] UpstreamError),

    #[error("no eligible provider ({} candidate(s) evaluated)", .failures.len())]
    NoEligibleProvider { failures: Vec<CandidateFailure> },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("selection exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("selection cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    pub fn validation(message: impl Into<String>) -> Self {
        BrokerError::Validation(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
            BrokerError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            BrokerError::NoEligibleProvider { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            BrokerError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<CandidateFailure>,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        let failures = match self {
            BrokerError::NoEligibleProvider { failures } => failures,
            _ => Vec::new(),
        };

        (
            status,
            Json(ErrorResponse {
                success: false,
                message,
                failures,
            }),
        )
            .into_response()
    }
}
