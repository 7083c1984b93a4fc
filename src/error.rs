/// Request-level error taxonomy for the gateway pipeline
use http::StatusCode;
use thiserror::Error;

use crate::forwarder::ForwardError;

/// Errors that terminate a request before a backend response is produced.
///
/// Every variant maps to exactly one outbound status code. None of them are
/// retried by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No configured route matches the request
    #[error("no route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The inbound request could not be normalized
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The authorization delegate rejected the caller
    #[error("{reason}")]
    Unauthorized { status: StatusCode, reason: String },

    /// The caller exhausted its quota for the current window
    #[error("rate limit exceeded ({limit} requests per window), resets at {reset_at}")]
    RateLimited {
        limit: u64,
        reset_at: u64,
        retry_after_secs: u64,
    },

    /// The backend call failed
    #[error(transparent)]
    Backend(#[from] ForwardError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized { status, .. } => *status,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Backend(ForwardError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short machine-readable error code for response bodies and metric tags
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::MalformedRequest(_) => "malformed_request",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Backend(e) => e.kind(),
        }
    }
}
