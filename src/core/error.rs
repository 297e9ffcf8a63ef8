//! Dispatch error taxonomy.
//!
//! Every terminal outcome of the dispatch pipeline maps to exactly one
//! variant here, and every variant maps to a distinct boundary status
//! code. Nothing in the pipeline swallows an error silently.
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::ports::http_client::HttpClientError;

/// Errors produced by the dispatch pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// No route definition matched the request path/method.
    #[error("no route matched path '{path}'")]
    RouteNotFound { path: String },

    /// The client's token bucket for this route is empty.
    #[error("rate limit exceeded for route '{route_id}'")]
    RateLimited { route_id: String },

    /// The circuit breaker for the target service is open.
    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    /// The service is known but has no instance eligible for selection.
    #[error("no healthy instance for service '{service}'")]
    NoHealthyInstance { service: String },

    /// A route referenced a service the registry does not know.
    /// Startup validation makes this unreachable unless the registry and
    /// route table have diverged mid-reload.
    #[error("service '{service}' is not registered")]
    UnknownService { service: String },

    /// The upstream did not answer within the per-route timeout.
    #[error("upstream call to '{service}' timed out after {timeout:?}")]
    UpstreamTimeout { service: String, timeout: Duration },

    /// Transport-level failure talking to the upstream (after any retry).
    #[error("upstream transport error for service '{service}': {source}")]
    UpstreamTransport {
        service: String,
        #[source]
        source: HttpClientError,
    },
}

impl DispatchError {
    /// Boundary status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::CircuitOpen { .. }
            | DispatchError::NoHealthyInstance { .. }
            | DispatchError::UnknownService { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::RouteNotFound { .. } => "route_not_found",
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::NoHealthyInstance { .. } => "no_healthy_instance",
            DispatchError::UnknownService { .. } => "unknown_service",
            DispatchError::UpstreamTimeout { .. } => "upstream_timeout",
            DispatchError::UpstreamTransport { .. } => "upstream_transport",
        }
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
