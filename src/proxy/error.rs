//! Proxy error types and response handling
//!
//! The error taxonomy maps onto HTTP statuses: client mistakes are 4xx,
//! a process that cannot be made Ready is 503, upstream transport trouble
//! is 502, and internal lifecycle conflicts are 500. Everything that
//! happens after the first response byte is logged instead of surfaced.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use thiserror::Error;

use crate::process::ProcessError;

/// Errors that can occur before any bytes reach the client
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Client(String),

    #[error("missing or invalid API key")]
    Auth,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    SleepNotSupported(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Concurrency(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Lifecycle(String),
}

impl From<ProcessError> for ProxyError {
    fn from(err: ProcessError) -> Self {
        match &err {
            ProcessError::UnknownModel { .. } => ProxyError::Client(err.to_string()),
            ProcessError::ConcurrencyRejected { .. } => ProxyError::Concurrency(err.to_string()),
            ProcessError::Upstream { .. } => ProxyError::Upstream(err.to_string()),
            ProcessError::Lifecycle { .. } | ProcessError::ResponseBuild { .. } => {
                ProxyError::Lifecycle(err.to_string())
            }
            // Everything that kept the process from reaching Ready
            ProcessError::Spawn { .. }
            | ProcessError::HealthCheckTimeout { .. }
            | ProcessError::StartAborted { .. }
            | ProcessError::StartFailedElsewhere { .. }
            | ProcessError::SleepFailed { .. }
            | ProcessError::WakeFailed { .. }
            | ProcessError::Unavailable { .. } => ProxyError::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::Client(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::Auth => (
                StatusCode::UNAUTHORIZED,
                "missing or invalid API key".to_string(),
            ),
            ProxyError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ProxyError::SleepNotSupported(msg) => (StatusCode::CONFLICT, msg),
            ProxyError::Unavailable(msg) | ProxyError::Concurrency(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ProxyError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ProxyError::Lifecycle(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::error!("proxy error: {} - {}", status, message);

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_else(|_| {
                Response::new(Body::from("internal error building error response"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_errors_map_to_statuses() {
        let unknown = ProxyError::from(ProcessError::UnknownModel {
            model: "x".into(),
        });
        assert!(matches!(unknown, ProxyError::Client(_)));

        let busy = ProxyError::from(ProcessError::ConcurrencyRejected {
            model: "x".into(),
        });
        assert!(matches!(busy, ProxyError::Concurrency(_)));

        let timeout = ProxyError::from(ProcessError::HealthCheckTimeout {
            model: "x".into(),
            timeout_secs: 15,
        });
        assert!(matches!(timeout, ProxyError::Unavailable(_)));
    }

    #[test]
    fn responses_carry_expected_status() {
        let resp = ProxyError::Client("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ProxyError::Auth.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = ProxyError::SleepNotSupported("no".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ProxyError::Unavailable("down".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = ProxyError::Upstream("gone".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
