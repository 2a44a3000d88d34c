//! Error types for the client-facing HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors returned to HTTP clients of the gateway endpoints.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no worker available for model '{0}'")]
    NoWorker(String),

    #[error("worker is busy")]
    WorkerBusy,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("request timed out")]
    Timeout,

    #[error("broker is draining")]
    Draining,

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl BrokerError {
    /// Stable machine-readable code placed in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::NoWorker(_) => "no_worker",
            BrokerError::WorkerBusy => "worker_busy",
            BrokerError::Upstream(_) => "upstream_error",
            BrokerError::Timeout => "timeout",
            BrokerError::Draining => "draining",
            BrokerError::Unauthorized => "unauthorized",
            BrokerError::ModelNotFound(_) => "model_not_found",
            BrokerError::BadRequest(_) => "bad_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::NoWorker(_) | BrokerError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::WorkerBusy | BrokerError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BrokerError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::Unauthorized => StatusCode::UNAUTHORIZED,
            BrokerError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error_code = self.code(), "{}", self);
        } else {
            tracing::debug!(error_code = self.code(), "{}", self);
        }

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BrokerError::NoWorker("m".into()), StatusCode::NOT_FOUND, "no_worker")]
    #[case(BrokerError::WorkerBusy, StatusCode::SERVICE_UNAVAILABLE, "worker_busy")]
    #[case(BrokerError::Upstream("x".into()), StatusCode::BAD_GATEWAY, "upstream_error")]
    #[case(BrokerError::Timeout, StatusCode::GATEWAY_TIMEOUT, "timeout")]
    #[case(BrokerError::Draining, StatusCode::SERVICE_UNAVAILABLE, "draining")]
    #[case(BrokerError::Unauthorized, StatusCode::UNAUTHORIZED, "unauthorized")]
    #[case(BrokerError::ModelNotFound("m".into()), StatusCode::NOT_FOUND, "model_not_found")]
    #[case(BrokerError::BadRequest("x".into()), StatusCode::BAD_REQUEST, "bad_request")]
    fn test_status_and_code(#[case] err: BrokerError, #[case] status: StatusCode, #[case] code: &str) {
        assert_eq!(err.status(), status);
        assert_eq!(err.code(), code);
    }

    #[tokio::test]
    async fn test_json_body() {
        let response = BrokerError::WorkerBusy.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "worker_busy");
        assert_eq!(body["message"], "worker is busy");
    }
}
