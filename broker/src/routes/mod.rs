//! Client-facing HTTP routes.

pub mod chat;
pub mod embeddings;
pub mod health;
pub mod models;
pub mod state;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::{AUTHORIZATION, CONTENT_TYPE},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::BrokerError;
use crate::AppState;

/// Require `Authorization: Bearer <api_key>` when an API key is configured.
pub async fn require_api_key(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let expected = &state.config.auth.api_key;
    if expected.is_empty() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if provided != Some(expected.as_str()) {
        return BrokerError::Unauthorized.into_response();
    }
    next.run(request).await
}

/// Refuse new work once the broker is draining.
pub async fn reject_when_draining(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if state.server_state.is_draining() {
        return BrokerError::Draining.into_response();
    }
    next.run(request).await
}

/// Reject bodies that are not declared as JSON.
pub(crate) fn require_json(headers: &HeaderMap) -> Result<(), BrokerError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.to_ascii_lowercase().starts_with("application/json") {
        Ok(())
    } else {
        Err(BrokerError::BadRequest("content-type must be application/json".to_string()))
    }
}
