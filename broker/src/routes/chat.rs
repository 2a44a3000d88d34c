use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Response,
    routing::post,
    Router,
};
use serde::Deserialize;

use crate::error::BrokerError;
use crate::gateway::{Dispatch, ProxyRequest, ProxyTimeouts};
use crate::AppState;

/// Worker path for chat completions.
const CHAT_PATH: &str = "/chat/completions";

/// The only fields the broker reads from a completion request.
#[derive(Debug, Deserialize)]
pub(crate) struct RoutingFields {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl RoutingFields {
    pub(crate) fn parse(body: &[u8]) -> Result<(String, bool), BrokerError> {
        let fields: RoutingFields =
            serde_json::from_slice(body).map_err(|e| BrokerError::BadRequest(e.to_string()))?;
        let model = fields
            .model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| BrokerError::BadRequest("missing model".to_string()))?;
        Ok((model, fields.stream))
    }
}

/// POST /v1/chat/completions - OpenAI-compatible chat endpoint, proxied to a worker
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BrokerError> {
    super::require_json(&headers)?;
    let (model, stream) = RoutingFields::parse(&body)?;

    let lease = state.scheduler.pick_worker(&model).await?;
    let request = ProxyRequest::post(CHAT_PATH, &headers, stream, body.to_vec());
    let dispatch = Dispatch::start(
        lease,
        request,
        ProxyTimeouts::from(&state.config.gateway),
        &model,
    )?;
    Ok(dispatch.into_response().await)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .with_state(state)
}
