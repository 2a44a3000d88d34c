//! POST /v1/embeddings.
//!
//! Array input is fanned out across workers; anything else is relayed to a
//! single worker as-is.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::Value;

use crate::error::BrokerError;
use crate::gateway::fanout::EMBEDDINGS_PATH;
use crate::gateway::{forward_headers, Dispatch, EmbeddingJob, ProxyRequest, ProxyTimeouts};
use crate::AppState;

/// Split a request into a fan-out job, or `None` when `input` is not a
/// non-empty array.
fn into_job(payload: Value, headers: &HeaderMap) -> Result<Option<EmbeddingJob>, BrokerError> {
    let Value::Object(mut base) = payload else {
        return Err(BrokerError::BadRequest("expected a JSON object".to_string()));
    };
    let model = base
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| BrokerError::BadRequest("missing model".to_string()))?
        .to_string();

    match base.get("input") {
        Some(Value::Array(items)) if !items.is_empty() => {}
        _ => return Ok(None),
    }
    let inputs = match base.remove("input") {
        Some(Value::Array(items)) => items,
        _ => return Ok(None),
    };

    Ok(Some(EmbeddingJob {
        model,
        base,
        inputs,
        headers: forward_headers(headers),
    }))
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BrokerError> {
    super::require_json(&headers)?;
    let payload: Value = serde_json::from_slice(&body).map_err(|e| BrokerError::BadRequest(e.to_string()))?;

    match into_job(payload, &headers)? {
        Some(job) => match state.fanout.run(&job).await {
            Ok(merged) => Ok(Json(merged).into_response()),
            Err(err) => Ok(err.into_response()),
        },
        None => {
            let (model, _) = super::chat::RoutingFields::parse(&body)?;
            let lease = state.scheduler.pick_worker(&model).await?;
            let request = ProxyRequest::post(EMBEDDINGS_PATH, &headers, false, body.to_vec());
            let dispatch = Dispatch::start(
                lease,
                request,
                ProxyTimeouts::from(&state.config.gateway),
                &model,
            )?;
            Ok(dispatch.into_response().await)
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/embeddings", post(embeddings))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_array_input_becomes_job() {
        let payload = json!({"model": "emb", "input": ["a", "b"], "dimensions": 8});
        let job = into_job(payload, &HeaderMap::new()).unwrap().unwrap();
        assert_eq!(job.model, "emb");
        assert_eq!(job.inputs, vec![json!("a"), json!("b")]);
        assert!(!job.base.contains_key("input"));
        assert_eq!(job.base["dimensions"], json!(8));
    }

    #[test]
    fn test_scalar_or_empty_input_is_relayed() {
        let scalar = json!({"model": "emb", "input": "hello"});
        assert!(into_job(scalar, &HeaderMap::new()).unwrap().is_none());
        let empty = json!({"model": "emb", "input": []});
        assert!(into_job(empty, &HeaderMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_missing_model_rejected() {
        let payload = json!({"input": ["a"]});
        assert!(matches!(
            into_job(payload, &HeaderMap::new()),
            Err(BrokerError::BadRequest(_))
        ));
    }
}
