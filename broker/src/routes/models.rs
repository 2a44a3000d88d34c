//! OpenAI-compatible /v1/models endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::gateway::ModelInfo;
use crate::AppState;

/// Model entry in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl From<ModelInfo> for ModelObject {
    fn from(info: ModelInfo) -> Self {
        Self {
            id: info.id,
            object: "model".to_string(),
            created: info.created,
            owned_by: info.owners.join(","),
        }
    }
}

/// Response from /v1/models endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

/// GET /v1/models - every label any connected worker advertises
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let data = state
        .registry
        .models()
        .await
        .into_iter()
        .map(ModelObject::from)
        .collect();
    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

/// GET /v1/models/:id
async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ModelObject>, BrokerError> {
    state
        .registry
        .models()
        .await
        .into_iter()
        .find(|m| m.id == id)
        .map(|m| Json(m.into()))
        .ok_or(BrokerError::ModelNotFound(id))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/:id", get(get_model))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::registry::tests::test_worker;
    use crate::test_util::test_state;
    use axum::body::{to_bytes, Body};
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_models_response_serialization() {
        let response = ModelsResponse {
            object: "list".to_string(),
            data: vec![ModelObject {
                id: "test-model".to_string(),
                object: "model".to_string(),
                created: 1234567890,
                owned_by: "gpu-a,gpu-b".to_string(),
            }],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test-model"));
        assert!(json.contains(r#""object":"list""#));
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let state = Arc::new(test_state());
        let (a, _rx1) = test_worker("a", &["zeta", "alpha"], 1);
        let (b, _rx2) = test_worker("b", &["alpha"], 1);
        state.registry.add(a).await;
        state.registry.add(b).await;

        let app = router(state);
        let response = app
            .clone()
            .oneshot(Request::get("/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let list: ModelsResponse = serde_json::from_slice(&body).unwrap();
        let ids: Vec<_> = list.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["alpha", "zeta"]);
        assert_eq!(list.data[0].owned_by, "a,b");

        let response = app
            .clone()
            .oneshot(Request::get("/models/zeta").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/models/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "model_not_found");
    }
}
