//! GET /state: live view of workers, relays and sessions.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::gateway::WorkerSnapshot;
use crate::rpc::registry::{RelaySnapshot, SessionSnapshot};
use crate::state::ServerStatus;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub status: ServerStatus,
    pub workers: Vec<WorkerSnapshot>,
    pub clients: Vec<RelaySnapshot>,
    pub sessions: Vec<SessionSnapshot>,
}

async fn get_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let relays = state.relays.snapshot().await;
    Json(StateResponse {
        status: state.server_state.status(),
        workers: state.registry.snapshot().await,
        clients: relays.clients,
        sessions: relays.sessions,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/state", get(get_state)).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::registry::tests::test_worker;
    use crate::rpc::registry::tests::test_relay;
    use crate::test_util::test_state;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_state_snapshot() {
        let state = Arc::new(test_state());
        let (worker, _rx1) = test_worker("w", &["m"], 2);
        state.registry.add(worker.clone()).await;
        worker.inc_in_flight();
        let (relay, _rx2) = test_relay("r");
        state.relays.insert(relay.clone()).await;
        let _session = relay.open_session("tools/call", 0).unwrap();

        let response = router(state)
            .oneshot(Request::get("/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["status"], "ready");
        assert_eq!(json["workers"][0]["id"], "w");
        assert_eq!(json["workers"][0]["in_flight"], 1);
        assert_eq!(json["clients"][0]["status"], "active");
        assert_eq!(json["sessions"][0]["method"], "tools/call");
        assert_eq!(json["sessions"][0]["state"], "opening");
    }
}
