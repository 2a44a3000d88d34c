pub mod config;
pub mod error;
pub mod gateway;
pub mod liveness;
pub mod logging;
pub mod routes;
pub mod rpc;
pub mod state;
pub mod test_util;

pub use config::{Config, GatewayConfig, RelayConfig};
pub use error::BrokerError;
pub use gateway::{FanOut, Scheduler, WorkerRegistry};
pub use rpc::RelayRegistry;
pub use state::{DrainCheck, HealthCheck, ServerState, ServerStatus};

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use gateway::ProxyTimeouts;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub server_state: Arc<ServerState>,
    /// Connected workers.
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Scheduler,
    /// Bulk embeddings engine.
    pub fanout: FanOut,
    /// Connected JSON-RPC relay clients.
    pub relays: Arc<RelayRegistry>,
    /// Dependencies gating `/healthz`.
    pub health_checks: Vec<Arc<dyn HealthCheck>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let server_state = Arc::new(ServerState::new());
        let registry = Arc::new(WorkerRegistry::new(server_state.clone()));
        let fanout = FanOut::new(
            registry.clone(),
            ProxyTimeouts::from(&config.gateway),
            config.gateway.max_parallel_embeddings,
        );
        Self {
            scheduler: Scheduler::new(registry.clone()),
            fanout,
            registry,
            relays: Arc::new(RelayRegistry::new()),
            health_checks: vec![Arc::new(DrainCheck(server_state.clone()))],
            server_state,
            config,
        }
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    /// Requests still running on workers and relays.
    pub async fn in_flight(&self) -> usize {
        self.registry.total_in_flight().await as usize + self.relays.total_inflight().await
    }

    /// Stop accepting work and wait up to `timeout` for in-flight requests.
    /// Returns `true` if everything finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        if self.server_state.start_drain() {
            tracing::info!(timeout_secs = timeout.as_secs(), "Draining");
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = self.in_flight().await;
            if remaining == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(in_flight = remaining, "Drain timeout, abandoning requests");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Disconnect every worker and relay client.
    pub async fn disconnect_all(&self) {
        let workers = self.registry.close_all().await;
        let relays = self.relays.close_all().await;
        tracing::info!(workers, relays, "Closed all connections");
    }
}

/// Build the complete HTTP surface.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .merge(routes::chat::router(state.clone()))
        .merge(routes::embeddings::router(state.clone()))
        .merge(routes::models::router(state.clone()));

    let relay = Router::new()
        .route("/relay/:client_id", post(rpc::relay_rpc_handler))
        .with_state(state.clone());

    let guarded = Router::new()
        .nest("/v1", v1)
        .merge(relay)
        .layer(middleware::from_fn_with_state(state.clone(), routes::require_api_key))
        .layer(middleware::from_fn_with_state(state.clone(), routes::reject_when_draining));

    Router::new()
        .route("/ws/worker", get(gateway::worker_ws_handler))
        .route("/ws/relay", get(rpc::relay_ws_handler))
        .with_state(state.clone())
        .merge(guarded)
        .merge(routes::health::router(state.clone()))
        .merge(routes::state::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
