pub mod mock_peer;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::{AuthConfig, Config, GatewayConfig, LoggingConfig, RelayConfig, ServerConfig};
use crate::{build_router, AppState};

pub use mock_peer::MockPeer;

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            drain_timeout_secs: 5,
        },
        auth: AuthConfig::default(),
        gateway: GatewayConfig {
            request_timeout_secs: 5,
            request_hard_timeout_secs: 0,
            max_parallel_embeddings: 4,
            heartbeat_interval_secs: 10,
            heartbeat_expiry_secs: 30,
            outbound_queue_capacity: 32,
            registration_timeout_secs: 2,
        },
        relay: RelayConfig {
            request_timeout_secs: 5,
            max_request_bytes: 64 * 1024,
            max_response_bytes: 64 * 1024,
            heartbeat_interval_ms: 15_000,
            dead_after_ms: 45_000,
            max_concurrency_per_client: 8,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
    }
}

pub fn test_state() -> AppState {
    AppState::new(test_config())
}

/// A broker serving on an ephemeral local port.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    server: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start(config: Config) -> Self {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Listener has no address");
        let app = build_router(state.clone());
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
        });
        Self { addr, state, server }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.server.abort();
    }
}
