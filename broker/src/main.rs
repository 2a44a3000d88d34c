use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use workpool_broker::liveness::spawn_worker_pruner;
use workpool_broker::logging::init_tracing;
use workpool_broker::{build_router, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    init_tracing(&config.logging.level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting workpool broker");

    let state = Arc::new(AppState::new(config.clone()));

    let pruner = spawn_worker_pruner(
        state.registry.clone(),
        Duration::from_secs(config.gateway.heartbeat_interval_secs),
        config.gateway.heartbeat_expiry(),
    );

    let app = build_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown(state.clone(), drain_timeout))
        .await?;

    pruner.abort();
    tracing::info!("Shut down");
    Ok(())
}

/// Resolves once a signal arrived and in-flight work is done (or timed out).
/// Long-lived sockets are closed last so the server can finish.
async fn shutdown(state: Arc<AppState>, drain_timeout: Duration) {
    wait_for_signal().await;
    state.drain(drain_timeout).await;
    state.disconnect_all().await;
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
