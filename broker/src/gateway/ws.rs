//! WebSocket handler for worker connections.
//!
//! Each connection gets one reader (this task) and one writer task draining
//! the worker's bounded outbound queue, so frames are never interleaved.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use workpool_common::{BrokerMessage, RegisterAck, RegisterMessage, WorkerMessage};

use super::registry::{Capabilities, Worker, WorkerRegistry};
use crate::error::BrokerError;
use crate::AppState;

/// WebSocket upgrade handler for `/ws/worker`.
pub async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if state.server_state.is_draining() {
        return BrokerError::Draining.into_response();
    }
    tracing::debug!("Worker connection attempt from {}", addr);
    ws.on_upgrade(move |socket| handle_worker(socket, state, addr))
}

/// Handle an individual worker connection.
async fn handle_worker(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let registration_timeout = Duration::from_secs(state.config.gateway.registration_timeout_secs);
    let registration = match timeout(registration_timeout, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<WorkerMessage>(&text) {
            Ok(WorkerMessage::Register(reg)) => reg,
            Ok(_) | Err(_) => {
                tracing::warn!("Expected register frame from {}", addr);
                let _ = close_with(&mut ws_tx, close_code::POLICY, "expected register").await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!("Expected text frame for registration from {}", addr);
            let _ = close_with(&mut ws_tx, close_code::POLICY, "expected register").await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!("WebSocket error during registration from {}: {}", addr, e);
            return;
        }
        Ok(None) => {
            tracing::info!("Connection closed before registration from {}", addr);
            return;
        }
        Err(_) => {
            tracing::warn!("Registration timeout from {}", addr);
            let _ = close_with(&mut ws_tx, close_code::POLICY, "registration timeout").await;
            return;
        }
    };

    if let Err(msg) = validate_registration(&registration, &state.config.auth.client_key) {
        tracing::warn!("Registration rejected from {}: {}", addr, msg);
        let _ = close_with(&mut ws_tx, close_code::POLICY, msg).await;
        return;
    }

    let id = registration
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let name = display_name(&registration, addr);

    if let Err(e) = send_message(&mut ws_tx, &RegisterAck { id: id.clone() }).await {
        tracing::error!(worker_id = %id, "Failed to send register ack: {}", e);
        return;
    }

    let (tx, rx) = mpsc::channel::<BrokerMessage>(state.config.gateway.outbound_queue_capacity.max(1));
    let worker = Arc::new(Worker::new(
        id.clone(),
        name.clone(),
        Some(addr.ip()),
        Capabilities {
            labels: registration.models.clone().unwrap_or_default(),
            max_concurrency: registration.max_concurrency.unwrap_or(0),
            preferred_batch_size: registration.batch_size(),
        },
        tx,
    ));
    state.registry.add(worker.clone()).await;

    tracing::info!(
        worker_id = %id,
        worker_name = %name,
        models = worker.labels().len(),
        max_concurrency = worker.max_concurrency(),
        version = registration.version.as_deref().unwrap_or("unknown"),
        "Worker registered from {}",
        addr
    );

    let writer = tokio::spawn(write_loop(ws_tx, rx, id.clone()));

    loop {
        tokio::select! {
            _ = worker.closed() => {
                tracing::info!(worker_id = %id, "Closing worker connection");
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_worker_frame(text.as_bytes(), &worker, &state.registry).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    handle_worker_frame(&data, &worker, &state.registry).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(worker_id = %id, "Worker closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(worker_id = %id, "WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    state.registry.remove_connection(&worker).await;
    writer.abort();

    tracing::info!(worker_id = %id, "Worker disconnected");
}

/// Drain an outbound queue onto the socket.
pub(crate) async fn write_loop<S, T>(mut sink: S, mut rx: mpsc::Receiver<T>, conn_id: String)
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    T: Serialize,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = send_message(&mut sink, &msg).await {
            tracing::warn!(conn_id = %conn_id, "Failed to write frame: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

/// Check the shared key. An unconfigured key rejects workers that send one.
pub(crate) fn validate_registration(reg: &RegisterMessage, expected_key: &str) -> Result<(), &'static str> {
    let provided = reg.client_key.as_deref().unwrap_or("");
    if expected_key.is_empty() && !provided.is_empty() {
        return Err("unauthorized");
    }
    if !expected_key.is_empty() && provided != expected_key {
        return Err("unauthorized");
    }
    Ok(())
}

/// Display name: the declared name, else a short form of the id, else the remote IP.
fn display_name(reg: &RegisterMessage, addr: SocketAddr) -> String {
    if let Some(name) = reg.client_name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match reg.id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => id.chars().take(8).collect(),
        None => addr.ip().to_string(),
    }
}

async fn handle_worker_frame(data: &[u8], worker: &Worker, registry: &WorkerRegistry) {
    let msg: WorkerMessage = match serde_json::from_slice(data) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(worker_id = %worker.id, "Ignoring unparseable frame: {}", e);
            return;
        }
    };

    match msg {
        WorkerMessage::Heartbeat { .. } => {
            worker.touch();
        }
        WorkerMessage::StatusUpdate(update) => {
            tracing::debug!(
                worker_id = %worker.id,
                status = %update.status,
                max_concurrency = update.max_concurrency,
                "Status update"
            );
            if let Some(labels) = worker.apply_status(&update) {
                registry.note_labels(&labels).await;
            }
        }
        WorkerMessage::Register(_) => {
            tracing::warn!(worker_id = %worker.id, "Unexpected register frame after registration");
        }
        response => worker.deliver(response),
    }
}

/// Serialize and send one frame.
pub(crate) async fn send_message<S, T>(
    sink: &mut S,
    msg: &T,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    T: Serialize,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

/// Send a close frame with `code` and `reason`.
pub(crate) async fn close_with<S>(
    sink: &mut S,
    code: u16,
    reason: &'static str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    sink.send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    })))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: Option<&str>, name: Option<&str>, key: Option<&str>) -> RegisterMessage {
        RegisterMessage {
            id: id.map(String::from),
            client_name: name.map(String::from),
            client_key: key.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_registration_matching_key() {
        let reg = registration(Some("w"), None, Some("secret"));
        assert!(validate_registration(&reg, "secret").is_ok());
    }

    #[test]
    fn test_validate_registration_bad_key() {
        let reg = registration(Some("w"), None, Some("wrong"));
        assert_eq!(validate_registration(&reg, "secret"), Err("unauthorized"));
        let reg = registration(Some("w"), None, None);
        assert_eq!(validate_registration(&reg, "secret"), Err("unauthorized"));
    }

    #[test]
    fn test_validate_registration_unexpected_key() {
        let reg = registration(Some("w"), None, Some("secret"));
        assert_eq!(validate_registration(&reg, ""), Err("unauthorized"));
        assert!(validate_registration(&registration(None, None, None), "").is_ok());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let addr: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        assert_eq!(display_name(&registration(Some("w"), Some("gpu"), None), addr), "gpu");
        assert_eq!(
            display_name(&registration(Some("0123456789abcdef"), None, None), addr),
            "01234567"
        );
        assert_eq!(display_name(&registration(Some("short"), None, None), addr), "short");
        assert_eq!(display_name(&registration(None, None, None), addr), "10.0.0.7");
    }
}
