//! WebSocket handler for relay clients.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use workpool_common::{RegisterAck, RegisterMessage, SessionFrame};

use super::registry::Relay;
use crate::error::BrokerError;
use crate::gateway::ws::{close_with, send_message, validate_registration, write_loop};
use crate::liveness::relay_ping_loop;
use crate::AppState;

/// WebSocket upgrade handler for `/ws/relay`.
pub async fn relay_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if state.server_state.is_draining() {
        return BrokerError::Draining.into_response();
    }
    tracing::debug!("Relay connection attempt from {}", addr);
    ws.on_upgrade(move |socket| handle_relay(socket, state, addr))
}

/// Accept `{"type":"register",...}` or a bare registration object.
fn parse_register(text: &str) -> Option<RegisterMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("type").and_then(Value::as_str) {
        None | Some("register") => serde_json::from_value(value).ok(),
        Some(_) => None,
    }
}

async fn handle_relay(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let registration_timeout = Duration::from_secs(state.config.gateway.registration_timeout_secs);
    let registration = match timeout(registration_timeout, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match parse_register(&text) {
            Some(reg) => reg,
            None => {
                tracing::warn!("Invalid relay registration from {}", addr);
                let _ = close_with(&mut ws_tx, close_code::POLICY, "invalid register").await;
                return;
            }
        },
        Ok(Some(Ok(_))) | Ok(Some(Err(_))) | Ok(None) => {
            let _ = close_with(&mut ws_tx, close_code::POLICY, "expected register").await;
            return;
        }
        Err(_) => {
            tracing::warn!("Relay registration timeout from {}", addr);
            let _ = close_with(&mut ws_tx, close_code::POLICY, "registration timeout").await;
            return;
        }
    };

    if let Err(msg) = validate_registration(&registration, &state.config.auth.client_key) {
        tracing::warn!("Relay rejected from {}: {}", addr, msg);
        let _ = close_with(&mut ws_tx, close_code::POLICY, msg).await;
        return;
    }

    let client_id = registration
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let name = registration.client_name.clone().unwrap_or_default();

    let (tx, rx) = mpsc::channel::<SessionFrame>(state.config.gateway.outbound_queue_capacity.max(1));
    let relay = Arc::new(Relay::new(client_id.clone(), name.clone(), tx));
    if !state.relays.insert(relay.clone()).await {
        tracing::warn!(client_id = %client_id, "Relay id already connected");
        let _ = close_with(&mut ws_tx, close_code::POLICY, "id in use").await;
        return;
    }

    if let Err(e) = send_message(&mut ws_tx, &RegisterAck { id: client_id.clone() }).await {
        tracing::error!(client_id = %client_id, "Failed to send register ack: {}", e);
        state.relays.remove_connection(&relay).await;
        return;
    }
    tracing::info!(client_id = %client_id, client_name = %name, "Relay registered from {}", addr);

    let writer = tokio::spawn(write_loop(ws_tx, rx, client_id.clone()));
    let pinger = tokio::spawn(relay_ping_loop(
        relay.clone(),
        Duration::from_millis(state.config.relay.heartbeat_interval_ms),
        state.config.relay.dead_after(),
    ));

    loop {
        tokio::select! {
            _ = relay.closed() => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_relay_frame(text.as_bytes(), &relay).await,
                Some(Ok(Message::Binary(data))) => handle_relay_frame(&data, &relay).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => relay.touch(),
                Some(Err(e)) => {
                    tracing::warn!(client_id = %client_id, "WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    state.relays.remove_connection(&relay).await;
    pinger.abort();
    writer.abort();
    tracing::info!(client_id = %client_id, "Relay disconnected");
}

async fn handle_relay_frame(data: &[u8], relay: &Relay) {
    relay.touch();
    let frame: SessionFrame = match serde_json::from_slice(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(client_id = %relay.id, "Ignoring unparseable frame: {}", e);
            return;
        }
    };
    match frame {
        SessionFrame::Pong => {}
        SessionFrame::Ping => {
            if let Err(e) = relay.send(SessionFrame::Pong) {
                tracing::debug!(client_id = %relay.id, "Pong not queued: {}", e);
            }
        }
        frame => relay.deliver(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::tests::test_relay;

    #[test]
    fn test_parse_register_forms() {
        let reg = parse_register(r#"{"type":"register","id":"r1","client_key":"k"}"#).unwrap();
        assert_eq!(reg.id.as_deref(), Some("r1"));
        assert_eq!(reg.client_key.as_deref(), Some("k"));

        let bare = parse_register(r#"{"id":"r2","client_name":"laptop"}"#).unwrap();
        assert_eq!(bare.client_name.as_deref(), Some("laptop"));

        assert!(parse_register(r#"{"type":"rpc","sid":"x"}"#).is_none());
        assert!(parse_register("not json").is_none());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (relay, mut rx) = test_relay("r");
        handle_relay_frame(br#"{"t":"ping"}"#, &relay).await;
        assert_eq!(rx.try_recv().unwrap(), SessionFrame::Pong);
    }

    #[tokio::test]
    async fn test_session_frames_delivered() {
        let (relay, _rx) = test_relay("r");
        let mut session = relay.open_session("tools/list", 0).unwrap();
        let frame = format!(r#"{{"t":"open.ok","sid":"{}"}}"#, session.sid());
        handle_relay_frame(frame.as_bytes(), &relay).await;
        assert!(matches!(session.recv().await, Some(SessionFrame::OpenOk { .. })));
    }
}
