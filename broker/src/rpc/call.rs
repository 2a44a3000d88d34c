//! `POST /relay/:client_id`: JSON-RPC calls forwarded to a relay client.
//!
//! Every reply is JSON-RPC shaped. Broker-side failures carry their class in
//! `error.data.code`; the HTTP status tells transport problems (503, 429,
//! 413, 401, 504) apart from protocol ones (200).

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tokio::time::{timeout_at, Instant};

use workpool_common::jsonrpc::error_response;
use workpool_common::{RawPayload, RpcEnvelope, RpcErrorCode, SessionFrame};

use super::registry::SessionState;
use crate::AppState;

fn rpc_error(
    status: StatusCode,
    id: Option<&Value>,
    code: RpcErrorCode,
    message: &str,
    client_id: &str,
    req_id: &str,
) -> Response {
    tracing::warn!(client_id, req_id, error_code = %code, "{}", message);
    (status, Json(error_response(id, code, message, req_id))).into_response()
}

/// Header carrying the caller's credential for the relay's tool provider.
pub const RELAY_AUTHORIZATION: &str = "x-relay-authorization";

fn bearer(value: Option<&HeaderValue>) -> Option<String> {
    let value = value?.to_str().ok()?;
    let (scheme, token) = (value.get(..7)?, value.get(7..)?);
    scheme
        .eq_ignore_ascii_case("bearer ")
        .then(|| token.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Credential forwarded to the relay in the `open` frame.
///
/// `X-Relay-Authorization` always wins. `Authorization` is only passed on
/// when the broker has no API key of its own, since otherwise it holds that key.
fn relay_credential(headers: &HeaderMap, api_key: &str) -> Option<String> {
    if let Some(token) = bearer(headers.get(RELAY_AUTHORIZATION)) {
        return Some(token);
    }
    if !api_key.is_empty() {
        return None;
    }
    bearer(headers.get(AUTHORIZATION))
}

pub async fn relay_rpc_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let config = &state.config.relay;

    let Some(relay) = state.relays.get(&client_id).await else {
        return rpc_error(
            StatusCode::SERVICE_UNAVAILABLE,
            None,
            RpcErrorCode::ProviderUnavailable,
            "relay offline",
            &client_id,
            &req_id,
        );
    };

    let body = match axum::body::to_bytes(body, config.max_request_bytes).await {
        Ok(body) => body,
        Err(_) => {
            return rpc_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                None,
                RpcErrorCode::LimitExceeded,
                "request too large",
                &client_id,
                &req_id,
            );
        }
    };

    let Some(envelope) = RpcEnvelope::parse(&body) else {
        return rpc_error(
            StatusCode::OK,
            None,
            RpcErrorCode::SchemaError,
            "invalid json-rpc",
            &client_id,
            &req_id,
        );
    };
    let id = Some(&envelope.id);
    let payload = match String::from_utf8(body.to_vec())
        .map_err(|e| e.to_string())
        .and_then(|text| RawPayload::from_json(text).map_err(|e| e.to_string()))
    {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(client_id = %client_id, "Unreadable payload: {}", e);
            return rpc_error(
                StatusCode::OK,
                id,
                RpcErrorCode::SchemaError,
                "invalid json-rpc",
                &client_id,
                &req_id,
            );
        }
    };

    if envelope.method == "cancel" {
        return rpc_error(
            StatusCode::OK,
            id,
            RpcErrorCode::MethodNotFound,
            "Method not found",
            &client_id,
            &req_id,
        );
    }

    let Some(mut session) = relay.open_session(&envelope.method, config.max_concurrency_per_client) else {
        return rpc_error(
            StatusCode::TOO_MANY_REQUESTS,
            id,
            RpcErrorCode::LimitExceeded,
            "too many concurrent calls",
            &client_id,
            &req_id,
        );
    };
    let sid = session.sid().to_string();
    let deadline = Instant::now() + config.request_timeout();

    let open = SessionFrame::Open {
        sid: sid.clone(),
        req_id: req_id.clone(),
        hint: envelope.method.clone(),
        auth: relay_credential(&headers, &state.config.auth.api_key),
    };
    if relay.send(open).is_err() {
        return rpc_error(
            StatusCode::SERVICE_UNAVAILABLE,
            id,
            RpcErrorCode::ProviderUnavailable,
            "relay write failed",
            &client_id,
            &req_id,
        );
    }

    match timeout_at(deadline, session.recv()).await {
        Ok(Some(SessionFrame::OpenOk { .. })) => session.set_state(SessionState::Open),
        Ok(Some(SessionFrame::OpenFail { code, msg, .. })) => {
            let code = RpcErrorCode::from_open_failure(&code);
            let status = match code {
                RpcErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            tracing::debug!(client_id = %client_id, sid = %sid, reason = %msg, "Relay refused session");
            return rpc_error(status, id, code, "open failed", &client_id, &req_id);
        }
        Ok(Some(_)) => {
            session.close("unexpected_frame");
            return rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                id,
                RpcErrorCode::ProviderUnavailable,
                "open failed",
                &client_id,
                &req_id,
            );
        }
        Ok(None) => {
            return rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                id,
                RpcErrorCode::ProviderUnavailable,
                "relay disconnected",
                &client_id,
                &req_id,
            );
        }
        Err(_) => {
            session.close("timeout");
            return rpc_error(
                StatusCode::GATEWAY_TIMEOUT,
                id,
                RpcErrorCode::Timeout,
                "timeout waiting for open",
                &client_id,
                &req_id,
            );
        }
    }

    if relay.send(SessionFrame::Rpc { sid: sid.clone(), payload }).is_err() {
        session.close("relay_write_failed");
        return rpc_error(
            StatusCode::SERVICE_UNAVAILABLE,
            id,
            RpcErrorCode::ProviderUnavailable,
            "relay write failed",
            &client_id,
            &req_id,
        );
    }

    let response = loop {
        match timeout_at(deadline, session.recv()).await {
            Ok(Some(SessionFrame::Rpc { payload, .. })) => break payload,
            Ok(Some(SessionFrame::Close { msg, .. })) => {
                tracing::debug!(client_id = %client_id, sid = %sid, reason = %msg, "Relay closed session");
                return rpc_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    id,
                    RpcErrorCode::ProviderUnavailable,
                    "session closed by relay",
                    &client_id,
                    &req_id,
                );
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return rpc_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    id,
                    RpcErrorCode::ProviderUnavailable,
                    "relay disconnected",
                    &client_id,
                    &req_id,
                );
            }
            Err(_) => {
                session.close("timeout");
                return rpc_error(
                    StatusCode::GATEWAY_TIMEOUT,
                    id,
                    RpcErrorCode::Timeout,
                    "timeout waiting for response",
                    &client_id,
                    &req_id,
                );
            }
        }
    };

    if response.len() > config.max_response_bytes {
        session.close("resp_too_large");
        return rpc_error(
            StatusCode::OK,
            id,
            RpcErrorCode::LimitExceeded,
            "response too large",
            &client_id,
            &req_id,
        );
    }

    session.close("done");
    tracing::info!(
        client_id = %client_id,
        req_id = %req_id,
        method = %envelope.method,
        "Relay call complete"
    );
    let body = match response.get() {
        "null" => "{}".to_string(),
        raw => raw.to_string(),
    };
    (StatusCode::OK, [(CONTENT_TYPE, "application/json")], body).into_response()
}
