//! Minimal JSON-RPC 2.0 envelope handling for the relay surface.
//!
//! The broker never interprets a call beyond its envelope: it checks the
//! request is well formed, reads `id` and `method` for bookkeeping, and
//! forwards the raw payload. Errors it produces itself carry a broker code in
//! `error.data.code` so callers can tell them apart from provider errors.

use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};

/// JSON-RPC code for broker-originated errors.
pub const SERVER_ERROR: i64 = -32000;
/// JSON-RPC code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// The parts of a JSON-RPC request the broker looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEnvelope {
    pub id: Value,
    pub method: String,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
}

impl RpcEnvelope {
    /// Parse and validate a request: `jsonrpc` must be `"2.0"`, `id` must be
    /// present and non-null, `method` must be a non-empty string.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let raw: RawEnvelope = serde_json::from_slice(body).ok()?;
        if raw.jsonrpc.as_deref() != Some("2.0") {
            return None;
        }
        let id = raw.id.filter(|id| !id.is_null())?;
        let method = raw.method.filter(|m| !m.is_empty())?;
        Some(Self { id, method })
    }
}

/// Broker-specific error classes reported in `error.data.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ProviderUnavailable,
    SchemaError,
    LimitExceeded,
    Unauthorized,
    Timeout,
    MethodNotFound,
}

impl RpcErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcErrorCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            RpcErrorCode::SchemaError => "SCHEMA_ERROR",
            RpcErrorCode::LimitExceeded => "LIMIT_EXCEEDED",
            RpcErrorCode::Unauthorized => "UNAUTHORIZED",
            RpcErrorCode::Timeout => "TIMEOUT",
            RpcErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
        }
    }

    /// Numeric JSON-RPC `error.code` for this class.
    pub fn rpc_code(&self) -> i64 {
        match self {
            RpcErrorCode::MethodNotFound => METHOD_NOT_FOUND,
            _ => SERVER_ERROR,
        }
    }

    /// Map a relay client's `open.fail` code. Anything unrecognised means the
    /// provider could not be reached.
    pub fn from_open_failure(code: &str) -> Self {
        if code.to_ascii_uppercase().ends_with("UNAUTHORIZED") {
            RpcErrorCode::Unauthorized
        } else {
            RpcErrorCode::ProviderUnavailable
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a JSON-RPC error response. `id` is `null` when the request id is unknown.
pub fn error_response(id: Option<&Value>, code: RpcErrorCode, message: &str, req_id: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {
            "code": code.rpc_code(),
            "message": message,
            "data": {
                "code": code.as_str(),
                "req_id": req_id,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_envelope() {
        let env = RpcEnvelope::parse(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert_eq!(env.id, json!(1));
        assert_eq!(env.method, "tools/list");
    }

    #[test]
    fn test_string_ids_are_accepted() {
        let env = RpcEnvelope::parse(br#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
        assert_eq!(env.id, json!("abc"));
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        let cases: [&[u8]; 6] = [
            b"not json",
            br#"{"jsonrpc":"1.0","id":1,"method":"m"}"#,
            br#"{"id":1,"method":"m"}"#,
            br#"{"jsonrpc":"2.0","id":null,"method":"m"}"#,
            br#"{"jsonrpc":"2.0","method":"m"}"#,
            br#"{"jsonrpc":"2.0","id":1,"method":""}"#,
        ];
        for body in cases {
            assert!(RpcEnvelope::parse(body).is_none(), "{}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response(Some(&json!(5)), RpcErrorCode::LimitExceeded, "too many", "req-1");
        assert_eq!(resp["id"], 5);
        assert_eq!(resp["error"]["code"], SERVER_ERROR);
        assert_eq!(resp["error"]["data"]["code"], "LIMIT_EXCEEDED");
        assert_eq!(resp["error"]["data"]["req_id"], "req-1");

        let resp = error_response(None, RpcErrorCode::MethodNotFound, "Method not found", "r");
        assert!(resp["id"].is_null());
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn test_open_failure_mapping() {
        assert_eq!(RpcErrorCode::from_open_failure("UNAUTHORIZED"), RpcErrorCode::Unauthorized);
        assert_eq!(RpcErrorCode::from_open_failure("MCP_UNAUTHORIZED"), RpcErrorCode::Unauthorized);
        assert_eq!(
            RpcErrorCode::from_open_failure("PROVIDER_DOWN"),
            RpcErrorCode::ProviderUnavailable
        );
    }
}
