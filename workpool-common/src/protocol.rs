//! WebSocket protocol types for broker-worker communication.
//!
//! A worker is any backend (local inference server, document processor, ...)
//! that keeps one long-lived WebSocket open to the broker and serves HTTP
//! requests tunnelled over it.
//!
//! # Protocol Overview
//!
//! Messages are JSON objects with a `type` field selecting the variant.
//!
//! ## Connection Flow
//!
//! 1. Worker connects to the broker's `/ws/worker` endpoint
//! 2. Worker sends `register` with its id, shared key, labels and capacity
//! 3. Broker replies with a bare `{"id": ...}` acknowledgement, or closes the
//!    socket with a policy-violation code
//! 4. Worker sends `heartbeat` periodically and `status_update` whenever its
//!    capacity or label set changes
//! 5. Broker sends `http_proxy_request`; the worker answers with exactly one
//!    `http_proxy_response_headers`, any number of `http_proxy_response_chunk`
//!    and one terminal `http_proxy_response_end`, all carrying the same
//!    `request_id`
//! 6. Broker may send `http_proxy_cancel` when the client went away
//!
//! Request and response bodies are carried as base64 strings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Agent config key a worker uses to advertise its preferred embedding batch size.
pub const EMBEDDING_BATCH_SIZE_KEY: &str = "embedding_batch_size";

/// Messages sent from worker to broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First frame on a new connection.
    Register(RegisterMessage),
    /// Periodic liveness signal.
    Heartbeat {
        #[serde(default)]
        ts: i64,
    },
    /// Capability refresh (capacity, labels, batch size).
    StatusUpdate(StatusUpdate),
    /// Status line and headers of a proxied response. Always first.
    HttpProxyResponseHeaders {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// A slice of the proxied response body.
    HttpProxyResponseChunk {
        request_id: String,
        #[serde(default, with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Terminal frame of a proxied response, optionally carrying an error.
    HttpProxyResponseEnd {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ProxyError>,
    },
}

impl WorkerMessage {
    /// Request id for response frames, `None` for control frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerMessage::HttpProxyResponseHeaders { request_id, .. }
            | WorkerMessage::HttpProxyResponseChunk { request_id, .. }
            | WorkerMessage::HttpProxyResponseEnd { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Whether this frame ends the response stream for its request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerMessage::HttpProxyResponseEnd { .. })
    }
}

/// Messages sent from broker to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// An HTTP request to execute against the worker's local backend.
    HttpProxyRequest {
        request_id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        stream: bool,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
    /// Best-effort request to abandon an in-flight proxy request.
    HttpProxyCancel { request_id: String },
}

/// Registration data sent as the first frame of a connection.
///
/// Field aliases accept the older `worker_id` / `worker_name` / `token` spellings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterMessage {
    /// Connection id; the broker generates one when absent.
    #[serde(default, alias = "worker_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name.
    #[serde(default, alias = "worker_name", skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Shared secret compared against the broker's configured client key.
    #[serde(default, alias = "token", skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// Labels (model names) this worker serves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    /// Maximum concurrent requests; 0 means not ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    /// Preferred slice size for bulk requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_batch_size: Option<u32>,
    /// Free-form agent settings; `embedding_batch_size` is honoured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<HashMap<String, String>>,
    /// Agent version, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RegisterMessage {
    /// Preferred batch size, falling back to the agent config entry. 0 when unset.
    pub fn batch_size(&self) -> u32 {
        resolve_batch_size(self.preferred_batch_size, self.agent_config.as_ref())
    }
}

/// Capability refresh from a connected worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Free-form status (`idle`, `busy`, `draining`, ...), informational.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub max_concurrency: u32,
    /// Replacement label set; `None` keeps the current labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<HashMap<String, String>>,
}

impl StatusUpdate {
    pub fn batch_size(&self) -> u32 {
        resolve_batch_size(self.preferred_batch_size, self.agent_config.as_ref())
    }
}

fn resolve_batch_size(explicit: Option<u32>, agent_config: Option<&HashMap<String, String>>) -> u32 {
    explicit
        .or_else(|| {
            agent_config
                .and_then(|c| c.get(EMBEDDING_BATCH_SIZE_KEY))
                .and_then(|v| v.trim().parse().ok())
        })
        .unwrap_or(0)
}

/// Error carried by a terminal `http_proxy_response_end` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Registration acknowledgement. Serialized without a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub id: String,
}

/// Serde adapter carrying byte buffers as base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) if !s.is_empty() => STANDARD.decode(s).map_err(serde::de::Error::custom),
            _ => Ok(Vec::new()),
        }
    }
}
