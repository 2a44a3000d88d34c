//! Session frames exchanged with relay clients.
//!
//! A relay client forwards JSON-RPC calls to a local tool provider. Each call
//! the broker receives becomes a session on the relay connection:
//!
//! ```text
//! broker -> relay   {"t":"open","sid":..,"req_id":..,"hint":<method>,"auth":..}
//! relay  -> broker  {"t":"open.ok","sid":..}  |  {"t":"open.fail","sid":..,"code":..,"msg":..}
//! broker -> relay   {"t":"rpc","sid":..,"payload":<json-rpc request>}
//! relay  -> broker  {"t":"rpc","sid":..,"payload":<json-rpc response>}
//! broker -> relay   {"t":"close","sid":..,"msg":"done"}
//! ```
//!
//! `ping`/`pong` frames carry no session and keep the connection alive.
//! `rpc` payloads are carried as raw JSON text in both directions.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

/// JSON text passed through untouched: numbers, key order and whitespace
/// are exactly what the sender wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(Box<RawValue>);

impl RawPayload {
    /// Wrap `text`, which must be a single valid JSON value.
    pub fn from_json(text: String) -> Result<Self, serde_json::Error> {
        RawValue::from_string(text).map(Self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::value::to_raw_value(value).map(Self)
    }

    pub fn null() -> Self {
        Self(RawValue::NULL.to_owned())
    }

    pub fn get(&self) -> &str {
        self.0.get()
    }

    /// Size of the JSON text in bytes.
    pub fn len(&self) -> usize {
        self.0.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parsed view, for callers that need to look inside.
    pub fn to_value(&self) -> Value {
        serde_json::from_str(self.get()).unwrap_or(Value::Null)
    }
}

impl PartialEq for RawPayload {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", try_from = "WireFrame")]
pub enum SessionFrame {
    #[serde(rename = "open")]
    Open {
        sid: String,
        req_id: String,
        hint: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },
    #[serde(rename = "open.ok")]
    OpenOk { sid: String },
    #[serde(rename = "open.fail")]
    OpenFail { sid: String, code: String, msg: String },
    #[serde(rename = "rpc")]
    Rpc { sid: String, payload: RawPayload },
    #[serde(rename = "close")]
    Close { sid: String, msg: String },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

/// Flat decoding shape. Internally tagged enums buffer their fields, which
/// a raw payload cannot survive, so frames are read flat and then sorted by
/// tag.
#[derive(Deserialize)]
struct WireFrame {
    t: String,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    req_id: String,
    #[serde(default)]
    hint: String,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    payload: Option<RawPayload>,
}

impl TryFrom<WireFrame> for SessionFrame {
    type Error = String;

    fn try_from(wire: WireFrame) -> Result<Self, Self::Error> {
        let sid = || wire.sid.clone().ok_or_else(|| format!("missing sid in '{}' frame", wire.t));
        let frame = match wire.t.as_str() {
            "open" => SessionFrame::Open {
                sid: sid()?,
                req_id: wire.req_id,
                hint: wire.hint,
                auth: wire.auth,
            },
            "open.ok" => SessionFrame::OpenOk { sid: sid()? },
            "open.fail" => SessionFrame::OpenFail {
                sid: sid()?,
                code: wire.code,
                msg: wire.msg,
            },
            "rpc" => SessionFrame::Rpc {
                sid: sid()?,
                payload: wire.payload.unwrap_or_else(RawPayload::null),
            },
            "close" => SessionFrame::Close { sid: sid()?, msg: wire.msg },
            "ping" => SessionFrame::Ping,
            "pong" => SessionFrame::Pong,
            other => return Err(format!("unknown frame type '{}'", other)),
        };
        Ok(frame)
    }
}

impl SessionFrame {
    /// Session the frame belongs to; `None` for keepalives.
    pub fn sid(&self) -> Option<&str> {
        match self {
            SessionFrame::Open { sid, .. }
            | SessionFrame::OpenOk { sid }
            | SessionFrame::OpenFail { sid, .. }
            | SessionFrame::Rpc { sid, .. }
            | SessionFrame::Close { sid, .. } => Some(sid),
            SessionFrame::Ping | SessionFrame::Pong => None,
        }
    }

    pub fn close(sid: &str, msg: &str) -> Self {
        SessionFrame::Close {
            sid: sid.to_string(),
            msg: msg.to_string(),
        }
    }
}
