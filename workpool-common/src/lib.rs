//! Workpool Common Types
//!
//! Wire types shared by the broker and the processes that connect to it:
//! model/tool workers speaking the proxy protocol, and relay clients
//! speaking the session protocol.

pub mod embeddings;
pub mod jsonrpc;
pub mod protocol;
pub mod session;

pub use embeddings::{EmbeddingResponse, EmbeddingUsage};
pub use jsonrpc::{RpcEnvelope, RpcErrorCode};
pub use protocol::{
    BrokerMessage, ProxyError, RegisterAck, RegisterMessage, StatusUpdate, WorkerMessage,
};
pub use session::{RawPayload, SessionFrame};
