//! JSON-RPC session broker.
//!
//! Relay clients connect over `/ws/relay` and front a local tool provider.
//! Each `POST /relay/:client_id` call becomes one session on that client's
//! connection: open, rpc, close.

mod call;
pub mod registry;
mod ws;

pub use call::relay_rpc_handler;
pub use registry::{Relay, RelayRegistry, RelaysSnapshot, Session, SessionState};
pub use ws::relay_ws_handler;
