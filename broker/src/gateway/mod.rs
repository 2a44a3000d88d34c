//! Worker side of the broker.
//!
//! - `registry`: connected workers, their capabilities and pending requests
//! - `scheduler`: least-busy selection with alias fallback
//! - `ws`: worker WebSocket connections
//! - `relay`: HTTP requests proxied over a worker connection
//! - `fanout`: bulk embeddings spread over several workers

pub mod fanout;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod ws;

pub use fanout::{EmbeddingJob, FanOut, FanOutError};
pub use registry::{alias_key, ModelInfo, SendError, Worker, WorkerRegistry, WorkerSnapshot};
pub use relay::{forward_headers, Dispatch, ProxyRequest, ProxyTimeouts};
pub use scheduler::{RouteError, Scheduler, WorkerLease};
pub use ws::worker_ws_handler;
