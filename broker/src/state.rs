//! Process-wide server state, passed explicitly to whoever needs it.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde::Serialize;

/// Coarse lifecycle status of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// No worker connected yet.
    NotReady,
    /// At least one worker connected.
    Ready,
    /// Shutting down; no new work is accepted.
    Draining,
}

impl ServerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServerStatus::Ready,
            2 => ServerStatus::Draining,
            _ => ServerStatus::NotReady,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServerStatus::NotReady => 0,
            ServerStatus::Ready => 1,
            ServerStatus::Draining => 2,
        }
    }
}

/// Status and drain flag. Once draining, the status never changes again.
#[derive(Debug)]
pub struct ServerState {
    status: AtomicU8,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(ServerStatus::NotReady.as_u8()),
        }
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_draining(&self) -> bool {
        self.status() == ServerStatus::Draining
    }

    /// Flip between `ready` and `not_ready` as workers come and go.
    pub fn set_ready(&self, ready: bool) {
        let next = if ready { ServerStatus::Ready } else { ServerStatus::NotReady };
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != ServerStatus::Draining.as_u8()).then_some(next.as_u8())
            });
    }

    /// Enter drain mode. Returns `false` if already draining.
    pub fn start_drain(&self) -> bool {
        let prev = self.status.swap(ServerStatus::Draining.as_u8(), Ordering::AcqRel);
        prev != ServerStatus::Draining.as_u8()
    }
}

/// A dependency whose health gates `/healthz`.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn is_healthy(&self) -> bool;
}

/// Reports unhealthy while the broker is draining.
pub struct DrainCheck(pub std::sync::Arc<ServerState>);

#[async_trait]
impl HealthCheck for DrainCheck {
    fn name(&self) -> &str {
        "drain"
    }

    async fn is_healthy(&self) -> bool {
        !self.0.is_draining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ready_transitions() {
        let state = ServerState::new();
        assert_eq!(state.status(), ServerStatus::NotReady);
        state.set_ready(true);
        assert_eq!(state.status(), ServerStatus::Ready);
        state.set_ready(false);
        assert_eq!(state.status(), ServerStatus::NotReady);
    }

    #[test]
    fn test_drain_is_sticky() {
        let state = ServerState::new();
        assert!(state.start_drain());
        assert!(!state.start_drain());
        state.set_ready(true);
        assert_eq!(state.status(), ServerStatus::Draining);
    }

    #[tokio::test]
    async fn test_drain_check() {
        let state = Arc::new(ServerState::new());
        let check = DrainCheck(state.clone());
        assert!(check.is_healthy().await);
        state.start_drain();
        assert!(!check.is_healthy().await);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&ServerStatus::NotReady).unwrap(), "\"not_ready\"");
    }
}
