//! Registry of connected relay clients and their sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;

use workpool_common::SessionFrame;

use crate::gateway::SendError;

/// Frames buffered for one session. A session sees at most an open reply and
/// an rpc reply before it is closed.
const SESSION_BUFFER: usize = 4;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Opening,
    Open,
    Closed,
}

#[derive(Debug)]
struct SessionInfo {
    method: String,
    state: SessionState,
    started: Instant,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RelayState {
    inflight: usize,
    methods: HashMap<String, usize>,
    sessions: HashMap<String, SessionInfo>,
    last_seen: Instant,
}

/// One connected relay client.
#[derive(Debug)]
pub struct Relay {
    pub id: String,
    pub name: String,
    state: Mutex<RelayState>,
    pending: Mutex<HashMap<String, mpsc::Sender<SessionFrame>>>,
    outbound: mpsc::Sender<SessionFrame>,
    closed: Notify,
}

impl Relay {
    pub fn new(id: String, name: String, outbound: mpsc::Sender<SessionFrame>) -> Self {
        Self {
            id,
            name,
            state: Mutex::new(RelayState {
                inflight: 0,
                methods: HashMap::new(),
                sessions: HashMap::new(),
                last_seen: Instant::now(),
            }),
            pending: Mutex::new(HashMap::new()),
            outbound,
            closed: Notify::new(),
        }
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        self.state.lock().last_seen = Instant::now();
    }

    pub fn last_seen_age(&self) -> Duration {
        self.state.lock().last_seen.elapsed()
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }

    /// Start a session for `method` unless `max_concurrency` sessions are
    /// already running (0 means unlimited). The check and the increment
    /// happen under one lock.
    pub fn open_session(self: &Arc<Self>, method: &str, max_concurrency: usize) -> Option<Session> {
        let sid = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock();
            if max_concurrency > 0 && state.inflight >= max_concurrency {
                return None;
            }
            state.inflight += 1;
            *state.methods.entry(method.to_string()).or_insert(0) += 1;
            state.sessions.insert(
                sid.clone(),
                SessionInfo {
                    method: method.to_string(),
                    state: SessionState::Opening,
                    started: Instant::now(),
                    started_at: Utc::now(),
                },
            );
        }

        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.pending.lock().insert(sid.clone(), tx);

        Some(Session {
            relay: self.clone(),
            sid,
            method: method.to_string(),
            rx,
        })
    }

    fn set_session_state(&self, sid: &str, new_state: SessionState) {
        if let Some(info) = self.state.lock().sessions.get_mut(sid) {
            info.state = new_state;
        }
    }

    fn end_session(&self, sid: &str, method: &str) {
        self.pending.lock().remove(sid);
        let mut state = self.state.lock();
        state.inflight = state.inflight.saturating_sub(1);
        if let Some(count) = state.methods.get_mut(method) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.methods.remove(method);
            }
        }
        state.sessions.remove(sid);
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: SessionFrame) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Route an inbound frame to its session. Frames for unknown sessions are dropped.
    ///
    /// Never waits on a session: one whose buffer is full loses its waiter
    /// and fails, and the relay is told to close it.
    pub fn deliver(&self, frame: SessionFrame) {
        let Some(sid) = frame.sid().map(str::to_string) else {
            return;
        };
        let sender = self.pending.lock().get(&sid).cloned();
        let Some(tx) = sender else {
            tracing::debug!(client_id = %self.id, sid = %sid, "Frame for unknown session dropped");
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = %self.id, "Session receiver gone");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(client_id = %self.id, sid = %sid, "Session not keeping up, closing");
                self.pending.lock().remove(&sid);
                let _ = self.send(SessionFrame::close(&sid, "overflow"));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every waiting session and stop the connection's reader.
    pub fn close(&self) {
        self.pending.lock().clear();
        self.closed.notify_one();
    }

    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    fn snapshot(&self) -> (RelaySnapshot, Vec<SessionSnapshot>) {
        let state = self.state.lock();
        let client = RelaySnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: if state.inflight > 0 { "active" } else { "idle" },
            inflight: state.inflight,
            functions: state.methods.clone(),
        };
        let sessions = state
            .sessions
            .iter()
            .map(|(sid, info)| SessionSnapshot {
                id: sid.clone(),
                client_id: self.id.clone(),
                method: info.method.clone(),
                state: info.state,
                started_at: info.started_at,
                duration_ms: info.started.elapsed().as_millis() as u64,
            })
            .collect();
        (client, sessions)
    }
}

/// One JSON-RPC call in flight on a relay.
///
/// Dropping it unregisters the session and gives back the concurrency slot.
#[derive(Debug)]
pub struct Session {
    relay: Arc<Relay>,
    sid: String,
    method: String,
    rx: mpsc::Receiver<SessionFrame>,
}

impl Session {
    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Next frame for this session; `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<SessionFrame> {
        self.rx.recv().await
    }

    pub fn set_state(&self, state: SessionState) {
        self.relay.set_session_state(&self.sid, state);
    }

    /// Tell the relay client the session is over.
    pub fn close(&self, msg: &str) {
        self.set_state(SessionState::Closed);
        if let Err(e) = self.relay.send(SessionFrame::close(&self.sid, msg)) {
            tracing::debug!(client_id = %self.relay.id, sid = %self.sid, "Close not sent: {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.relay.end_session(&self.sid, &self.method);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub id: String,
    pub name: String,
    pub status: &'static str,
    pub inflight: usize,
    pub functions: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub client_id: String,
    pub method: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelaysSnapshot {
    pub clients: Vec<RelaySnapshot>,
    pub sessions: Vec<SessionSnapshot>,
}

/// Relay clients keyed by client id.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    relays: RwLock<HashMap<String, Arc<Relay>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a relay. Returns `false` if the id is already connected.
    pub async fn insert(&self, relay: Arc<Relay>) -> bool {
        let mut relays = self.relays.write().await;
        if relays.contains_key(&relay.id) {
            return false;
        }
        relays.insert(relay.id.clone(), relay);
        true
    }

    /// Remove `relay` if it is still the registered connection for its id.
    pub async fn remove_connection(&self, relay: &Arc<Relay>) -> bool {
        let mut relays = self.relays.write().await;
        let same = relays.get(&relay.id).is_some_and(|r| Arc::ptr_eq(r, relay));
        if same {
            relays.remove(&relay.id);
        }
        relay.close();
        same
    }

    /// Disconnect every relay. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let mut relays = self.relays.write().await;
        let count = relays.len();
        for (_, relay) in relays.drain() {
            relay.close();
        }
        count
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Relay>> {
        self.relays.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.relays.read().await.len()
    }

    pub async fn total_inflight(&self) -> usize {
        self.relays.read().await.values().map(|r| r.inflight()).sum()
    }

    pub async fn snapshot(&self) -> RelaysSnapshot {
        let relays = self.relays.read().await;
        let mut snapshot = RelaysSnapshot::default();
        for relay in relays.values() {
            let (client, sessions) = relay.snapshot();
            snapshot.clients.push(client);
            snapshot.sessions.extend(sessions);
        }
        snapshot.clients.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot.sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshot
    }
}
