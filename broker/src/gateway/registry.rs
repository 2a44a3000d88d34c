//! Worker registry for tracking connected workers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;

use workpool_common::{BrokerMessage, StatusUpdate, WorkerMessage};

use crate::state::ServerState;

/// Buffer of frames queued for one waiting request.
const PENDING_BUFFER: usize = 64;

/// Failure to enqueue a frame on a worker's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Capability set advertised at registration and refreshed by `status_update`.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub labels: Vec<String>,
    pub max_concurrency: u32,
    pub preferred_batch_size: u32,
}

#[derive(Debug)]
struct LiveState {
    labels: Vec<String>,
    max_concurrency: u32,
    preferred_batch_size: u32,
    in_flight: u32,
    last_heartbeat: Instant,
}

/// One connected worker.
///
/// Capability and usage counters sit behind a single lock so that the
/// capacity check and the increment in [`Worker::try_acquire`] are atomic.
#[derive(Debug)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub remote_ip: Option<IpAddr>,
    pub connected_at: DateTime<Utc>,
    connected: Instant,
    live: Mutex<LiveState>,
    outbound: mpsc::Sender<BrokerMessage>,
    pending: Mutex<HashMap<String, mpsc::Sender<WorkerMessage>>>,
    closed: Notify,
}

impl Worker {
    pub fn new(
        id: String,
        name: String,
        remote_ip: Option<IpAddr>,
        caps: Capabilities,
        outbound: mpsc::Sender<BrokerMessage>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            name,
            remote_ip,
            connected_at: Utc::now(),
            connected: now,
            live: Mutex::new(LiveState {
                labels: dedup(caps.labels),
                max_concurrency: caps.max_concurrency,
                preferred_batch_size: caps.preferred_batch_size,
                in_flight: 0,
                last_heartbeat: now,
            }),
            outbound,
            pending: Mutex::new(HashMap::new()),
            closed: Notify::new(),
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.live.lock().labels.clone()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.live.lock().labels.iter().any(|l| l == label)
    }

    pub fn in_flight(&self) -> u32 {
        self.live.lock().in_flight
    }

    pub fn max_concurrency(&self) -> u32 {
        self.live.lock().max_concurrency
    }

    pub fn preferred_batch_size(&self) -> u32 {
        self.live.lock().preferred_batch_size
    }

    /// Whether a new dispatch would be accepted right now.
    pub fn has_capacity(&self) -> bool {
        let live = self.live.lock();
        live.in_flight < live.max_concurrency
    }

    /// Reserve one slot if the worker has capacity.
    pub fn try_acquire(&self) -> bool {
        let mut live = self.live.lock();
        if live.in_flight < live.max_concurrency {
            live.in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn inc_in_flight(&self) {
        self.live.lock().in_flight += 1;
    }

    /// Release one slot. Never goes below zero.
    pub fn dec_in_flight(&self) {
        let mut live = self.live.lock();
        live.in_flight = live.in_flight.saturating_sub(1);
    }

    /// Record a liveness signal.
    pub fn touch(&self) {
        self.live.lock().last_heartbeat = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.live.lock().last_heartbeat.elapsed()
    }

    /// Apply a capability refresh. Returns the new label set when it changed.
    pub fn apply_status(&self, update: &StatusUpdate) -> Option<Vec<String>> {
        let mut live = self.live.lock();
        live.max_concurrency = update.max_concurrency;
        live.preferred_batch_size = update.batch_size();
        live.last_heartbeat = Instant::now();
        let models = update.models.as_ref()?;
        live.labels = dedup(models.clone());
        Some(live.labels.clone())
    }

    /// Enqueue a frame without waiting.
    pub fn send(&self, msg: BrokerMessage) -> Result<(), SendError> {
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Register a waiter for `request_id`. `None` if the id is already pending.
    pub fn register_pending(&self, request_id: &str) -> Option<mpsc::Receiver<WorkerMessage>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(request_id) {
            return None;
        }
        let (tx, rx) = mpsc::channel(PENDING_BUFFER);
        pending.insert(request_id.to_string(), tx);
        Some(rx)
    }

    pub fn remove_pending(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Hand a response frame to its waiter. Frames for unknown ids are dropped.
    ///
    /// Never waits: the connection's reader serves every request on it. A
    /// waiter whose buffer is full is treated as a stalled consumer; it is
    /// dropped, which fails the request as upstream-closed, and the worker
    /// is told to cancel it. The terminal frame also removes the waiter.
    pub fn deliver(&self, msg: WorkerMessage) {
        let Some(request_id) = msg.request_id() else {
            return;
        };
        let waiter = {
            let mut pending = self.pending.lock();
            if msg.is_terminal() {
                pending.remove(request_id)
            } else {
                pending.get(request_id).cloned()
            }
        };
        let Some(tx) = waiter else {
            tracing::trace!(worker_id = %self.id, request_id, "Dropping frame for unknown request");
            return;
        };
        let request_id = request_id.to_string();
        match tx.try_send(msg) {
            Ok(()) => {}
            // The requester already gave up.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(worker_id = %self.id, request_id = %request_id, "Request not keeping up, cancelling");
                self.pending.lock().remove(&request_id);
                let _ = self.send(BrokerMessage::HttpProxyCancel { request_id });
            }
        }
    }

    /// Tear down: wake the connection task and release every waiter.
    pub fn close(&self) {
        self.pending.lock().clear();
        self.closed.notify_one();
    }

    /// Resolves once [`Worker::close`] has been called.
    pub async fn closed(&self) {
        self.closed.notified().await
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let live = self.live.lock();
        WorkerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            labels: live.labels.clone(),
            in_flight: live.in_flight,
            max_concurrency: live.max_concurrency,
            preferred_batch_size: live.preferred_batch_size,
            last_heartbeat_ms: live.last_heartbeat.elapsed().as_millis() as u64,
            connected_at: self.connected_at,
        }
    }
}

fn dedup(mut labels: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    labels.retain(|l| !l.is_empty() && seen.insert(l.clone()));
    labels
}

/// Canonical alias key for a label: `name:tag` with any `-variant` suffix removed.
///
/// `"llama2:7b-q4_0"` and `"llama2:7b"` both map to `"llama2:7b"`; labels
/// without a colon have no alias key.
pub fn alias_key(label: &str) -> Option<String> {
    let (name, rest) = label.split_once(':')?;
    if name.is_empty() {
        return None;
    }
    let (tag, suffix) = match rest.split_once('-') {
        Some((tag, suffix)) => (tag, Some(suffix)),
        None => (rest, None),
    };
    if tag.is_empty() || tag.chars().any(char::is_whitespace) || suffix == Some("") {
        return None;
    }
    Some(format!("{}:{}", name, tag))
}

/// Serializable view of a worker for `/state`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub name: String,
    pub labels: Vec<String>,
    pub in_flight: u32,
    pub max_concurrency: u32,
    pub preferred_batch_size: u32,
    pub last_heartbeat_ms: u64,
    pub connected_at: DateTime<Utc>,
}

/// A label available somewhere in the pool.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    /// Unix time the label was first advertised.
    pub created: i64,
    /// Sorted names of workers advertising the label.
    pub owners: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    workers: HashMap<String, Arc<Worker>>,
    first_seen: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn note_labels(&mut self, labels: &[String]) {
        let now = Utc::now();
        for label in labels {
            self.first_seen.entry(label.clone()).or_insert(now);
        }
    }

    /// Workers in connection order, so ties resolve to the oldest connection.
    fn ordered(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<_> = self.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.connected);
        workers
    }
}

/// Registry of connected workers.
#[derive(Debug)]
pub struct WorkerRegistry {
    inner: RwLock<Inner>,
    server_state: Arc<ServerState>,
}

impl WorkerRegistry {
    pub fn new(server_state: Arc<ServerState>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            server_state,
        }
    }

    /// Insert a worker. A previous connection with the same id is closed and replaced.
    pub async fn add(&self, worker: Arc<Worker>) {
        let mut inner = self.inner.write().await;
        inner.note_labels(&worker.labels());
        if let Some(previous) = inner.workers.insert(worker.id.clone(), worker) {
            tracing::warn!(worker_id = %previous.id, "Replacing existing connection for worker");
            previous.close();
        }
        self.server_state.set_ready(true);
    }

    /// Remove a worker and release its pending waiters.
    pub async fn remove(&self, id: &str) -> Option<Arc<Worker>> {
        let mut inner = self.inner.write().await;
        let removed = inner.workers.remove(id);
        if let Some(worker) = &removed {
            worker.close();
        }
        self.server_state.set_ready(!inner.workers.is_empty());
        removed
    }

    /// Remove `worker` only if it is still the registered connection for its id.
    pub async fn remove_connection(&self, worker: &Arc<Worker>) -> bool {
        let mut inner = self.inner.write().await;
        let same = inner
            .workers
            .get(&worker.id)
            .is_some_and(|w| Arc::ptr_eq(w, worker));
        if same {
            inner.workers.remove(&worker.id);
        }
        worker.close();
        self.server_state.set_ready(!inner.workers.is_empty());
        same
    }

    /// Disconnect every worker. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.workers.len();
        for (_, worker) in inner.workers.drain() {
            worker.close();
        }
        self.server_state.set_ready(false);
        count
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.inner.read().await.workers.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Worker>> {
        self.inner.read().await.ordered()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.workers.len()
    }

    /// Workers advertising exactly `label` that have spare capacity.
    pub async fn workers_for_label(&self, label: &str) -> Vec<Arc<Worker>> {
        self.inner
            .read()
            .await
            .ordered()
            .into_iter()
            .filter(|w| w.has_label(label) && w.has_capacity())
            .collect()
    }

    /// Workers with spare capacity whose labels share `label`'s alias key,
    /// excluding exact matches.
    pub async fn workers_for_alias(&self, label: &str) -> Vec<Arc<Worker>> {
        let Some(key) = alias_key(label) else {
            return Vec::new();
        };
        self.inner
            .read()
            .await
            .ordered()
            .into_iter()
            .filter(|w| {
                !w.has_label(label)
                    && w.has_capacity()
                    && w.labels().iter().any(|l| alias_key(l).as_deref() == Some(&key))
            })
            .collect()
    }

    /// Record first-seen times for labels gained after registration.
    pub async fn note_labels(&self, labels: &[String]) {
        self.inner.write().await.note_labels(labels);
    }

    pub async fn inc_in_flight(&self, id: &str) {
        if let Some(worker) = self.get(id).await {
            worker.inc_in_flight();
        }
    }

    pub async fn dec_in_flight(&self, id: &str) {
        if let Some(worker) = self.get(id).await {
            worker.dec_in_flight();
        }
    }

    /// Sum of in-flight requests across the pool.
    pub async fn total_in_flight(&self) -> u32 {
        self.inner
            .read()
            .await
            .workers
            .values()
            .map(|w| w.in_flight())
            .sum()
    }

    /// Remove workers whose last heartbeat is older than `max_age`.
    pub async fn prune_expired(&self, max_age: Duration) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let mut removed = vec![];

        inner.workers.retain(|id, worker| {
            let age = worker.heartbeat_age();
            if age > max_age {
                tracing::warn!(
                    worker_id = %id,
                    age_secs = age.as_secs(),
                    "Removing expired worker"
                );
                worker.close();
                removed.push(id.clone());
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            self.server_state.set_ready(!inner.workers.is_empty());
        }
        removed
    }

    /// Every label in the pool, sorted by id.
    pub async fn models(&self) -> Vec<ModelInfo> {
        let inner = self.inner.read().await;
        let mut owners: HashMap<String, Vec<String>> = HashMap::new();
        for worker in inner.workers.values() {
            for label in worker.labels() {
                owners.entry(label).or_default().push(worker.name.clone());
            }
        }

        let mut models: Vec<ModelInfo> = owners
            .into_iter()
            .map(|(id, mut names)| {
                names.sort();
                names.dedup();
                let created = inner
                    .first_seen
                    .get(&id)
                    .map(|t| t.timestamp())
                    .unwrap_or_else(|| Utc::now().timestamp());
                ModelInfo { id, created, owners: names }
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.inner
            .read()
            .await
            .ordered()
            .iter()
            .map(|w| w.snapshot())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;

    pub(crate) fn test_worker(
        id: &str,
        labels: &[&str],
        max_concurrency: u32,
    ) -> (Arc<Worker>, mpsc::Receiver<BrokerMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let worker = Worker::new(
            id.to_string(),
            id.to_string(),
            None,
            Capabilities {
                labels: labels.iter().map(|s| s.to_string()).collect(),
                max_concurrency,
                preferred_batch_size: 0,
            },
            tx,
        );
        (Arc::new(worker), rx)
    }

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(Arc::new(ServerState::new()))
    }

    #[rstest]
    #[case("llama2:7b-q4_0", Some("llama2:7b"))]
    #[case("llama2:7b-q5_k_m", Some("llama2:7b"))]
    #[case("llama2:7b", Some("llama2:7b"))]
    #[case("llama2-7b-q4_0", None)]
    #[case(":7b", None)]
    #[case("llama2:", None)]
    #[case("llama2:7b-", None)]
    fn test_alias_key(#[case] label: &str, #[case] expected: Option<&str>) {
        assert_eq!(alias_key(label).as_deref(), expected);
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let registry = registry();
        let (worker, _rx) = test_worker("w-1", &["m"], 1);
        registry.add(worker).await;

        let found = registry.get("w-1").await.unwrap();
        assert_eq!(found.id, "w-1");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_releases_pending_waiters() {
        let registry = registry();
        let (worker, _rx) = test_worker("w-1", &["m"], 1);
        registry.add(worker.clone()).await;
        let mut waiter = worker.register_pending("req-1").unwrap();

        assert!(registry.remove("w-1").await.is_some());
        assert!(registry.get("w-1").await.is_none());
        assert!(waiter.recv().await.is_none());
        assert_eq!(worker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_workers_for_label_excludes_full_workers() {
        let registry = registry();
        let (busy, _rx1) = test_worker("busy", &["m"], 1);
        let (idle, _rx2) = test_worker("idle", &["m"], 1);
        let (not_ready, _rx3) = test_worker("not-ready", &["m"], 0);
        registry.add(busy.clone()).await;
        registry.add(idle).await;
        registry.add(not_ready).await;
        assert!(busy.try_acquire());

        let found = registry.workers_for_label("m").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "idle");
    }

    #[tokio::test]
    async fn test_workers_for_alias_skips_exact_matches() {
        let registry = registry();
        let (exact, _rx1) = test_worker("exact", &["llama2:7b-q4_0"], 1);
        let (variant, _rx2) = test_worker("variant", &["llama2:7b-q5_k_m"], 1);
        let (other, _rx3) = test_worker("other", &["mistral:7b"], 1);
        registry.add(exact).await;
        registry.add(variant).await;
        registry.add(other).await;

        let found = registry.workers_for_alias("llama2:7b-q4_0").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "variant");

        assert!(registry.workers_for_alias("llama2-7b").await.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_never_negative() {
        let registry = registry();
        let (worker, _rx) = test_worker("w-1", &["m"], 2);
        registry.add(worker.clone()).await;

        registry.dec_in_flight("w-1").await;
        assert_eq!(worker.in_flight(), 0);
        registry.inc_in_flight("w-1").await;
        registry.dec_in_flight("w-1").await;
        registry.dec_in_flight("w-1").await;
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_try_acquire_respects_max_concurrency() {
        let (worker, _rx) = test_worker("w-1", &["m"], 2);
        assert!(worker.try_acquire());
        assert!(worker.try_acquire());
        assert!(!worker.try_acquire());
        worker.dec_in_flight();
        assert!(worker.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_expired() {
        let registry = registry();
        let (stale, _rx1) = test_worker("stale", &["m"], 1);
        let (fresh, _rx2) = test_worker("fresh", &["m"], 1);
        registry.add(stale.clone()).await;
        registry.add(fresh.clone()).await;
        let mut waiter = stale.register_pending("req").unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        fresh.touch();
        tokio::time::advance(Duration::from_secs(15)).await;

        let removed = registry.prune_expired(Duration::from_secs(30)).await;
        assert_eq!(removed, vec!["stale".to_string()]);
        assert!(registry.get("fresh").await.is_some());
        assert!(waiter.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_routes_by_request_id() {
        let (worker, _rx) = test_worker("w-1", &["m"], 1);
        let mut waiter = worker.register_pending("req-1").unwrap();

        worker.deliver(WorkerMessage::HttpProxyResponseChunk {
            request_id: "unknown".to_string(),
            data: b"lost".to_vec(),
        });
        worker.deliver(WorkerMessage::HttpProxyResponseEnd {
            request_id: "req-1".to_string(),
            error: None,
        });

        assert!(waiter.recv().await.unwrap().is_terminal());
        assert_eq!(worker.pending_count(), 0);
        assert!(waiter.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_waiter_does_not_block_others() {
        let (worker, mut outbound) = test_worker("w-1", &["m"], 2);
        let mut stalled = worker.register_pending("a").unwrap();
        let mut other = worker.register_pending("b").unwrap();
        let chunk = |id: &str| WorkerMessage::HttpProxyResponseChunk {
            request_id: id.to_string(),
            data: b"x".to_vec(),
        };

        for _ in 0..=PENDING_BUFFER {
            worker.deliver(chunk("a"));
        }
        worker.deliver(chunk("b"));

        assert!(matches!(
            other.try_recv(),
            Ok(WorkerMessage::HttpProxyResponseChunk { request_id, .. }) if request_id == "b"
        ));
        match outbound.try_recv() {
            Ok(BrokerMessage::HttpProxyCancel { request_id }) => assert_eq!(request_id, "a"),
            other => panic!("expected cancel, got {:?}", other),
        }
        assert_eq!(worker.pending_count(), 1);

        // Buffered frames drain, then the stalled request sees its end.
        for _ in 0..PENDING_BUFFER {
            assert!(stalled.recv().await.is_some());
        }
        assert!(stalled.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_rejected() {
        let (worker, _rx) = test_worker("w-1", &["m"], 1);
        let _first = worker.register_pending("req").unwrap();
        assert!(worker.register_pending("req").is_none());
        worker.remove_pending("req");
        assert!(worker.register_pending("req").is_some());
    }

    #[tokio::test]
    async fn test_send_reports_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let worker = Worker::new("w".into(), "w".into(), None, Capabilities::default(), tx);
        let cancel = |id: &str| BrokerMessage::HttpProxyCancel { request_id: id.to_string() };
        assert_eq!(worker.send(cancel("a")), Ok(()));
        assert_eq!(worker.send(cancel("b")), Err(SendError::Full));
    }

    #[tokio::test]
    async fn test_status_update_replaces_capabilities() {
        let (worker, _rx) = test_worker("w-1", &["a"], 1);
        let update = StatusUpdate {
            status: "idle".to_string(),
            max_concurrency: 4,
            models: Some(vec!["b".to_string(), "b".to_string()]),
            preferred_batch_size: Some(16),
            agent_config: None,
        };
        assert_eq!(worker.apply_status(&update), Some(vec!["b".to_string()]));
        assert_eq!(worker.max_concurrency(), 4);
        assert_eq!(worker.preferred_batch_size(), 16);

        let keep_labels = StatusUpdate { max_concurrency: 2, ..Default::default() };
        assert_eq!(worker.apply_status(&keep_labels), None);
        assert!(worker.has_label("b"));
    }

    #[tokio::test]
    async fn test_models_listing() {
        let registry = registry();
        let (w1, _rx1) = test_worker("beta", &["model-a", "model-b"], 1);
        let (w2, _rx2) = test_worker("alpha", &["model-a"], 1);
        registry.add(w1).await;
        registry.add(w2).await;

        let models = registry.models().await;
        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["model-a", "model-b"]);
        assert_eq!(models[0].owners, vec!["alpha".to_string(), "beta".to_string()]);
        assert!(models[0].created > 0);
    }

    #[tokio::test]
    async fn test_ready_status_follows_pool() {
        let state = Arc::new(ServerState::new());
        let registry = WorkerRegistry::new(state.clone());
        let (worker, _rx) = test_worker("w-1", &["m"], 1);
        registry.add(worker.clone()).await;
        assert_eq!(state.status(), crate::state::ServerStatus::Ready);
        registry.remove_connection(&worker).await;
        assert_eq!(state.status(), crate::state::ServerStatus::NotReady);
    }

    #[tokio::test]
    async fn test_stale_connection_does_not_remove_replacement() {
        let registry = registry();
        let (old, _rx1) = test_worker("w-1", &["m"], 1);
        let (new, _rx2) = test_worker("w-1", &["m"], 1);
        registry.add(old.clone()).await;
        registry.add(new.clone()).await;

        assert!(!registry.remove_connection(&old).await);
        let current = registry.get("w-1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }
}
