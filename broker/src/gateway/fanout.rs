//! Fan-out of bulk embedding requests across workers.
//!
//! With one eligible worker the inputs go out sequentially in slices of its
//! preferred batch size. With several, the inputs are split into contiguous
//! slices weighted by batch size, dispatched concurrently, and a failed slice
//! is retried on another worker from the same selection. Results are placed
//! back at their original offsets.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::future::try_join_all;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Notify;

use workpool_common::EmbeddingResponse;

use super::registry::{Worker, WorkerRegistry};
use super::relay::{Dispatch, ProxyRequest, ProxyTimeouts};
use super::scheduler::WorkerLease;
use crate::error::BrokerError;

/// Worker path for embedding calls.
pub const EMBEDDINGS_PATH: &str = "/embeddings";

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("No worker available for '{0}'")]
    NoWorker(String),
    /// The worker answered with an error status; its body is passed through.
    #[error("upstream returned {status}")]
    UpstreamStatus { status: StatusCode, body: Vec<u8> },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl IntoResponse for FanOutError {
    fn into_response(self) -> Response {
        match self {
            FanOutError::NoWorker(model) => BrokerError::NoWorker(model).into_response(),
            FanOutError::UpstreamStatus { status, body } => {
                tracing::warn!(status = status.as_u16(), "Embedding slice failed upstream");
                (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
            }
            FanOutError::Broker(err) => err.into_response(),
        }
    }
}

/// One logical embeddings request with array input.
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub model: String,
    /// Request fields other than `input`, copied into every slice.
    pub base: Map<String, Value>,
    pub inputs: Vec<Value>,
    /// Headers forwarded to workers.
    pub headers: HashMap<String, String>,
}

impl EmbeddingJob {
    fn slice_body(&self, items: &[Value]) -> Result<Vec<u8>, BrokerError> {
        let mut payload = self.base.clone();
        payload.insert("input".to_string(), Value::Array(items.to_vec()));
        serde_json::to_vec(&payload).map_err(|e| BrokerError::BadRequest(e.to_string()))
    }
}

/// Split `n` items into one contiguous range per weight.
///
/// Sizes follow the weights, every range gets at least one item and the
/// ranges cover `0..n` in order. Requires `1 <= weights.len() <= n` and
/// non-zero weights.
pub fn partition(n: usize, weights: &[usize]) -> Vec<Range<usize>> {
    let count = weights.len();
    let mut ranges = Vec::with_capacity(count);
    let mut remaining = n;
    let mut remaining_weight: usize = weights.iter().sum();
    let mut offset = 0;

    for (i, &weight) in weights.iter().enumerate() {
        let size = if i + 1 == count {
            remaining
        } else {
            let still_to_serve = count - i - 1;
            let portion = if remaining_weight == 0 {
                1
            } else {
                remaining * weight / remaining_weight
            };
            portion.clamp(1, remaining.saturating_sub(still_to_serve).max(1))
        };
        ranges.push(offset..offset + size);
        offset += size;
        remaining -= size;
        remaining_weight -= weight;
    }
    ranges
}

/// Mutual-exclusion pool over the workers selected for one fan-out.
///
/// Each selected worker serves at most one slice at a time; workers outside
/// the selection are never recruited.
struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    used: Mutex<HashSet<String>>,
    released: Notify,
}

impl WorkerPool {
    /// Every worker starts out assigned to its initial slice.
    fn new(workers: Vec<Arc<Worker>>) -> Self {
        let used = workers.iter().map(|w| w.id.clone()).collect();
        Self {
            workers,
            used: Mutex::new(used),
            released: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.workers.len()
    }

    /// Take a free worker not in `exclude`, waiting for a release if needed.
    /// `None` once every worker has been excluded.
    async fn acquire(&self, exclude: &HashSet<String>) -> Option<Arc<Worker>> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut used = self.used.lock();
                let free = self
                    .workers
                    .iter()
                    .find(|w| !used.contains(&w.id) && !exclude.contains(&w.id));
                if let Some(worker) = free {
                    used.insert(worker.id.clone());
                    return Some(worker.clone());
                }
                if exclude.len() >= self.workers.len() {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn release(&self, worker_id: &str) {
        self.used.lock().remove(worker_id);
        self.released.notify_waiters();
    }
}

/// Runs [`EmbeddingJob`]s against the worker pool.
#[derive(Debug, Clone)]
pub struct FanOut {
    registry: Arc<WorkerRegistry>,
    timeouts: ProxyTimeouts,
    max_parallel: usize,
}

impl FanOut {
    pub fn new(registry: Arc<WorkerRegistry>, timeouts: ProxyTimeouts, max_parallel: usize) -> Self {
        Self {
            registry,
            timeouts,
            max_parallel: max_parallel.max(1),
        }
    }

    pub async fn run(&self, job: &EmbeddingJob) -> Result<EmbeddingResponse, FanOutError> {
        let mut workers = self.registry.workers_for_label(&job.model).await;
        if workers.is_empty() {
            workers = self.registry.workers_for_alias(&job.model).await;
            if let Some(first) = workers.first() {
                tracing::info!(model = %job.model, worker_id = %first.id, "Alias fallback for embeddings");
            }
        }
        if workers.is_empty() {
            return Err(FanOutError::NoWorker(job.model.clone()));
        }

        workers.sort_by(|a, b| {
            a.in_flight()
                .cmp(&b.in_flight())
                .then_with(|| b.preferred_batch_size().cmp(&a.preferred_batch_size()))
        });
        workers.truncate(self.max_parallel.min(job.inputs.len()));

        if workers.len() == 1 {
            return self.run_sequential(job, workers.remove(0)).await;
        }
        self.run_parallel(job, workers).await
    }

    async fn run_sequential(&self, job: &EmbeddingJob, worker: Arc<Worker>) -> Result<EmbeddingResponse, FanOutError> {
        let batch = match worker.preferred_batch_size() as usize {
            0 => job.inputs.len(),
            n => n,
        };

        let mut merged = EmbeddingResponse {
            object: "list".to_string(),
            ..Default::default()
        };
        for items in job.inputs.chunks(batch.max(1)) {
            let resp = self.dispatch_slice(job, &worker, items).await?;
            merged.data.extend(resp.data);
            merged.usage += resp.usage;
            if merged.model.is_empty() {
                merged.model = resp.model;
            }
        }
        Ok(merged)
    }

    async fn run_parallel(&self, job: &EmbeddingJob, workers: Vec<Arc<Worker>>) -> Result<EmbeddingResponse, FanOutError> {
        let n = job.inputs.len();
        let weights: Vec<usize> = workers
            .iter()
            .map(|w| match w.preferred_batch_size() as usize {
                0 => n,
                size => size,
            })
            .collect();
        let ranges = partition(n, &weights);
        let pool = WorkerPool::new(workers.clone());

        tracing::debug!(model = %job.model, inputs = n, slices = ranges.len(), "Fanning out embeddings");

        let slices = ranges
            .into_iter()
            .zip(workers)
            .map(|(range, worker)| self.run_slice(job, &pool, range, worker));
        let results = try_join_all(slices).await?;

        let mut merged = EmbeddingResponse {
            object: "list".to_string(),
            data: vec![Value::Null; n],
            ..Default::default()
        };
        for (range, resp) in results {
            if resp.data.len() != range.len() {
                tracing::warn!(
                    expected = range.len(),
                    got = resp.data.len(),
                    "Slice returned unexpected item count"
                );
            }
            for (offset, item) in resp.data.into_iter().take(range.len()).enumerate() {
                merged.data[range.start + offset] = item;
            }
            merged.usage += resp.usage;
            if merged.model.is_empty() {
                merged.model = resp.model;
            }
        }
        Ok(merged)
    }

    /// Run one slice, moving to another pooled worker on failure.
    async fn run_slice(
        &self,
        job: &EmbeddingJob,
        pool: &WorkerPool,
        range: Range<usize>,
        first: Arc<Worker>,
    ) -> Result<(Range<usize>, EmbeddingResponse), FanOutError> {
        let mut attempted = HashSet::new();
        let mut current = first;
        loop {
            let result = self.dispatch_slice(job, &current, &job.inputs[range.clone()]).await;
            pool.release(&current.id);
            let err = match result {
                Ok(resp) => return Ok((range, resp)),
                Err(err) => err,
            };

            tracing::warn!(
                worker_id = %current.id,
                slice_start = range.start,
                slice_len = range.len(),
                "Embedding slice failed: {}",
                err
            );
            attempted.insert(current.id.clone());
            if attempted.len() >= pool.len() {
                return Err(err);
            }
            match pool.acquire(&attempted).await {
                Some(next) => current = next,
                None => return Err(err),
            }
        }
    }

    async fn dispatch_slice(
        &self,
        job: &EmbeddingJob,
        worker: &Arc<Worker>,
        items: &[Value],
    ) -> Result<EmbeddingResponse, FanOutError> {
        let lease = WorkerLease::acquire(worker.clone()).ok_or(BrokerError::WorkerBusy)?;
        let request = ProxyRequest {
            method: "POST".to_string(),
            path: EMBEDDINGS_PATH.to_string(),
            headers: job.headers.clone(),
            stream: false,
            body: job.slice_body(items)?,
        };
        let dispatch = Dispatch::start(lease, request, self.timeouts, &job.model)?;
        let (status, body) = dispatch.collect().await?;
        if status.is_client_error() || status.is_server_error() {
            return Err(FanOutError::UpstreamStatus { status, body });
        }
        serde_json::from_slice(&body)
            .map_err(|e| BrokerError::Upstream(format!("invalid embeddings response: {}", e)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::registry::tests::test_worker;
    use crate::state::ServerState;
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use workpool_common::{BrokerMessage, ProxyError, WorkerMessage};

    #[rstest]
    #[case(6, vec![1, 1], vec![0..3, 3..6])]
    #[case(10, vec![2, 8], vec![0..2, 2..10])]
    #[case(3, vec![1000, 1, 1], vec![0..1, 1..2, 2..3])]
    #[case(4, vec![4, 4, 4, 4], vec![0..1, 1..2, 2..3, 3..4])]
    #[case(7, vec![7], vec![0..7])]
    fn test_partition(#[case] n: usize, #[case] weights: Vec<usize>, #[case] expected: Vec<Range<usize>>) {
        assert_eq!(partition(n, &weights), expected);
    }

    #[test]
    fn test_partition_covers_every_item() {
        for n in 2..40 {
            for weights in [vec![1, 50], vec![3, 3, 3], vec![100, 1, 1, 1], vec![n, 1]] {
                if weights.len() > n {
                    continue;
                }
                let ranges = partition(n, &weights);
                assert_eq!(ranges.len(), weights.len());
                assert_eq!(ranges.first().unwrap().start, 0);
                assert_eq!(ranges.last().unwrap().end, n);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
                assert!(ranges.iter().all(|r| !r.is_empty()));
            }
        }
    }

    #[tokio::test]
    async fn test_pool_waits_for_release() {
        let (a, _rx1) = test_worker("a", &["m"], 1);
        let (b, _rx2) = test_worker("b", &["m"], 1);
        let pool = Arc::new(WorkerPool::new(vec![a, b]));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let exclude = HashSet::from(["a".to_string()]);
                pool.acquire(&exclude).await.map(|w| w.id.clone())
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        pool.release("b");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_pool_gives_up_when_all_excluded() {
        let (a, _rx) = test_worker("a", &["m"], 1);
        let pool = WorkerPool::new(vec![a]);
        pool.release("a");
        assert!(pool.acquire(&HashSet::from(["a".to_string()])).await.is_none());
    }

    /// Answers embedding requests by echoing each input back as its vector.
    fn spawn_responder(worker: Arc<Worker>, mut rx: mpsc::Receiver<BrokerMessage>, delay: Duration, fail: bool) {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let BrokerMessage::HttpProxyRequest { request_id, body, .. } = msg else {
                    continue;
                };
                tokio::time::sleep(delay).await;
                if fail {
                    worker.deliver(WorkerMessage::HttpProxyResponseEnd {
                        request_id,
                        error: Some(ProxyError { code: "oom".into(), message: "out of memory".into() }),
                    });
                    continue;
                }
                let payload: Value = serde_json::from_slice(&body).unwrap();
                let inputs = payload["input"].as_array().unwrap().clone();
                let data: Vec<Value> = inputs
                    .iter()
                    .enumerate()
                    .map(|(i, input)| json!({"object": "embedding", "index": i, "embedding": input}))
                    .collect();
                let response = json!({
                    "object": "list",
                    "data": data,
                    "model": payload["model"],
                    "usage": {"prompt_tokens": inputs.len(), "total_tokens": inputs.len() * 2},
                });
                worker.deliver(WorkerMessage::HttpProxyResponseHeaders {
                    request_id: request_id.clone(),
                    status: 200,
                    headers: HashMap::new(),
                });
                worker.deliver(WorkerMessage::HttpProxyResponseChunk {
                    request_id: request_id.clone(),
                    data: serde_json::to_vec(&response).unwrap(),
                });
                worker.deliver(WorkerMessage::HttpProxyResponseEnd { request_id, error: None });
            }
        });
    }

    fn job(inputs: &[&str]) -> EmbeddingJob {
        let mut base = Map::new();
        base.insert("model".to_string(), json!("emb"));
        EmbeddingJob {
            model: "emb".to_string(),
            base,
            inputs: inputs.iter().map(|s| json!(s)).collect(),
            headers: HashMap::new(),
        }
    }

    fn fan_out(registry: Arc<WorkerRegistry>) -> FanOut {
        let timeouts = ProxyTimeouts { idle: Some(Duration::from_secs(5)), hard: None };
        FanOut::new(registry, timeouts, 4)
    }

    #[tokio::test]
    async fn test_parallel_reassembles_in_input_order() {
        let registry = Arc::new(WorkerRegistry::new(Arc::new(ServerState::new())));
        let (slow, slow_rx) = test_worker("slow", &["emb"], 2);
        let (fast, fast_rx) = test_worker("fast", &["emb"], 2);
        registry.add(slow.clone()).await;
        registry.add(fast.clone()).await;
        spawn_responder(slow.clone(), slow_rx, Duration::from_millis(50), false);
        spawn_responder(fast.clone(), fast_rx, Duration::ZERO, false);

        let inputs = ["a", "b", "c", "d", "e", "f"];
        let resp = fan_out(registry).run(&job(&inputs)).await.unwrap();

        assert_eq!(resp.data.len(), 6);
        for (i, input) in inputs.iter().enumerate() {
            assert_eq!(resp.data[i]["embedding"], json!(input));
        }
        assert_eq!(resp.usage.prompt_tokens, 6);
        assert_eq!(resp.usage.total_tokens, 12);
        assert_eq!(resp.model, "emb");
        assert_eq!(slow.in_flight(), 0);
        assert_eq!(fast.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_slice_retries_on_other_worker() {
        let registry = Arc::new(WorkerRegistry::new(Arc::new(ServerState::new())));
        let (broken, broken_rx) = test_worker("broken", &["emb"], 2);
        let (healthy, healthy_rx) = test_worker("healthy", &["emb"], 2);
        registry.add(broken.clone()).await;
        registry.add(healthy.clone()).await;
        spawn_responder(broken, broken_rx, Duration::ZERO, true);
        spawn_responder(healthy, healthy_rx, Duration::from_millis(10), false);

        let inputs = ["a", "b", "c", "d"];
        let resp = fan_out(registry).run(&job(&inputs)).await.unwrap();
        for (i, input) in inputs.iter().enumerate() {
            assert_eq!(resp.data[i]["embedding"], json!(input));
        }
        assert_eq!(resp.usage.prompt_tokens, 4);
    }

    #[tokio::test]
    async fn test_all_workers_failing_fails_request() {
        let registry = Arc::new(WorkerRegistry::new(Arc::new(ServerState::new())));
        let (a, a_rx) = test_worker("a", &["emb"], 2);
        let (b, b_rx) = test_worker("b", &["emb"], 2);
        registry.add(a.clone()).await;
        registry.add(b.clone()).await;
        spawn_responder(a, a_rx, Duration::ZERO, true);
        spawn_responder(b, b_rx, Duration::ZERO, true);

        let err = fan_out(registry).run(&job(&["a", "b", "c"])).await.unwrap_err();
        assert!(matches!(err, FanOutError::Broker(BrokerError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_single_worker_uses_preferred_batch_size() {
        let registry = Arc::new(WorkerRegistry::new(Arc::new(ServerState::new())));
        let (tx, rx) = mpsc::channel(32);
        let worker = Arc::new(Worker::new(
            "solo".into(),
            "solo".into(),
            None,
            crate::gateway::registry::Capabilities {
                labels: vec!["emb".into()],
                max_concurrency: 1,
                preferred_batch_size: 2,
            },
            tx,
        ));
        registry.add(worker.clone()).await;

        // Count slices on the way through.
        let (count_tx, mut count_rx) = mpsc::unbounded_channel();
        let (fwd_tx, fwd_rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(msg) = rx.recv().await {
                let _ = count_tx.send(());
                if fwd_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        spawn_responder(worker.clone(), fwd_rx, Duration::ZERO, false);

        let inputs = ["a", "b", "c", "d", "e"];
        let resp = fan_out(registry).run(&job(&inputs)).await.unwrap();
        assert_eq!(resp.data.len(), 5);
        assert_eq!(resp.data[4]["embedding"], json!("e"));

        let mut slices = 0;
        while count_rx.try_recv().is_ok() {
            slices += 1;
        }
        assert_eq!(slices, 3);
    }

    #[tokio::test]
    async fn test_no_worker() {
        let registry = Arc::new(WorkerRegistry::new(Arc::new(ServerState::new())));
        let err = fan_out(registry).run(&job(&["a"])).await.unwrap_err();
        assert!(matches!(err, FanOutError::NoWorker(_)));
    }
}
