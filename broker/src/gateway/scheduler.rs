//! Least-busy worker selection with alias fallback.

use std::sync::Arc;

use thiserror::Error;

use super::registry::{Worker, WorkerRegistry};
use crate::error::BrokerError;

/// Errors from worker selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("No worker available for '{0}'")]
    NoWorker(String),
}

impl From<RouteError> for BrokerError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoWorker(label) => BrokerError::NoWorker(label),
        }
    }
}

/// One reserved in-flight slot on a worker, released on drop.
#[derive(Debug)]
pub struct WorkerLease {
    worker: Arc<Worker>,
}

impl WorkerLease {
    /// Reserve a slot on `worker` if it has capacity.
    pub fn acquire(worker: Arc<Worker>) -> Option<Self> {
        worker.try_acquire().then_some(Self { worker })
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.worker.dec_in_flight();
    }
}

/// Picks a worker for a label.
///
/// Exact label matches always win over alias matches, whatever their load.
/// Within a group the least busy worker is taken, ties going to the oldest
/// connection.
#[derive(Debug, Clone)]
pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
}

impl Scheduler {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Select a worker for `label` and reserve a slot on it.
    pub async fn pick_worker(&self, label: &str) -> Result<WorkerLease, RouteError> {
        let exact = self.registry.workers_for_label(label).await;
        if let Some(lease) = lease_least_busy(exact) {
            tracing::debug!(model = label, worker_id = %lease.worker().id, "Selected exact match");
            return Ok(lease);
        }

        let alias = self.registry.workers_for_alias(label).await;
        if let Some(lease) = lease_least_busy(alias) {
            tracing::debug!(model = label, worker_id = %lease.worker().id, "Selected alias match");
            return Ok(lease);
        }

        Err(RouteError::NoWorker(label.to_string()))
    }
}

/// Try candidates from least to most busy until one accepts a reservation.
fn lease_least_busy(mut candidates: Vec<Arc<Worker>>) -> Option<WorkerLease> {
    candidates.sort_by_key(|w| w.in_flight());
    candidates.into_iter().find_map(WorkerLease::acquire)
}
