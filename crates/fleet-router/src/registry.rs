//! Live worker handles keyed by identity.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_types::WorkerId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::worker::Worker;

/// A registered worker plus its admission limit.
///
/// Cheap to clone. The semaphore bounds how many `process` calls the
/// dispatcher runs on this worker at once.
#[derive(Clone)]
pub struct WorkerHandle {
    worker: Arc<dyn Worker>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl WorkerHandle {
    /// Wrap a worker, allowing at most `max_in_flight` concurrent tasks.
    pub fn new(worker: Arc<dyn Worker>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            worker,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Worker identity.
    pub fn id(&self) -> &WorkerId {
        self.worker.id()
    }

    /// The underlying worker.
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn is_healthy(&self) -> bool {
        self.worker.is_healthy()
    }

    pub fn processed_count(&self) -> u64 {
        self.worker.processed_count()
    }

    pub fn load(&self) -> f64 {
        self.worker.load()
    }

    /// Tasks currently being processed through this handle.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Maximum concurrent tasks for this worker.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Wait for an admission permit.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", self.id())
            .field("healthy", &self.is_healthy())
            .field("in_flight", &self.in_flight())
            .field("max_in_flight", &self.max_in_flight)
            .finish()
    }
}

/// Worker handles keyed by ID.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle, returning the one it replaced.
    pub fn insert(&mut self, handle: WorkerHandle) -> Option<WorkerHandle> {
        self.workers.insert(handle.id().clone(), handle)
    }

    pub fn remove(&mut self, worker_id: &str) -> Option<WorkerHandle> {
        self.workers.remove(worker_id)
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerHandle> {
        self.workers.get(worker_id)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All handles, sorted by worker ID.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        let mut handles: Vec<WorkerHandle> = self.workers.values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }
}
