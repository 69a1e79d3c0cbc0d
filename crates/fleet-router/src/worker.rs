//! Worker capability contract and a simulated implementation.
//!
//! The router consumes workers only through [`Worker`]. Any backend (a
//! thread pool, an RPC stub, a test double) can sit behind it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use fleet_types::{Task, WorkerId};
use tracing::{debug, info};

use crate::error::ProcessError;

/// A unit of work execution.
///
/// The dispatcher may call `process` concurrently on the same worker, up to
/// the configured per-worker in-flight limit. Implementations that cannot
/// handle that must serialize internally.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Unique worker identity. Must not change over the worker's lifetime.
    fn id(&self) -> &WorkerId;

    /// Process one task.
    async fn process(&self, task: &Task) -> Result<(), ProcessError>;

    /// Health check consulted by the dispatcher before handing over a task.
    fn is_healthy(&self) -> bool;

    /// Current load metric. Opaque to the router; reported in stats.
    fn load(&self) -> f64;

    /// Number of tasks processed successfully.
    fn processed_count(&self) -> u64;
}

/// In-process worker that simulates work by sleeping.
///
/// Health can be toggled out-of-band with [`SimulatedWorker::set_healthy`]
/// while the worker is registered. Processing is fully concurrent: there is
/// no worker-side lock.
#[derive(Debug)]
pub struct SimulatedWorker {
    id: WorkerId,
    processing_time: Duration,
    healthy: AtomicBool,
    processed: AtomicU64,
}

impl SimulatedWorker {
    /// Create a healthy worker that takes `processing_time` per task.
    pub fn new(id: impl Into<WorkerId>, processing_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            processing_time,
            healthy: AtomicBool::new(true),
            processed: AtomicU64::new(0),
        })
    }

    /// Mark the worker healthy or failed.
    pub fn set_healthy(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::SeqCst);
        if was != healthy {
            info!(worker_id = %self.id, healthy, "worker health changed");
        }
    }

    /// Simulated time spent per task.
    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }
}

#[async_trait::async_trait]
impl Worker for SimulatedWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn process(&self, task: &Task) -> Result<(), ProcessError> {
        // Health may flip between routing and execution.
        if !self.is_healthy() {
            return Err(ProcessError::Unhealthy {
                worker_id: self.id.clone(),
            });
        }

        debug!(worker_id = %self.id, task_id = %task.id, "processing task");
        tokio::time::sleep(self.processing_time).await;

        let total = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(worker_id = %self.id, task_id = %task.id, total, "task processed");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Processing time in seconds: slower workers report a higher load.
    fn load(&self) -> f64 {
        self.processing_time.as_secs_f64()
    }

    fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}
