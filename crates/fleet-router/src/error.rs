//! Error types for routing and processing.

use fleet_types::WorkerId;

/// Failure reported by a worker while processing a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// The worker was unhealthy when the task reached it.
    #[error("worker {worker_id} is not healthy")]
    Unhealthy {
        /// The refusing worker.
        worker_id: WorkerId,
    },

    /// The worker attempted the task and failed.
    #[error("worker {worker_id} failed: {reason}")]
    Failed {
        /// The failing worker.
        worker_id: WorkerId,
        /// Worker-supplied description.
        reason: String,
    },
}

/// Errors produced by the router.
///
/// Only [`RouterError::QueueFull`] and [`RouterError::Stopped`] ever reach a
/// `submit` caller. The rest are produced inside the dispatch loop and
/// surface through stats, events and logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// The bounded task queue is at capacity. Not retried internally.
    #[error("task queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The ring had no workers at lookup time.
    #[error("no workers available")]
    NoWorkersAvailable,

    /// The routed worker failed its health check.
    #[error("worker {worker_id} is not healthy")]
    WorkerUnhealthy {
        /// The worker the task was routed to.
        worker_id: WorkerId,
    },

    /// A worker reported a processing failure.
    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    /// `start` was called on a running dispatcher.
    #[error("dispatcher already started")]
    AlreadyStarted,

    /// The dispatcher has been stopped and accepts no more work.
    #[error("dispatcher stopped")]
    Stopped,
}
