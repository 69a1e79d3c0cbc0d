//! Router statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use fleet_types::WorkerId;

use crate::registry::WorkerHandle;

/// Per-worker view.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub processed: u64,
    pub healthy: bool,
    pub load: f64,
    /// Tasks currently executing on this worker.
    pub in_flight: usize,
}

impl From<&WorkerHandle> for WorkerStats {
    fn from(handle: &WorkerHandle) -> Self {
        Self {
            id: handle.id().clone(),
            processed: handle.processed_count(),
            healthy: handle.is_healthy(),
            load: handle.load(),
            in_flight: handle.in_flight(),
        }
    }
}

/// Fleet-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub worker_count: usize,
    pub healthy_count: usize,
    pub total_processed: u64,
}

/// Dispatcher-side task accounting.
///
/// Every submitted task ends up in `dispatched` or one of the drop counters,
/// or is still waiting in the dispatcher queue or a worker's admission
/// queue. Dispatched tasks later land in `completed` or `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    /// Accepted by `submit`.
    pub submitted: u64,
    /// Rejected by `submit` with `QueueFull`.
    pub rejected: u64,
    /// Handed to a worker.
    pub dispatched: u64,
    /// Processed successfully.
    pub completed: u64,
    /// Worker returned an error.
    pub failed: u64,
    /// Dropped because the ring was empty.
    pub dropped_no_workers: u64,
    /// Dropped because the routed worker was unhealthy.
    pub dropped_unhealthy: u64,
    /// Dropped because the routed worker's admission queue was full.
    pub dropped_saturated: u64,
    /// Still queued when the dispatcher stopped.
    pub abandoned: u64,
}

impl DispatchCounters {
    /// Tasks that left the router without reaching a worker.
    pub fn dropped(&self) -> u64 {
        self.dropped_no_workers + self.dropped_unhealthy + self.dropped_saturated + self.abandoned
    }

    /// Tasks that reached a final routing decision: handed to a worker or
    /// dropped. Equals `submitted` once nothing is waiting.
    pub fn resolved(&self) -> u64 {
        self.dispatched + self.dropped()
    }
}

/// Snapshot returned by `Dispatcher::stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// Sorted by worker ID.
    pub workers: Vec<WorkerStats>,
    pub totals: Totals,
    pub dispatch: DispatchCounters,
}

impl Stats {
    pub(crate) fn collect(handles: &[WorkerHandle], dispatch: DispatchCounters) -> Self {
        let workers: Vec<WorkerStats> = handles.iter().map(WorkerStats::from).collect();
        let totals = Totals {
            worker_count: workers.len(),
            healthy_count: workers.iter().filter(|w| w.healthy).count(),
            total_processed: workers.iter().map(|w| w.processed).sum(),
        };
        Self {
            workers,
            totals,
            dispatch,
        }
    }

    /// Look up one worker's stats.
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerStats> {
        self.workers.iter().find(|w| w.id.as_str() == worker_id)
    }
}

/// Live counters shared between the dispatcher and its spawned tasks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub dropped_no_workers: AtomicU64,
    pub dropped_unhealthy: AtomicU64,
    pub dropped_saturated: AtomicU64,
    pub abandoned: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchCounters {
        DispatchCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_no_workers: self.dropped_no_workers.load(Ordering::Relaxed),
            dropped_unhealthy: self.dropped_unhealthy.load(Ordering::Relaxed),
            dropped_saturated: self.dropped_saturated.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}
