//! Shared test harness for Fleet integration tests.
//!
//! Provides [`TestFleet`]: a running [`Dispatcher`] over a set of
//! [`RecordingWorker`]s that remember which tasks they processed, so tests
//! can check end-to-end routing against ring ownership.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_router::{Dispatcher, ProcessError, Stats, Worker};
use fleet_types::{RouterConfig, Task, TaskId, WorkerId};
use tracing::debug;

/// How long [`TestFleet::wait_for`] waits before failing the test.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test-friendly subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `"{prefix}-{i}"` for every `i` in `range`.
pub fn task_ids(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("{prefix}-{i}")).collect()
}

// =========================================================================
// Recording worker
// =========================================================================

/// Worker that records every task it completes, and how many `process`
/// calls ever ran on it at once.
pub struct RecordingWorker {
    id: WorkerId,
    processing_time: Duration,
    healthy: AtomicBool,
    seen: Mutex<Vec<TaskId>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl RecordingWorker {
    pub fn new(id: &str, processing_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: WorkerId::from(id),
            processing_time,
            healthy: AtomicBool::new(true),
            seen: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Task IDs processed so far, in completion order.
    pub fn seen(&self) -> Vec<TaskId> {
        self.seen.lock().unwrap().clone()
    }

    /// Highest number of overlapping `process` calls observed.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn process(&self, task: &Task) -> Result<(), ProcessError> {
        if !self.is_healthy() {
            return Err(ProcessError::Unhealthy {
                worker_id: self.id.clone(),
            });
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        if !self.processing_time.is_zero() {
            tokio::time::sleep(self.processing_time).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        debug!(worker_id = %self.id, task_id = %task.id, "recorded task");
        self.seen.lock().unwrap().push(task.id.clone());
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn load(&self) -> f64 {
        self.processing_time.as_secs_f64()
    }

    fn processed_count(&self) -> u64 {
        self.seen.lock().unwrap().len() as u64
    }
}

// =========================================================================
// TestFleet
// =========================================================================

/// A started dispatcher plus handles to its workers.
pub struct TestFleet {
    pub dispatcher: Arc<Dispatcher>,
    workers: BTreeMap<String, Arc<RecordingWorker>>,
}

impl TestFleet {
    /// `worker-1` .. `worker-n`, each taking `processing_time` per task.
    pub async fn new(n: usize, processing_time: Duration, config: RouterConfig) -> Self {
        let ids: Vec<String> = (1..=n).map(|i| format!("worker-{i}")).collect();
        let specs: Vec<(&str, Duration)> =
            ids.iter().map(|id| (id.as_str(), processing_time)).collect();
        Self::with_workers(&specs, config).await
    }

    /// Build a fleet from explicit `(id, processing_time)` pairs and start it.
    pub async fn with_workers(specs: &[(&str, Duration)], config: RouterConfig) -> Self {
        init_tracing();
        let mut fleet = Self {
            dispatcher: Arc::new(Dispatcher::new(config)),
            workers: BTreeMap::new(),
        };
        for (id, processing_time) in specs {
            fleet.add(id, *processing_time).await;
        }
        fleet.dispatcher.start().unwrap();
        fleet
    }

    pub fn worker(&self, id: &str) -> &Arc<RecordingWorker> {
        self.workers
            .get(id)
            .unwrap_or_else(|| panic!("unknown worker {id}"))
    }

    pub async fn add(&mut self, id: &str, processing_time: Duration) -> Arc<RecordingWorker> {
        let worker = RecordingWorker::new(id, processing_time);
        self.dispatcher.add_worker(worker.clone()).await;
        self.workers.insert(id.to_string(), worker.clone());
        worker
    }

    pub async fn remove(&mut self, id: &str) -> bool {
        self.workers.remove(id);
        self.dispatcher.remove_worker(id).await
    }

    /// Submit every ID, returning how many were accepted.
    pub fn submit_all(&self, ids: &[String]) -> usize {
        ids.iter()
            .filter(|id| self.dispatcher.submit(Task::new(id.as_str(), "x")).is_ok())
            .count()
    }

    /// Current owner of each ID on the ring.
    pub async fn owners(&self, ids: &[String]) -> HashMap<String, String> {
        let mut owners = HashMap::new();
        for id in ids {
            let handle = self.dispatcher.ring().lookup(id).await.unwrap();
            owners.insert(id.clone(), handle.id().to_string());
        }
        owners
    }

    /// Which worker processed each task, across all current workers.
    pub fn processed_by(&self) -> HashMap<String, String> {
        let mut by = HashMap::new();
        for (worker_id, worker) in &self.workers {
            for task_id in worker.seen() {
                by.insert(task_id.to_string(), worker_id.clone());
            }
        }
        by
    }

    /// Poll stats until `cond` holds, failing the test after a timeout.
    pub async fn wait_for(&self, cond: impl Fn(&Stats) -> bool) -> Stats {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let stats = self.dispatcher.stats().await;
            if cond(&stats) {
                return stats;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for fleet: {stats:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until every submitted task has been routed and finished.
    pub async fn settle(&self) -> Stats {
        let dispatcher = self.dispatcher.clone();
        self.wait_for(move |s| {
            let d = &s.dispatch;
            dispatcher.queue_len() == 0
                && d.resolved() == d.submitted
                && d.completed + d.failed == d.dispatched
        })
        .await
    }

    /// Wait until the dispatch loop has taken every task off the queue.
    pub async fn drain_queue(&self) {
        let dispatcher = self.dispatcher.clone();
        self.wait_for(move |_| dispatcher.queue_len() == 0).await;
    }

    pub async fn stop(&self) {
        self.dispatcher.stop().await;
    }
}
