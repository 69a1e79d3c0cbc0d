//! Dispatcher: accepts tasks into a bounded queue and routes them to
//! workers through the hash ring.
//!
//! `submit` never waits. A single dispatch loop drains the queue, resolves
//! the target worker and hands the task to that worker's lane: a bounded
//! admission queue drained by a per-worker executor. The loop itself never
//! waits on a worker, so one saturated worker cannot hold up routing for the
//! rest of the fleet. Failures after `submit` returns are reported through
//! [`Stats`], the [`EventBus`] and logs; nothing is retried here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fleet_types::events::{
    DropReason, EventBus, TaskCompleted, TaskDispatched, TaskDropped, TaskFailed,
};
use fleet_types::{RouterConfig, Task, UnhealthyPolicy, WorkerId};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::RouterError;
use crate::hash_ring::HashRing;
use crate::registry::WorkerHandle;
use crate::stats::{Counters, Stats};
use crate::worker::Worker;

/// Lifecycle of the dispatch loop.
///
/// `Idle` → `Running` → `Stopping` → `Stopped`. There is no pause/resume
/// and a stopped dispatcher cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Created, loop not started. Submitted tasks are buffered.
    Idle,
    /// Loop is consuming the queue.
    Running,
    /// Stop requested; loop exits after its current iteration.
    Stopping,
    /// Terminal.
    Stopped,
}

/// Bounded-queue task router over a [`HashRing`].
///
/// Routed tasks wait in the target worker's lane (at most
/// `worker_queue_capacity` of them) until one of the worker's
/// `max_in_flight_per_worker` permits frees up, then run in their own tokio
/// task. A task routed to a worker whose lane is full is dropped and
/// reported as [`DropReason::WorkerSaturated`].
///
/// `stop` does not wait for tasks that are already executing.
pub struct Dispatcher {
    ring: Arc<HashRing>,
    config: RouterConfig,
    queue_capacity: usize,
    tx: mpsc::Sender<Task>,
    /// Taken by the loop on `start`.
    rx: Mutex<Option<mpsc::Receiver<Task>>>,
    state: watch::Sender<DispatcherState>,
    shutdown_tx: watch::Sender<bool>,
    /// Loop handle. Held while changing state so `start` and `stop` see a
    /// consistent pair.
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    events: EventBus,
}

impl Dispatcher {
    /// Create a dispatcher with an empty ring and its own event bus.
    pub fn new(config: RouterConfig) -> Self {
        let events = EventBus::new();
        let ring = HashRing::new(
            config.replicas,
            config.max_in_flight_per_worker,
            events.clone(),
        );
        Self::with_ring(config, ring, events)
    }

    /// Create a dispatcher over an existing ring.
    pub fn with_ring(config: RouterConfig, ring: Arc<HashRing>, events: EventBus) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (state, _) = watch::channel(DispatcherState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            ring,
            config,
            queue_capacity,
            tx,
            rx: Mutex::new(Some(rx)),
            state,
            shutdown_tx,
            task: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            events,
        }
    }

    /// Add a worker to the ring (replacing one with the same ID).
    pub async fn add_worker(&self, worker: Arc<dyn Worker>) {
        self.ring.add_worker(worker).await;
    }

    /// Remove a worker from the ring. Returns `false` if it was unknown.
    pub async fn remove_worker(&self, worker_id: &str) -> bool {
        self.ring.remove_worker(worker_id).await
    }

    /// Enqueue a task without blocking.
    ///
    /// Returns [`RouterError::QueueFull`] when the queue is at capacity and
    /// [`RouterError::Stopped`] once the dispatcher has been stopped.
    pub fn submit(&self, task: Task) -> Result<(), RouterError> {
        if matches!(
            self.state(),
            DispatcherState::Stopping | DispatcherState::Stopped
        ) {
            return Err(RouterError::Stopped);
        }

        let task_id = task.id.clone();
        match self.tx.try_send(task) {
            Ok(()) => {
                Counters::incr(&self.counters.submitted);
                debug!(%task_id, "task queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                Counters::incr(&self.counters.rejected);
                debug!(%task_id, capacity = self.queue_capacity, "task rejected, queue full");
                Err(RouterError::QueueFull {
                    capacity: self.queue_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(RouterError::Stopped),
        }
    }

    /// Spawn the dispatch loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), RouterError> {
        let mut task = self.task.lock().expect("dispatcher lock poisoned");
        if matches!(
            self.state(),
            DispatcherState::Stopping | DispatcherState::Stopped
        ) {
            return Err(RouterError::Stopped);
        }
        let Some(rx) = self.rx.lock().expect("dispatcher lock poisoned").take() else {
            return Err(RouterError::AlreadyStarted);
        };

        let dispatch_loop = DispatchLoop {
            ring: self.ring.clone(),
            policy: self.config.unhealthy_policy,
            rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            lanes: HashMap::new(),
            lane_capacity: self.config.worker_queue_capacity.max(1),
            counters: self.counters.clone(),
            events: self.events.clone(),
        };

        self.state.send_replace(DispatcherState::Running);
        *task = Some(tokio::spawn(dispatch_loop.run()));

        info!(
            queue_capacity = self.queue_capacity,
            worker_queue_capacity = self.config.worker_queue_capacity,
            replicas = self.ring.replicas(),
            policy = ?self.config.unhealthy_policy,
            "dispatcher started"
        );
        Ok(())
    }

    /// Stop the dispatch loop and wait for it to exit.
    ///
    /// Tasks still queued, in the dispatcher or in a worker lane, are
    /// abandoned and reported. Tasks already handed to workers keep running
    /// and may finish after this returns. Concurrent callers all return once
    /// the dispatcher is `Stopped`.
    pub async fn stop(&self) {
        // `None`: someone else is driving the shutdown.
        let handle = {
            let mut task = self.task.lock().expect("dispatcher lock poisoned");
            let initiated = self.state.send_if_modified(|state| match state {
                DispatcherState::Idle | DispatcherState::Running => {
                    *state = DispatcherState::Stopping;
                    true
                }
                DispatcherState::Stopping | DispatcherState::Stopped => false,
            });
            if initiated {
                self.shutdown_tx.send_replace(true);
                Some(task.take())
            } else {
                None
            }
        };

        let Some(handle) = handle else {
            let mut state_rx = self.state.subscribe();
            // The sender lives in `self`, so this only returns once stopped.
            let _ = state_rx
                .wait_for(|state| *state == DispatcherState::Stopped)
                .await;
            return;
        };

        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "dispatch loop terminated abnormally");
                }
            }
            None => {
                // Never started: abandon whatever was buffered.
                let rx = self.rx.lock().expect("dispatcher lock poisoned").take();
                if let Some(mut rx) = rx {
                    abandon(drain(&mut rx), &self.counters, &self.events);
                }
            }
        }

        self.state.send_replace(DispatcherState::Stopped);
        info!(stats = ?self.counters.snapshot(), "dispatcher stopped");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Number of tasks waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.queue_capacity - self.tx.capacity()
    }

    /// Configured queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Snapshot of worker and dispatch statistics.
    pub async fn stats(&self) -> Stats {
        let handles = self.ring.list_workers().await;
        Stats::collect(&handles, self.counters.snapshot())
    }

    /// The ring this dispatcher routes over.
    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    /// Bus carrying dispatch, drop and failure events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_len", &self.queue_len())
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------
// Dispatch loop
// -----------------------------------------------------------------------

/// The single consumer of the task queue.
struct DispatchLoop {
    ring: Arc<HashRing>,
    policy: UnhealthyPolicy,
    rx: mpsc::Receiver<Task>,
    shutdown_rx: watch::Receiver<bool>,
    /// One lane per worker ID seen so far.
    lanes: HashMap<WorkerId, Lane>,
    lane_capacity: usize,
    counters: Arc<Counters>,
    events: EventBus,
}

impl DispatchLoop {
    async fn run(mut self) {
        info!("dispatch loop started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                task = self.rx.recv() => match task {
                    Some(task) => self.dispatch(task).await,
                    None => break,
                },
            }
        }

        abandon(drain(&mut self.rx), &self.counters, &self.events);

        for (worker_id, lane) in self.lanes.drain() {
            drop(lane.tx);
            if let Err(e) = lane.executor.await {
                error!(%worker_id, error = %e, "worker lane terminated abnormally");
            }
        }
        info!("dispatch loop stopped");
    }

    async fn dispatch(&mut self, task: Task) {
        let handle = match self.ring.route(task.id.as_str(), self.policy).await {
            Ok(handle) => handle,
            Err(RouterError::WorkerUnhealthy { worker_id }) => {
                Counters::incr(&self.counters.dropped_unhealthy);
                warn!(task_id = %task.id, %worker_id, "worker unhealthy, task dropped");
                self.report_drop(task, DropReason::WorkerUnhealthy(worker_id));
                return;
            }
            Err(e) => {
                Counters::incr(&self.counters.dropped_no_workers);
                warn!(task_id = %task.id, error = %e, "no route for task, task dropped");
                self.report_drop(task, DropReason::NoWorkersAvailable);
                return;
            }
        };

        let worker_id = handle.id().clone();
        let lane = self.lanes.entry(worker_id.clone()).or_insert_with(|| {
            Lane::spawn(
                worker_id.clone(),
                self.lane_capacity,
                self.shutdown_rx.clone(),
                self.counters.clone(),
                self.events.clone(),
            )
        });

        match lane.tx.try_send((handle, task)) {
            Ok(()) => debug!(%worker_id, "task admitted to worker lane"),
            Err(TrySendError::Full((_, task))) => {
                Counters::incr(&self.counters.dropped_saturated);
                warn!(
                    task_id = %task.id,
                    %worker_id,
                    capacity = self.lane_capacity,
                    "worker saturated, task dropped"
                );
                self.report_drop(task, DropReason::WorkerSaturated(worker_id));
            }
            Err(TrySendError::Closed((_, task))) => {
                Counters::incr(&self.counters.abandoned);
                self.report_drop(task, DropReason::Abandoned);
            }
        }
    }

    fn report_drop(&self, task: Task, reason: DropReason) {
        self.events.emit(TaskDropped {
            task_id: task.id,
            reason,
        });
    }
}

// -----------------------------------------------------------------------
// Worker lanes
// -----------------------------------------------------------------------

/// Routed tasks waiting for one worker, plus the executor draining them.
struct Lane {
    tx: mpsc::Sender<(WorkerHandle, Task)>,
    executor: JoinHandle<()>,
}

impl Lane {
    fn spawn(
        worker_id: WorkerId,
        capacity: usize,
        shutdown_rx: watch::Receiver<bool>,
        counters: Arc<Counters>,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let executor = LaneExecutor {
            worker_id,
            rx,
            shutdown_rx,
            counters,
            events,
        };
        Self {
            tx,
            executor: tokio::spawn(executor.run()),
        }
    }
}

/// Starts a lane's tasks in order, one per free worker permit.
///
/// The handle travels with each task, so tasks routed before a worker was
/// re-added still run against the handle they were routed to.
struct LaneExecutor {
    worker_id: WorkerId,
    rx: mpsc::Receiver<(WorkerHandle, Task)>,
    shutdown_rx: watch::Receiver<bool>,
    counters: Arc<Counters>,
    events: EventBus,
}

impl LaneExecutor {
    async fn run(mut self) {
        debug!(worker_id = %self.worker_id, "worker lane started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let (handle, task) = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                next = self.rx.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            if handle.in_flight() >= handle.max_in_flight() {
                debug!(worker_id = %self.worker_id, "worker busy, waiting for a permit");
            }
            let permit = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => None,
                permit = handle.acquire() => permit,
            };
            let Some(permit) = permit else {
                abandon([task], &self.counters, &self.events);
                continue;
            };

            Counters::incr(&self.counters.dispatched);
            debug!(task_id = %task.id, worker_id = %self.worker_id, "task dispatched");
            self.events.emit(TaskDispatched {
                task_id: task.id.clone(),
                worker_id: self.worker_id.clone(),
            });

            spawn_process(handle, task, permit, self.counters.clone(), self.events.clone());
        }

        abandon(
            drain(&mut self.rx).map(|(_, task)| task),
            &self.counters,
            &self.events,
        );
        debug!(worker_id = %self.worker_id, "worker lane stopped");
    }
}

fn spawn_process(
    handle: WorkerHandle,
    task: Task,
    permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
    events: EventBus,
) {
    tokio::spawn(async move {
        let _permit = permit;
        let worker_id = handle.id().clone();
        let started = Instant::now();

        match handle.worker().process(&task).await {
            Ok(()) => {
                Counters::incr(&counters.completed);
                let elapsed = started.elapsed();
                debug!(task_id = %task.id, %worker_id, elapsed_ms = elapsed.as_millis(), "task completed");
                events.emit(TaskCompleted {
                    task_id: task.id,
                    worker_id,
                    elapsed,
                });
            }
            Err(e) => {
                Counters::incr(&counters.failed);
                error!(task_id = %task.id, %worker_id, error = %e, "task processing failed");
                events.emit(TaskFailed {
                    task_id: task.id,
                    worker_id,
                    error: e.to_string(),
                });
            }
        }
    });
}

/// Close `rx` and yield whatever it still holds.
fn drain<T>(rx: &mut mpsc::Receiver<T>) -> impl Iterator<Item = T> + '_ {
    rx.close();
    std::iter::from_fn(move || rx.try_recv().ok())
}

/// Report every task as abandoned at shutdown.
fn abandon(tasks: impl IntoIterator<Item = Task>, counters: &Counters, events: &EventBus) {
    let mut abandoned = 0u64;
    for task in tasks {
        Counters::incr(&counters.abandoned);
        events.emit(TaskDropped {
            task_id: task.id,
            reason: DropReason::Abandoned,
        });
        abandoned += 1;
    }
    if abandoned > 0 {
        warn!(abandoned, "queued tasks abandoned at shutdown");
    }
}
