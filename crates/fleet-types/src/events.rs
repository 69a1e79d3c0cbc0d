//! Type-safe event bus for router outcomes.
//!
//! Routing and processing failures happen after `submit` has returned, so
//! the dispatcher reports them here. Any component can subscribe to the
//! event types it cares about without coupling to the dispatcher.
//!
//! # Design
//!
//! Each event type is a distinct struct implementing the [`Event`] marker
//! trait. The bus keeps a `HashMap<TypeId, Box<dyn Any>>` where each value is
//! a `tokio::sync::broadcast::Sender<E>`, created lazily on the first
//! `subscribe()` for that type.
//!
//! # Example
//!
//! ```rust
//! use fleet_types::events::{DropReason, EventBus, TaskDropped};
//! use fleet_types::TaskId;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<TaskDropped>();
//!
//! bus.emit(TaskDropped {
//!     task_id: TaskId::from("task-01"),
//!     reason: DropReason::NoWorkersAvailable,
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.task_id, TaskId::from("task-01"));
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::{TaskId, WorkerId};

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Why a task was dropped without being processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The ring was empty at lookup time.
    NoWorkersAvailable,
    /// The routed worker failed its health check.
    WorkerUnhealthy(WorkerId),
    /// The routed worker's admission queue was full.
    WorkerSaturated(WorkerId),
    /// The task was still queued when the dispatcher stopped.
    Abandoned,
}

/// A task was routed and handed to a worker.
#[derive(Clone, Debug)]
pub struct TaskDispatched {
    /// The dispatched task.
    pub task_id: TaskId,
    /// The worker it was handed to.
    pub worker_id: WorkerId,
}
impl Event for TaskDispatched {}

/// A worker finished processing a task successfully.
#[derive(Clone, Debug)]
pub struct TaskCompleted {
    /// The completed task.
    pub task_id: TaskId,
    /// The worker that processed it.
    pub worker_id: WorkerId,
    /// Time spent inside `process`.
    pub elapsed: Duration,
}
impl Event for TaskCompleted {}

/// A worker reported a failure while processing a task.
#[derive(Clone, Debug)]
pub struct TaskFailed {
    /// The failed task.
    pub task_id: TaskId,
    /// The worker that failed it.
    pub worker_id: WorkerId,
    /// Rendered error.
    pub error: String,
}
impl Event for TaskFailed {}

/// A task left the router without reaching a worker.
#[derive(Clone, Debug)]
pub struct TaskDropped {
    /// The dropped task.
    pub task_id: TaskId,
    /// Why it was dropped.
    pub reason: DropReason,
}
impl Event for TaskDropped {}

/// A worker was added to the ring (or re-added, replacing its vnodes).
#[derive(Clone, Debug)]
pub struct WorkerJoined {
    /// The worker that joined.
    pub worker_id: WorkerId,
    /// Number of virtual nodes it owns.
    pub vnodes: u16,
}
impl Event for WorkerJoined {}

/// A worker was removed from the ring.
#[derive(Clone, Debug)]
pub struct WorkerLeft {
    /// The worker that left.
    pub worker_id: WorkerId,
}
impl Event for WorkerLeft {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus.
///
/// Clonable (`Arc` inside). Thread-safe. Non-blocking emits.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Non-blocking: with no subscribers the event is dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(sender) = inner
            .channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // Err only means nobody is listening right now.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    ///
    /// Only events emitted after this call are received.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventReceiver
// ---------------------------------------------------------------------------

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the bus has been dropped. Lagged events are
    /// skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
