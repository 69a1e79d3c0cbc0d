//! Consistent-hash task routing for Fleet.
//!
//! This crate provides:
//!
//! - [`Worker`]: the capability contract a task executor implements, plus
//!   [`SimulatedWorker`] for demos and tests.
//! - [`WorkerRegistry`] and [`WorkerHandle`]: live workers with their
//!   per-worker admission limit.
//! - [`HashRing`]: the placement ring and registry behind one lock.
//! - [`Dispatcher`]: a bounded queue with non-blocking submit and a dispatch
//!   loop that routes every task to the worker owning its ID.

pub mod dispatcher;
pub mod error;
pub mod hash_ring;
pub mod registry;
pub mod stats;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{ProcessError, RouterError};
pub use hash_ring::HashRing;
pub use registry::{WorkerHandle, WorkerRegistry};
pub use stats::{DispatchCounters, Stats, Totals, WorkerStats};
pub use worker::{SimulatedWorker, Worker};
