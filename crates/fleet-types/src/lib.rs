//! Shared types for Fleet.
//!
//! This crate defines the core types used across the Fleet workspace:
//! identifiers ([`TaskId`], [`WorkerId`]), the unit of work ([`Task`]),
//! router configuration ([`RouterConfig`], [`UnhealthyPolicy`]), and the
//! typed [`events::EventBus`] used to report asynchronous outcomes.

pub mod events;

use std::borrow::Borrow;
use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an ID from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Return the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Caller-supplied task identifier. Doubles as the routing key.
    TaskId
);

define_id!(
    /// Unique identifier of a worker in the fleet.
    WorkerId
);

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work submitted to the router.
///
/// Immutable once submitted. The payload is opaque to the router; only
/// `id` takes part in routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Routing key.
    pub id: TaskId,
    /// Opaque task data, handed to the worker untouched.
    pub payload: Bytes,
    /// When the task was created.
    pub created_at: SystemTime,
}

impl Task {
    /// Create a task stamped with the current time.
    pub fn new(id: impl Into<TaskId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            created_at: SystemTime::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What the dispatcher does when the ring routes a task to an unhealthy worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyPolicy {
    /// Drop the task and report it. No re-routing.
    #[default]
    Drop,
    /// Walk the ring clockwise to the next healthy worker; drop only if
    /// every worker is unhealthy.
    NextHealthy,
}

/// Router tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Virtual nodes per worker on the ring.
    pub replicas: u16,
    /// Capacity of the bounded task queue.
    pub queue_capacity: usize,
    /// Maximum concurrent `process` calls per worker.
    pub max_in_flight_per_worker: usize,
    /// Tasks a worker may have routed to it but not yet started. Once full,
    /// further tasks for that worker are dropped as saturated.
    pub worker_queue_capacity: usize,
    /// Behavior when the routed worker fails its health check.
    pub unhealthy_policy: UnhealthyPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            queue_capacity: 100,
            max_in_flight_per_worker: 16,
            worker_queue_capacity: 100,
            unhealthy_policy: UnhealthyPolicy::Drop,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
