//! Shared routing state: placement ring plus live worker registry.
//!
//! [`HashRing`] is the read-mostly structure the dispatcher consults for
//! every task. Ring and registry sit behind one lock so that every position
//! on the ring always has a registered worker behind it.

use std::sync::Arc;

use fleet_placement::Ring;
use fleet_types::events::{EventBus, WorkerJoined, WorkerLeft};
use fleet_types::{UnhealthyPolicy, WorkerId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::RouterError;
use crate::registry::{WorkerHandle, WorkerRegistry};
use crate::worker::Worker;

struct Membership {
    ring: Ring,
    registry: WorkerRegistry,
}

/// Consistent hash ring over the live worker fleet.
///
/// Mutations (`add_worker`, `remove_worker`) take the write lock; lookups
/// take the read lock and run concurrently with each other.
pub struct HashRing {
    inner: RwLock<Membership>,
    /// Vnodes per worker.
    replicas: u16,
    /// Admission limit given to every registered worker.
    max_in_flight_per_worker: usize,
    events: EventBus,
}

impl HashRing {
    /// Create an empty ring.
    ///
    /// `replicas` is raised to 1 if zero: a worker without vnodes could be
    /// registered but never routed to.
    pub fn new(replicas: u16, max_in_flight_per_worker: usize, events: EventBus) -> Arc<Self> {
        if replicas == 0 {
            warn!("replicas must be at least 1, using 1");
        }
        let replicas = replicas.max(1);
        Arc::new(Self {
            inner: RwLock::new(Membership {
                ring: Ring::new(replicas),
                registry: WorkerRegistry::new(),
            }),
            replicas,
            max_in_flight_per_worker,
            events,
        })
    }

    /// Vnodes per worker.
    pub fn replicas(&self) -> u16 {
        self.replicas
    }

    /// Add a worker, or replace the worker registered under the same ID.
    ///
    /// Re-adding replaces the vnodes instead of duplicating them.
    pub async fn add_worker(&self, worker: Arc<dyn Worker>) {
        let handle = WorkerHandle::new(worker, self.max_in_flight_per_worker);
        let worker_id = handle.id().clone();

        let replaced = {
            let mut inner = self.inner.write().await;
            inner.ring.add_worker(worker_id.clone());
            inner.registry.insert(handle).is_some()
        };

        info!(%worker_id, vnodes = self.replicas, replaced, "worker added to ring");
        self.events.emit(WorkerJoined {
            worker_id,
            vnodes: self.replicas,
        });
    }

    /// Remove a worker and its vnodes.
    ///
    /// Only keys in the removed worker's arcs move, each to the next worker
    /// clockwise. Returns `false` if the worker was not registered.
    pub async fn remove_worker(&self, worker_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.ring.remove_worker(worker_id);
            inner.registry.remove(worker_id).is_some()
        };

        if removed {
            info!(%worker_id, "worker removed from ring");
            self.events.emit(WorkerLeft {
                worker_id: WorkerId::from(worker_id),
            });
        } else {
            debug!(%worker_id, "remove ignored, worker not on ring");
        }
        removed
    }

    /// Return the worker owning `task_id`.
    pub async fn lookup(&self, task_id: &str) -> Result<WorkerHandle, RouterError> {
        let inner = self.inner.read().await;
        owner_handle(&inner, task_id)
    }

    /// Return a worker for `task_id` that passes its health check.
    ///
    /// With [`UnhealthyPolicy::Drop`] only the owner is considered. With
    /// [`UnhealthyPolicy::NextHealthy`] the ring is walked clockwise over
    /// distinct workers until a healthy one is found. Either way the error
    /// names the owner when no healthy worker was found.
    pub async fn route(
        &self,
        task_id: &str,
        policy: UnhealthyPolicy,
    ) -> Result<WorkerHandle, RouterError> {
        let inner = self.inner.read().await;
        let owner = owner_handle(&inner, task_id)?;
        if owner.is_healthy() {
            return Ok(owner);
        }

        if policy == UnhealthyPolicy::NextHealthy {
            let candidates = inner.ring.owners(task_id, inner.registry.len());
            let next = candidates
                .iter()
                .skip(1)
                .filter_map(|worker_id| inner.registry.get(worker_id.as_str()))
                .find(|handle| handle.is_healthy());

            if let Some(handle) = next {
                debug!(
                    %task_id,
                    owner = %owner.id(),
                    rerouted_to = %handle.id(),
                    "owner unhealthy, rerouted to next healthy worker"
                );
                return Ok(handle.clone());
            }
        }

        Err(RouterError::WorkerUnhealthy {
            worker_id: owner.id().clone(),
        })
    }

    /// Return the first healthy worker clockwise from the owner of `task_id`.
    pub async fn lookup_healthy(&self, task_id: &str) -> Result<WorkerHandle, RouterError> {
        self.route(task_id, UnhealthyPolicy::NextHealthy).await
    }

    /// Return all registered workers, sorted by ID.
    pub async fn list_workers(&self) -> Vec<WorkerHandle> {
        self.inner.read().await.registry.handles()
    }

    /// Return a registered worker by ID.
    pub async fn worker(&self, worker_id: &str) -> Option<WorkerHandle> {
        self.inner.read().await.registry.get(worker_id).cloned()
    }

    /// Return a clone of the current placement ring.
    pub async fn ring(&self) -> Ring {
        self.inner.read().await.ring.clone()
    }

    /// Return the number of registered workers.
    pub async fn worker_count(&self) -> usize {
        self.inner.read().await.registry.len()
    }
}

fn owner_handle(inner: &Membership, task_id: &str) -> Result<WorkerHandle, RouterError> {
    let worker_id = inner
        .ring
        .owner(task_id)
        .ok_or(RouterError::NoWorkersAvailable)?;

    // Ring and registry are mutated together under the write lock.
    inner
        .registry
        .get(worker_id.as_str())
        .cloned()
        .ok_or(RouterError::NoWorkersAvailable)
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("max_in_flight_per_worker", &self.max_in_flight_per_worker)
            .finish_non_exhaustive()
    }
}
