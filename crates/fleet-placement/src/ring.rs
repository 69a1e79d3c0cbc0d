//! Consistent hashing ring implementation.

use std::collections::{BTreeMap, HashMap};

use fleet_types::WorkerId;
use tracing::debug;

/// A key whose owner differs between two ring states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remap {
    /// The routing key that moved.
    pub key: String,
    /// Owner in the old ring.
    pub from: WorkerId,
    /// Owner in the new ring.
    pub to: WorkerId,
}

/// Consistent hashing ring for deterministic task routing.
///
/// Each worker is mapped to `replicas` virtual nodes on a u32 ring. A key is
/// owned by the first virtual node at or after its position, wrapping
/// around to the smallest position.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Virtual node positions: ring position -> worker.
    vnodes: BTreeMap<u32, WorkerId>,
    /// Vnode count per worker.
    workers: HashMap<WorkerId, u16>,
    /// Default vnode count for [`Ring::add_worker`].
    replicas: u16,
}

impl Ring {
    /// Create a new empty ring giving each worker `replicas` vnodes.
    pub fn new(replicas: u16) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            workers: HashMap::new(),
            replicas,
        }
    }

    /// Add a worker with the ring's default replica count.
    pub fn add_worker(&mut self, worker_id: WorkerId) {
        self.add_worker_with_replicas(worker_id, self.replicas);
    }

    /// Add a worker with an explicit number of vnodes.
    ///
    /// Re-adding a worker replaces its vnodes. A position already held by
    /// another worker is taken over (last write wins).
    pub fn add_worker_with_replicas(&mut self, worker_id: WorkerId, replicas: u16) {
        self.remove_worker(worker_id.as_str());

        for i in 0..replicas {
            let pos = vnode_position(worker_id.as_str(), i);
            if let Some(previous) = self.vnodes.insert(pos, worker_id.clone()) {
                debug!(pos, %previous, %worker_id, "vnode collision, position taken over");
            }
        }

        debug!(%worker_id, replicas, "added worker to ring");
        self.workers.insert(worker_id, replicas);
    }

    /// Remove a worker and all the vnodes it still owns.
    ///
    /// Returns `false` if the worker was not on the ring.
    pub fn remove_worker(&mut self, worker_id: &str) -> bool {
        let Some(replicas) = self.workers.remove(worker_id) else {
            return false;
        };

        for i in 0..replicas {
            let pos = vnode_position(worker_id, i);
            // A collision may have handed this position to someone else.
            if self.vnodes.get(&pos).is_some_and(|owner| owner.as_str() == worker_id) {
                self.vnodes.remove(&pos);
            }
        }

        debug!(%worker_id, "removed worker from ring");
        true
    }

    /// Ring position of `key`.
    pub fn position(key: &str) -> u32 {
        key_position(key)
    }

    /// Return the worker that owns `key`, or `None` if the ring is empty.
    pub fn owner(&self, key: &str) -> Option<&WorkerId> {
        let pos = key_position(key);
        self.vnodes
            .range(pos..)
            .next()
            .or_else(|| self.vnodes.first_key_value())
            .map(|(_, worker_id)| worker_id)
    }

    /// Return up to `n` distinct workers, walking clockwise from `key`.
    ///
    /// The first element is [`Ring::owner`]. If fewer than `n` workers exist,
    /// all of them are returned.
    pub fn owners(&self, key: &str, n: usize) -> Vec<WorkerId> {
        if self.vnodes.is_empty() {
            return Vec::new();
        }

        let pos = key_position(key);
        let max_distinct = n.min(self.workers.len());
        let mut owners = Vec::with_capacity(max_distinct);

        let after = self.vnodes.range(pos..);
        let before = self.vnodes.range(..pos);

        for (_, worker_id) in after.chain(before) {
            if !owners.contains(worker_id) {
                owners.push(worker_id.clone());
                if owners.len() == max_distinct {
                    break;
                }
            }
        }

        owners
    }

    /// Compute which keys change owner between two ring states.
    pub fn diff<'a>(old: &Ring, new: &Ring, keys: impl IntoIterator<Item = &'a str>) -> Vec<Remap> {
        keys.into_iter()
            .filter_map(|key| match (old.owner(key), new.owner(key)) {
                (Some(from), Some(to)) if from != to => Some(Remap {
                    key: key.to_string(),
                    from: from.clone(),
                    to: to.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Return the number of workers on the ring.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Return the number of vnodes on the ring.
    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    /// Whether the ring has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Whether `worker_id` is on the ring.
    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    /// Return all worker IDs on the ring.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    /// Iterate over `(position, worker)` pairs in ascending position order.
    pub fn vnodes(&self) -> impl Iterator<Item = (u32, &WorkerId)> {
        self.vnodes.iter().map(|(pos, worker_id)| (*pos, worker_id))
    }
}

/// Position of a routing key on the ring: CRC-32 (IEEE) of its bytes.
pub fn key_position(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Position of a worker's vnode: CRC-32 (IEEE) of `"{worker_id}#{index}"`.
pub fn vnode_position(worker_id: &str, vnode_index: u16) -> u32 {
    crc32fast::hash(format!("{worker_id}#{vnode_index}").as_bytes())
}
