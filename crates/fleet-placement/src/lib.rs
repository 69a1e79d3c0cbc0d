//! Consistent hashing ring for deterministic task routing.
//!
//! This crate implements a consistent hash ring that maps routing keys (task
//! IDs) to worker IDs. It is a pure data structure: no locking, no I/O.
//! Adding or removing a worker only moves the keys in the arcs that worker
//! gains or loses, and [`Ring::diff`] reports exactly which keys moved.
//!
//! The ring uses virtual nodes (vnodes): each worker gets `R` positions on a
//! `u32` ring, `crc32("{worker_id}#{i}")` for `i in 0..R`, so positions are
//! stable across process runs. More vnodes per worker gives a more uniform
//! key distribution at the cost of a larger ring and slower mutations.

mod ring;

pub use ring::{Remap, Ring, key_position, vnode_position};
