// SPDX-License-Identifier: MIT OR Apache-2.0

//! The concurrent verification-tag index.
//!
//! Every packet on every association performs a lookup; structural updates
//! (handshake completion, teardown) are comparatively rare. The index is a
//! sharded map, so lookups on unrelated keys never contend and a lookup
//! racing a removal of the same key sees either the old handle or nothing.
//! Handles are reference counted: a removal unlinks the entry, but the
//! record behind a handle an in-flight lookup already cloned stays valid
//! until that clone is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::warn;

use crate::error::IndexError;
use crate::record::AssocHandle;
use crate::state::Direction;

/// Network namespace identity, supplied by the surrounding flow table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetnsId(pub u32);

/// Exact-match key for one direction of one association.
///
/// The entry stored for record slot `d` indexes packets *addressed to*
/// endpoint `d`: `vtag` is the tag that endpoint announced, and the ports
/// are as such packets carry them (source port of the opposite endpoint).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VtagKey {
    pub vtag: u32,
    pub sport: u16,
    pub dport: u16,
    pub netns: NetnsId,
    pub dir: Direction,
}

/// Partitioned map from [`VtagKey`] to association handles.
pub struct VtagIndex {
    map: DashMap<VtagKey, AssocHandle>,
    // Occupancy is kept outside the map: `DashMap::len` takes every shard
    // lock, which would deadlock under an entry guard, and a load-then-act
    // check could overshoot the capacity across shards.
    occupancy: AtomicUsize,
    capacity: usize,
}

impl VtagIndex {
    pub fn new(capacity: usize) -> Self {
        VtagIndex {
            map: DashMap::new(),
            occupancy: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Exact-key lookup. The returned handle is cloned under the shard
    /// guard, so it remains usable even if the entry is removed right after
    /// this returns.
    pub fn lookup(&self, key: &VtagKey) -> Option<AssocHandle> {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Binds `key` to `handle`.
    ///
    /// Re-inserting the same pairing is a no-op; a key already bound to a
    /// *different* record is rejected with [`IndexError::DuplicateVtag`]
    /// and the existing mapping is preserved. A 32-bit random tag plus the
    /// port qualifier makes genuine collisions a documented residual risk,
    /// not a crash.
    pub fn insert(&self, key: VtagKey, handle: AssocHandle) -> Result<(), IndexError> {
        match self.map.entry(key) {
            Entry::Occupied(occupied) => {
                if Arc::ptr_eq(occupied.get(), &handle) {
                    // A re-insert of the live pairing never counts against
                    // capacity.
                    Ok(())
                } else {
                    warn!(
                        "vtag collision: key {:?} already bound to record {}",
                        key,
                        occupied.get().id()
                    );
                    Err(IndexError::DuplicateVtag)
                }
            }
            Entry::Vacant(vacant) => {
                if !self.reserve_slot() {
                    return Err(IndexError::ResourceExhausted);
                }
                vacant.insert(handle);
                Ok(())
            }
        }
    }

    /// Unlinks `key`. Idempotent: returns whether an entry was present.
    pub fn remove(&self, key: &VtagKey) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.occupancy.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Unlinks `key` only while it still maps to `handle`, protecting a
    /// torn-down record from removing a successor's entry.
    pub fn remove_if_bound(&self, key: &VtagKey, handle: &AssocHandle) -> bool {
        let removed = self
            .map
            .remove_if(key, |_, bound| Arc::ptr_eq(bound, handle))
            .is_some();
        if removed {
            self.occupancy.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims one occupancy slot, failing once `capacity` is reached. The
    /// compare-exchange loop cannot overshoot under concurrent inserts.
    fn reserve_slot(&self) -> bool {
        self.occupancy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}
