// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-association tracking records and the shared handles the index and
//! the external flow table hold onto.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::index::VtagKey;
use crate::state::{AssocState, Direction};

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// One tracked SCTP association.
///
/// A direction's verification tag and its index key are bound and unbound
/// together: `vtag[d]` is set if and only if `index_key[d]` is, so a record
/// is reachable through the index exactly while at least one direction is
/// bound.
#[derive(Clone, Debug)]
pub struct Association {
    state: AssocState,
    vtag: [Option<u32>; 2],
    index_key: [Option<VtagKey>; 2],
    crossed: bool,
    from_heartbeat: bool,
}

impl Association {
    pub fn new(state: AssocState) -> Self {
        Association {
            state,
            vtag: [None, None],
            index_key: [None, None],
            crossed: false,
            from_heartbeat: false,
        }
    }

    /// A record created for heartbeat traffic with no observable handshake.
    pub fn new_from_heartbeat() -> Self {
        let mut assoc = Association::new(AssocState::Established);
        assoc.from_heartbeat = true;
        assoc
    }

    #[inline]
    pub fn state(&self) -> AssocState {
        self.state
    }

    #[inline]
    pub(crate) fn set_state(&mut self, state: AssocState) {
        self.state = state;
    }

    /// The verification tag announced by endpoint `dir`, if known. Packets
    /// addressed to that endpoint carry it in the common header.
    #[inline]
    pub fn vtag(&self, dir: Direction) -> Option<u32> {
        self.vtag[dir.index()]
    }

    #[inline]
    pub fn index_key(&self, dir: Direction) -> Option<&VtagKey> {
        self.index_key[dir.index()].as_ref()
    }

    /// True while any direction is still indexed.
    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.index_key.iter().any(Option::is_some)
    }

    /// Binds a direction's tag together with the index key it was inserted
    /// under.
    pub(crate) fn bind(&mut self, dir: Direction, tag: u32, key: VtagKey) {
        self.vtag[dir.index()] = Some(tag);
        self.index_key[dir.index()] = Some(key);
    }

    /// Clears a direction's binding, handing back the key that must be
    /// removed from the index. `None` if the direction was never bound (or
    /// a racing destroy got here first).
    pub(crate) fn unbind(&mut self, dir: Direction) -> Option<VtagKey> {
        self.vtag[dir.index()] = None;
        self.index_key[dir.index()].take()
    }

    #[inline]
    pub fn crossed(&self) -> bool {
        self.crossed
    }

    /// Marks the record as superseded by a restart. Never reset.
    #[inline]
    pub(crate) fn set_crossed(&mut self) {
        self.crossed = true;
    }

    #[inline]
    pub fn from_heartbeat(&self) -> bool {
        self.from_heartbeat
    }
}

/// The shared portion of a record: the index and any in-flight packet
/// workers hold clones of the same `Arc`, so a record is deallocated only
/// after the last holder lets go, no matter how lookups and removals
/// interleave.
#[derive(Debug)]
pub struct AssocShared {
    id: u64,
    inner: Mutex<Association>,
}

/// Reference-counted handle to a tracked association.
pub type AssocHandle = Arc<AssocShared>;

impl AssocShared {
    pub fn new(assoc: Association) -> AssocHandle {
        Arc::new(AssocShared {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(assoc),
        })
    }

    /// Process-unique record id, for logging and debugging.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Locks the record for exclusive mutation.
    #[inline]
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Association> {
        self.inner.lock()
    }
}
