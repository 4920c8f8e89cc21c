// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stateful SCTP association tracking for a flow-table core.
//!
//! The crate classifies SCTP packets to association records by
//! verification tag, walks bundled chunk trains, drives a
//! direction-qualified state machine across the 4-way handshake, shutdown
//! and abort paths, and keeps a concurrent tag index consistent with each
//! record's bound tags. The surrounding flow table owns per-flow
//! bookkeeping (hashing, LRU, timeout sweep) and calls in through
//! [`SctpTracker`].
//!
//! ```
//! use sctp_conntrack::{NetnsId, SctpTracker, TrackerConfig};
//!
//! let tracker = SctpTracker::new(TrackerConfig::default());
//! assert_eq!(tracker.tracked_entries(), 0);
//! # let _ = NetnsId(0);
//! ```

pub mod chunk;
pub mod error;
pub mod index;
pub mod record;
pub mod state;
pub mod tracker;
mod utils;

pub use chunk::{ChunkRef, ChunkType, ChunkWalker, CommonHeader, SctpPacketRef};
pub use error::{IndexError, MalformedChunkTrain, TrackError};
pub use index::{NetnsId, VtagIndex, VtagKey};
pub use record::{AssocHandle, AssocShared, Association};
pub use state::{AssocState, Direction};
pub use tracker::{OutOfStatePolicy, SctpTracker, TrackerConfig, Verdict};
