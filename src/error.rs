// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types reported to the surrounding flow table.
//!
//! Nothing here is fatal to the process: every error is scoped to one packet
//! or one association, and the caller decides between accepting, dropping
//! and logging.

use crate::chunk::ChunkType;
use crate::state::AssocState;

/// A chunk train that stopped framing correctly partway through.
///
/// `valid_chunks` counts the well-formed chunks that preceded the malformed
/// one; callers may process that prefix or drop the whole packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed SCTP chunk train after {valid_chunks} valid chunk(s): {reason}")]
pub struct MalformedChunkTrain {
    pub valid_chunks: usize,
    pub reason: &'static str,
}

/// Failures raised by [`VtagIndex`](crate::index::VtagIndex) mutation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// The key is already bound to a different association. The existing
    /// mapping is preserved; a 32-bit random tag plus port qualifier makes
    /// genuine collisions rare but not impossible.
    #[error("verification tag key already bound to a different association")]
    DuplicateVtag,
    /// The index is at capacity. The association stays untracked for the
    /// direction that failed to insert.
    #[error("verification tag index is full")]
    ResourceExhausted,
}

/// Errors surfaced by the tracker entry points.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error(transparent)]
    Malformed(#[from] MalformedChunkTrain),
    /// A chunk with no edge in the current state, reported only under
    /// [`OutOfStatePolicy::Strict`](crate::tracker::OutOfStatePolicy).
    #[error("unexpected {chunk_type:?} chunk in state {state:?}")]
    UnexpectedChunk {
        state: AssocState,
        chunk_type: ChunkType,
    },
    #[error("verification tag key already bound to a different association")]
    DuplicateVtag,
    #[error("verification tag index is full")]
    ResourceExhausted,
}

impl From<IndexError> for TrackError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DuplicateVtag => TrackError::DuplicateVtag,
            IndexError::ResourceExhausted => TrackError::ResourceExhausted,
        }
    }
}
