// SPDX-License-Identifier: MIT OR Apache-2.0

//! The association state machine.
//!
//! [`next_state`] is the pure, direction-qualified transition table;
//! [`Engine`] layers verification-tag checking, tag binding and crossed
//! association detection on top of it, mutating one [`Association`] at a
//! time. Per-record serialization is the caller's job (the external flow
//! table locks the record), so nothing here is re-entrant.

use core::time::Duration;

use log::{debug, trace};

use crate::chunk::{ChunkFlags, ChunkRef, ChunkType, CommonHeader};
use crate::error::TrackError;
use crate::record::Association;
use crate::tracker::OutOfStatePolicy;

/// Direction of a packet relative to the association: `Original` packets
/// come from the endpoint whose packet created the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Original = 0,
    Reply = 1,
}

impl Direction {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Direction::Original => Direction::Reply,
            Direction::Reply => Direction::Original,
        }
    }

    /// Index into the per-direction arrays of an association record.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Tracked association states. `Closed` is the initial state; terminal
/// teardown is signalled through the destroy verdict rather than a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssocState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownSent,
    ShutdownRecd,
    ShutdownAckSent,
    HeartbeatSent,
}

impl AssocState {
    /// Idle timeout for the external sweep: how long a record in this state
    /// may go without traffic before it is eligible for destruction.
    pub fn timeout(self) -> Duration {
        match self {
            AssocState::Closed => Duration::from_secs(10),
            AssocState::CookieWait => Duration::from_secs(3),
            AssocState::CookieEchoed => Duration::from_secs(3),
            AssocState::Established => Duration::from_secs(210),
            AssocState::ShutdownSent => Duration::from_millis(300),
            AssocState::ShutdownRecd => Duration::from_millis(300),
            AssocState::ShutdownAckSent => Duration::from_secs(3),
            AssocState::HeartbeatSent => Duration::from_secs(30),
        }
    }
}

/// Pure transition table: `(state, chunk type, direction) -> new state`.
///
/// `None` means the combination has no edge; the engine's policy decides
/// whether that is tolerated or reported. ABORT, SHUTDOWN COMPLETE and
/// crossed INITs never reach this table -- the engine intercepts them.
pub fn next_state(state: AssocState, chunk: ChunkType, dir: Direction) -> Option<AssocState> {
    use AssocState::*;
    use ChunkType::*;

    match (state, chunk, dir) {
        (Closed, Init, Direction::Original) => Some(CookieWait),
        (Closed, Heartbeat, _) => Some(HeartbeatSent),

        (CookieWait, InitAck, Direction::Reply) => Some(CookieEchoed),

        (CookieEchoed, CookieEcho, Direction::Original) => Some(CookieEchoed),
        (CookieEchoed, CookieAck, Direction::Reply) => Some(Established),

        (Established, Shutdown, _) => Some(ShutdownSent),
        (ShutdownSent, Shutdown, _) => Some(ShutdownRecd),
        (ShutdownSent, ShutdownAck, _) => Some(ShutdownAckSent),
        (ShutdownRecd, ShutdownAck, _) => Some(ShutdownAckSent),

        (HeartbeatSent, HeartbeatAck, _) => Some(Established),

        // Liveness-only chunks: accepted in every post-handshake state
        // without a state change. In-flight DATA is legal during shutdown.
        (
            Established | ShutdownSent | ShutdownRecd | HeartbeatSent,
            Data | Sack | Heartbeat | HeartbeatAck,
            _,
        ) => Some(state),

        _ => None,
    }
}

/// What the tracker has to do after the engine processed one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    /// Nothing beyond any state change already applied.
    Nothing,
    /// INIT ACK observed: bind both direction tags and index them. The
    /// move to `new_state` belongs to the caller and must only happen once
    /// both binds took; a failed bind leaves the record where it was, so a
    /// retransmitted INIT ACK can retry.
    BindTags {
        original: u32,
        reply: u32,
        new_state: AssocState,
    },
    /// A tag was learned passively (mid-association tracking); bind and
    /// index the one slot.
    LearnTag { slot: Direction, tag: u32 },
    /// Terminal chunk (ABORT / SHUTDOWN COMPLETE): unindex and release.
    Destroy,
    /// A restart INIT with a different tag: the old record must not change
    /// (beyond the `crossed` mark); the flow table should create a fresh
    /// record for the new association.
    CrossedInit,
}

/// Per-chunk state machine driver.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Engine {
    policy: OutOfStatePolicy,
}

impl Engine {
    pub(crate) fn new(policy: OutOfStatePolicy) -> Self {
        Engine { policy }
    }

    /// Feeds one chunk to the state machine, mutating `assoc` in place.
    ///
    /// Returns the side effect the caller must apply. `Err` is only
    /// produced under [`OutOfStatePolicy::Strict`].
    pub(crate) fn on_chunk(
        &self,
        assoc: &mut Association,
        hdr: &CommonHeader,
        chunk: &ChunkRef<'_>,
        dir: Direction,
    ) -> Result<ChunkOutcome, TrackError> {
        let chunk_type = chunk.chunk_type();

        if chunk_type == ChunkType::Init {
            return self.on_init(assoc, chunk, dir);
        }

        // A packet traveling in direction `dir` is addressed to the
        // opposite side and must carry that side's announced tag. ABORT and
        // SHUTDOWN COMPLETE with the T bit reflect the sender's own tag
        // instead (the sender had no TCB left).
        if let Some(expected) = assoc.vtag(dir.opposite()) {
            let t_bit_ok = matches!(chunk_type, ChunkType::Abort | ChunkType::ShutdownComplete)
                && chunk.flags().contains(ChunkFlags::T_BIT)
                && assoc.vtag(dir) == Some(hdr.verify_tag);
            if hdr.verify_tag != expected && !t_bit_ok {
                debug!(
                    "dropping {:?} chunk with bad vtag {:#010x} (expected {:#010x})",
                    chunk_type, hdr.verify_tag, expected
                );
                return Ok(ChunkOutcome::Nothing);
            }
        }

        match chunk_type {
            // Valid ABORT is an immediate terminal, from any state.
            ChunkType::Abort => {
                debug!("ABORT in state {:?}: destroying record", assoc.state());
                return Ok(ChunkOutcome::Destroy);
            }
            ChunkType::ShutdownComplete if assoc.state() == AssocState::ShutdownAckSent => {
                debug!("SHUTDOWN COMPLETE: destroying record");
                return Ok(ChunkOutcome::Destroy);
            }
            ChunkType::InitAck if assoc.state() == AssocState::CookieWait => {
                if dir != Direction::Reply {
                    return self.out_of_state(assoc, chunk_type);
                }
                let Some(init) = chunk.init() else {
                    debug!("INIT ACK with truncated fixed part; ignoring");
                    return Ok(ChunkOutcome::Nothing);
                };
                // The reply echoes the original side's initiate tag in the
                // common header; its own tag rides in the chunk value. The
                // state advance is deferred to the caller until the tags are
                // indexed.
                return Ok(ChunkOutcome::BindTags {
                    original: hdr.verify_tag,
                    reply: init.initiate_tag(),
                    new_state: AssocState::CookieEchoed,
                });
            }
            _ => (),
        }

        // Passive tag pickup: tracking began mid-association, so the tag
        // for the addressed side can only be learned from heartbeat
        // traffic.
        let learnable = matches!(chunk_type, ChunkType::Heartbeat | ChunkType::HeartbeatAck)
            && assoc.vtag(dir.opposite()).is_none()
            && (assoc.from_heartbeat()
                || matches!(
                    assoc.state(),
                    AssocState::Closed | AssocState::HeartbeatSent | AssocState::Established
                ));

        let outcome = if learnable {
            ChunkOutcome::LearnTag {
                slot: dir.opposite(),
                tag: hdr.verify_tag,
            }
        } else {
            ChunkOutcome::Nothing
        };

        match next_state(assoc.state(), chunk_type, dir) {
            Some(new_state) => {
                if new_state != assoc.state() {
                    trace!(
                        "{:?} ({:?}) moves state {:?} -> {:?}",
                        chunk_type,
                        dir,
                        assoc.state(),
                        new_state
                    );
                    assoc.set_state(new_state);
                }
                Ok(outcome)
            }
            None if outcome != ChunkOutcome::Nothing => Ok(outcome),
            None => self.out_of_state(assoc, chunk_type),
        }
    }

    fn on_init(
        &self,
        assoc: &mut Association,
        chunk: &ChunkRef<'_>,
        dir: Direction,
    ) -> Result<ChunkOutcome, TrackError> {
        let Some(init) = chunk.init() else {
            debug!("INIT with truncated fixed part; ignoring");
            return Ok(ChunkOutcome::Nothing);
        };
        let proposed = init.initiate_tag();

        // An INIT announcing a different tag than the one already bound for
        // the sender is a restart: leave this record alone and hint the
        // flow table to start a new one.
        if let Some(bound) = assoc.vtag(dir) {
            if bound != proposed {
                debug!(
                    "crossed INIT: bound vtag {:#010x}, proposed {:#010x}",
                    bound, proposed
                );
                assoc.set_crossed();
                return Ok(ChunkOutcome::CrossedInit);
            }
        }

        match next_state(assoc.state(), ChunkType::Init, dir) {
            Some(new_state) => {
                // The proposed tag is not trusted until the peer echoes it
                // back in INIT ACK; nothing is bound here.
                trace!("INIT ({:?}) moves state {:?} -> {:?}", dir, assoc.state(), new_state);
                assoc.set_state(new_state);
                Ok(ChunkOutcome::Nothing)
            }
            // A retransmitted INIT with the unchanged tag.
            None => self.out_of_state(assoc, ChunkType::Init),
        }
    }

    fn out_of_state(
        &self,
        assoc: &Association,
        chunk_type: ChunkType,
    ) -> Result<ChunkOutcome, TrackError> {
        match self.policy {
            OutOfStatePolicy::Permissive => {
                trace!(
                    "tolerating out-of-state {:?} chunk in {:?}",
                    chunk_type,
                    assoc.state()
                );
                Ok(ChunkOutcome::Nothing)
            }
            OutOfStatePolicy::Strict => Err(TrackError::UnexpectedChunk {
                state: assoc.state(),
                chunk_type,
            }),
        }
    }
}
