// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracker entry points and teardown coordination.
//!
//! The external flow table owns generic per-flow bookkeeping (5-tuple hash,
//! LRU, timeout sweep) and calls in here with a decoded common header, the
//! raw chunk train and, where known, the record handle and packet
//! direction. Per-record mutation is serialized by the record's own lock;
//! the index tolerates arbitrary concurrent lookups.

use core::time::Duration;
use std::sync::Arc;

use log::debug;

use crate::chunk::{ChunkType, ChunkWalker, CommonHeader};
use crate::error::{MalformedChunkTrain, TrackError};
use crate::index::{NetnsId, VtagIndex, VtagKey};
use crate::record::{AssocHandle, AssocShared, Association};
use crate::state::{AssocState, ChunkOutcome, Direction, Engine};

/// How chunks with no edge in the current state are treated.
///
/// The permissive default accepts them without a state change (a stray SACK
/// in `CookieWait` is harmless); strict deployments turn them into
/// [`TrackError::UnexpectedChunk`] so the caller can drop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutOfStatePolicy {
    #[default]
    Permissive,
    Strict,
}

/// Tracker tuning, supplied once at construction.
#[derive(Clone, Copy, Debug)]
pub struct TrackerConfig {
    pub policy: OutOfStatePolicy,
    /// Grace window a crossed (restarted-over) record is kept alive, so
    /// reordered packets referencing the outgoing association still match.
    pub crossed_linger: Duration,
    /// Upper bound on vtag index entries (two per fully-bound record).
    pub max_index_entries: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            policy: OutOfStatePolicy::Permissive,
            crossed_linger: Duration::from_secs(3),
            max_index_entries: 50_000,
        }
    }
}

/// What the flow table should do with the record after a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub new_state: AssocState,
    /// The record reached a terminal transition and has been unindexed;
    /// the flow table should release it.
    pub destroy: bool,
    /// A restart INIT was seen: keep this record lingering and create a
    /// fresh one for the new association.
    pub create_new_record_hint: bool,
}

/// The stateful SCTP association tracker core.
pub struct SctpTracker {
    index: VtagIndex,
    engine: Engine,
    config: TrackerConfig,
}

impl SctpTracker {
    pub fn new(config: TrackerConfig) -> Self {
        SctpTracker {
            index: VtagIndex::new(config.max_index_entries),
            engine: Engine::new(config.policy),
            config,
        }
    }

    /// Finds the association a packet belongs to, and the direction the
    /// packet travels in, from the common header alone.
    ///
    /// A hit on the entry owned by record slot `d` means the packet is
    /// addressed to endpoint `d`, i.e. travels in the opposite direction.
    pub fn classify(&self, netns: NetnsId, hdr: &CommonHeader) -> Option<(AssocHandle, Direction)> {
        for slot in [Direction::Original, Direction::Reply] {
            let key = VtagKey {
                vtag: hdr.verify_tag,
                sport: hdr.sport,
                dport: hdr.dport,
                netns,
                dir: slot,
            };
            if let Some(handle) = self.index.lookup(&key) {
                return Some((handle, slot.opposite()));
            }
        }
        None
    }

    /// Checks the framing of a whole chunk train, returning the chunk
    /// count. Policy for malformed tails (drop vs accept the valid prefix)
    /// is the caller's.
    pub fn validate(&self, payload: &[u8]) -> Result<usize, MalformedChunkTrain> {
        let mut walker = ChunkWalker::new(payload);
        for item in walker.by_ref() {
            item?;
        }
        Ok(walker.seen())
    }

    /// Runs one packet's chunks through the state machine under the record
    /// lock, applying any index binds/unbinds they require.
    ///
    /// A malformed tail aborts processing with the valid-prefix count in
    /// the error; chunks before it have already taken effect.
    pub fn update(
        &self,
        handle: &AssocHandle,
        netns: NetnsId,
        hdr: &CommonHeader,
        payload: &[u8],
        dir: Direction,
    ) -> Result<Verdict, TrackError> {
        let mut assoc = handle.lock();
        let mut destroy = false;
        let mut create_new_record_hint = false;

        for item in ChunkWalker::new(payload) {
            let chunk = item?;
            match self.engine.on_chunk(&mut assoc, hdr, &chunk, dir)? {
                ChunkOutcome::Nothing => (),
                ChunkOutcome::BindTags {
                    original,
                    reply,
                    new_state,
                } => {
                    // State commits only once both tags are indexed; on a
                    // failed bind the record stays put and a retransmitted
                    // INIT ACK retries the whole binding.
                    self.bind_slot(
                        &mut assoc,
                        handle,
                        Direction::Original,
                        original,
                        netns,
                        hdr,
                        dir,
                    )?;
                    self.bind_slot(&mut assoc, handle, Direction::Reply, reply, netns, hdr, dir)?;
                    assoc.set_state(new_state);
                }
                ChunkOutcome::LearnTag { slot, tag } => {
                    self.bind_slot(&mut assoc, handle, slot, tag, netns, hdr, dir)?;
                }
                ChunkOutcome::Destroy => {
                    self.unbind_all(&mut assoc, handle);
                    destroy = true;
                    break;
                }
                ChunkOutcome::CrossedInit => create_new_record_hint = true,
            }
        }

        Ok(Verdict {
            new_state: assoc.state(),
            destroy,
            create_new_record_hint,
        })
    }

    /// Creates and primes a record for the first packet of a flow the
    /// caller could not match to an existing record.
    ///
    /// INIT starts the normal handshake; HEARTBEAT creates a record
    /// directly in `Established` with the heartbeat-learned flag set (the
    /// handshake cannot be reconstructed after the fact). Any other leading
    /// chunk is not a trackable start and yields `None`.
    pub fn track_new(
        &self,
        netns: NetnsId,
        hdr: &CommonHeader,
        payload: &[u8],
        dir: Direction,
    ) -> Result<Option<(AssocHandle, Verdict)>, TrackError> {
        let assoc = match ChunkWalker::new(payload).next() {
            Some(Ok(chunk)) => match chunk.chunk_type() {
                ChunkType::Init => Association::new(AssocState::Closed),
                ChunkType::Heartbeat => Association::new_from_heartbeat(),
                _ => return Ok(None),
            },
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        };

        let handle = AssocShared::new(assoc);
        debug!("created record {} for new flow", handle.id());
        let verdict = self.update(&handle, netns, hdr, payload, dir)?;
        Ok(Some((handle, verdict)))
    }

    /// Tears a record down: both direction entries are removed from the
    /// index (each independently; one may never have been bound) and the
    /// record is released once the last outstanding handle drops.
    ///
    /// Racing or repeated destroys are no-ops past the first.
    pub fn destroy(&self, handle: &AssocHandle) {
        let mut assoc = handle.lock();
        if assoc.is_indexed() {
            debug!("destroying record {}", handle.id());
        }
        self.unbind_all(&mut assoc, handle);
    }

    /// The idle timeout the external sweep should apply to this record.
    /// Crossed records get the bounded linger window instead of their
    /// state's timeout.
    pub fn timeout_of(&self, handle: &AssocHandle) -> Duration {
        let assoc = handle.lock();
        if assoc.crossed() {
            self.config.crossed_linger
        } else {
            assoc.state().timeout()
        }
    }

    /// The per-direction bound tags, for the NAT/translation layer.
    pub fn bound_vtags(&self, handle: &AssocHandle) -> [Option<u32>; 2] {
        let assoc = handle.lock();
        [
            assoc.vtag(Direction::Original),
            assoc.vtag(Direction::Reply),
        ]
    }

    /// Number of live index entries.
    pub fn tracked_entries(&self) -> usize {
        self.index.len()
    }

    fn bind_slot(
        &self,
        assoc: &mut Association,
        handle: &AssocHandle,
        slot: Direction,
        tag: u32,
        netns: NetnsId,
        hdr: &CommonHeader,
        pkt_dir: Direction,
    ) -> Result<(), TrackError> {
        if assoc.vtag(slot) == Some(tag) {
            // Retransmission of the binding chunk.
            return Ok(());
        }

        let key = key_for_slot(slot, tag, netns, hdr, pkt_dir);
        self.index.insert(key, Arc::clone(handle))?;

        // A re-key (should not happen through the engine, but keep the
        // index consistent if it does).
        if let Some(old) = assoc.unbind(slot) {
            self.index.remove_if_bound(&old, handle);
        }
        assoc.bind(slot, tag, key);
        debug!(
            "record {}: bound vtag {:#010x} for {:?}",
            handle.id(),
            tag,
            slot
        );
        Ok(())
    }

    fn unbind_all(&self, assoc: &mut Association, handle: &AssocHandle) {
        for dir in [Direction::Original, Direction::Reply] {
            if let Some(key) = assoc.unbind(dir) {
                self.index.remove_if_bound(&key, handle);
            }
        }
    }
}

/// Builds the index key for record slot `slot` from an observed packet.
///
/// The entry matches packets addressed to `slot`'s endpoint. If the
/// observed packet travels toward that endpoint, its ports can be used as
/// seen; otherwise they are mirrored.
fn key_for_slot(
    slot: Direction,
    tag: u32,
    netns: NetnsId,
    hdr: &CommonHeader,
    pkt_dir: Direction,
) -> VtagKey {
    let (sport, dport) = if pkt_dir == slot.opposite() {
        (hdr.sport, hdr.dport)
    } else {
        (hdr.dport, hdr.sport)
    };
    VtagKey {
        vtag: tag,
        sport,
        dport,
        netns,
        dir: slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: NetnsId = NetnsId(0);

    fn chunk(chunk_type: ChunkType, flags: u8, value: &[u8]) -> Vec<u8> {
        let mut out = vec![u8::from(chunk_type), flags];
        out.extend_from_slice(&((value.len() + 4) as u16).to_be_bytes());
        out.extend_from_slice(value);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn init_value(initiate_tag: u32) -> Vec<u8> {
        let mut value = Vec::new();
        value.extend_from_slice(&initiate_tag.to_be_bytes());
        value.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        value.extend_from_slice(&10u16.to_be_bytes());
        value.extend_from_slice(&10u16.to_be_bytes());
        value.extend_from_slice(&1u32.to_be_bytes());
        value
    }

    fn hdr(sport: u16, dport: u16, verify_tag: u32) -> CommonHeader {
        CommonHeader {
            sport,
            dport,
            verify_tag,
        }
    }

    /// Runs INIT(100) / INIT_ACK(200) / COOKIE_ECHO / COOKIE_ACK, returning
    /// the established record. Original is 1000 -> 2000.
    fn establish(tracker: &SctpTracker) -> AssocHandle {
        let init = chunk(ChunkType::Init, 0, &init_value(100));
        let (handle, v) = tracker
            .track_new(NS, &hdr(1000, 2000, 0), &init, Direction::Original)
            .unwrap()
            .unwrap();
        assert_eq!(v.new_state, AssocState::CookieWait);

        let init_ack = chunk(ChunkType::InitAck, 0, &init_value(200));
        let v = tracker
            .update(&handle, NS, &hdr(2000, 1000, 100), &init_ack, Direction::Reply)
            .unwrap();
        assert_eq!(v.new_state, AssocState::CookieEchoed);

        let cookie_echo = chunk(ChunkType::CookieEcho, 0, &[0u8; 8]);
        tracker
            .update(&handle, NS, &hdr(1000, 2000, 200), &cookie_echo, Direction::Original)
            .unwrap();

        let cookie_ack = chunk(ChunkType::CookieAck, 0, &[]);
        let v = tracker
            .update(&handle, NS, &hdr(2000, 1000, 100), &cookie_ack, Direction::Reply)
            .unwrap();
        assert_eq!(v.new_state, AssocState::Established);
        handle
    }

    #[test]
    fn handshake_binds_both_tags() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        assert_eq!(tracker.bound_vtags(&handle), [Some(100), Some(200)]);
        assert_eq!(tracker.tracked_entries(), 2);
    }

    #[test]
    fn classify_resolves_both_directions() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        // Packet from the original side carries the reply's tag.
        let (found, dir) = tracker.classify(NS, &hdr(1000, 2000, 200)).unwrap();
        assert!(Arc::ptr_eq(&found, &handle));
        assert_eq!(dir, Direction::Original);

        let (found, dir) = tracker.classify(NS, &hdr(2000, 1000, 100)).unwrap();
        assert!(Arc::ptr_eq(&found, &handle));
        assert_eq!(dir, Direction::Reply);

        assert!(tracker.classify(NS, &hdr(1000, 2000, 999)).is_none());
        assert!(tracker.classify(NetnsId(9), &hdr(1000, 2000, 200)).is_none());
    }

    #[test]
    fn shutdown_sequence_destroys_and_unindexes() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        let shutdown = chunk(ChunkType::Shutdown, 0, &[0u8; 4]);
        let v = tracker
            .update(&handle, NS, &hdr(1000, 2000, 200), &shutdown, Direction::Original)
            .unwrap();
        assert_eq!(v.new_state, AssocState::ShutdownSent);
        assert!(!v.destroy);

        let shutdown_ack = chunk(ChunkType::ShutdownAck, 0, &[]);
        let v = tracker
            .update(&handle, NS, &hdr(2000, 1000, 100), &shutdown_ack, Direction::Reply)
            .unwrap();
        assert_eq!(v.new_state, AssocState::ShutdownAckSent);

        let complete = chunk(ChunkType::ShutdownComplete, 0, &[]);
        let v = tracker
            .update(&handle, NS, &hdr(1000, 2000, 200), &complete, Direction::Original)
            .unwrap();
        assert!(v.destroy);
        assert_eq!(tracker.tracked_entries(), 0);
        assert!(tracker.classify(NS, &hdr(1000, 2000, 200)).is_none());
    }

    #[test]
    fn abort_is_immediate_from_any_state() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        let abort = chunk(ChunkType::Abort, 0, &[]);
        let v = tracker
            .update(&handle, NS, &hdr(1000, 2000, 200), &abort, Direction::Original)
            .unwrap();
        assert!(v.destroy);
        assert_eq!(tracker.tracked_entries(), 0);
    }

    #[test]
    fn abort_with_wrong_vtag_is_ignored() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        let abort = chunk(ChunkType::Abort, 0, &[]);
        let v = tracker
            .update(&handle, NS, &hdr(1000, 2000, 999), &abort, Direction::Original)
            .unwrap();
        assert!(!v.destroy);
        assert_eq!(v.new_state, AssocState::Established);
        assert_eq!(tracker.tracked_entries(), 2);
    }

    #[test]
    fn crossed_init_leaves_record_untouched_and_hints() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        let restart = chunk(ChunkType::Init, 0, &init_value(777));
        let v = tracker
            .update(&handle, NS, &hdr(1000, 2000, 0), &restart, Direction::Original)
            .unwrap();
        assert!(v.create_new_record_hint);
        assert!(!v.destroy);
        assert_eq!(v.new_state, AssocState::Established);
        assert_eq!(tracker.bound_vtags(&handle), [Some(100), Some(200)]);

        // The crossed record lingers on the configured window.
        assert_eq!(tracker.timeout_of(&handle), Duration::from_secs(3));
    }

    #[test]
    fn heartbeat_creates_established_record() {
        let tracker = SctpTracker::new(TrackerConfig::default());

        let hb = chunk(ChunkType::Heartbeat, 0, &[0u8; 8]);
        let (handle, v) = tracker
            .track_new(NS, &hdr(1000, 2000, 0xDEAD_BEEF), &hb, Direction::Original)
            .unwrap()
            .unwrap();
        assert_eq!(v.new_state, AssocState::Established);
        assert!(handle.lock().from_heartbeat());
        assert_eq!(
            tracker.bound_vtags(&handle),
            [None, Some(0xDEAD_BEEF)]
        );

        // The same flow now classifies.
        let (found, dir) = tracker.classify(NS, &hdr(1000, 2000, 0xDEAD_BEEF)).unwrap();
        assert!(Arc::ptr_eq(&found, &handle));
        assert_eq!(dir, Direction::Original);

        // The reverse heartbeat-ack teaches the other tag.
        let hb_ack = chunk(ChunkType::HeartbeatAck, 0, &[0u8; 8]);
        tracker
            .update(&handle, NS, &hdr(2000, 1000, 0xFEED_FACE), &hb_ack, Direction::Reply)
            .unwrap();
        assert_eq!(
            tracker.bound_vtags(&handle),
            [Some(0xFEED_FACE), Some(0xDEAD_BEEF)]
        );
        assert_eq!(tracker.tracked_entries(), 2);
    }

    #[test]
    fn data_or_sack_does_not_start_tracking() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let sack = chunk(ChunkType::Sack, 0, &[0u8; 12]);
        assert!(tracker
            .track_new(NS, &hdr(1000, 2000, 42), &sack, Direction::Original)
            .unwrap()
            .is_none());
    }

    #[test]
    fn destroy_is_idempotent() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        tracker.destroy(&handle);
        assert_eq!(tracker.tracked_entries(), 0);
        tracker.destroy(&handle);
        assert_eq!(tracker.tracked_entries(), 0);
    }

    #[test]
    fn malformed_tail_reports_processed_prefix() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let handle = establish(&tracker);

        let mut payload = chunk(ChunkType::Sack, 0, &[0u8; 12]);
        payload.extend_from_slice(&[u8::from(ChunkType::Data), 0, 0, 0]); // zero length

        let err = tracker
            .update(&handle, NS, &hdr(1000, 2000, 200), &payload, Direction::Original)
            .unwrap_err();
        match err {
            TrackError::Malformed(m) => assert_eq!(m.valid_chunks, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn strict_policy_reports_out_of_state_chunks() {
        let config = TrackerConfig {
            policy: OutOfStatePolicy::Strict,
            ..TrackerConfig::default()
        };
        let tracker = SctpTracker::new(config);

        let init = chunk(ChunkType::Init, 0, &init_value(100));
        let (handle, _) = tracker
            .track_new(NS, &hdr(1000, 2000, 0), &init, Direction::Original)
            .unwrap()
            .unwrap();

        // DATA in CookieWait has no edge.
        let data = chunk(ChunkType::Data, 0x03, &[0u8; 17]);
        let err = tracker
            .update(&handle, NS, &hdr(1000, 2000, 0), &data, Direction::Original)
            .unwrap_err();
        assert!(matches!(err, TrackError::UnexpectedChunk { .. }));
    }

    #[test]
    fn permissive_policy_tolerates_out_of_state_chunks() {
        let tracker = SctpTracker::new(TrackerConfig::default());

        let init = chunk(ChunkType::Init, 0, &init_value(100));
        let (handle, _) = tracker
            .track_new(NS, &hdr(1000, 2000, 0), &init, Direction::Original)
            .unwrap()
            .unwrap();

        let data = chunk(ChunkType::Data, 0x03, &[0u8; 17]);
        let v = tracker
            .update(&handle, NS, &hdr(1000, 2000, 0), &data, Direction::Original)
            .unwrap();
        assert_eq!(v.new_state, AssocState::CookieWait);
    }

    #[test]
    fn duplicate_vtag_insert_is_surfaced() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let _first = establish(&tracker);

        // A second record on the same ports completing a handshake with
        // identical tags collides in the index.
        let init = chunk(ChunkType::Init, 0, &init_value(100));
        let (second, _) = tracker
            .track_new(NS, &hdr(1000, 2000, 0), &init, Direction::Original)
            .unwrap()
            .unwrap();
        let init_ack = chunk(ChunkType::InitAck, 0, &init_value(200));
        let err = tracker
            .update(&second, NS, &hdr(2000, 1000, 100), &init_ack, Direction::Reply)
            .unwrap_err();
        assert_eq!(err, TrackError::DuplicateVtag);
    }

    #[test]
    fn failed_bind_does_not_advance_state() {
        let config = TrackerConfig {
            max_index_entries: 0,
            ..TrackerConfig::default()
        };
        let tracker = SctpTracker::new(config);

        let init = chunk(ChunkType::Init, 0, &init_value(100));
        let (handle, _) = tracker
            .track_new(NS, &hdr(1000, 2000, 0), &init, Direction::Original)
            .unwrap()
            .unwrap();

        // With no index room the INIT ACK cannot bind; the record must stay
        // in CookieWait with nothing bound rather than move on half-tracked.
        let init_ack = chunk(ChunkType::InitAck, 0, &init_value(200));
        let err = tracker
            .update(&handle, NS, &hdr(2000, 1000, 100), &init_ack, Direction::Reply)
            .unwrap_err();
        assert_eq!(err, TrackError::ResourceExhausted);
        assert_eq!(handle.lock().state(), AssocState::CookieWait);
        assert_eq!(tracker.bound_vtags(&handle), [None, None]);
    }

    #[test]
    fn retransmitted_init_ack_binds_once_collision_clears() {
        let tracker = SctpTracker::new(TrackerConfig::default());
        let first = establish(&tracker);

        let init = chunk(ChunkType::Init, 0, &init_value(100));
        let (second, _) = tracker
            .track_new(NS, &hdr(1000, 2000, 0), &init, Direction::Original)
            .unwrap()
            .unwrap();
        let init_ack = chunk(ChunkType::InitAck, 0, &init_value(200));
        let err = tracker
            .update(&second, NS, &hdr(2000, 1000, 100), &init_ack, Direction::Reply)
            .unwrap_err();
        assert_eq!(err, TrackError::DuplicateVtag);
        assert_eq!(second.lock().state(), AssocState::CookieWait);
        assert_eq!(tracker.bound_vtags(&second), [None, None]);

        // The colliding record goes away; the peer retransmits INIT ACK and
        // the handshake completes as if nothing happened.
        tracker.destroy(&first);
        let v = tracker
            .update(&second, NS, &hdr(2000, 1000, 100), &init_ack, Direction::Reply)
            .unwrap();
        assert_eq!(v.new_state, AssocState::CookieEchoed);
        assert_eq!(tracker.bound_vtags(&second), [Some(100), Some(200)]);

        let cookie_ack = chunk(ChunkType::CookieAck, 0, &[]);
        let v = tracker
            .update(&second, NS, &hdr(2000, 1000, 100), &cookie_ack, Direction::Reply)
            .unwrap();
        assert_eq!(v.new_state, AssocState::Established);
        assert_eq!(tracker.tracked_entries(), 2);
    }

    #[test]
    fn index_capacity_surfaces_resource_exhausted() {
        let config = TrackerConfig {
            max_index_entries: 1,
            ..TrackerConfig::default()
        };
        let tracker = SctpTracker::new(config);

        let init = chunk(ChunkType::Init, 0, &init_value(100));
        let (handle, _) = tracker
            .track_new(NS, &hdr(1000, 2000, 0), &init, Direction::Original)
            .unwrap()
            .unwrap();
        let init_ack = chunk(ChunkType::InitAck, 0, &init_value(200));
        let err = tracker
            .update(&handle, NS, &hdr(2000, 1000, 100), &init_ack, Direction::Reply)
            .unwrap_err();
        assert_eq!(err, TrackError::ResourceExhausted);
        // The record stays partially tracked at most.
        assert!(tracker.tracked_entries() <= 1);
    }
}
