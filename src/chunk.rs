// SPDX-License-Identifier: MIT OR Apache-2.0

//! Zero-copy views over SCTP packets and the chunk-train walker.
//!
//! The walker only enforces framing (type, flags, length, value with 4-byte
//! padding between chunks); no chunk type is special-cased at this layer.
//! Checksum validation is assumed to have happened before bytes reach us.

use bitflags::bitflags;

use crate::error::MalformedChunkTrain;
use crate::utils;

// Chunk Types
const CHUNK_TYPE_DATA: u8 = 0;
const CHUNK_TYPE_INIT: u8 = 1;
const CHUNK_TYPE_INIT_ACK: u8 = 2;
const CHUNK_TYPE_SACK: u8 = 3;
const CHUNK_TYPE_HEARTBEAT: u8 = 4;
const CHUNK_TYPE_HEARTBEAT_ACK: u8 = 5;
const CHUNK_TYPE_ABORT: u8 = 6;
const CHUNK_TYPE_SHUTDOWN: u8 = 7;
const CHUNK_TYPE_SHUTDOWN_ACK: u8 = 8;
const CHUNK_TYPE_ERROR: u8 = 9;
const CHUNK_TYPE_COOKIE_ECHO: u8 = 10;
const CHUNK_TYPE_COOKIE_ACK: u8 = 11;
const CHUNK_TYPE_SHUTDOWN_COMPLETE: u8 = 14;

/// Common header length for every SCTP packet.
pub const COMMON_HEADER_LEN: usize = 12;

/// Chunk header length (type, flags, length).
pub const CHUNK_HEADER_LEN: usize = 4;

/// Fixed part of an INIT/INIT ACK chunk value (initiate tag, a_rwnd,
/// outbound/inbound stream counts, initial TSN).
const INIT_FIXED_LEN: usize = 16;

/// The type octet of a chunk, with unassigned values preserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Data,
    Init,
    InitAck,
    Sack,
    Heartbeat,
    HeartbeatAck,
    Abort,
    Shutdown,
    ShutdownAck,
    Error,
    CookieEcho,
    CookieAck,
    ShutdownComplete,
    Unknown(u8),
}

impl From<u8> for ChunkType {
    fn from(value: u8) -> Self {
        match value {
            CHUNK_TYPE_DATA => ChunkType::Data,
            CHUNK_TYPE_INIT => ChunkType::Init,
            CHUNK_TYPE_INIT_ACK => ChunkType::InitAck,
            CHUNK_TYPE_SACK => ChunkType::Sack,
            CHUNK_TYPE_HEARTBEAT => ChunkType::Heartbeat,
            CHUNK_TYPE_HEARTBEAT_ACK => ChunkType::HeartbeatAck,
            CHUNK_TYPE_ABORT => ChunkType::Abort,
            CHUNK_TYPE_SHUTDOWN => ChunkType::Shutdown,
            CHUNK_TYPE_SHUTDOWN_ACK => ChunkType::ShutdownAck,
            CHUNK_TYPE_ERROR => ChunkType::Error,
            CHUNK_TYPE_COOKIE_ECHO => ChunkType::CookieEcho,
            CHUNK_TYPE_COOKIE_ACK => ChunkType::CookieAck,
            CHUNK_TYPE_SHUTDOWN_COMPLETE => ChunkType::ShutdownComplete,
            other => ChunkType::Unknown(other),
        }
    }
}

impl From<ChunkType> for u8 {
    fn from(value: ChunkType) -> Self {
        match value {
            ChunkType::Data => CHUNK_TYPE_DATA,
            ChunkType::Init => CHUNK_TYPE_INIT,
            ChunkType::InitAck => CHUNK_TYPE_INIT_ACK,
            ChunkType::Sack => CHUNK_TYPE_SACK,
            ChunkType::Heartbeat => CHUNK_TYPE_HEARTBEAT,
            ChunkType::HeartbeatAck => CHUNK_TYPE_HEARTBEAT_ACK,
            ChunkType::Abort => CHUNK_TYPE_ABORT,
            ChunkType::Shutdown => CHUNK_TYPE_SHUTDOWN,
            ChunkType::ShutdownAck => CHUNK_TYPE_SHUTDOWN_ACK,
            ChunkType::Error => CHUNK_TYPE_ERROR,
            ChunkType::CookieEcho => CHUNK_TYPE_COOKIE_ECHO,
            ChunkType::CookieAck => CHUNK_TYPE_COOKIE_ACK,
            ChunkType::ShutdownComplete => CHUNK_TYPE_SHUTDOWN_COMPLETE,
            ChunkType::Unknown(other) => other,
        }
    }
}

bitflags! {
    /// Chunk flag bits. Only the bits the tracker cares about are named;
    /// DATA reassembly bits are carried for completeness of the view.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        /// T bit of ABORT/SHUTDOWN COMPLETE: the sender had no TCB and
        /// reflected the peer's own tag instead.
        const T_BIT = 0b_0000_0001;
        const DATA_IMMEDIATE = 0b_0000_1000;
        const DATA_UNORDERED = 0b_0000_0100;
        const DATA_BEGINNING = 0b_0000_0010;
        const DATA_ENDING = 0b_0000_0001;
    }
}

/// The decoded SCTP common header, as handed to the tracker by the external
/// flow table. The checksum is omitted: it is verified before tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommonHeader {
    pub sport: u16,
    pub dport: u16,
    pub verify_tag: u32,
}

/// A zero-copy view over a full SCTP packet (common header plus chunk train).
#[derive(Clone, Copy, Debug)]
pub struct SctpPacketRef<'a> {
    data: &'a [u8],
}

impl<'a> SctpPacketRef<'a> {
    /// Wraps `bytes`, or `None` if there are too few bytes for the common
    /// header.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < COMMON_HEADER_LEN {
            return None;
        }
        Some(SctpPacketRef { data: bytes })
    }

    /// The SCTP port number from which the packet has been sent.
    #[inline]
    pub fn sport(&self) -> u16 {
        u16::from_be_bytes(
            utils::to_array(self.data, 0)
                .expect("insufficient bytes in SctpPacketRef to retrieve Source Port field"),
        )
    }

    /// The SCTP port number to which the packet is destined.
    #[inline]
    pub fn dport(&self) -> u16 {
        u16::from_be_bytes(
            utils::to_array(self.data, 2)
                .expect("insufficient bytes in SctpPacketRef to retrieve Destination Port field"),
        )
    }

    /// The Verification Tag carried in the common header.
    #[inline]
    pub fn verify_tag(&self) -> u32 {
        u32::from_be_bytes(
            utils::to_array(self.data, 4)
                .expect("insufficient bytes in SctpPacketRef to retrieve Verification Tag field"),
        )
    }

    /// The CRC32c checksum field. Not validated here.
    #[inline]
    pub fn chksum(&self) -> u32 {
        u32::from_be_bytes(
            utils::to_array(self.data, 8)
                .expect("insufficient bytes in SctpPacketRef to retrieve Checksum field"),
        )
    }

    /// The decoded common header.
    #[inline]
    pub fn header(&self) -> CommonHeader {
        CommonHeader {
            sport: self.sport(),
            dport: self.dport(),
            verify_tag: self.verify_tag(),
        }
    }

    /// The raw chunk train following the common header.
    #[inline]
    pub fn chunk_bytes(&self) -> &'a [u8] {
        &self.data[COMMON_HEADER_LEN..]
    }

    /// A walker over the chunk train.
    #[inline]
    pub fn chunks(&self) -> ChunkWalker<'a> {
        ChunkWalker::new(self.chunk_bytes())
    }
}

/// One framed chunk. `data` spans the chunk header and the unpadded value.
#[derive(Clone, Copy, Debug)]
pub struct ChunkRef<'a> {
    data: &'a [u8],
}

impl<'a> ChunkRef<'a> {
    #[inline]
    pub fn chunk_type(&self) -> ChunkType {
        ChunkType::from(self.data[0])
    }

    #[inline]
    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_retain(self.data[1])
    }

    /// The declared chunk length, covering the header and unpadded value.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The chunk value after the 4-byte header, without padding.
    #[inline]
    pub fn value(&self) -> &'a [u8] {
        &self.data[CHUNK_HEADER_LEN..]
    }

    /// A view over this chunk's value as an INIT/INIT ACK body, or `None`
    /// if the chunk is of a different type or the value is short.
    pub fn init(&self) -> Option<InitRef<'a>> {
        match self.chunk_type() {
            ChunkType::Init | ChunkType::InitAck => InitRef::new(self.value()),
            _ => None,
        }
    }
}

/// The fixed part of an INIT or INIT ACK chunk value.
#[derive(Clone, Copy, Debug)]
pub struct InitRef<'a> {
    data: &'a [u8],
}

impl<'a> InitRef<'a> {
    pub fn new(value: &'a [u8]) -> Option<Self> {
        if value.len() < INIT_FIXED_LEN {
            return None;
        }
        Some(InitRef { data: value })
    }

    /// The Initiate Tag the sender is announcing for this association.
    #[inline]
    pub fn initiate_tag(&self) -> u32 {
        u32::from_be_bytes(
            utils::to_array(self.data, 0)
                .expect("insufficient bytes in InitRef to retrieve Initiate Tag field"),
        )
    }

    /// The sender's advertised receiver window credit.
    #[inline]
    pub fn a_rwnd(&self) -> u32 {
        u32::from_be_bytes(
            utils::to_array(self.data, 4)
                .expect("insufficient bytes in InitRef to retrieve a_rwnd field"),
        )
    }
}

/// A lazy, restartable walker over one packet's chunk train.
///
/// The walker yields each well-formed chunk in order. The first framing
/// violation yields exactly one [`MalformedChunkTrain`] (carrying the count
/// of chunks that preceded it) and the walker fuses. Cloning/copying the
/// walker restarts from its current position.
#[derive(Clone, Copy, Debug)]
pub struct ChunkWalker<'a> {
    bytes: &'a [u8],
    seen: usize,
    done: bool,
}

impl<'a> ChunkWalker<'a> {
    #[inline]
    pub fn new(chunk_bytes: &'a [u8]) -> Self {
        ChunkWalker {
            bytes: chunk_bytes,
            seen: 0,
            done: false,
        }
    }

    /// The number of well-formed chunks yielded so far.
    #[inline]
    pub fn seen(&self) -> usize {
        self.seen
    }

    fn malformed(&mut self, reason: &'static str) -> MalformedChunkTrain {
        self.done = true;
        MalformedChunkTrain {
            valid_chunks: self.seen,
            reason,
        }
    }
}

impl<'a> Iterator for ChunkWalker<'a> {
    type Item = Result<ChunkRef<'a>, MalformedChunkTrain>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.bytes.is_empty() {
            self.done = true;
            return None;
        }

        let len_field = match utils::to_array::<2>(self.bytes, 2) {
            Some(arr) => u16::from_be_bytes(arr) as usize,
            None => return Some(Err(self.malformed("truncated chunk header"))),
        };

        if len_field < CHUNK_HEADER_LEN {
            // Covers the zero-length case: a walker that trusted it would
            // never advance.
            return Some(Err(self.malformed("chunk declares a length shorter than its header")));
        }
        if len_field > self.bytes.len() {
            return Some(Err(self.malformed("chunk length extends past the payload boundary")));
        }

        let chunk = ChunkRef {
            data: &self.bytes[..len_field],
        };

        // Interior chunks are padded to 4 bytes; the final chunk may omit
        // the padding.
        let padded = utils::padded_length::<4>(len_field);
        self.bytes = if padded >= self.bytes.len() {
            &[]
        } else {
            &self.bytes[padded..]
        };

        self.seen += 1;
        Some(Ok(chunk))
    }
}
