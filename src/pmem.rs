//! On-device storage model.
//!
//! Two chains live inside the data region: the device event log and the
//! recorded tracks. Each chain is described by a small descriptor at a fixed
//! offset and consists of 0x1000-byte entry blocks doubly linked by absolute
//! offset. The device overwrites oldest blocks when full, so the chain is a
//! logical ring; the descriptor's `first` pointer names the oldest retained
//! block and `last` the current write block.

use binrw::{BinRead, BinWrite};
use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::REGION_SIZE;

pub const BLOCK_SIZE: u32 = 0x1000;
pub const BLOCK_HEADER_LEN: u32 = 12;

/// Offset value marking the end of a chain.
pub const NO_BLOCK: u32 = 0xFFFF_FFFF;

pub const LOG_DESCRIPTOR_OFFSET: u32 = 0x0000;
pub const TRACK_DESCRIPTOR_OFFSET: u32 = 0x0040;

/// Entry blocks start above the descriptors and the settings area.
pub const FIRST_BLOCK_OFFSET: u32 = 0x1000;

/// Upper bound on chain length, also the cycle guard.
pub const BLOCK_COUNT: usize = ((REGION_SIZE - FIRST_BLOCK_OFFSET) / BLOCK_SIZE) as usize;

pub const CHAIN_DESCRIPTOR_LEN: u32 = 18;

/// Top-level chain descriptor at a fixed region offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ChainDescriptor {
    /// Oldest retained entry block
    pub first: u32,
    /// Current write block
    pub last: u32,
    /// Block the next entry will be appended to
    pub current: u32,
    pub entry_count: u32,
    pub wrap_count: u16,
}

/// Header of one entry block.
///
/// `first_entry` and `last_written` are block-relative; records never
/// straddle blocks, so the device pads the tail of a block and
/// `last_written` excludes the padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct EntryBlockHeader {
    pub prev: u32,
    pub next: u32,
    pub first_entry: u16,
    pub last_written: u16,
}

/// Which of the two top-level chains to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    Log,
    Tracks,
}

impl ChainKind {
    pub fn descriptor_offset(self) -> u32 {
        match self {
            ChainKind::Log => LOG_DESCRIPTOR_OFFSET,
            ChainKind::Tracks => TRACK_DESCRIPTOR_OFFSET,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChainKind::Log => "log",
            ChainKind::Tracks => "tracks",
        }
    }
}

/// One contiguous run of chain bytes and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Region offset of the first byte of this segment.
    pub region_offset: u32,
    /// Position of this segment within the logical stream.
    pub start: usize,
    pub len: usize,
}

/// The logical byte stream of one chain, oldest to newest.
#[derive(Debug, Default)]
pub struct ChainStream {
    pub bytes: Vec<u8>,
    pub segments: Vec<Segment>,
    /// Region offset where the walk stopped early, if the chain was broken.
    pub truncated_at: Option<u32>,
    pub blocks: usize,
}

impl ChainStream {
    /// Map a position in the logical stream back to its region offset.
    pub fn region_offset(&self, stream_pos: usize) -> Option<u32> {
        for segment in &self.segments {
            if stream_pos < segment.start + segment.len {
                let delta = stream_pos.checked_sub(segment.start)?;
                return Some(segment.region_offset + delta as u32);
            }
        }
        None
    }
}

/// Compact visit set indexed by block base offset.
struct BlockSet {
    bits: Vec<u64>,
}

impl BlockSet {
    fn new() -> Self {
        Self {
            bits: vec![0; BLOCK_COUNT.div_ceil(64)],
        }
    }

    fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        let seen = self.bits[word] & (1 << bit) != 0;
        self.bits[word] |= 1 << bit;
        !seen
    }
}

fn block_index(offset: u32) -> Option<usize> {
    if offset < FIRST_BLOCK_OFFSET
        || offset % BLOCK_SIZE != 0
        || offset + BLOCK_SIZE > REGION_SIZE
    {
        return None;
    }
    Some(((offset - FIRST_BLOCK_OFFSET) / BLOCK_SIZE) as usize)
}

fn parse_descriptor(bytes: &[u8]) -> Result<ChainDescriptor> {
    let mut cursor = std::io::Cursor::new(bytes);
    ChainDescriptor::read_le(&mut cursor)
        .map_err(|e| Error::Protocol(format!("failed to decode chain descriptor: {e}")))
}

fn parse_block_header(bytes: &[u8]) -> Result<EntryBlockHeader> {
    let mut cursor = std::io::Cursor::new(bytes);
    EntryBlockHeader::read_le(&mut cursor)
        .map_err(|e| Error::Protocol(format!("failed to decode entry block header: {e}")))
}

/// Walk one chain and concatenate the valid body bytes of every block.
///
/// A broken chain (out-of-range offset, bad entry bounds, severed linkage or
/// a revisited block) truncates the stream at the last good block; whatever
/// was collected stays valid and `truncated_at` carries the failing offset.
pub fn chain_stream<F>(kind: ChainKind, mut read: F) -> Result<ChainStream>
where
    F: FnMut(u32, u32) -> Result<Vec<u8>>,
{
    let raw = read(kind.descriptor_offset(), CHAIN_DESCRIPTOR_LEN)?;
    let descriptor = parse_descriptor(&raw)?;

    let mut stream = ChainStream::default();
    if descriptor.first == NO_BLOCK {
        return Ok(stream);
    }
    if block_index(descriptor.first).is_none() {
        // Nothing decodable at all: the descriptor itself is garbage.
        return Err(Error::Decode {
            offset: kind.descriptor_offset(),
            reason: format!(
                "{} chain descriptor names invalid first block {:#x}",
                kind.name(),
                descriptor.first
            ),
        });
    }

    let mut visited = BlockSet::new();
    let mut offset = descriptor.first;
    let mut prev_base: Option<u32> = None;
    let mut steps = 0usize;
    loop {
        if steps >= BLOCK_COUNT {
            stream.truncated_at = Some(offset);
            break;
        }
        steps += 1;

        let index = match block_index(offset) {
            Some(index) => index,
            None => {
                stream.truncated_at = Some(offset);
                break;
            }
        };
        if !visited.insert(index) {
            stream.truncated_at = Some(offset);
            break;
        }

        let raw = read(offset, BLOCK_SIZE)?;
        let header = parse_block_header(&raw)?;

        let first = header.first_entry as u32;
        let last = header.last_written as u32;
        if first < BLOCK_HEADER_LEN || first > last || last > BLOCK_SIZE {
            stream.truncated_at = Some(offset);
            break;
        }
        // Adjacent blocks must be mutual inverses: the block we stepped to
        // has to point back at the block we came from.
        if let Some(prev) = prev_base {
            if header.prev != prev {
                stream.truncated_at = Some(offset);
                break;
            }
        }

        stream.segments.push(Segment {
            region_offset: offset + first,
            start: stream.bytes.len(),
            len: (last - first) as usize,
        });
        stream.bytes.extend_from_slice(&raw[first as usize..last as usize]);
        stream.blocks += 1;

        if offset == descriptor.last {
            break;
        }
        if header.next == NO_BLOCK {
            stream.truncated_at = Some(offset);
            break;
        }
        prev_base = Some(offset);
        offset = header.next;
    }

    if let Some(at) = stream.truncated_at {
        warn!(
            chain = kind.name(),
            offset = format_args!("{at:#x}"),
            blocks = stream.blocks,
            "chain walk truncated"
        );
    }
    Ok(stream)
}
