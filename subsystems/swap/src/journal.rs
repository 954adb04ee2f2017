//! Metadata journal and checkpoint.
//!
//! The metadata index is made durable in two layers on the primary device:
//!
//! - A checkpoint in the metadata region: a full copy of the index. The
//!   region is split into two slots written alternately, so a torn
//!   checkpoint write always leaves the previous one intact.
//! - A journal ring after the superblock: one checksummed record per
//!   committed index mutation, appended before the in-memory index changes.
//!
//! Recovery loads the newest valid checkpoint and replays journal records
//! whose sequence numbers continue it without a gap. After a checkpoint the
//! ring restarts at slot 0; stale records left behind carry older sequence
//! numbers and end the replay.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::checksum::Crc32c;
use crate::device::{read_exact, write_all, BlockDevice, SECTOR_SIZE};
use crate::error::{SwapError, SwapResult};
use crate::index::{MetadataEntry, ENTRY_SIZE};
use crate::superblock::{le_u32, le_u64, Superblock};

// ============================================================================
// Journal
// ============================================================================

/// Size of one journal record
pub const JOURNAL_RECORD_SIZE: usize = 128;

const JOURNAL_MAGIC: u32 = 0x534A_524E; // "SJRN"

/// Records read per device access during replay
const REPLAY_BATCH: usize = 32;

/// Kind of index mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum JournalOp {
    /// Entry stored or replaced
    Store      = 1,
    /// Entry freed
    Free       = 2,
    /// Entry moved to quarantine
    Quarantine = 3,
    /// Quarantined entry freed, its sectors retired
    Retire     = 4,
}

impl JournalOp {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Store),
            2 => Some(Self::Free),
            3 => Some(Self::Quarantine),
            4 => Some(Self::Retire),
            _ => None,
        }
    }
}

/// One replayable index mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalRecord {
    /// Mutation kind
    pub op: JournalOp,
    /// Sequence number
    pub seq: u64,
    /// Entry after the mutation (the removed entry for `Free`)
    pub entry: MetadataEntry,
}

impl JournalRecord {
    fn encode(&self, tag: u32) -> [u8; JOURNAL_RECORD_SIZE] {
        let mut b = [0u8; JOURNAL_RECORD_SIZE];
        b[0..4].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&(self.op as u32).to_le_bytes());
        b[8..16].copy_from_slice(&self.seq.to_le_bytes());
        b[16..16 + ENTRY_SIZE].copy_from_slice(&self.entry.encode());
        b[80..84].copy_from_slice(&tag.to_le_bytes());
        let crc = Crc32c::hash(&b[..124]);
        b[124..128].copy_from_slice(&crc.to_le_bytes());
        b
    }

    fn decode(b: &[u8], tag: u32) -> Option<Self> {
        if le_u32(b, 0) != JOURNAL_MAGIC || le_u32(b, 80) != tag {
            return None;
        }
        if Crc32c::hash(&b[..124]) != le_u32(b, 124) {
            return None;
        }
        Some(Self {
            op: JournalOp::from_u32(le_u32(b, 4))?,
            seq: le_u64(b, 8),
            entry: MetadataEntry::decode(&b[16..16 + ENTRY_SIZE]).ok()?,
        })
    }
}

/// Write-ahead ring of index mutations.
pub struct Journal {
    device: Arc<dyn BlockDevice>,
    offset: u64,
    capacity: u64,
    head: u64,
    next_seq: u64,
    tag: u32,
}

impl Journal {
    /// Open the journal region described by `sb`
    pub fn new(device: Arc<dyn BlockDevice>, sb: &Superblock, next_seq: u64) -> Self {
        Self {
            device,
            offset: sb.journal_offset(),
            capacity: sb.journal_bytes() / JOURNAL_RECORD_SIZE as u64,
            head: 0,
            next_seq,
            tag: sb.space_tag(),
        }
    }

    /// Ring capacity in records
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Records appended since the last reset
    pub fn len(&self) -> u64 {
        self.head
    }

    /// Whether nothing was appended since the last reset
    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    /// Whether the next append needs a checkpoint first
    pub fn is_full(&self) -> bool {
        self.head >= self.capacity
    }

    /// Sequence number of the last appended record
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Append a record and make it durable, returning its sequence number
    pub fn append(&mut self, op: JournalOp, entry: &MetadataEntry) -> SwapResult<u64> {
        if self.is_full() {
            return Err(SwapError::Internal);
        }
        let record = JournalRecord {
            op,
            seq: self.next_seq,
            entry: *entry,
        };
        let at = self.offset + self.head * JOURNAL_RECORD_SIZE as u64;
        write_all(self.device.as_ref(), at, &record.encode(self.tag))?;
        self.device.flush()?;
        self.head += 1;
        self.next_seq += 1;
        Ok(record.seq)
    }

    /// Restart the ring after a checkpoint
    pub fn reset(&mut self) {
        self.head = 0;
    }

    /// Read the records that continue a checkpoint taken at `after_seq`.
    ///
    /// Leaves the ring positioned after the last valid record.
    pub fn replay(&mut self, after_seq: u64) -> SwapResult<Vec<JournalRecord>> {
        let mut records = Vec::new();
        let mut expected = after_seq + 1;
        let mut slot = 0u64;
        let mut batch = vec![0u8; REPLAY_BATCH * JOURNAL_RECORD_SIZE];
        'outer: while slot < self.capacity {
            let n = core::cmp::min(REPLAY_BATCH as u64, self.capacity - slot) as usize;
            let buf = &mut batch[..n * JOURNAL_RECORD_SIZE];
            read_exact(
                self.device.as_ref(),
                self.offset + slot * JOURNAL_RECORD_SIZE as u64,
                buf,
            )?;
            for chunk in buf.chunks_exact(JOURNAL_RECORD_SIZE) {
                match JournalRecord::decode(chunk, self.tag) {
                    Some(rec) if rec.seq == expected => {
                        records.push(rec);
                        expected += 1;
                        slot += 1;
                    }
                    _ => break 'outer,
                }
            }
        }
        self.head = slot;
        self.next_seq = expected;
        Ok(records)
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("head", &self.head)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

// ============================================================================
// Checkpoint
// ============================================================================

const CHECKPOINT_MAGIC: u32 = 0x5357_324D; // "SW2M"
const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_HEADER: u64 = SECTOR_SIZE;

/// A loaded checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    /// Write generation (selects the newer slot)
    pub generation: u64,
    /// Last journal sequence number folded in
    pub seq: u64,
    /// Every live, quarantined and retired entry
    pub entries: Vec<MetadataEntry>,
}

/// Double-slotted checkpoint region.
pub struct CheckpointRegion {
    device: Arc<dyn BlockDevice>,
    offset: u64,
    slot_bytes: u64,
    tag: u32,
    generation: u64,
}

impl CheckpointRegion {
    /// Open the metadata region described by `sb`
    pub fn new(device: Arc<dyn BlockDevice>, sb: &Superblock) -> Self {
        Self {
            device,
            offset: sb.metadata_offset(),
            slot_bytes: (sb.metadata_bytes() / 2) / SECTOR_SIZE * SECTOR_SIZE,
            tag: sb.space_tag(),
            generation: 0,
        }
    }

    /// Entries one slot can hold
    pub fn capacity(&self) -> u64 {
        self.slot_bytes.saturating_sub(CHECKPOINT_HEADER) / ENTRY_SIZE as u64
    }

    fn slot_offset(&self, generation: u64) -> u64 {
        self.offset + (generation % 2) * self.slot_bytes
    }

    /// Write a checkpoint covering journal records up to `seq`
    pub fn write(&mut self, seq: u64, entries: &[MetadataEntry]) -> SwapResult<()> {
        if self.slot_bytes < CHECKPOINT_HEADER || entries.len() as u64 > self.capacity() {
            return Err(SwapError::MetadataRegionFull);
        }
        let generation = self.generation + 1;
        let base = self.slot_offset(generation);

        let mut body = Vec::with_capacity(entries.len() * ENTRY_SIZE);
        for e in entries {
            body.extend_from_slice(&e.encode());
        }
        if !body.is_empty() {
            write_all(self.device.as_ref(), base + CHECKPOINT_HEADER, &body)?;
        }

        let mut header = [0u8; CHECKPOINT_HEADER as usize];
        header[0..4].copy_from_slice(&CHECKPOINT_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&generation.to_le_bytes());
        header[16..24].copy_from_slice(&seq.to_le_bytes());
        header[24..32].copy_from_slice(&(entries.len() as u64).to_le_bytes());
        header[32..36].copy_from_slice(&self.tag.to_le_bytes());
        header[36..40].copy_from_slice(&Crc32c::hash(&body).to_le_bytes());
        let crc = Crc32c::hash(&header[..40]);
        header[40..44].copy_from_slice(&crc.to_le_bytes());
        self.device.flush()?;
        write_all(self.device.as_ref(), base, &header)?;
        self.device.flush()?;

        self.generation = generation;
        Ok(())
    }

    fn load_slot(&self, slot: u64) -> SwapResult<Option<Checkpoint>> {
        let base = self.offset + slot * self.slot_bytes;
        let mut header = [0u8; CHECKPOINT_HEADER as usize];
        read_exact(self.device.as_ref(), base, &mut header)?;
        if le_u32(&header, 0) != CHECKPOINT_MAGIC
            || le_u32(&header, 4) != CHECKPOINT_VERSION
            || le_u32(&header, 32) != self.tag
            || Crc32c::hash(&header[..40]) != le_u32(&header, 40)
        {
            return Ok(None);
        }
        let count = le_u64(&header, 24);
        if count > self.capacity() {
            return Ok(None);
        }
        let mut body = vec![0u8; count as usize * ENTRY_SIZE];
        if !body.is_empty() {
            read_exact(self.device.as_ref(), base + CHECKPOINT_HEADER, &mut body)?;
        }
        if Crc32c::hash(&body) != le_u32(&header, 36) {
            return Ok(None);
        }
        let entries = body
            .chunks_exact(ENTRY_SIZE)
            .map(MetadataEntry::decode)
            .collect::<SwapResult<Vec<_>>>()?;
        Ok(Some(Checkpoint {
            generation: le_u64(&header, 8),
            seq: le_u64(&header, 16),
            entries,
        }))
    }

    /// Load the newest valid checkpoint
    pub fn load(&mut self) -> SwapResult<Checkpoint> {
        if self.slot_bytes < CHECKPOINT_HEADER {
            return Err(SwapError::CheckpointCorrupt);
        }
        let a = self.load_slot(0)?;
        let b = self.load_slot(1)?;
        let best = match (a, b) {
            (Some(a), Some(b)) => {
                if a.generation >= b.generation {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return Err(SwapError::CheckpointCorrupt),
        };
        self.generation = best.generation;
        Ok(best)
    }
}

impl fmt::Debug for CheckpointRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointRegion")
            .field("offset", &self.offset)
            .field("slot_bytes", &self.slot_bytes)
            .field("generation", &self.generation)
            .finish()
    }
}
