//! Metadata index.
//!
//! Maps every live swapped page, keyed by `(address, pid)`, to its
//! on-device extent and bookkeeping. Duplicate inserts are rejected; the
//! swap engine uses [`MetadataIndex::replace`] for its upsert path.

use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use crate::error::{SwapError, SwapResult};
use crate::pool::{DeviceId, Extent};
use crate::superblock::{le_u32, le_u64};

/// Size of an encoded metadata entry
pub const ENTRY_SIZE: usize = 64;

/// Identity of a swapped page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    /// Virtual address
    pub address: u64,
    /// Owning process
    pub pid: u32,
}

impl PageKey {
    /// Create a key
    #[inline]
    pub const fn new(address: u64, pid: u32) -> Self {
        Self { address, pid }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}", self.address, self.pid)
    }
}

/// Reclaim priority class of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum PriorityClass {
    /// Cold data
    Low      = 0,
    /// Default
    #[default]
    Normal   = 1,
    /// Hot data
    High     = 2,
    /// Must survive (hibernation images)
    Critical = 3,
}

impl PriorityClass {
    /// Decode an on-disk value
    pub const fn from_u8(value: u8) -> SwapResult<Self> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Critical),
            _ => Err(SwapError::CheckpointCorrupt),
        }
    }
}

bitflags::bitflags! {
    /// Metadata entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u32 {
        /// Payload is compressed
        const COMPRESSED  = 1 << 0;
        /// Written as part of a hibernation image
        const HIBERNATION = 1 << 1;
        /// Failed integrity verification
        const QUARANTINED = 1 << 2;
        /// Sectors withdrawn for good after the quarantined page was freed
        const RETIRED     = 1 << 3;
    }
}

/// Lifecycle of a page as seen by the swap engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// In memory, no swap copy
    Resident,
    /// Swap-out in flight
    SwappingOut,
    /// Stored on a device
    Stored,
    /// Swap-in in flight
    SwappingIn,
    /// Stored copy failed verification
    Quarantined,
    /// Swap copy released; terminal for that copy, the key reads as
    /// `Resident` afterwards
    Freed,
}

impl PageState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// The swap engine admits every page operation through this table. A
    /// free may overtake an in-flight read, whose pin keeps the sectors
    /// until it completes.
    pub const fn can_transition(self, next: PageState) -> bool {
        matches!(
            (self, next),
            (Self::Resident, Self::SwappingOut)
                | (Self::SwappingOut, Self::Stored)
                | (Self::SwappingOut, Self::Resident)
                | (Self::Stored, Self::SwappingIn)
                | (Self::Stored, Self::SwappingOut)
                | (Self::Stored, Self::Freed)
                | (Self::SwappingIn, Self::Resident)
                | (Self::SwappingIn, Self::Stored)
                | (Self::SwappingIn, Self::Quarantined)
                | (Self::SwappingIn, Self::Freed)
                | (Self::Quarantined, Self::Freed)
        )
    }
}

/// Record locating one swapped page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetadataEntry {
    /// Page identity
    pub key: PageKey,
    /// Where the header and payload live
    pub location: Extent,
    /// Stored payload bytes
    pub stored_size: u32,
    /// Uncompressed bytes
    pub original_size: u32,
    /// `stored / original` in thousandths
    pub ratio_permille: u16,
    /// Last swap-in time
    pub last_access: u64,
    /// Swap-in count
    pub access_count: u32,
    /// Reclaim priority
    pub priority: PriorityClass,
    /// Flags
    pub flags: EntryFlags,
    /// Time of swap-out
    pub swap_time: u64,
}

impl MetadataEntry {
    /// Compression ratio in thousandths
    pub fn ratio_for(stored: u32, original: u32) -> u16 {
        if original == 0 {
            return 1000;
        }
        ((stored as u64 * 1000) / original as u64).min(u16::MAX as u64) as u16
    }

    /// Serialise to a 64-byte record
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut b = [0u8; ENTRY_SIZE];
        b[0..8].copy_from_slice(&self.key.address.to_le_bytes());
        b[8..12].copy_from_slice(&self.key.pid.to_le_bytes());
        b[12..16].copy_from_slice(&self.location.device.to_le_bytes());
        b[16..24].copy_from_slice(&self.location.start_sector.to_le_bytes());
        b[24..28].copy_from_slice(&self.location.sectors.to_le_bytes());
        b[28..32].copy_from_slice(&self.stored_size.to_le_bytes());
        b[32..40].copy_from_slice(&self.last_access.to_le_bytes());
        b[40..48].copy_from_slice(&self.swap_time.to_le_bytes());
        b[48..52].copy_from_slice(&self.access_count.to_le_bytes());
        b[52..56].copy_from_slice(&self.flags.bits().to_le_bytes());
        b[56..58].copy_from_slice(&self.ratio_permille.to_le_bytes());
        b[58] = self.priority as u8;
        b[60..64].copy_from_slice(&self.original_size.to_le_bytes());
        b
    }

    /// Parse a 64-byte record
    pub fn decode(b: &[u8]) -> SwapResult<Self> {
        if b.len() < ENTRY_SIZE {
            return Err(SwapError::CheckpointCorrupt);
        }
        let sectors = le_u32(b, 24);
        if sectors == 0 {
            return Err(SwapError::CheckpointCorrupt);
        }
        Ok(Self {
            key: PageKey::new(le_u64(b, 0), le_u32(b, 8)),
            location: Extent {
                device: le_u32(b, 12) as DeviceId,
                start_sector: le_u64(b, 16),
                sectors,
            },
            stored_size: le_u32(b, 28),
            last_access: le_u64(b, 32),
            swap_time: le_u64(b, 40),
            access_count: le_u32(b, 48),
            flags: EntryFlags::from_bits_retain(le_u32(b, 52)),
            ratio_permille: u16::from_le_bytes([b[56], b[57]]),
            priority: PriorityClass::from_u8(b[58])?,
            original_size: le_u32(b, 60),
        })
    }
}

impl fmt::Display for MetadataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} at {:<22} {:>5}/{:<5} ratio {:>4}\u{2030} hits {:<4} last {:<12} {:?} {:?}",
            self.key,
            self.location,
            self.stored_size,
            self.original_size,
            self.ratio_permille,
            self.access_count,
            self.last_access,
            self.priority,
            self.flags
        )
    }
}

// ============================================================================
// Index
// ============================================================================

/// Hash index of live metadata entries.
#[derive(Clone, Debug, Default)]
pub struct MetadataIndex {
    entries: HashMap<PageKey, MetadataEntry>,
}

impl MetadataIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert a new entry; duplicates are rejected
    pub fn insert(&mut self, entry: MetadataEntry) -> SwapResult<()> {
        if self.entries.contains_key(&entry.key) {
            return Err(SwapError::AlreadyExists);
        }
        self.entries.insert(entry.key, entry);
        Ok(())
    }

    /// Insert or replace, returning the previous entry
    pub fn replace(&mut self, entry: MetadataEntry) -> Option<MetadataEntry> {
        self.entries.insert(entry.key, entry)
    }

    /// Look up an entry
    pub fn get(&self, key: &PageKey) -> Option<&MetadataEntry> {
        self.entries.get(key)
    }

    /// Look up an entry for update
    pub fn get_mut(&mut self, key: &PageKey) -> Option<&mut MetadataEntry> {
        self.entries.get_mut(key)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &PageKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &PageKey) -> SwapResult<MetadataEntry> {
        self.entries.remove(key).ok_or(SwapError::NotFound)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate entries in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = &MetadataEntry> {
        self.entries.values()
    }

    /// Entries sorted by key (stable output for dumps and checkpoints)
    pub fn sorted(&self) -> Vec<MetadataEntry> {
        let mut v: Vec<MetadataEntry> = self.entries.values().copied().collect();
        v.sort_by_key(|e| e.key);
        v
    }

    /// Entries stored on one device
    pub fn on_device(&self, device: DeviceId) -> Vec<MetadataEntry> {
        let mut v: Vec<MetadataEntry> = self
            .entries
            .values()
            .filter(|e| e.location.device == device)
            .copied()
            .collect();
        v.sort_by_key(|e| e.key);
        v
    }
}
