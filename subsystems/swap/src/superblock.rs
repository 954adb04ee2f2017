//! Superblock manager.
//!
//! The superblock is the fixed 64 KiB block at offset 0 of the primary
//! device. It carries the global format of the swap space and the page
//! counters. Its trailing CRC32C covers the whole block with the checksum
//! field zeroed, and must validate before any other field is trusted.
//!
//! ```text
//! 0      magic            4B     60   uuid           16B
//! 4      version          4B     76   creation_time   8B
//! 8      total_pages      8B     84   flags           4B
//! 16     free_pages       8B     88   reserved     4040B
//! 24     used_pages       8B     4128 checksum        4B
//! 32     journal_pages    8B     ...  zero padding to 65536
//! 40     metadata_pages   8B
//! 48     page_size        4B
//! 52     compression_alg  4B
//! 56     checksum_alg     4B
//! ```

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use static_assertions::{const_assert, const_assert_eq};
use uuid::Uuid;

use crate::checksum::{ChecksumAlg, Crc32c};
use crate::codec::CompressionAlg;
use crate::device::{read_exact, sectors_for, write_all, BlockDevice, SECTOR_SIZE};
use crate::error::{SwapError, SwapResult};
use crate::platform::{generate_uuid, Platform};

// ============================================================================
// Constants
// ============================================================================

/// Swap2 magic ("SW2!")
pub const SWAP_MAGIC: u32 = 0x5357_3221;

/// Format version major
pub const VERSION_MAJOR: u8 = 2;
/// Format version minor
pub const VERSION_MINOR: u8 = 0;
/// Format version patch
pub const VERSION_PATCH: u8 = 0;

/// Packed format version (`major << 16 | minor << 8 | patch`)
pub const SWAP_VERSION: u32 =
    ((VERSION_MAJOR as u32) << 16) | ((VERSION_MINOR as u32) << 8) | VERSION_PATCH as u32;

/// Size of the on-disk superblock block
pub const SUPERBLOCK_SIZE: usize = 65536;

/// Default journal reservation in pages
pub const DEFAULT_JOURNAL_PAGES: u64 = 32768;

/// Default metadata reservation in pages
pub const DEFAULT_METADATA_PAGES: u64 = 65536;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_TOTAL: usize = 8;
const OFF_FREE: usize = 16;
const OFF_USED: usize = 24;
const OFF_JOURNAL: usize = 32;
const OFF_METADATA: usize = 40;
const OFF_PAGE_SIZE: usize = 48;
const OFF_COMPRESSION: usize = 52;
const OFF_CHECKSUM_ALG: usize = 56;
const OFF_UUID: usize = 60;
const OFF_CREATION: usize = 76;
const OFF_FLAGS: usize = 84;

/// Offset of the reserved area
pub const OFF_RESERVED: usize = 88;

/// Size of the reserved area
pub const RESERVED_SIZE: usize = 4040;

/// Offset of the trailing checksum
pub const OFF_CHECKSUM: usize = OFF_RESERVED + RESERVED_SIZE;

const_assert_eq!(OFF_UUID + 16, OFF_CREATION);
const_assert_eq!(OFF_CREATION + 8, OFF_FLAGS);
const_assert_eq!(OFF_FLAGS + 4, OFF_RESERVED);
const_assert_eq!(OFF_CHECKSUM, 4128);
const_assert!(OFF_CHECKSUM + 4 <= SUPERBLOCK_SIZE);

// ============================================================================
// Flags and Page Size
// ============================================================================

bitflags::bitflags! {
    /// Superblock flag bitset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SuperblockFlags: u32 {
        /// Pages may be stored compressed
        const COMPRESSED = 1 << 0;
        /// Pages are encrypted
        const ENCRYPTED  = 1 << 1;
        /// Space is mounted for writing (crash marker)
        const DIRTY      = 1 << 2;
        /// Space is locked against administration
        const LOCKED     = 1 << 3;
        /// Space has been referenced since format
        const REFERENCED = 1 << 4;
        /// Space has been accessed since format
        const ACCESSED   = 1 << 5;
        /// A hibernation image is stored
        const HIBERNATED = 1 << 6;
    }
}

/// Supported page sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum PageSize {
    /// 4 KiB
    Size4K  = 4096,
    /// 8 KiB
    Size8K  = 8192,
    /// 16 KiB
    Size16K = 16384,
    /// 32 KiB
    Size32K = 32768,
}

impl PageSize {
    /// Validate a byte size
    pub const fn from_bytes(bytes: u32) -> SwapResult<Self> {
        match bytes {
            4096 => Ok(Self::Size4K),
            8192 => Ok(Self::Size8K),
            16384 => Ok(Self::Size16K),
            32768 => Ok(Self::Size32K),
            _ => Err(SwapError::UnsupportedPageSize),
        }
    }

    /// Size in bytes
    #[inline]
    pub const fn bytes(self) -> u32 {
        self as u32
    }
}

// ============================================================================
// Superblock
// ============================================================================

/// In-memory superblock.
#[derive(Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number
    pub magic: u32,
    /// Packed version
    pub version: u32,
    /// Logical capacity in pages
    pub total_pages: u64,
    /// Pages available for new swap-outs
    pub free_pages: u64,
    /// Pages holding stored or quarantined data
    pub used_pages: u64,
    /// Journal reservation on the primary device
    pub journal_pages: u64,
    /// Metadata checkpoint reservation on the primary device
    pub metadata_pages: u64,
    /// Page size
    pub page_size: PageSize,
    /// Default compression algorithm
    pub compression: CompressionAlg,
    /// Integrity algorithm for page headers and payloads
    pub checksum_alg: ChecksumAlg,
    /// Swap space identity
    pub uuid: Uuid,
    /// Creation time (platform nanoseconds)
    pub creation_time: u64,
    /// Flag bitset
    pub flags: SuperblockFlags,
    /// Reserved area (holds the saved configuration record)
    pub reserved: [u8; RESERVED_SIZE],
    /// Trailing checksum, valid after [`Superblock::seal`]
    pub checksum: u32,
}

impl Superblock {
    /// Build a new superblock.
    ///
    /// Reserves the default journal and metadata regions on the primary
    /// device, stamps a fresh UUID and the creation time, and sets
    /// `COMPRESSED | DIRTY`.
    pub fn create(
        total_pages: u64,
        page_size: u32,
        compression: CompressionAlg,
        checksum_alg: ChecksumAlg,
        platform: &dyn Platform,
    ) -> SwapResult<Self> {
        let page_size = PageSize::from_bytes(page_size)?;
        if total_pages == 0 {
            return Err(SwapError::InvalidArgument);
        }
        let mut sb = Self {
            magic: SWAP_MAGIC,
            version: SWAP_VERSION,
            total_pages,
            free_pages: total_pages,
            used_pages: 0,
            journal_pages: DEFAULT_JOURNAL_PAGES,
            metadata_pages: DEFAULT_METADATA_PAGES,
            page_size,
            compression,
            checksum_alg,
            uuid: generate_uuid(platform),
            creation_time: platform.now_ns(),
            flags: SuperblockFlags::COMPRESSED | SuperblockFlags::DIRTY,
            reserved: [0; RESERVED_SIZE],
            checksum: 0,
        };
        sb.seal();
        Ok(sb)
    }

    /// Override the journal and metadata reservations
    pub fn with_reserved_pages(mut self, journal_pages: u64, metadata_pages: u64) -> Self {
        self.journal_pages = journal_pages;
        self.metadata_pages = metadata_pages;
        self.seal();
        self
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    fn encode_fields(&self, buf: &mut [u8]) {
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        buf[OFF_TOTAL..OFF_TOTAL + 8].copy_from_slice(&self.total_pages.to_le_bytes());
        buf[OFF_FREE..OFF_FREE + 8].copy_from_slice(&self.free_pages.to_le_bytes());
        buf[OFF_USED..OFF_USED + 8].copy_from_slice(&self.used_pages.to_le_bytes());
        buf[OFF_JOURNAL..OFF_JOURNAL + 8].copy_from_slice(&self.journal_pages.to_le_bytes());
        buf[OFF_METADATA..OFF_METADATA + 8].copy_from_slice(&self.metadata_pages.to_le_bytes());
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.bytes().to_le_bytes());
        buf[OFF_COMPRESSION..OFF_COMPRESSION + 4]
            .copy_from_slice(&self.compression.as_u32().to_le_bytes());
        buf[OFF_CHECKSUM_ALG..OFF_CHECKSUM_ALG + 4]
            .copy_from_slice(&self.checksum_alg.as_u32().to_le_bytes());
        buf[OFF_UUID..OFF_UUID + 16].copy_from_slice(self.uuid.as_bytes());
        buf[OFF_CREATION..OFF_CREATION + 8].copy_from_slice(&self.creation_time.to_le_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[OFF_RESERVED..OFF_CHECKSUM].copy_from_slice(&self.reserved);
    }

    /// Compute the checksum of the current fields
    pub fn compute_checksum(&self) -> u32 {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        self.encode_fields(&mut buf);
        Crc32c::hash(&buf)
    }

    /// Recompute and store the trailing checksum
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Serialise to a full 64 KiB block (checksum recomputed)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        self.encode_fields(&mut buf);
        let crc = Crc32c::hash(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and validate a 64 KiB block.
    ///
    /// Magic is checked first ([`SwapError::BadMagic`]: not a swap space),
    /// then the checksum ([`SwapError::SuperblockCorrupt`]), then version,
    /// page size and algorithm ids.
    pub fn decode(buf: &[u8]) -> SwapResult<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(SwapError::ShortRead);
        }
        let buf = &buf[..SUPERBLOCK_SIZE];
        if le_u32(buf, OFF_MAGIC) != SWAP_MAGIC {
            return Err(SwapError::BadMagic);
        }
        let stored = le_u32(buf, OFF_CHECKSUM);
        if ChecksumAlg::Crc32c.compute_zeroed(buf, OFF_CHECKSUM) != stored {
            return Err(SwapError::SuperblockCorrupt);
        }
        let version = le_u32(buf, OFF_VERSION);
        if version != SWAP_VERSION {
            return Err(SwapError::IncompatibleVersion);
        }
        let page_size = PageSize::from_bytes(le_u32(buf, OFF_PAGE_SIZE))?;
        let compression = CompressionAlg::from_u32(le_u32(buf, OFF_COMPRESSION))?;
        let checksum_alg = ChecksumAlg::from_u32(le_u32(buf, OFF_CHECKSUM_ALG))?;

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[OFF_UUID..OFF_UUID + 16]);
        let mut reserved = [0u8; RESERVED_SIZE];
        reserved.copy_from_slice(&buf[OFF_RESERVED..OFF_CHECKSUM]);

        let sb = Self {
            magic: SWAP_MAGIC,
            version,
            total_pages: le_u64(buf, OFF_TOTAL),
            free_pages: le_u64(buf, OFF_FREE),
            used_pages: le_u64(buf, OFF_USED),
            journal_pages: le_u64(buf, OFF_JOURNAL),
            metadata_pages: le_u64(buf, OFF_METADATA),
            page_size,
            compression,
            checksum_alg,
            uuid: Uuid::from_bytes(uuid),
            creation_time: le_u64(buf, OFF_CREATION),
            flags: SuperblockFlags::from_bits_retain(le_u32(buf, OFF_FLAGS)),
            reserved,
            checksum: stored,
        };
        if sb.free_pages.checked_add(sb.used_pages) != Some(sb.total_pages) {
            return Err(SwapError::SuperblockCorrupt);
        }
        if sb.reserved_end().is_err() {
            return Err(SwapError::SuperblockCorrupt);
        }
        Ok(sb)
    }

    // ------------------------------------------------------------------------
    // Device I/O
    // ------------------------------------------------------------------------

    /// Load and validate the superblock from `dev`
    pub fn read(dev: &dyn BlockDevice) -> SwapResult<Self> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        read_exact(dev, 0, &mut buf)?;
        Self::decode(&buf)
    }

    /// Seal and persist the superblock to `dev`.
    ///
    /// Callers sharing a swap space serialise writes through the space's
    /// superblock write lock.
    pub fn write(&mut self, dev: &dyn BlockDevice) -> SwapResult<()> {
        self.seal();
        let buf = self.encode();
        write_all(dev, 0, &buf)?;
        dev.flush()
    }

    /// Pure validation: magic, exact version and checksum
    pub fn verify(&self) -> SwapResult<()> {
        if self.magic != SWAP_MAGIC {
            return Err(SwapError::BadMagic);
        }
        if self.version != SWAP_VERSION {
            return Err(SwapError::IncompatibleVersion);
        }
        PageSize::from_bytes(self.page_size.bytes())?;
        if self.compute_checksum() != self.checksum {
            return Err(SwapError::SuperblockCorrupt);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------------

    /// Set the crash marker
    #[inline]
    pub fn mark_dirty(&mut self) {
        self.flags.insert(SuperblockFlags::DIRTY);
    }

    /// Clear the crash marker (clean shutdown only)
    #[inline]
    pub fn clear_dirty(&mut self) {
        self.flags.remove(SuperblockFlags::DIRTY);
    }

    /// Whether the previous session ended uncleanly
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(SuperblockFlags::DIRTY)
    }

    /// Whether a hibernation image is stored
    #[inline]
    pub fn is_hibernated(&self) -> bool {
        self.flags.contains(SuperblockFlags::HIBERNATED)
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    /// Move one page from free to used
    pub fn take_page(&mut self) -> SwapResult<()> {
        if self.free_pages == 0 {
            return Err(SwapError::NoSpace);
        }
        self.free_pages -= 1;
        self.used_pages += 1;
        Ok(())
    }

    /// Move one page from used to free
    pub fn return_page(&mut self) -> SwapResult<()> {
        if self.used_pages == 0 {
            return Err(SwapError::Internal);
        }
        self.used_pages -= 1;
        self.free_pages += 1;
        Ok(())
    }

    /// Reset counters from an authoritative used count
    pub fn set_used(&mut self, used: u64) -> SwapResult<()> {
        if used > self.total_pages {
            return Err(SwapError::CheckpointCorrupt);
        }
        self.used_pages = used;
        self.free_pages = self.total_pages - used;
        Ok(())
    }

    /// Counter invariant `free + used == total`
    #[inline]
    pub fn counters_consistent(&self) -> bool {
        self.free_pages + self.used_pages == self.total_pages
    }

    // ------------------------------------------------------------------------
    // Primary-device layout
    // ------------------------------------------------------------------------

    /// Page size in bytes
    #[inline]
    pub fn page_bytes(&self) -> u64 {
        self.page_size.bytes() as u64
    }

    /// Byte offset of the journal region
    #[inline]
    pub fn journal_offset(&self) -> u64 {
        SUPERBLOCK_SIZE as u64
    }

    /// Size of the journal region
    #[inline]
    pub fn journal_bytes(&self) -> u64 {
        self.journal_pages.saturating_mul(self.page_bytes())
    }

    /// Byte offset of the metadata checkpoint region
    #[inline]
    pub fn metadata_offset(&self) -> u64 {
        self.journal_offset().saturating_add(self.journal_bytes())
    }

    /// Size of the metadata checkpoint region
    #[inline]
    pub fn metadata_bytes(&self) -> u64 {
        self.metadata_pages.saturating_mul(self.page_bytes())
    }

    /// First sector of the primary device usable for page data
    #[inline]
    pub fn data_start_sector(&self) -> u64 {
        sectors_for(self.metadata_offset().saturating_add(self.metadata_bytes()))
    }

    /// Byte offset where the sector-aligned reserved area ends.
    ///
    /// Fails with `OutOfRange` when the reservations do not fit a 64-bit
    /// device offset.
    pub fn reserved_end(&self) -> SwapResult<u64> {
        let page = self.page_bytes();
        let end = self
            .journal_pages
            .checked_mul(page)
            .and_then(|j| self.metadata_pages.checked_mul(page).map(|m| (j, m)))
            .and_then(|(j, m)| self.journal_offset().checked_add(j)?.checked_add(m))
            .ok_or(SwapError::OutOfRange)?;
        end.checked_next_multiple_of(SECTOR_SIZE)
            .ok_or(SwapError::OutOfRange)
    }

    /// Short tag identifying this space in journal and checkpoint records
    pub fn space_tag(&self) -> u32 {
        Crc32c::hash(self.uuid.as_bytes())
    }
}

impl fmt::Debug for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Superblock")
            .field("version", &format_args!("{:#08x}", self.version))
            .field("total_pages", &self.total_pages)
            .field("free_pages", &self.free_pages)
            .field("used_pages", &self.used_pages)
            .field("journal_pages", &self.journal_pages)
            .field("metadata_pages", &self.metadata_pages)
            .field("page_size", &self.page_size)
            .field("compression", &self.compression)
            .field("checksum_alg", &self.checksum_alg)
            .field("uuid", &self.uuid)
            .field("flags", &self.flags)
            .field("checksum", &format_args!("{:#010x}", self.checksum))
            .finish()
    }
}

impl fmt::Display for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Swap2 superblock")?;
        writeln!(f, "  magic:          {:#010x}", self.magic)?;
        writeln!(
            f,
            "  version:        {}.{}.{}",
            (self.version >> 16) & 0xFF,
            (self.version >> 8) & 0xFF,
            self.version & 0xFF
        )?;
        writeln!(f, "  uuid:           {}", self.uuid)?;
        writeln!(f, "  page size:      {} bytes", self.page_size.bytes())?;
        writeln!(
            f,
            "  pages:          total {} free {} used {}",
            self.total_pages, self.free_pages, self.used_pages
        )?;
        writeln!(
            f,
            "  reserved:       journal {} metadata {}",
            self.journal_pages, self.metadata_pages
        )?;
        writeln!(f, "  compression:    {}", self.compression)?;
        writeln!(f, "  checksum alg:   {}", self.checksum_alg)?;
        writeln!(f, "  created:        {}", self.creation_time)?;
        writeln!(f, "  flags:          {:?}", self.flags)?;
        write!(f, "  checksum:       {:#010x}", self.checksum)
    }
}

#[inline]
pub(crate) fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(crate) fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}
