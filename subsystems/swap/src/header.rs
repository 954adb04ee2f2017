//! Per-page header.
//!
//! Every stored page is one contiguous sector extent holding a 68-byte
//! header followed by the (possibly compressed) payload, zero padded to a
//! sector multiple. The header carries two independent checksums so that
//! header corruption is distinguishable from payload corruption.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use static_assertions::const_assert_eq;

use crate::checksum::ChecksumAlg;
use crate::codec::CompressionAlg;
use crate::device::{sectors_for, SECTOR_SIZE};
use crate::error::{SwapError, SwapResult};
use crate::superblock::{le_u32, le_u64};

/// Encoded header size
pub const PAGE_HEADER_SIZE: usize = 68;

const OFF_ADDRESS: usize = 0;
const OFF_PID: usize = 8;
const OFF_ORIGINAL: usize = 12;
const OFF_COMPRESSED: usize = 16;
const OFF_COMPRESSION: usize = 20;
const OFF_CHECKSUM_ALG: usize = 24;
const OFF_SWAP_TIME: usize = 28;
const OFF_ACCESS: usize = 36;
const OFF_FLAGS: usize = 40;
const OFF_RESERVED: usize = 44;
const OFF_HEADER_CSUM: usize = 60;
const OFF_DATA_CSUM: usize = 64;

const_assert_eq!(OFF_RESERVED + 16, OFF_HEADER_CSUM);
const_assert_eq!(OFF_DATA_CSUM + 4, PAGE_HEADER_SIZE);

bitflags::bitflags! {
    /// Page header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Payload is compressed
        const COMPRESSED  = 1 << 0;
        /// Page belongs to a hibernation image
        const HIBERNATION = 1 << 1;
    }
}

/// Decoded page header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageHeader {
    /// Virtual address of the page
    pub address: u64,
    /// Owning process
    pub pid: u32,
    /// Uncompressed size
    pub original_size: u32,
    /// Stored payload size
    pub compressed_size: u32,
    /// Algorithm applied to the payload
    pub compression: CompressionAlg,
    /// Algorithm for both checksums
    pub checksum_alg: ChecksumAlg,
    /// Time of swap-out
    pub swap_time: u64,
    /// Access count at swap-out
    pub access_count: u32,
    /// Flags
    pub flags: PageFlags,
    /// Header checksum (header with this field zeroed)
    pub header_checksum: u32,
    /// Payload checksum
    pub data_checksum: u32,
}

impl PageHeader {
    /// Build an unsealed header for a payload
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: u64,
        pid: u32,
        original_size: u32,
        compression: CompressionAlg,
        checksum_alg: ChecksumAlg,
        swap_time: u64,
        access_count: u32,
        flags: PageFlags,
    ) -> Self {
        Self {
            address,
            pid,
            original_size,
            compressed_size: 0,
            compression,
            checksum_alg,
            swap_time,
            access_count,
            flags,
            header_checksum: 0,
            data_checksum: 0,
        }
    }

    /// Compute both checksums over `payload` and this header
    pub fn seal(&mut self, payload: &[u8]) {
        self.compressed_size = payload.len() as u32;
        if self.compression != CompressionAlg::None {
            self.flags.insert(PageFlags::COMPRESSED);
        }
        self.data_checksum = self.checksum_alg.compute(payload);
        self.header_checksum = 0;
        let bytes = self.encode();
        self.header_checksum = self.checksum_alg.compute_zeroed(&bytes, OFF_HEADER_CSUM);
    }

    /// Serialise to the on-disk form
    pub fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[OFF_ADDRESS..OFF_ADDRESS + 8].copy_from_slice(&self.address.to_le_bytes());
        buf[OFF_PID..OFF_PID + 4].copy_from_slice(&self.pid.to_le_bytes());
        buf[OFF_ORIGINAL..OFF_ORIGINAL + 4].copy_from_slice(&self.original_size.to_le_bytes());
        buf[OFF_COMPRESSED..OFF_COMPRESSED + 4].copy_from_slice(&self.compressed_size.to_le_bytes());
        buf[OFF_COMPRESSION..OFF_COMPRESSION + 4]
            .copy_from_slice(&self.compression.as_u32().to_le_bytes());
        buf[OFF_CHECKSUM_ALG..OFF_CHECKSUM_ALG + 4]
            .copy_from_slice(&self.checksum_alg.as_u32().to_le_bytes());
        buf[OFF_SWAP_TIME..OFF_SWAP_TIME + 8].copy_from_slice(&self.swap_time.to_le_bytes());
        buf[OFF_ACCESS..OFF_ACCESS + 4].copy_from_slice(&self.access_count.to_le_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[OFF_HEADER_CSUM..OFF_HEADER_CSUM + 4].copy_from_slice(&self.header_checksum.to_le_bytes());
        buf[OFF_DATA_CSUM..OFF_DATA_CSUM + 4].copy_from_slice(&self.data_checksum.to_le_bytes());
        buf
    }

    /// Parse and validate a header.
    ///
    /// Any header whose checksum does not validate, including one whose
    /// algorithm id is unreadable, fails with
    /// [`SwapError::HeaderChecksumMismatch`].
    pub fn decode(buf: &[u8]) -> SwapResult<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(SwapError::ShortRead);
        }
        let buf = &buf[..PAGE_HEADER_SIZE];
        let checksum_alg = ChecksumAlg::from_u32(le_u32(buf, OFF_CHECKSUM_ALG))
            .map_err(|_| SwapError::HeaderChecksumMismatch)?;
        let header_checksum = le_u32(buf, OFF_HEADER_CSUM);
        if checksum_alg.compute_zeroed(buf, OFF_HEADER_CSUM) != header_checksum {
            return Err(SwapError::HeaderChecksumMismatch);
        }
        let compression = CompressionAlg::from_u32(le_u32(buf, OFF_COMPRESSION))?;
        if !compression.is_concrete() {
            return Err(SwapError::UnsupportedAlgorithm);
        }
        let header = Self {
            address: le_u64(buf, OFF_ADDRESS),
            pid: le_u32(buf, OFF_PID),
            original_size: le_u32(buf, OFF_ORIGINAL),
            compressed_size: le_u32(buf, OFF_COMPRESSED),
            compression,
            checksum_alg,
            swap_time: le_u64(buf, OFF_SWAP_TIME),
            access_count: le_u32(buf, OFF_ACCESS),
            flags: PageFlags::from_bits_retain(le_u32(buf, OFF_FLAGS)),
            header_checksum,
            data_checksum: le_u32(buf, OFF_DATA_CSUM),
        };
        if compression != CompressionAlg::None && header.compressed_size > header.original_size {
            return Err(SwapError::CompressionInvariant);
        }
        if compression == CompressionAlg::None && header.compressed_size != header.original_size {
            return Err(SwapError::SizeMismatch);
        }
        Ok(header)
    }

    /// Validate the payload checksum
    pub fn verify_data(&self, payload: &[u8]) -> SwapResult<()> {
        if payload.len() != self.compressed_size as usize {
            return Err(SwapError::SizeMismatch);
        }
        if !self.checksum_alg.verify(payload, self.data_checksum) {
            return Err(SwapError::DataChecksumMismatch);
        }
        Ok(())
    }

    /// Check the header describes the expected page
    pub fn expect_key(&self, address: u64, pid: u32) -> SwapResult<()> {
        if self.address != address || self.pid != pid {
            return Err(SwapError::MisdirectedPage);
        }
        Ok(())
    }

    /// Sectors occupied by this header and its payload
    #[inline]
    pub fn extent_sectors(&self) -> u64 {
        extent_sectors_for(self.compressed_size as usize)
    }
}

/// Sectors needed for a header plus `payload_len` bytes
#[inline]
pub fn extent_sectors_for(payload_len: usize) -> u64 {
    sectors_for((PAGE_HEADER_SIZE + payload_len) as u64)
}

/// Lay out a sealed header and its payload as a sector-padded extent
pub fn build_extent(header: &PageHeader, payload: &[u8]) -> Vec<u8> {
    let sectors = extent_sectors_for(payload.len());
    let mut buf = vec![0u8; (sectors * SECTOR_SIZE) as usize];
    buf[..PAGE_HEADER_SIZE].copy_from_slice(&header.encode());
    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    buf
}

/// Split an extent into a validated header and its payload bytes
pub fn parse_extent(buf: &[u8]) -> SwapResult<(PageHeader, &[u8])> {
    let header = PageHeader::decode(buf)?;
    let end = PAGE_HEADER_SIZE + header.compressed_size as usize;
    if end > buf.len() {
        return Err(SwapError::SizeMismatch);
    }
    let payload = &buf[PAGE_HEADER_SIZE..end];
    header.verify_data(payload)?;
    Ok((header, payload))
}

impl fmt::Display for PageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Page header {:#x} pid {}", self.address, self.pid)?;
        writeln!(
            f,
            "  size:       {} -> {} ({})",
            self.original_size, self.compressed_size, self.compression
        )?;
        writeln!(f, "  checksums:  {} header {:#010x} data {:#010x}",
            self.checksum_alg, self.header_checksum, self.data_checksum)?;
        writeln!(f, "  swapped at: {}", self.swap_time)?;
        writeln!(f, "  accesses:   {}", self.access_count)?;
        write!(f, "  flags:      {:?}", self.flags)
    }
}
