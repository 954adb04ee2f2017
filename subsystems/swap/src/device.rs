//! Block device primitive.
//!
//! The architecture layer supplies concrete devices. This module defines
//! the byte-addressed contract the swap engine consumes and a RAM-backed
//! implementation used for compressed RAM swap and for tests.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::error::{SwapError, SwapResult};

/// Sector size in bytes. Device ranges are expressed in sectors.
pub const SECTOR_SIZE: u64 = 512;

/// Round a byte count up to whole sectors.
#[inline]
pub const fn sectors_for(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Byte-addressed block device.
///
/// Implementations return the number of bytes transferred. Retry policy
/// belongs to the block layer; the swap engine propagates failures as-is.
pub trait BlockDevice: Send + Sync {
    /// Read into `buf` starting at byte `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> SwapResult<usize>;

    /// Write `buf` starting at byte `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> SwapResult<usize>;

    /// Make previous writes durable
    fn flush(&self) -> SwapResult<()> {
        Ok(())
    }

    /// Device capacity in bytes
    fn size_bytes(&self) -> u64;
}

/// Read exactly `buf.len()` bytes or fail with [`SwapError::ShortRead`].
pub fn read_exact(dev: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> SwapResult<()> {
    let n = dev.read_at(offset, buf)?;
    if n != buf.len() {
        return Err(SwapError::ShortRead);
    }
    Ok(())
}

/// Write exactly `buf.len()` bytes or fail with [`SwapError::ShortWrite`].
pub fn write_all(dev: &dyn BlockDevice, offset: u64, buf: &[u8]) -> SwapResult<()> {
    let n = dev.write_at(offset, buf)?;
    if n != buf.len() {
        return Err(SwapError::ShortWrite);
    }
    Ok(())
}

// ============================================================================
// RAM Block Device
// ============================================================================

/// Chunk granularity of the sparse RAM store
const CHUNK_SIZE: u64 = 4096;

/// Sparse RAM-backed block device.
///
/// Storage is allocated per 4 KiB chunk on first write; untouched regions
/// read as zero, so large nominal capacities cost nothing until used.
pub struct MemBlockDevice {
    /// Nominal capacity
    size: u64,
    /// Written chunks keyed by chunk index
    chunks: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    /// Create a device of `size` bytes
    pub fn new(size: u64) -> Self {
        Self {
            size,
            chunks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create a device of `sectors` sectors
    pub fn with_sectors(sectors: u64) -> Self {
        Self::new(sectors * SECTOR_SIZE)
    }

    /// Bytes of backing memory currently allocated
    pub fn resident_bytes(&self) -> u64 {
        self.chunks.lock().len() as u64 * CHUNK_SIZE
    }

    fn check_range(&self, offset: u64, len: usize) -> SwapResult<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(SwapError::OutOfRange)?;
        if end > self.size {
            return Err(SwapError::OutOfRange);
        }
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> SwapResult<usize> {
        self.check_range(offset, buf.len())?;
        let chunks = self.chunks.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = pos / CHUNK_SIZE;
            let within = (pos % CHUNK_SIZE) as usize;
            let take = core::cmp::min(CHUNK_SIZE as usize - within, buf.len() - done);
            match chunks.get(&index) {
                Some(chunk) => buf[done..done + take].copy_from_slice(&chunk[within..within + take]),
                None => buf[done..done + take].fill(0),
            }
            done += take;
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> SwapResult<usize> {
        self.check_range(offset, buf.len())?;
        let mut chunks = self.chunks.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = pos / CHUNK_SIZE;
            let within = (pos % CHUNK_SIZE) as usize;
            let take = core::cmp::min(CHUNK_SIZE as usize - within, buf.len() - done);
            let chunk = chunks
                .entry(index)
                .or_insert_with(|| vec![0u8; CHUNK_SIZE as usize]);
            chunk[within..within + take].copy_from_slice(&buf[done..done + take]);
            done += take;
        }
        Ok(done)
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }
}

impl fmt::Debug for MemBlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlockDevice")
            .field("size", &self.size)
            .field("resident_bytes", &self.resident_bytes())
            .finish()
    }
}
