//! Test doubles shared by the unit tests.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::codec::{Codec, CompressionAlg};
use crate::device::{BlockDevice, MemBlockDevice, SECTOR_SIZE};
use crate::error::{SwapError, SwapResult};
use crate::header::PAGE_HEADER_SIZE;
use crate::index::MetadataEntry;
use crate::platform::{MemoryManager, PageVisitor, Platform};
use crate::space::{FormatOptions, SwapSpace};

/// Page size used throughout the tests
pub(crate) const TEST_PAGE: usize = 4096;

/// Sectors taken by one uncompressed test page
pub(crate) const PAGE_SECTORS: u64 = 9;

// ============================================================================
// Platform
// ============================================================================

/// Deterministic clock and xorshift entropy.
pub(crate) struct TestPlatform {
    clock: AtomicU64,
    seed: AtomicU64,
}

impl TestPlatform {
    pub(crate) fn new() -> Self {
        Self {
            clock: AtomicU64::new(1_000_000),
            seed: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        }
    }
}

impl Platform for TestPlatform {
    fn now_ns(&self) -> u64 {
        self.clock.fetch_add(1_000, Ordering::Relaxed) + 1_000
    }

    fn fill_random(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let mut x = self.seed.load(Ordering::Relaxed);
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.seed.store(x, Ordering::Relaxed);
            chunk.copy_from_slice(&x.to_le_bytes()[..chunk.len()]);
        }
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Run-length codec registered as LZ4: `(count, byte)` pairs.
pub(crate) struct RleCodec;

impl Codec for RleCodec {
    fn alg(&self) -> CompressionAlg {
        CompressionAlg::Lz4
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> SwapResult<()> {
        let mut i = 0;
        while i < input.len() {
            let byte = input[i];
            let mut run = 1;
            while i + run < input.len() && input[i + run] == byte && run < 255 {
                run += 1;
            }
            out.push(run as u8);
            out.push(byte);
            i += run;
        }
        Ok(())
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>, _expected: usize) -> SwapResult<()> {
        if input.len() % 2 != 0 {
            return Err(SwapError::DecompressionFailed);
        }
        for pair in input.chunks_exact(2) {
            if pair[0] == 0 {
                return Err(SwapError::DecompressionFailed);
            }
            out.extend(core::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        Ok(())
    }
}

/// Misbehaving codec registered as Zstd: output is one byte longer.
pub(crate) struct ExpandingCodec;

impl Codec for ExpandingCodec {
    fn alg(&self) -> CompressionAlg {
        CompressionAlg::Zstd
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> SwapResult<()> {
        out.extend_from_slice(input);
        out.push(0);
        Ok(())
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>, _expected: usize) -> SwapResult<()> {
        let body = input.split_last().map(|(_, b)| b).unwrap_or(&[]);
        out.extend_from_slice(body);
        Ok(())
    }
}

// ============================================================================
// Devices
// ============================================================================

/// RAM device whose reads and writes can be made to fail.
pub(crate) struct FailingDevice {
    inner: MemBlockDevice,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_writes_from: AtomicU64,
}

impl FailingDevice {
    pub(crate) fn new(sectors: u64) -> Self {
        Self {
            inner: MemBlockDevice::with_sectors(sectors),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_writes_from: AtomicU64::new(u64::MAX),
        }
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail writes starting at or beyond byte `offset`
    pub(crate) fn fail_writes_from(&self, offset: u64) {
        self.fail_writes_from.store(offset, Ordering::SeqCst);
    }
}

impl BlockDevice for FailingDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> SwapResult<usize> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SwapError::DeviceIo);
        }
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> SwapResult<usize> {
        if self.fail_writes.load(Ordering::SeqCst)
            || offset >= self.fail_writes_from.load(Ordering::SeqCst)
        {
            return Err(SwapError::DeviceIo);
        }
        self.inner.write_at(offset, buf)
    }

    fn size_bytes(&self) -> u64 {
        self.inner.size_bytes()
    }
}

/// A standalone data device of `sectors` sectors
pub(crate) fn data_device(sectors: u64) -> Arc<dyn BlockDevice> {
    Arc::new(MemBlockDevice::with_sectors(sectors))
}

/// Flip one payload byte of a stored page
pub(crate) fn corrupt_payload(dev: &dyn BlockDevice, entry: &MetadataEntry) {
    let at = entry.location.byte_offset() + PAGE_HEADER_SIZE as u64 + 17;
    let mut b = [0u8; 1];
    dev.read_at(at, &mut b).unwrap();
    b[0] ^= 0xA5;
    dev.write_at(at, &b).unwrap();
}

// ============================================================================
// Spaces
// ============================================================================

/// A test page filled with `seed`-derived bytes
pub(crate) fn page(seed: u8) -> Vec<u8> {
    (0..TEST_PAGE)
        .map(|i| seed.wrapping_add((i / 64) as u8))
        .collect()
}

/// Small reservations: 4 journal pages, 8 metadata pages
pub(crate) fn test_format(total_pages: u64) -> FormatOptions {
    FormatOptions::new(total_pages, TEST_PAGE as u32).reserved_pages(4, 8)
}

/// Format a primary device sized for `total_pages` of data and mount it.
///
/// No data device is attached and the space is not started.
pub(crate) fn format_and_mount(
    total_pages: u64,
    platform: &Arc<TestPlatform>,
) -> (SwapSpace, Arc<MemBlockDevice>) {
    let options = test_format(total_pages);
    let reserved = (crate::superblock::SUPERBLOCK_SIZE as u64
        + (options.journal_pages + options.metadata_pages) * TEST_PAGE as u64)
        / SECTOR_SIZE;
    let sectors = reserved + total_pages * PAGE_SECTORS + 64;
    let primary = Arc::new(MemBlockDevice::with_sectors(sectors));
    let dyn_primary: Arc<dyn BlockDevice> = primary.clone();
    SwapSpace::format(&dyn_primary, platform.as_ref(), &options).unwrap();
    let space = SwapSpace::mount(dyn_primary, platform.clone()).unwrap();
    (space, primary)
}

/// A started space whose data region follows the reserved area on the
/// primary device, registered as device `primary`.
pub(crate) fn started_space(total_pages: u64) -> (SwapSpace, Arc<MemBlockDevice>) {
    let platform = Arc::new(TestPlatform::new());
    let (space, primary) = format_and_mount(total_pages, &platform);
    let start = space.superblock().data_start_sector();
    let sectors = primary.size_bytes() / SECTOR_SIZE - start;
    space
        .add_device("primary", primary.clone(), start, sectors, 0)
        .unwrap();
    space.start().unwrap();
    (space, primary)
}

// ============================================================================
// Memory Manager
// ============================================================================

/// Resident memory of a pretend machine.
pub(crate) struct TestMemory {
    pages: Mutex<BTreeMap<(u64, u32), Vec<u8>>>,
    restored: Mutex<BTreeMap<(u64, u32), Vec<u8>>>,
    restore_budget: AtomicUsize,
}

impl TestMemory {
    /// `count` distinct resident pages of process `pid`
    pub(crate) fn with_pages(count: u64, pid: u32) -> Self {
        let pages = (0..count)
            .map(|i| ((0x10_0000 + i * TEST_PAGE as u64, pid), page(i as u8)))
            .collect();
        Self {
            pages: Mutex::new(pages),
            restored: Mutex::new(BTreeMap::new()),
            restore_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Fail every restore after the next `n`
    pub(crate) fn fail_restores_after(&self, n: usize) {
        self.restore_budget.store(n, Ordering::SeqCst);
    }

    /// Drop resident memory (power off)
    pub(crate) fn power_off(&self) {
        self.pages.lock().clear();
    }

    pub(crate) fn restored(&self) -> BTreeMap<(u64, u32), Vec<u8>> {
        self.restored.lock().clone()
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<(u64, u32), Vec<u8>> {
        self.pages.lock().clone()
    }
}

impl MemoryManager for TestMemory {
    fn resident_page_count(&self) -> u64 {
        self.pages.lock().len() as u64
    }

    fn for_each_resident_page(&self, visit: &mut PageVisitor<'_>) -> SwapResult<()> {
        let pages = self.pages.lock().clone();
        for ((address, pid), data) in &pages {
            visit(*address, *pid, data)?;
        }
        Ok(())
    }

    fn restore_page(&self, address: u64, pid: u32, data: &[u8]) -> SwapResult<()> {
        let left = self.restore_budget.load(Ordering::SeqCst);
        if left == 0 {
            return Err(SwapError::Internal);
        }
        if left != usize::MAX {
            self.restore_budget.store(left - 1, Ordering::SeqCst);
        }
        self.restored.lock().insert((address, pid), data.to_vec());
        Ok(())
    }
}
