//! Device pool manager.
//!
//! Tracks the backing devices of a swap space, their sector ranges,
//! priorities and activation state, and allocates page extents from them.
//!
//! Allocation picks the active device with the highest priority that has a
//! free run long enough, breaking ties by most free space. Within a device
//! the free map is first-fit with coalescing on release.
//!
//! Every allocated extent is reference counted. The live metadata entry
//! holds one reference, each snapshot holding the entry holds another, and
//! in-flight reads pin one more, so sectors only return to the free map
//! once nothing can still reach them. Retired extents (quarantined data)
//! never return to the free map.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::checksum::Crc32c;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{SwapError, SwapResult};

/// Stable device identifier (CRC32C of the device name).
pub type DeviceId = u32;

/// Derive the id of a device name
#[inline]
pub fn device_id(name: &str) -> DeviceId {
    Crc32c::hash(name.as_bytes())
}

/// Location of one stored page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extent {
    /// Owning device
    pub device: DeviceId,
    /// First sector (absolute on the device)
    pub start_sector: u64,
    /// Length in sectors
    pub sectors: u32,
}

impl Extent {
    /// Byte offset on the device
    #[inline]
    pub fn byte_offset(&self) -> u64 {
        self.start_sector * SECTOR_SIZE
    }

    /// Length in bytes
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.sectors as usize * SECTOR_SIZE as usize
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{}+{}", self.device, self.start_sector, self.sectors)
    }
}

#[derive(Clone, Copy, Debug)]
struct ExtentRef {
    sectors: u64,
    refs: u32,
    retired: bool,
}

// ============================================================================
// Device
// ============================================================================

/// A backing store in the pool.
pub struct Device {
    /// Device name
    name: String,
    /// Stable id
    id: DeviceId,
    /// Opaque I/O handle
    handle: Arc<dyn BlockDevice>,
    /// First sector of the swap range
    start_sector: u64,
    /// Sectors in the swap range
    total_sectors: u64,
    /// Sectors not referenced by any extent
    free_sectors: u64,
    /// Allocation priority (higher first)
    priority: i32,
    /// Eligible for new allocations
    active: bool,
    /// Free runs: start -> length
    free_map: BTreeMap<u64, u64>,
    /// Allocated extents: start -> reference
    refs: BTreeMap<u64, ExtentRef>,
    /// Extents with in-flight I/O
    io_refs: u32,
    /// Sectors permanently withdrawn after integrity failures
    retired_sectors: u64,
}

impl Device {
    fn new(
        name: String,
        handle: Arc<dyn BlockDevice>,
        start_sector: u64,
        total_sectors: u64,
        priority: i32,
    ) -> Self {
        let mut free_map = BTreeMap::new();
        free_map.insert(start_sector, total_sectors);
        Self {
            id: device_id(&name),
            name,
            handle,
            start_sector,
            total_sectors,
            free_sectors: total_sectors,
            priority,
            active: true,
            free_map,
            refs: BTreeMap::new(),
            io_refs: 0,
            retired_sectors: 0,
        }
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device id
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Free sectors
    pub fn free_sectors(&self) -> u64 {
        self.free_sectors
    }

    /// Whether any extent has I/O in flight
    pub fn has_io(&self) -> bool {
        self.io_refs > 0
    }

    /// Longest free run
    pub fn largest_free_run(&self) -> u64 {
        self.free_map.values().copied().max().unwrap_or(0)
    }

    fn take_range(&mut self, sectors: u64) -> Option<u64> {
        let (&start, &len) = self.free_map.iter().find(|(_, len)| **len >= sectors)?;
        self.free_map.remove(&start);
        if len > sectors {
            self.free_map.insert(start + sectors, len - sectors);
        }
        self.free_sectors -= sectors;
        Some(start)
    }

    fn carve_exact(&mut self, start: u64, sectors: u64) -> bool {
        let Some((&run_start, &run_len)) = self.free_map.range(..=start).next_back() else {
            return false;
        };
        if run_start + run_len < start + sectors {
            return false;
        }
        self.free_map.remove(&run_start);
        if start > run_start {
            self.free_map.insert(run_start, start - run_start);
        }
        let tail = run_start + run_len - (start + sectors);
        if tail > 0 {
            self.free_map.insert(start + sectors, tail);
        }
        self.free_sectors -= sectors;
        true
    }

    fn release_range(&mut self, mut start: u64, mut len: u64) {
        self.free_sectors += len;
        if let Some((&prev_start, &prev_len)) = self.free_map.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free_map.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_map.remove(&(start + len)) {
            len += next_len;
        }
        self.free_map.insert(start, len);
    }

    fn reset(&mut self) {
        self.free_map.clear();
        self.free_map.insert(self.start_sector, self.total_sectors);
        self.refs.clear();
        self.free_sectors = self.total_sectors;
        self.io_refs = 0;
        self.retired_sectors = 0;
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            id: self.id,
            start_sector: self.start_sector,
            total_sectors: self.total_sectors,
            free_sectors: self.free_sectors,
            priority: self.priority,
            active: self.active,
            extents: self.refs.len(),
            retired_sectors: self.retired_sectors,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("start_sector", &self.start_sector)
            .field("total_sectors", &self.total_sectors)
            .field("free_sectors", &self.free_sectors)
            .field("priority", &self.priority)
            .field("active", &self.active)
            .finish()
    }
}

/// Read-only view of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Stable id
    pub id: DeviceId,
    /// First sector of the swap range
    pub start_sector: u64,
    /// Sectors in the swap range
    pub total_sectors: u64,
    /// Free sectors
    pub free_sectors: u64,
    /// Allocation priority
    pub priority: i32,
    /// Eligible for allocation
    pub active: bool,
    /// Allocated extents
    pub extents: usize,
    /// Retired sectors
    pub retired_sectors: u64,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} id {:08x} prio {:>4} {} sectors {}+{} free {} extents {} retired {}",
            self.name,
            self.id,
            self.priority,
            if self.active { "active  " } else { "inactive" },
            self.start_sector,
            self.total_sectors,
            self.free_sectors,
            self.extents,
            self.retired_sectors
        )
    }
}

// ============================================================================
// Device Pool
// ============================================================================

/// The set of backing devices of one swap space.
#[derive(Debug)]
pub struct DevicePool {
    devices: Vec<Device>,
    max_devices: usize,
}

impl DevicePool {
    /// Create an empty pool
    pub fn new(max_devices: usize) -> Self {
        Self {
            devices: Vec::new(),
            max_devices,
        }
    }

    /// Change the device limit (existing devices are kept)
    pub fn set_max_devices(&mut self, max_devices: usize) {
        self.max_devices = max_devices;
    }

    /// Register a device; it starts active.
    pub fn add(
        &mut self,
        name: &str,
        handle: Arc<dyn BlockDevice>,
        start_sector: u64,
        sector_count: u64,
        priority: i32,
    ) -> SwapResult<DeviceId> {
        if name.is_empty() || sector_count == 0 {
            return Err(SwapError::InvalidArgument);
        }
        let id = device_id(name);
        if self.devices.iter().any(|d| d.name == name || d.id == id) {
            return Err(SwapError::AlreadyExists);
        }
        let end = start_sector
            .checked_add(sector_count)
            .and_then(|s| s.checked_mul(SECTOR_SIZE))
            .ok_or(SwapError::OutOfRange)?;
        if end > handle.size_bytes() {
            return Err(SwapError::OutOfRange);
        }
        if self.devices.len() >= self.max_devices {
            return Err(SwapError::TooManyDevices);
        }
        self.devices.push(Device::new(
            String::from(name),
            handle,
            start_sector,
            sector_count,
            priority,
        ));
        Ok(id)
    }

    /// Detach a device, returning it
    pub fn remove(&mut self, id: DeviceId) -> SwapResult<Device> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.id == id)
            .ok_or(SwapError::DeviceNotFound)?;
        Ok(self.devices.remove(pos))
    }

    /// Resolve a name
    pub fn id_of(&self, name: &str) -> SwapResult<DeviceId> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.id)
            .ok_or(SwapError::DeviceNotFound)
    }

    /// Look up a device
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn get_mut(&mut self, id: DeviceId) -> SwapResult<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(SwapError::DeviceMissing)
    }

    /// Whether a device is attached
    pub fn contains(&self, id: DeviceId) -> bool {
        self.get(id).is_some()
    }

    /// I/O handle of a device
    pub fn handle(&self, id: DeviceId) -> SwapResult<Arc<dyn BlockDevice>> {
        self.get(id)
            .map(|d| Arc::clone(&d.handle))
            .ok_or(SwapError::DeviceMissing)
    }

    /// Toggle eligibility for new allocations
    pub fn set_active(&mut self, id: DeviceId, active: bool) -> SwapResult<()> {
        let dev = self.get_mut(id).map_err(|_| SwapError::DeviceNotFound)?;
        dev.active = active;
        Ok(())
    }

    /// Change allocation priority
    pub fn set_priority(&mut self, id: DeviceId, priority: i32) -> SwapResult<()> {
        let dev = self.get_mut(id).map_err(|_| SwapError::DeviceNotFound)?;
        dev.priority = priority;
        Ok(())
    }

    /// Number of attached devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of active devices
    pub fn active_count(&self) -> usize {
        self.devices.iter().filter(|d| d.active).count()
    }

    /// Free sectors across active devices
    pub fn active_free_sectors(&self) -> u64 {
        self.devices
            .iter()
            .filter(|d| d.active)
            .map(|d| d.free_sectors)
            .sum()
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    fn pick(&mut self, sectors: u64, exclude: Option<DeviceId>) -> Option<Extent> {
        let mut order: Vec<usize> = (0..self.devices.len())
            .filter(|&i| {
                let d = &self.devices[i];
                d.active && Some(d.id) != exclude && d.free_sectors >= sectors
            })
            .collect();
        order.sort_by(|&a, &b| {
            let (da, db) = (&self.devices[a], &self.devices[b]);
            db.priority
                .cmp(&da.priority)
                .then(db.free_sectors.cmp(&da.free_sectors))
        });
        for i in order {
            let dev = &mut self.devices[i];
            if let Some(start) = dev.take_range(sectors) {
                dev.refs.insert(
                    start,
                    ExtentRef {
                        sectors,
                        refs: 1,
                        retired: false,
                    },
                );
                return Some(Extent {
                    device: dev.id,
                    start_sector: start,
                    sectors: sectors as u32,
                });
            }
        }
        None
    }

    /// Allocate an extent holding one reference
    pub fn allocate(&mut self, sectors: u64) -> SwapResult<Extent> {
        if sectors == 0 || sectors > u32::MAX as u64 {
            return Err(SwapError::InvalidArgument);
        }
        self.pick(sectors, None).ok_or(SwapError::NoSpace)
    }

    /// Allocate on any active device except `exclude`
    pub fn allocate_excluding(&mut self, exclude: DeviceId, sectors: u64) -> SwapResult<Extent> {
        if sectors == 0 || sectors > u32::MAX as u64 {
            return Err(SwapError::InvalidArgument);
        }
        self.pick(sectors, Some(exclude)).ok_or(SwapError::DeviceFull)
    }

    /// Claim an exact extent during recovery
    pub fn reserve_exact(&mut self, extent: Extent) -> SwapResult<()> {
        let dev = self.get_mut(extent.device)?;
        let sectors = extent.sectors as u64;
        if let Some(r) = dev.refs.get_mut(&extent.start_sector) {
            if r.sectors != sectors {
                return Err(SwapError::CheckpointCorrupt);
            }
            r.refs += 1;
            return Ok(());
        }
        if !dev.carve_exact(extent.start_sector, sectors) {
            return Err(SwapError::CheckpointCorrupt);
        }
        dev.refs.insert(
            extent.start_sector,
            ExtentRef {
                sectors,
                refs: 1,
                retired: false,
            },
        );
        Ok(())
    }

    /// Add a reference to an allocated extent
    pub fn pin(&mut self, extent: Extent) -> SwapResult<()> {
        let dev = self.get_mut(extent.device)?;
        let r = dev
            .refs
            .get_mut(&extent.start_sector)
            .ok_or(SwapError::Internal)?;
        r.refs += 1;
        Ok(())
    }

    /// Drop a reference; the last one releases or retires the sectors
    pub fn unpin(&mut self, extent: Extent) -> SwapResult<()> {
        let dev = self.get_mut(extent.device)?;
        let r = dev
            .refs
            .get_mut(&extent.start_sector)
            .ok_or(SwapError::Internal)?;
        r.refs = r.refs.checked_sub(1).ok_or(SwapError::Internal)?;
        if r.refs == 0 {
            let r = *r;
            dev.refs.remove(&extent.start_sector);
            if r.retired {
                dev.retired_sectors += r.sectors;
            } else {
                dev.release_range(extent.start_sector, r.sectors);
            }
        }
        Ok(())
    }

    /// Mark an extent as bad and drop one reference
    pub fn retire(&mut self, extent: Extent) -> SwapResult<()> {
        {
            let dev = self.get_mut(extent.device)?;
            let r = dev
                .refs
                .get_mut(&extent.start_sector)
                .ok_or(SwapError::Internal)?;
            r.retired = true;
        }
        self.unpin(extent)
    }

    /// Withdraw a previously retired extent during recovery.
    ///
    /// A free range is removed from the free map and counted as retired at
    /// once. A range still referenced is flagged and retires with its last
    /// reference.
    pub fn withdraw(&mut self, extent: Extent) -> SwapResult<()> {
        let dev = self.get_mut(extent.device)?;
        let sectors = extent.sectors as u64;
        if let Some(r) = dev.refs.get_mut(&extent.start_sector) {
            if r.sectors != sectors {
                return Err(SwapError::CheckpointCorrupt);
            }
            r.retired = true;
            return Ok(());
        }
        if !dev.carve_exact(extent.start_sector, sectors) {
            return Err(SwapError::CheckpointCorrupt);
        }
        dev.retired_sectors += sectors;
        Ok(())
    }

    /// Pin an extent for an in-flight transfer
    pub fn begin_io(&mut self, extent: Extent) -> SwapResult<()> {
        self.pin(extent)?;
        self.get_mut(extent.device)?.io_refs += 1;
        Ok(())
    }

    /// Release an in-flight transfer pin
    pub fn end_io(&mut self, extent: Extent) -> SwapResult<()> {
        let dev = self.get_mut(extent.device)?;
        dev.io_refs = dev.io_refs.checked_sub(1).ok_or(SwapError::Internal)?;
        self.unpin(extent)
    }

    /// Forget all allocations (recovery rebuilds them)
    pub fn reset_allocation(&mut self) {
        for dev in &mut self.devices {
            dev.reset();
        }
    }

    /// Views of every device, in registration order
    pub fn infos(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(Device::info).collect()
    }

    /// View of one device
    pub fn info(&self, id: DeviceId) -> Option<DeviceInfo> {
        self.get(id).map(Device::info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn ram(sectors: u64) -> Arc<dyn BlockDevice> {
        Arc::new(MemBlockDevice::with_sectors(sectors))
    }

    #[test]
    fn test_add_validation() {
        let mut pool = DevicePool::new(2);
        pool.add("a", ram(100), 0, 100, 0).unwrap();
        assert_eq!(pool.add("a", ram(100), 0, 100, 0), Err(SwapError::AlreadyExists));
        assert_eq!(pool.add("b", ram(100), 50, 51, 0), Err(SwapError::OutOfRange));
        assert_eq!(pool.add("b", ram(100), 0, 0, 0), Err(SwapError::InvalidArgument));
        pool.add("b", ram(100), 0, 100, 0).unwrap();
        assert_eq!(pool.add("c", ram(100), 0, 100, 0), Err(SwapError::TooManyDevices));
        assert_eq!(pool.id_of("b"), Ok(device_id("b")));
        assert_eq!(pool.id_of("zz"), Err(SwapError::DeviceNotFound));
    }

    #[test]
    fn test_priority_then_fallback() {
        let mut pool = DevicePool::new(8);
        let low = pool.add("low", ram(100), 0, 100, 1).unwrap();
        let high = pool.add("high", ram(100), 0, 20, 10).unwrap();
        for _ in 0..2 {
            assert_eq!(pool.allocate(9).unwrap().device, high);
        }
        // two free sectors left on high
        assert_eq!(pool.allocate(9).unwrap().device, low);
        assert_eq!(pool.allocate(2).unwrap().device, high);
    }

    #[test]
    fn test_tie_breaks_on_free_space() {
        let mut pool = DevicePool::new(8);
        let a = pool.add("a", ram(100), 0, 50, 5).unwrap();
        let b = pool.add("b", ram(100), 0, 60, 5).unwrap();
        assert_eq!(pool.allocate(15).unwrap().device, b);
        assert_eq!(pool.allocate(15).unwrap().device, a);
    }

    #[test]
    fn test_inactive_devices_are_skipped() {
        let mut pool = DevicePool::new(8);
        let a = pool.add("a", ram(100), 0, 100, 5).unwrap();
        pool.set_active(a, false).unwrap();
        assert_eq!(pool.allocate(1), Err(SwapError::NoSpace));
        pool.set_active(a, true).unwrap();
        assert!(pool.allocate(1).is_ok());
    }

    #[test]
    fn test_release_coalesces() {
        let mut pool = DevicePool::new(8);
        let id = pool.add("a", ram(64), 0, 64, 0).unwrap();
        let x = pool.allocate(16).unwrap();
        let y = pool.allocate(16).unwrap();
        let z = pool.allocate(32).unwrap();
        assert_eq!(pool.allocate(1), Err(SwapError::NoSpace));
        pool.unpin(x).unwrap();
        pool.unpin(z).unwrap();
        pool.unpin(y).unwrap();
        let dev = pool.get(id).unwrap();
        assert_eq!(dev.free_sectors(), 64);
        assert_eq!(dev.largest_free_run(), 64);
    }

    #[test]
    fn test_refcounted_release_and_retire() {
        let mut pool = DevicePool::new(8);
        let id = pool.add("a", ram(64), 0, 64, 0).unwrap();
        let e = pool.allocate(8).unwrap();
        pool.pin(e).unwrap();
        pool.unpin(e).unwrap();
        assert_eq!(pool.get(id).unwrap().free_sectors(), 56);
        pool.pin(e).unwrap();
        pool.retire(e).unwrap();
        pool.unpin(e).unwrap();
        let info = pool.info(id).unwrap();
        assert_eq!(info.free_sectors, 56);
        assert_eq!(info.retired_sectors, 8);
        assert_eq!(pool.unpin(e), Err(SwapError::Internal));
    }

    #[test]
    fn test_reserve_exact_rebuilds_allocation() {
        let mut pool = DevicePool::new(8);
        let id = pool.add("a", ram(64), 0, 64, 0).unwrap();
        let e = Extent {
            device: id,
            start_sector: 10,
            sectors: 9,
        };
        pool.reserve_exact(e).unwrap();
        assert_eq!(pool.get(id).unwrap().free_sectors(), 55);
        let overlapping = Extent {
            device: id,
            start_sector: 12,
            sectors: 4,
        };
        assert_eq!(pool.reserve_exact(overlapping), Err(SwapError::CheckpointCorrupt));
        let missing = Extent {
            device: 7,
            start_sector: 0,
            sectors: 1,
        };
        assert_eq!(pool.reserve_exact(missing), Err(SwapError::DeviceMissing));
        pool.reset_allocation();
        assert_eq!(pool.get(id).unwrap().free_sectors(), 64);
    }

    #[test]
    fn test_withdraw_keeps_bad_sectors_out() {
        let mut pool = DevicePool::new(8);
        let id = pool.add("a", ram(18), 0, 18, 0).unwrap();
        let bad = Extent {
            device: id,
            start_sector: 0,
            sectors: 9,
        };
        pool.withdraw(bad).unwrap();
        let info = pool.info(id).unwrap();
        assert_eq!((info.free_sectors, info.retired_sectors, info.extents), (9, 9, 0));
        assert_eq!(pool.allocate(9).unwrap().start_sector, 9);
        assert_eq!(pool.allocate(1), Err(SwapError::NoSpace));

        // still referenced: retires with the last reference
        pool.reset_allocation();
        pool.reserve_exact(bad).unwrap();
        pool.withdraw(bad).unwrap();
        assert_eq!(pool.info(id).unwrap().retired_sectors, 0);
        pool.unpin(bad).unwrap();
        let info = pool.info(id).unwrap();
        assert_eq!((info.free_sectors, info.retired_sectors), (9, 9));

        let missing = Extent { device: 7, ..bad };
        assert_eq!(pool.withdraw(missing), Err(SwapError::DeviceMissing));
    }

    #[test]
    fn test_io_pins() {
        let mut pool = DevicePool::new(8);
        let id = pool.add("a", ram(64), 0, 64, 0).unwrap();
        let e = pool.allocate(4).unwrap();
        pool.begin_io(e).unwrap();
        assert!(pool.get(id).unwrap().has_io());
        pool.unpin(e).unwrap();
        assert_eq!(pool.get(id).unwrap().free_sectors(), 60);
        pool.end_io(e).unwrap();
        assert!(!pool.get(id).unwrap().has_io());
        assert_eq!(pool.get(id).unwrap().free_sectors(), 64);
    }

    #[test]
    fn test_allocate_excluding() {
        let mut pool = DevicePool::new(8);
        let a = pool.add("a", ram(64), 0, 64, 9).unwrap();
        let b = pool.add("b", ram(64), 0, 8, 1).unwrap();
        assert_eq!(pool.allocate_excluding(a, 8).unwrap().device, b);
        assert_eq!(pool.allocate_excluding(a, 1), Err(SwapError::DeviceFull));
    }
}
