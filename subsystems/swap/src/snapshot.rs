//! Point-in-time snapshots of a swap space.
//!
//! A snapshot captures the superblock, every metadata entry and the device
//! pool layout, and holds a reference on every extent it names. Pinned
//! extents are never reallocated, so restoring a snapshot brings back the
//! exact page contents it saw even after those pages were freed or
//! rewritten. Snapshots live in memory for the lifetime of the mount.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use crate::error::{SwapError, SwapResult};
use crate::index::{MetadataEntry, PageKey};
use crate::pool::{DeviceId, DeviceInfo, DevicePool};
use crate::space::SwapSpace;
use crate::superblock::Superblock;

/// A captured view of the space.
#[derive(Clone, Debug)]
pub struct Snapshot {
    name: String,
    created_at: u64,
    superblock: Superblock,
    entries: Vec<MetadataEntry>,
    quarantined: Vec<MetadataEntry>,
    devices: Vec<DeviceInfo>,
}

impl Snapshot {
    /// Snapshot name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether any captured extent lives on `device`
    pub(crate) fn references(&self, device: DeviceId) -> bool {
        self.all_entries().any(|e| e.location.device == device)
    }

    fn all_entries(&self) -> impl Iterator<Item = &MetadataEntry> {
        self.entries.iter().chain(self.quarantined.iter())
    }

    /// Drop the snapshot's extent references
    pub(crate) fn release(&self, pool: &mut DevicePool) -> SwapResult<()> {
        for e in self.all_entries() {
            pool.unpin(e.location)?;
        }
        Ok(())
    }

    /// Summary of the snapshot
    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            name: self.name.clone(),
            created_at: self.created_at,
            entries: self.entries.len(),
            quarantined: self.quarantined.len(),
            used_pages: self.superblock.used_pages,
            devices: self.devices.len(),
        }
    }
}

/// Summary returned by [`SwapSpace::snapshot_list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Snapshot name
    pub name: String,
    /// Platform time of capture
    pub created_at: u64,
    /// Live entries captured
    pub entries: usize,
    /// Quarantined entries captured
    pub quarantined: usize,
    /// Superblock used-page count at capture
    pub used_pages: u64,
    /// Devices attached at capture
    pub devices: usize,
}

impl fmt::Display for SnapshotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} at {:<12} {} entries ({} quarantined) {} used pages on {} devices",
            self.name, self.created_at, self.entries, self.quarantined, self.used_pages, self.devices
        )
    }
}

impl SwapSpace {
    /// Capture the current state under `name`
    pub fn snapshot_create(&self, name: &str) -> SwapResult<SnapshotInfo> {
        if name.is_empty() {
            return Err(SwapError::InvalidArgument);
        }
        let mut st = self.state.lock();
        st.ensure_online()?;
        if st.snapshots.contains_key(name) {
            return Err(SwapError::SnapshotExists);
        }
        let snapshot = Snapshot {
            name: String::from(name),
            created_at: self.platform.now_ns(),
            superblock: st.superblock.clone(),
            entries: st.index.sorted(),
            quarantined: st.quarantine.values().copied().collect(),
            devices: st.pool.infos(),
        };
        for e in snapshot.all_entries() {
            st.pool.pin(e.location)?;
        }
        let info = snapshot.info();
        st.snapshots.insert(String::from(name), snapshot);
        log::info!("swap: snapshot {} created ({} entries)", name, info.entries);
        Ok(info)
    }

    /// Make the named snapshot the live state.
    ///
    /// Pages stored after the snapshot are discarded; pages freed after it
    /// come back. The snapshot itself is kept and can be restored again.
    pub fn snapshot_restore(&self, name: &str) -> SwapResult<()> {
        let mut st = self.state.lock();
        st.ensure_online()?;
        let snap = st
            .snapshots
            .get(name)
            .cloned()
            .ok_or(SwapError::SnapshotNotFound)?;
        if !st.is_idle() {
            return Err(SwapError::DeviceBusy);
        }

        for e in snap.all_entries() {
            st.pool.pin(e.location)?;
        }
        for e in st.index.sorted() {
            st.pool.unpin(e.location)?;
        }
        let bad: Vec<MetadataEntry> = st.quarantine.values().copied().collect();
        for q in &bad {
            st.retire(q)?;
        }

        st.index.clear();
        for e in &snap.entries {
            st.index.insert(*e)?;
        }
        st.quarantine = snap.quarantined.iter().map(|q| (q.key, *q)).collect();
        let used = (snap.entries.len() + snap.quarantined.len()) as u64;
        st.superblock.set_used(used)?;

        for dev in &snap.devices {
            if st.pool.contains(dev.id) {
                st.pool.set_active(dev.id, dev.active)?;
                st.pool.set_priority(dev.id, dev.priority)?;
            }
        }
        self.stats.active_devices.store(st.pool.active_count() as u64);

        self.checkpoint_locked(&mut st)?;
        let staged = st.stage_superblock();
        self.write_superblock(staged)?;
        log::info!(
            "swap: restored snapshot {} ({} entries, {} used pages)",
            name,
            snap.entries.len(),
            used
        );
        Ok(())
    }

    /// All snapshots, sorted by name
    pub fn snapshot_list(&self) -> Vec<SnapshotInfo> {
        self.state.lock().snapshots.values().map(Snapshot::info).collect()
    }

    /// Drop a snapshot and its extent references
    pub fn snapshot_delete(&self, name: &str) -> SwapResult<()> {
        let mut st = self.state.lock();
        let snap = st.snapshots.remove(name).ok_or(SwapError::SnapshotNotFound)?;
        snap.release(&mut st.pool)?;
        log::info!("swap: snapshot {} deleted", name);
        Ok(())
    }

    /// Keys captured by a snapshot
    pub fn snapshot_keys(&self, name: &str) -> SwapResult<Vec<PageKey>> {
        let st = self.state.lock();
        let snap = st.snapshots.get(name).ok_or(SwapError::SnapshotNotFound)?;
        Ok(snap.entries.iter().map(|e| e.key).collect())
    }

    /// Render every snapshot
    pub fn dump_snapshots(&self) -> String {
        let mut out = String::new();
        for info in self.snapshot_list() {
            let _ = writeln!(out, "{}", info);
        }
        out
    }
}
