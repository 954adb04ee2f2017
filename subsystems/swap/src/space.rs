//! Swap space handle and page swap engine.
//!
//! A [`SwapSpace`] is an explicitly constructed handle owned by its
//! mounter; any number of independent spaces can coexist.
//!
//! ## Lifecycle
//!
//! ```text
//! format ──► mount ──► add devices ──► start ──► swap traffic ──► unmount
//!            (Mounted)                 (Online)                  (Unmounted)
//! ```
//!
//! `start` loads the metadata checkpoint, replays the journal and rebuilds
//! device allocation. When the superblock carried the dirty marker this is
//! the crash recovery of the previous session. The marker is then set and
//! persisted before the first write and only cleared by `unmount`.
//!
//! ## Locking
//!
//! All shared counters, allocator state and index mutations are serialised
//! by one mutex per space. Compression, checksumming and the sector
//! transfers run outside it once an extent is reserved: a reserved extent
//! is owned by exactly one in-flight operation. Superblock writes are
//! serialised by a second lock and carry a generation so the newest image
//! always wins.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};
use spin::{Mutex, RwLock};

use crate::checksum::ChecksumAlg;
use crate::codec::{Codec, CodecRegistry, CompressionAlg};
use crate::config::SwapConfig;
use crate::device::{read_exact, write_all, BlockDevice, SECTOR_SIZE};
use crate::error::{SwapError, SwapResult};
use crate::header::{build_extent, parse_extent, PageFlags, PageHeader};
use crate::hibernate::HibernationPhase;
use crate::index::{EntryFlags, MetadataEntry, MetadataIndex, PageKey, PageState, PriorityClass};
use crate::journal::{CheckpointRegion, Journal, JournalOp};
use crate::platform::{AccessGate, DeviceOp, Platform};
use crate::pool::{DeviceId, DeviceInfo, DevicePool, Extent};
use crate::snapshot::Snapshot;
use crate::stats::{StatsSnapshot, SwapStats};
use crate::superblock::{Superblock, DEFAULT_JOURNAL_PAGES, DEFAULT_METADATA_PAGES};

// ============================================================================
// Public Types
// ============================================================================

/// Parameters of a new swap space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    /// Logical capacity in pages
    pub total_pages: u64,
    /// Page size in bytes
    pub page_size: u32,
    /// Default compression
    pub compression: CompressionAlg,
    /// Integrity algorithm
    pub checksum: ChecksumAlg,
    /// Journal reservation in pages
    pub journal_pages: u64,
    /// Metadata checkpoint reservation in pages
    pub metadata_pages: u64,
}

impl FormatOptions {
    /// Options with default algorithms and reservations
    pub const fn new(total_pages: u64, page_size: u32) -> Self {
        Self {
            total_pages,
            page_size,
            compression: CompressionAlg::None,
            checksum: ChecksumAlg::Crc32c,
            journal_pages: DEFAULT_JOURNAL_PAGES,
            metadata_pages: DEFAULT_METADATA_PAGES,
        }
    }

    /// Set the default compression
    pub const fn compression(mut self, alg: CompressionAlg) -> Self {
        self.compression = alg;
        self
    }

    /// Set the integrity algorithm
    pub const fn checksum(mut self, alg: ChecksumAlg) -> Self {
        self.checksum = alg;
        self
    }

    /// Override the journal and metadata reservations
    pub const fn reserved_pages(mut self, journal_pages: u64, metadata_pages: u64) -> Self {
        self.journal_pages = journal_pages;
        self.metadata_pages = metadata_pages;
        self
    }
}

/// Lifecycle of a mounted space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Superblock read, devices may be attached, no swap traffic
    Mounted,
    /// Recovered and accepting swap traffic
    Online,
    /// Cleanly shut down
    Unmounted,
}

/// Outcome of [`SwapSpace::start`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Previous session ended without a clean unmount
    pub was_dirty: bool,
    /// Entries found in the checkpoint
    pub checkpoint_entries: usize,
    /// Journal records replayed on top of it
    pub replayed: usize,
    /// Live entries after recovery
    pub recovered: usize,
    /// Quarantined entries after recovery
    pub quarantined: usize,
    /// Pages whose storage could not be reclaimed (device missing or overlap)
    pub lost: Vec<PageKey>,
}

/// Outcome of a successful swap-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapOutReceipt {
    /// Where the page was written
    pub location: Extent,
    /// Stored payload bytes
    pub stored_size: u32,
    /// Algorithm actually applied
    pub compression: CompressionAlg,
    /// A previous copy of the page was replaced
    pub replaced: bool,
}

/// Outcome of [`SwapSpace::remove_device`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Pages moved to other devices
    pub relocated: usize,
    /// Pages dropped because no other device had room
    pub lost: Vec<PageKey>,
}

// ============================================================================
// Shared State
// ============================================================================

/// Everything guarded by the space lock.
pub(crate) struct SpaceState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) superblock: Superblock,
    pub(crate) sb_generation: u64,
    pub(crate) pool: DevicePool,
    pub(crate) index: MetadataIndex,
    pub(crate) quarantine: BTreeMap<PageKey, MetadataEntry>,
    pub(crate) retired: BTreeMap<Extent, MetadataEntry>,
    pub(crate) writing: HashSet<PageKey>,
    pub(crate) reading: HashMap<PageKey, u32>,
    pub(crate) snapshots: BTreeMap<String, Snapshot>,
    pub(crate) journal: Journal,
    pub(crate) checkpoint: CheckpointRegion,
    pub(crate) config: SwapConfig,
    pub(crate) gate: Option<Arc<dyn AccessGate>>,
    pub(crate) hibernation: HibernationPhase,
}

impl SpaceState {
    pub(crate) fn ensure_online(&self) -> SwapResult<()> {
        match self.lifecycle {
            Lifecycle::Online => Ok(()),
            _ => Err(SwapError::NotOnline),
        }
    }

    fn ensure_attached(&self) -> SwapResult<()> {
        match self.lifecycle {
            Lifecycle::Unmounted => Err(SwapError::NotOnline),
            _ => Ok(()),
        }
    }

    fn authorize(&self, name: &str, op: DeviceOp) -> SwapResult<()> {
        match &self.gate {
            Some(gate) if !gate.authorize(name, op) => {
                log::warn!("swap: access gate denied {:?} on {}", op, name);
                Err(SwapError::AccessDenied)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.writing.is_empty() && self.reading.is_empty()
    }

    pub(crate) fn stage_superblock(&mut self) -> (u64, Superblock) {
        self.sb_generation += 1;
        (self.sb_generation, self.superblock.clone())
    }

    fn used_pages(&self) -> u64 {
        (self.index.len() + self.quarantine.len()) as u64
    }

    /// Where `key` stands in the swap state machine
    pub(crate) fn page_state(&self, key: &PageKey) -> PageState {
        if self.writing.contains(key) {
            PageState::SwappingOut
        } else if self.reading.contains_key(key) {
            PageState::SwappingIn
        } else if self.quarantine.contains_key(key) {
            PageState::Quarantined
        } else if self.index.contains(key) {
            PageState::Stored
        } else {
            PageState::Resident
        }
    }

    /// Admit `key` into `next`, refusing with the error callers branch on
    fn admit(&self, key: &PageKey, next: PageState) -> SwapResult<()> {
        let current = self.page_state(key);
        if current.can_transition(next) {
            return Ok(());
        }
        Err(match current {
            PageState::Resident | PageState::Freed => SwapError::NotFound,
            PageState::Quarantined => SwapError::PageQuarantined,
            PageState::SwappingOut | PageState::SwappingIn => SwapError::DeviceBusy,
            PageState::Stored => SwapError::InvalidState,
        })
    }

    /// Withdraw the sectors of a freed quarantined entry for good
    pub(crate) fn retire(&mut self, entry: &MetadataEntry) -> SwapResult<()> {
        self.pool.retire(entry.location)?;
        let mut record = *entry;
        record.flags.insert(EntryFlags::RETIRED);
        self.retired.insert(record.location, record);
        Ok(())
    }
}

/// Decrements the in-flight swap-out count on drop.
struct OutGuard<'a>(&'a AtomicUsize);

impl Drop for OutGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Swap Space
// ============================================================================

/// A mounted swap space.
pub struct SwapSpace {
    primary: Arc<dyn BlockDevice>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) state: Mutex<SpaceState>,
    sb_io: Mutex<u64>,
    codecs: RwLock<CodecRegistry>,
    pub(crate) stats: SwapStats,
    pub(crate) quiesced: AtomicBool,
    pub(crate) outs_in_flight: AtomicUsize,
}

impl SwapSpace {
    // ------------------------------------------------------------------------
    // Format / Mount / Start / Unmount
    // ------------------------------------------------------------------------

    /// Write a new, empty swap space to `primary`.
    ///
    /// Lays down the superblock, an empty metadata checkpoint and the saved
    /// default configuration. Data devices are attached after mounting.
    pub fn format(
        primary: &Arc<dyn BlockDevice>,
        platform: &dyn Platform,
        options: &FormatOptions,
    ) -> SwapResult<Superblock> {
        if options.metadata_pages == 0 {
            return Err(SwapError::InvalidArgument);
        }
        let mut sb = Superblock::create(
            options.total_pages,
            options.page_size,
            options.compression,
            options.checksum,
            platform,
        )?
        .with_reserved_pages(options.journal_pages, options.metadata_pages);
        let reserved_end = sb.reserved_end().map_err(|_| SwapError::InvalidArgument)?;
        if reserved_end > primary.size_bytes() {
            return Err(SwapError::OutOfRange);
        }
        SwapConfig::with_algorithms(options.compression, options.checksum).save_to(&mut sb.reserved);

        let mut checkpoint = CheckpointRegion::new(Arc::clone(primary), &sb);
        checkpoint.write(0, &[])?;
        sb.write(primary.as_ref())?;
        log::info!(
            "swap: formatted {} ({} pages of {} bytes, {} / {})",
            sb.uuid,
            sb.total_pages,
            sb.page_size.bytes(),
            sb.compression,
            sb.checksum_alg
        );
        Ok(sb)
    }

    /// Read the superblock of `primary` and open the space.
    ///
    /// The space accepts device administration but no swap traffic until
    /// [`SwapSpace::start`].
    pub fn mount(primary: Arc<dyn BlockDevice>, platform: Arc<dyn Platform>) -> SwapResult<Self> {
        let sb = Superblock::read(primary.as_ref()).map_err(|e| {
            if e.is_integrity() {
                log::error!("swap: superblock rejected: {}", e);
            } else {
                log::warn!("swap: refusing device: {}", e);
            }
            e
        })?;
        if sb.reserved_end()? > primary.size_bytes() {
            return Err(SwapError::OutOfRange);
        }
        let config = match SwapConfig::load_from(&sb.reserved) {
            Ok(cfg) => cfg,
            Err(SwapError::NotFound) => SwapConfig::with_algorithms(sb.compression, sb.checksum_alg),
            Err(e) => {
                log::warn!("swap: ignoring saved configuration: {}", e);
                SwapConfig::with_algorithms(sb.compression, sb.checksum_alg)
            }
        };
        if sb.is_dirty() {
            log::warn!("swap: {} was not cleanly unmounted, recovery runs on start", sb.uuid);
        }
        log::info!("swap: mounted {} ({} of {} pages used)", sb.uuid, sb.used_pages, sb.total_pages);

        let state = SpaceState {
            lifecycle: Lifecycle::Mounted,
            journal: Journal::new(Arc::clone(&primary), &sb, 1),
            checkpoint: CheckpointRegion::new(Arc::clone(&primary), &sb),
            superblock: sb,
            sb_generation: 0,
            pool: DevicePool::new(config.max_devices as usize),
            index: MetadataIndex::new(),
            quarantine: BTreeMap::new(),
            retired: BTreeMap::new(),
            writing: HashSet::new(),
            reading: HashMap::new(),
            snapshots: BTreeMap::new(),
            config,
            gate: None,
            hibernation: HibernationPhase::Idle,
        };
        Ok(Self {
            primary,
            platform,
            state: Mutex::new(state),
            sb_io: Mutex::new(0),
            codecs: RwLock::new(CodecRegistry::new()),
            stats: SwapStats::new(),
            quiesced: AtomicBool::new(false),
            outs_in_flight: AtomicUsize::new(0),
        })
    }

    /// Recover metadata and go online.
    ///
    /// Loads the newest checkpoint, replays the journal and rebuilds device
    /// allocation, retired sectors and page counters. The dirty marker is
    /// persisted before the fresh checkpoint is written. Entries whose
    /// device is not attached are reported lost.
    pub fn start(&self) -> SwapResult<RecoveryReport> {
        let mut st = self.state.lock();
        match st.lifecycle {
            Lifecycle::Mounted => {}
            Lifecycle::Online => return Err(SwapError::AlreadyOnline),
            Lifecycle::Unmounted => return Err(SwapError::NotOnline),
        }
        let was_dirty = st.superblock.is_dirty();

        let checkpoint = st.checkpoint.load().map_err(|e| {
            log::error!("swap: no valid metadata checkpoint: {}", e);
            e
        })?;
        let records = st.journal.replay(checkpoint.seq)?;

        let mut live: BTreeMap<PageKey, MetadataEntry> = BTreeMap::new();
        let mut bad: BTreeMap<PageKey, MetadataEntry> = BTreeMap::new();
        let mut retired: BTreeMap<Extent, MetadataEntry> = BTreeMap::new();
        for e in &checkpoint.entries {
            if e.flags.contains(EntryFlags::RETIRED) {
                retired.insert(e.location, *e);
            } else if e.flags.contains(EntryFlags::QUARANTINED) {
                bad.insert(e.key, *e);
            } else {
                live.insert(e.key, *e);
            }
        }
        for rec in &records {
            let key = rec.entry.key;
            match rec.op {
                JournalOp::Store => {
                    live.insert(key, rec.entry);
                }
                JournalOp::Free => {
                    live.remove(&key);
                    bad.remove(&key);
                }
                JournalOp::Quarantine => {
                    live.remove(&key);
                    let mut q = rec.entry;
                    q.flags.insert(EntryFlags::QUARANTINED);
                    bad.insert(key, q);
                }
                JournalOp::Retire => {
                    bad.remove(&key);
                    let mut r = rec.entry;
                    r.flags.insert(EntryFlags::RETIRED);
                    retired.insert(r.location, r);
                }
            }
        }

        st.pool.reset_allocation();
        st.index.clear();
        st.quarantine.clear();
        st.retired.clear();
        let mut lost = Vec::new();
        for e in live.into_values() {
            match st.pool.reserve_exact(e.location) {
                Ok(()) => st.index.insert(e)?,
                Err(err) => {
                    log::warn!("swap: lost {} at {}: {}", e.key, e.location, err);
                    lost.push(e.key);
                }
            }
        }
        for q in bad.into_values() {
            match st.pool.reserve_exact(q.location) {
                Ok(()) => {
                    st.quarantine.insert(q.key, q);
                }
                Err(err) => {
                    log::warn!("swap: lost quarantined {} at {}: {}", q.key, q.location, err);
                    lost.push(q.key);
                }
            }
        }
        for r in retired.into_values() {
            match st.pool.withdraw(r.location) {
                Ok(()) | Err(SwapError::DeviceMissing) => {
                    st.retired.insert(r.location, r);
                }
                Err(err) => {
                    log::warn!("swap: dropping retired extent {}: {}", r.location, err);
                }
            }
        }
        let used = st.used_pages();
        st.superblock.set_used(used)?;

        st.superblock.mark_dirty();
        st.superblock.flags.insert(crate::superblock::SuperblockFlags::REFERENCED);
        let staged = st.stage_superblock();
        self.write_superblock(staged)?;
        self.checkpoint_locked(&mut st)?;
        st.lifecycle = Lifecycle::Online;
        self.stats.active_devices.store(st.pool.active_count() as u64);

        let report = RecoveryReport {
            was_dirty,
            checkpoint_entries: checkpoint.entries.len(),
            replayed: records.len(),
            recovered: st.index.len(),
            quarantined: st.quarantine.len(),
            lost,
        };
        if was_dirty {
            log::warn!(
                "swap: recovered {} pages ({} journal records, {} lost)",
                report.recovered,
                report.replayed,
                report.lost.len()
            );
        }
        log::info!(
            "swap: {} online, {} of {} pages used",
            st.superblock.uuid,
            st.superblock.used_pages,
            st.superblock.total_pages
        );
        Ok(report)
    }

    /// Checkpoint metadata, clear the dirty marker and go offline.
    pub fn unmount(&self) -> SwapResult<()> {
        let mut st = self.state.lock();
        match st.lifecycle {
            Lifecycle::Online => {}
            Lifecycle::Mounted => {
                if st.superblock.is_dirty() {
                    return Err(SwapError::RecoveryRequired);
                }
                st.lifecycle = Lifecycle::Unmounted;
                return Ok(());
            }
            Lifecycle::Unmounted => return Err(SwapError::NotOnline),
        }
        if !st.is_idle() || self.outs_in_flight.load(Ordering::SeqCst) > 0 {
            return Err(SwapError::DeviceBusy);
        }
        self.checkpoint_locked(&mut st)?;
        let names: Vec<String> = st.snapshots.keys().cloned().collect();
        for name in names {
            if let Some(snap) = st.snapshots.remove(&name) {
                snap.release(&mut st.pool)?;
            }
        }
        st.superblock.clear_dirty();
        let staged = st.stage_superblock();
        self.write_superblock(staged)?;
        st.lifecycle = Lifecycle::Unmounted;
        log::info!("swap: {} unmounted cleanly", st.superblock.uuid);
        Ok(())
    }

    /// Current lifecycle
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    // ------------------------------------------------------------------------
    // Superblock and Journal Plumbing
    // ------------------------------------------------------------------------

    /// Persist a staged superblock unless a newer one is already on disk
    pub(crate) fn write_superblock(&self, staged: (u64, Superblock)) -> SwapResult<()> {
        let (generation, mut sb) = staged;
        let mut last = self.sb_io.lock();
        if generation <= *last {
            return Ok(());
        }
        sb.write(self.primary.as_ref())?;
        *last = generation;
        Ok(())
    }

    /// Serialise the whole index into the checkpoint region
    pub(crate) fn checkpoint_locked(&self, st: &mut SpaceState) -> SwapResult<()> {
        let mut entries = st.index.sorted();
        entries.extend(st.quarantine.values().copied());
        entries.extend(st.retired.values().copied());
        let seq = st.journal.last_seq();
        st.checkpoint.write(seq, &entries).map_err(|e| {
            log::error!("swap: checkpoint of {} entries failed: {}", entries.len(), e);
            e
        })?;
        st.journal.reset();
        self.stats.checkpoints.increment();
        log::debug!("swap: checkpoint at seq {} ({} entries)", seq, entries.len());
        Ok(())
    }

    /// Append a journal record ahead of an index mutation
    pub(crate) fn journal_locked(
        &self,
        st: &mut SpaceState,
        op: JournalOp,
        entry: &MetadataEntry,
    ) -> SwapResult<()> {
        if !st.config.journal_enabled || st.journal.capacity() == 0 {
            return Ok(());
        }
        if st.journal.is_full() {
            self.checkpoint_locked(st)?;
        }
        st.journal.append(op, entry)?;
        self.stats.journal_entries.increment();
        Ok(())
    }

    /// Write a checkpoint now
    pub fn checkpoint(&self) -> SwapResult<()> {
        let mut st = self.state.lock();
        st.ensure_online()?;
        self.checkpoint_locked(&mut st)
    }

    // ------------------------------------------------------------------------
    // Device Pool
    // ------------------------------------------------------------------------

    /// Attach a device range to the pool; it starts active
    pub fn add_device(
        &self,
        name: &str,
        handle: Arc<dyn BlockDevice>,
        start_sector: u64,
        sector_count: u64,
        priority: i32,
    ) -> SwapResult<DeviceId> {
        let mut st = self.state.lock();
        st.ensure_attached()?;
        st.authorize(name, DeviceOp::Add)?;
        let same_as_primary =
            Arc::as_ptr(&handle) as *const () == Arc::as_ptr(&self.primary) as *const ();
        if same_as_primary && start_sector < st.superblock.data_start_sector() {
            return Err(SwapError::InvalidArgument);
        }
        let id = st.pool.add(name, handle, start_sector, sector_count, priority)?;
        let bad: Vec<Extent> = st.retired.keys().filter(|x| x.device == id).copied().collect();
        for extent in bad {
            if let Err(err) = st.pool.withdraw(extent) {
                log::warn!("swap: retired extent {} does not fit {}: {}", extent, name, err);
            }
        }
        self.stats.active_devices.store(st.pool.active_count() as u64);
        log::info!(
            "swap: added device {} ({} sectors at {}, priority {})",
            name,
            sector_count,
            start_sector,
            priority
        );
        Ok(id)
    }

    /// Make a device eligible for new allocations
    pub fn activate_device(&self, name: &str) -> SwapResult<()> {
        let mut st = self.state.lock();
        st.ensure_attached()?;
        st.authorize(name, DeviceOp::Activate)?;
        let id = st.pool.id_of(name)?;
        st.pool.set_active(id, true)?;
        self.stats.active_devices.store(st.pool.active_count() as u64);
        log::info!("swap: activated device {}", name);
        Ok(())
    }

    /// Stop allocating from a device; stored pages stay readable
    pub fn deactivate_device(&self, name: &str) -> SwapResult<()> {
        let mut st = self.state.lock();
        st.ensure_attached()?;
        let id = st.pool.id_of(name)?;
        st.pool.set_active(id, false)?;
        self.stats.active_devices.store(st.pool.active_count() as u64);
        log::info!("swap: deactivated device {}", name);
        Ok(())
    }

    /// Change a device's allocation priority
    pub fn set_device_priority(&self, name: &str, priority: i32) -> SwapResult<()> {
        let mut st = self.state.lock();
        st.ensure_attached()?;
        let id = st.pool.id_of(name)?;
        st.pool.set_priority(id, priority)
    }

    /// Detach a device.
    ///
    /// Fails with [`SwapError::DeviceBusy`] while the device holds pages
    /// unless `force` is set, in which case pages are moved to other
    /// devices or reported lost. Storage pinned by a snapshot blocks
    /// removal even when forced.
    pub fn remove_device(&self, name: &str, force: bool) -> SwapResult<RemovalReport> {
        let mut st = self.state.lock();
        st.ensure_attached()?;
        st.authorize(name, DeviceOp::Remove)?;
        let id = st.pool.id_of(name)?;
        if st.snapshots.values().any(|s| s.references(id)) {
            return Err(SwapError::SnapshotPinned);
        }
        if st.pool.get(id).is_some_and(|d| d.has_io()) {
            return Err(SwapError::DeviceBusy);
        }
        let live = st.index.on_device(id);
        let bad: Vec<MetadataEntry> = st
            .quarantine
            .values()
            .filter(|q| q.location.device == id)
            .copied()
            .collect();
        if !force && !(live.is_empty() && bad.is_empty()) {
            return Err(SwapError::DeviceBusy);
        }

        let source = st.pool.handle(id)?;
        let mut report = RemovalReport::default();
        for entry in live {
            match self.relocate_locked(&mut st, &entry, source.as_ref(), id) {
                Ok(()) => report.relocated += 1,
                Err(err) => {
                    log::warn!("swap: forced removal of {} loses {}: {}", name, entry.key, err);
                    self.journal_locked(&mut st, JournalOp::Free, &entry)?;
                    st.index.remove(&entry.key)?;
                    st.superblock.return_page()?;
                    report.lost.push(entry.key);
                }
            }
        }
        for q in bad {
            self.journal_locked(&mut st, JournalOp::Free, &q)?;
            st.quarantine.remove(&q.key);
            st.superblock.return_page()?;
            report.lost.push(q.key);
        }
        st.pool.remove(id)?;
        self.stats.active_devices.store(st.pool.active_count() as u64);
        if st.lifecycle == Lifecycle::Online {
            let staged = st.stage_superblock();
            self.write_superblock(staged)?;
        }
        log::info!(
            "swap: removed device {} ({} relocated, {} lost)",
            name,
            report.relocated,
            report.lost.len()
        );
        Ok(report)
    }

    fn relocate_locked(
        &self,
        st: &mut SpaceState,
        entry: &MetadataEntry,
        source: &dyn BlockDevice,
        from: DeviceId,
    ) -> SwapResult<()> {
        let target = st.pool.allocate_excluding(from, entry.location.sectors as u64)?;
        let moved = (|| {
            let handle = st.pool.handle(target.device)?;
            let mut raw = vec![0u8; entry.location.byte_len()];
            read_exact(source, entry.location.byte_offset(), &mut raw)?;
            write_all(handle.as_ref(), target.byte_offset(), &raw)?;
            handle.flush()
        })();
        let mut relocated = *entry;
        relocated.location = target;
        let result = moved.and_then(|()| self.journal_locked(st, JournalOp::Store, &relocated));
        if let Err(err) = result {
            st.pool.unpin(target)?;
            return Err(err);
        }
        st.index.replace(relocated);
        log::debug!("swap: relocated {} to {}", entry.key, target);
        Ok(())
    }

    /// Views of every attached device
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.state.lock().pool.infos()
    }

    /// Install the security/audit callback
    pub fn set_access_gate(&self, gate: Arc<dyn AccessGate>) {
        self.state.lock().gate = Some(gate);
    }

    /// Register a compression codec
    pub fn register_codec(&self, codec: Arc<dyn Codec>) -> SwapResult<()> {
        self.codecs.write().register(codec)
    }

    // ------------------------------------------------------------------------
    // Page Swap Engine
    // ------------------------------------------------------------------------

    /// Store one page.
    ///
    /// Compresses and checksums `data`, writes header and payload to an
    /// extent on the best device and records (or replaces) the metadata
    /// entry. On any failure no metadata references the new extent.
    pub fn swap_out(
        &self,
        address: u64,
        pid: u32,
        data: &[u8],
        priority: PriorityClass,
    ) -> SwapResult<SwapOutReceipt> {
        let _guard = self.enter_swap_out()?;
        self.store_page(PageKey::new(address, pid), data, priority, EntryFlags::empty())
    }

    fn enter_swap_out(&self) -> SwapResult<OutGuard<'_>> {
        let limit = self.state.lock().config.quiesce_spin_limit;
        let mut spins = 0u32;
        loop {
            if !self.quiesced.load(Ordering::SeqCst) {
                self.outs_in_flight.fetch_add(1, Ordering::SeqCst);
                if !self.quiesced.load(Ordering::SeqCst) {
                    return Ok(OutGuard(&self.outs_in_flight));
                }
                self.outs_in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            if spins >= limit {
                return Err(SwapError::Quiesced);
            }
            spins += 1;
            core::hint::spin_loop();
        }
    }

    /// Swap-out path shared with the hibernation controller
    pub(crate) fn store_page(
        &self,
        key: PageKey,
        data: &[u8],
        priority: PriorityClass,
        flags: EntryFlags,
    ) -> SwapResult<SwapOutReceipt> {
        let started = self.platform.now_ns();
        let cfg = {
            let mut st = self.state.lock();
            st.ensure_online()?;
            if data.is_empty() || data.len() as u64 > st.superblock.page_bytes() {
                return Err(SwapError::InvalidArgument);
            }
            st.admit(&key, PageState::SwappingOut)?;
            if !st.index.contains(&key) && st.superblock.free_pages == 0 {
                return Err(SwapError::NoSpace);
            }
            st.writing.insert(key);
            st.config
        };
        let result = self.write_page(key, data, priority, flags, &cfg);
        match &result {
            Ok(receipt) => {
                self.stats.pages_out.increment();
                self.stats.bytes_out.add(data.len() as u64);
                self.stats.bytes_stored.add(receipt.stored_size as u64);
                if receipt.compression != CompressionAlg::None {
                    self.stats.compressed_pages.increment();
                }
                self.stats
                    .record_latency(self.platform.now_ns().saturating_sub(started));
                log::trace!(
                    "swap: out {} -> {} ({} bytes, {})",
                    key,
                    receipt.location,
                    receipt.stored_size,
                    receipt.compression
                );
            }
            Err(err) => {
                self.state.lock().writing.remove(&key);
                log::debug!("swap: out {} failed: {}", key, err);
            }
        }
        result
    }

    fn write_page(
        &self,
        key: PageKey,
        data: &[u8],
        priority: PriorityClass,
        flags: EntryFlags,
        cfg: &SwapConfig,
    ) -> SwapResult<SwapOutReceipt> {
        let compressed =
            self.codecs
                .read()
                .compress(cfg.compression, data, cfg.adaptive_min_savings_pct)?;
        let now = self.platform.now_ns();
        let mut page_flags = PageFlags::empty();
        if flags.contains(EntryFlags::HIBERNATION) {
            page_flags.insert(PageFlags::HIBERNATION);
        }
        let mut header = PageHeader::new(
            key.address,
            key.pid,
            data.len() as u32,
            compressed.alg,
            cfg.checksum,
            now,
            0,
            page_flags,
        );
        header.seal(&compressed.data);
        let image = build_extent(&header, &compressed.data);
        let sectors = image.len() as u64 / SECTOR_SIZE;

        // Reserve: the extent is now owned by this operation alone.
        let (extent, handle) = {
            let mut st = self.state.lock();
            let extent = st.pool.allocate(sectors)?;
            st.pool.begin_io(extent)?;
            let handle = st.pool.handle(extent.device)?;
            (extent, handle)
        };

        let io = write_all(handle.as_ref(), extent.byte_offset(), &image).and_then(|()| handle.flush());

        let mut st = self.state.lock();
        st.pool.end_io(extent)?;
        if let Err(err) = io {
            st.pool.unpin(extent)?;
            return Err(err);
        }

        let mut entry_flags = flags;
        if compressed.alg != CompressionAlg::None {
            entry_flags.insert(EntryFlags::COMPRESSED);
        }
        let stored_size = compressed.data.len() as u32;
        let entry = MetadataEntry {
            key,
            location: extent,
            stored_size,
            original_size: data.len() as u32,
            ratio_permille: MetadataEntry::ratio_for(stored_size, data.len() as u32),
            last_access: now,
            access_count: 0,
            priority,
            flags: entry_flags,
            swap_time: now,
        };

        let replacing = st.index.contains(&key);
        if !replacing {
            if let Err(err) = st.superblock.take_page() {
                st.pool.unpin(extent)?;
                return Err(err);
            }
        }
        if let Err(err) = self.journal_locked(&mut st, JournalOp::Store, &entry) {
            if !replacing {
                st.superblock.return_page()?;
            }
            st.pool.unpin(extent)?;
            return Err(err);
        }
        if let Some(old) = st.index.replace(entry) {
            st.pool.unpin(old.location)?;
        }
        st.writing.remove(&key);
        let staged = cfg.sync_superblock.then(|| st.stage_superblock());
        drop(st);

        if let Some(staged) = staged {
            if let Err(err) = self.write_superblock(staged) {
                // the journal already holds the entry; counters are rebuilt on start
                log::error!("swap: superblock update failed: {}", err);
            }
        }
        Ok(SwapOutReceipt {
            location: extent,
            stored_size,
            compression: compressed.alg,
            replaced: replacing,
        })
    }

    /// Read one page back into `buf`, returning its size.
    ///
    /// The swap copy is kept; release it with [`SwapSpace::swap_free`].
    /// A header or data checksum failure quarantines the page.
    pub fn swap_in(&self, address: u64, pid: u32, buf: &mut [u8]) -> SwapResult<usize> {
        let started = self.platform.now_ns();
        let key = PageKey::new(address, pid);
        let (entry, handle) = {
            let mut st = self.state.lock();
            st.ensure_online()?;
            st.admit(&key, PageState::SwappingIn)?;
            let entry = *st.index.get(&key).ok_or(SwapError::NotFound)?;
            if buf.len() < entry.original_size as usize {
                return Err(SwapError::BufferTooSmall);
            }
            let handle = st.pool.handle(entry.location.device)?;
            st.pool.begin_io(entry.location)?;
            *st.reading.entry(key).or_insert(0) += 1;
            (entry, handle)
        };

        let result = self.read_page(&entry, handle.as_ref());

        let mut st = self.state.lock();
        st.pool.end_io(entry.location)?;
        if let Some(n) = st.reading.get_mut(&key) {
            *n -= 1;
            if *n == 0 {
                st.reading.remove(&key);
            }
        }
        let still_current = st
            .index
            .get(&key)
            .is_some_and(|e| e.location == entry.location);
        match result {
            Ok(data) => {
                buf[..data.len()].copy_from_slice(&data);
                let now = self.platform.now_ns();
                if let Some(live) = st.index.get_mut(&key).filter(|_| still_current) {
                    live.last_access = now;
                    live.access_count = live.access_count.saturating_add(1);
                }
                drop(st);
                self.stats.pages_in.increment();
                self.stats.bytes_in.add(data.len() as u64);
                self.stats.record_latency(now.saturating_sub(started));
                log::trace!("swap: in {} <- {}", key, entry.location);
                Ok(data.len())
            }
            Err(err) => {
                if err.is_integrity() {
                    self.stats.checksum_errors.increment();
                    log::error!("swap: {} at {} failed verification: {}", key, entry.location, err);
                    if still_current {
                        self.quarantine_locked(&mut st, key)?;
                    }
                }
                Err(err)
            }
        }
    }

    /// [`SwapSpace::swap_in`] into a freshly allocated buffer
    pub fn swap_in_vec(&self, address: u64, pid: u32) -> SwapResult<Vec<u8>> {
        let size = {
            let st = self.state.lock();
            st.ensure_online()?;
            st.index
                .get(&PageKey::new(address, pid))
                .map(|e| e.original_size as usize)
                .unwrap_or(st.superblock.page_bytes() as usize)
        };
        let mut buf = vec![0u8; size];
        let n = self.swap_in(address, pid, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_page(&self, entry: &MetadataEntry, handle: &dyn BlockDevice) -> SwapResult<Vec<u8>> {
        let mut raw = vec![0u8; entry.location.byte_len()];
        read_exact(handle, entry.location.byte_offset(), &mut raw)?;
        let (header, payload) = parse_extent(&raw)?;
        header.expect_key(entry.key.address, entry.key.pid)?;
        if header.original_size != entry.original_size {
            return Err(SwapError::SizeMismatch);
        }
        self.codecs
            .read()
            .decompress(header.compression, payload, header.original_size as usize)
    }

    fn quarantine_locked(&self, st: &mut SpaceState, key: PageKey) -> SwapResult<()> {
        let mut entry = *st.index.get(&key).ok_or(SwapError::NotFound)?;
        entry.flags.insert(EntryFlags::QUARANTINED);
        self.journal_locked(st, JournalOp::Quarantine, &entry)?;
        st.index.remove(&key)?;
        st.quarantine.insert(key, entry);
        log::warn!("swap: quarantined {} at {}", key, entry.location);
        Ok(())
    }

    /// Release the swap copy of a page.
    ///
    /// A second free of the same page fails with [`SwapError::NotFound`].
    /// Freeing a quarantined page retires its sectors for good.
    pub fn swap_free(&self, address: u64, pid: u32) -> SwapResult<()> {
        let key = PageKey::new(address, pid);
        let mut st = self.state.lock();
        st.ensure_online()?;
        st.admit(&key, PageState::Freed)?;
        self.free_locked(&mut st, key)?;
        let staged = st.config.sync_superblock.then(|| st.stage_superblock());
        drop(st);
        self.stats.pages_freed.increment();
        log::trace!("swap: freed {}", key);
        if let Some(staged) = staged {
            if let Err(err) = self.write_superblock(staged) {
                log::error!("swap: superblock update failed: {}", err);
            }
        }
        Ok(())
    }

    pub(crate) fn free_locked(&self, st: &mut SpaceState, key: PageKey) -> SwapResult<()> {
        if let Some(q) = st.quarantine.get(&key).copied() {
            self.journal_locked(st, JournalOp::Retire, &q)?;
            st.quarantine.remove(&key);
            st.retire(&q)?;
            return st.superblock.return_page();
        }
        let entry = *st.index.get(&key).ok_or(SwapError::NotFound)?;
        self.journal_locked(st, JournalOp::Free, &entry)?;
        st.index.remove(&key)?;
        st.pool.unpin(entry.location)?;
        st.superblock.return_page()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Where a page stands in the swap state machine
    pub fn page_state(&self, address: u64, pid: u32) -> PageState {
        self.state.lock().page_state(&PageKey::new(address, pid))
    }

    /// Metadata entry of a stored page
    pub fn lookup(&self, address: u64, pid: u32) -> Option<MetadataEntry> {
        self.state.lock().index.get(&PageKey::new(address, pid)).copied()
    }

    /// All live entries, sorted by key
    pub fn entries(&self) -> Vec<MetadataEntry> {
        self.state.lock().index.sorted()
    }

    /// All quarantined entries, sorted by key
    pub fn quarantined(&self) -> Vec<MetadataEntry> {
        self.state.lock().quarantine.values().copied().collect()
    }

    /// Copy of the in-memory superblock
    pub fn superblock(&self) -> Superblock {
        self.state.lock().superblock.clone()
    }

    // ------------------------------------------------------------------------
    // Statistics and Configuration
    // ------------------------------------------------------------------------

    /// Current statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the statistics counters
    pub fn reset_stats(&self) {
        self.stats.reset();
        log::debug!("swap: statistics reset");
    }

    /// Current tunables
    pub fn config(&self) -> SwapConfig {
        self.state.lock().config
    }

    /// Replace all tunables
    pub fn set_config(&self, config: SwapConfig) -> SwapResult<()> {
        config.validate()?;
        if !self.codecs.read().supports(config.compression) {
            return Err(SwapError::CodecUnavailable);
        }
        let mut st = self.state.lock();
        st.pool.set_max_devices(config.max_devices as usize);
        st.superblock.compression = config.compression;
        st.superblock.checksum_alg = config.checksum;
        st.config = config;
        Ok(())
    }

    /// Read one tunable by name
    pub fn get_param(&self, name: &str) -> SwapResult<u64> {
        self.state.lock().config.get_param(name)
    }

    /// Write one tunable by name
    pub fn set_param(&self, name: &str, value: u64) -> SwapResult<()> {
        let mut cfg = self.config();
        cfg.set_param(name, value)?;
        self.set_config(cfg)
    }

    /// Persist the tunables in the superblock
    pub fn save_config(&self) -> SwapResult<()> {
        let mut st = self.state.lock();
        st.ensure_attached()?;
        let cfg = st.config;
        cfg.save_to(&mut st.superblock.reserved);
        let staged = st.stage_superblock();
        self.write_superblock(staged)?;
        log::info!("swap: configuration saved");
        Ok(())
    }

    /// Reload the tunables persisted in the on-disk superblock
    pub fn load_config(&self) -> SwapResult<SwapConfig> {
        let on_disk = Superblock::read(self.primary.as_ref())?;
        let cfg = SwapConfig::load_from(&on_disk.reserved)?;
        self.set_config(cfg)?;
        log::info!("swap: configuration loaded");
        Ok(cfg)
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Render the superblock
    pub fn dump_superblock(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}", self.superblock());
        out
    }

    /// Render the device pool
    pub fn dump_devices(&self) -> String {
        let mut out = String::new();
        for info in self.devices() {
            let _ = writeln!(out, "{}", info);
        }
        out
    }

    /// Render every live and quarantined entry
    pub fn dump_index(&self) -> String {
        let st = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(out, "{} stored, {} quarantined", st.index.len(), st.quarantine.len());
        for e in st.index.sorted() {
            let _ = writeln!(out, "{}", e);
        }
        for q in st.quarantine.values() {
            let _ = writeln!(out, "{}", q);
        }
        out
    }

    /// Render the statistics
    pub fn dump_stats(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}", self.stats());
        out
    }

    /// Read and render the on-device header of a stored page
    pub fn dump_page_header(&self, address: u64, pid: u32) -> SwapResult<String> {
        let header = self.read_page_header(address, pid)?;
        let mut out = String::new();
        let _ = write!(out, "{}", header);
        Ok(out)
    }

    /// Read and validate the on-device header of a stored page
    pub fn read_page_header(&self, address: u64, pid: u32) -> SwapResult<PageHeader> {
        let (entry, handle) = {
            let mut st = self.state.lock();
            st.ensure_online()?;
            let key = PageKey::new(address, pid);
            let entry = st
                .index
                .get(&key)
                .or_else(|| st.quarantine.get(&key))
                .copied()
                .ok_or(SwapError::NotFound)?;
            let handle = st.pool.handle(entry.location.device)?;
            st.pool.begin_io(entry.location)?;
            (entry, handle)
        };
        let mut raw = vec![0u8; crate::header::PAGE_HEADER_SIZE];
        let read = read_exact(handle.as_ref(), entry.location.byte_offset(), &mut raw);
        self.state.lock().pool.end_io(entry.location)?;
        read?;
        PageHeader::decode(&raw)
    }
}

impl fmt::Debug for SwapSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SwapSpace")
            .field("uuid", &st.superblock.uuid)
            .field("lifecycle", &st.lifecycle)
            .field("devices", &st.pool.len())
            .field("stored", &st.index.len())
            .field("quarantined", &st.quarantine.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::testing::{
        corrupt_payload, data_device, format_and_mount, page, started_space, test_format,
        FailingDevice, RleCodec, TestPlatform, TEST_PAGE,
    };
    use alloc::string::ToString;

    #[test]
    fn test_zero_page_scenario() {
        let (space, _primary) = started_space(1000);
        let zeros = [0u8; TEST_PAGE];
        let before = space.superblock();
        space.swap_out(0x1000, 42, &zeros, PriorityClass::Normal).unwrap();
        let after = space.superblock();
        assert_eq!(after.free_pages, before.free_pages - 1);
        assert_eq!(after.used_pages, before.used_pages + 1);

        let mut buf = [0xFFu8; TEST_PAGE];
        assert_eq!(space.swap_in(0x1000, 42, &mut buf).unwrap(), TEST_PAGE);
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(space.stats().checksum_errors, 0);
        assert_eq!(space.page_state(0x1000, 42), PageState::Stored);
    }

    #[test]
    fn test_no_space_creates_no_entry() {
        let (space, _primary) = started_space(1000);
        space.deactivate_device("primary").unwrap();
        let err = space
            .swap_out(0x1000, 1, &page(1), PriorityClass::Normal)
            .unwrap_err();
        assert_eq!(err, SwapError::NoSpace);
        assert!(err.is_capacity());
        assert!(space.lookup(0x1000, 1).is_none());
        assert_eq!(space.superblock().used_pages, 0);
        assert_eq!(space.page_state(0x1000, 1), PageState::Resident);
    }

    #[test]
    fn test_full_devices_report_capacity_error() {
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(1000, &platform);
        // exactly one uncompressed page (9 sectors) fits
        space.add_device("tiny", data_device(9), 0, 9, 5).unwrap();
        space.start().unwrap();
        space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        assert_eq!(
            space.swap_out(2, 1, &page(2), PriorityClass::Normal),
            Err(SwapError::NoSpace)
        );
        assert!(space.lookup(2, 1).is_none());
        assert_eq!(space.superblock().used_pages, 1);
    }

    #[test]
    fn test_logical_page_limit() {
        let (space, _primary) = started_space(2);
        space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        space.swap_out(2, 1, &page(2), PriorityClass::Normal).unwrap();
        assert_eq!(
            space.swap_out(3, 1, &page(3), PriorityClass::Normal),
            Err(SwapError::NoSpace)
        );
        // replacing an existing page needs no new page
        let receipt = space.swap_out(2, 1, &page(9), PriorityClass::High).unwrap();
        assert!(receipt.replaced);
        assert_eq!(space.swap_in_vec(2, 1).unwrap(), page(9));
        let sb = space.superblock();
        assert_eq!((sb.free_pages, sb.used_pages), (0, 2));
    }

    #[test]
    fn test_priority_fallback_between_devices() {
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(1000, &platform);
        let fast = space.add_device("fast", data_device(18), 0, 18, 10).unwrap();
        let slow = space.add_device("slow", data_device(1000), 0, 1000, 1).unwrap();
        space.start().unwrap();
        let a = space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        let b = space.swap_out(2, 1, &page(2), PriorityClass::Normal).unwrap();
        let c = space.swap_out(3, 1, &page(3), PriorityClass::Normal).unwrap();
        assert_eq!(a.location.device, fast);
        assert_eq!(b.location.device, fast);
        assert_eq!(c.location.device, slow);
        space.swap_free(1, 1).unwrap();
        let d = space.swap_out(4, 1, &page(4), PriorityClass::Normal).unwrap();
        assert_eq!(d.location.device, fast);
    }

    #[test]
    fn test_double_free() {
        let (space, _primary) = started_space(100);
        space.swap_out(0x2000, 7, &page(7), PriorityClass::Low).unwrap();
        space.swap_free(0x2000, 7).unwrap();
        assert_eq!(space.swap_free(0x2000, 7), Err(SwapError::NotFound));
        assert_eq!(space.swap_in_vec(0x2000, 7), Err(SwapError::NotFound));
        let sb = space.superblock();
        assert_eq!((sb.free_pages, sb.used_pages), (100, 0));
    }

    #[test]
    fn test_in_flight_transfers_gate_page_operations() {
        let (space, _primary) = started_space(10);
        let key = PageKey::new(0x3000, 4);
        space.swap_out(0x3000, 4, &page(4), PriorityClass::Normal).unwrap();
        let entry = space.lookup(0x3000, 4).unwrap();

        // a read in flight: it pins the extent
        {
            let mut st = space.state.lock();
            st.pool.begin_io(entry.location).unwrap();
            st.reading.insert(key, 1);
        }
        assert_eq!(space.page_state(0x3000, 4), PageState::SwappingIn);
        assert_eq!(space.swap_in_vec(0x3000, 4), Err(SwapError::DeviceBusy));
        assert_eq!(
            space.swap_out(0x3000, 4, &page(5), PriorityClass::Normal),
            Err(SwapError::DeviceBusy)
        );
        space.swap_free(0x3000, 4).unwrap();
        assert_eq!(space.devices()[0].extents, 1);
        {
            let mut st = space.state.lock();
            st.pool.end_io(entry.location).unwrap();
            st.reading.remove(&key);
        }
        assert_eq!(space.devices()[0].extents, 0);
        assert_eq!(space.page_state(0x3000, 4), PageState::Resident);

        // a write in flight
        space.state.lock().writing.insert(key);
        assert_eq!(space.page_state(0x3000, 4), PageState::SwappingOut);
        assert_eq!(space.swap_in_vec(0x3000, 4), Err(SwapError::DeviceBusy));
        assert_eq!(space.swap_free(0x3000, 4), Err(SwapError::DeviceBusy));
        space.state.lock().writing.remove(&key);

        space.swap_out(0x3000, 4, &page(6), PriorityClass::Normal).unwrap();
        assert_eq!(
            space.state.lock().admit(&key, PageState::Resident),
            Err(SwapError::InvalidState)
        );
        assert!(space.superblock().counters_consistent());
    }

    #[test]
    fn test_counters_stay_consistent() {
        let (space, _primary) = started_space(64);
        let mut seed = 0x1234_5678u32;
        for step in 0..300u32 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let addr = (seed % 40) as u64 * 0x1000;
            let result = match step % 3 {
                0 | 1 => space
                    .swap_out(addr, 1, &page(step as u8), PriorityClass::Normal)
                    .map(|_| ()),
                _ => space.swap_free(addr, 1),
            };
            if result.is_ok() {
                assert!(space.superblock().counters_consistent());
            }
        }
        let sb = space.superblock();
        assert!(sb.counters_consistent());
        assert_eq!(sb.used_pages as usize, space.entries().len());
    }

    #[test]
    fn test_buffer_too_small_and_bad_sizes() {
        let (space, _primary) = started_space(10);
        space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        let mut small = [0u8; 100];
        assert_eq!(space.swap_in(1, 1, &mut small), Err(SwapError::BufferTooSmall));
        assert_eq!(
            space.swap_out(2, 1, &[], PriorityClass::Normal),
            Err(SwapError::InvalidArgument)
        );
        let oversized = vec![0u8; TEST_PAGE + 1];
        assert_eq!(
            space.swap_out(2, 1, &oversized, PriorityClass::Normal),
            Err(SwapError::InvalidArgument)
        );
    }

    #[test]
    fn test_compressed_roundtrip_and_stats() {
        let (space, _primary) = started_space(100);
        space.register_codec(Arc::new(RleCodec)).unwrap();
        space.set_param("compression", CompressionAlg::Lz4.as_u32() as u64).unwrap();
        let zeros = [0u8; TEST_PAGE];
        let receipt = space.swap_out(0x5000, 3, &zeros, PriorityClass::Normal).unwrap();
        assert_eq!(receipt.compression, CompressionAlg::Lz4);
        assert_eq!(receipt.location.sectors, 1);
        let entry = space.lookup(0x5000, 3).unwrap();
        assert!(entry.flags.contains(EntryFlags::COMPRESSED));
        assert!(entry.ratio_permille < 100);
        assert_eq!(space.swap_in_vec(0x5000, 3).unwrap(), zeros.to_vec());
        let stats = space.stats();
        assert_eq!(stats.compressed_pages, 1);
        assert!(stats.compression_ratio_permille() < 100);
        assert_eq!((stats.pages_out, stats.pages_in), (1, 1));
    }

    #[test]
    fn test_compression_requires_codec() {
        let (space, _primary) = started_space(100);
        assert_eq!(
            space.set_param("compression", CompressionAlg::Zstd.as_u32() as u64),
            Err(SwapError::CodecUnavailable)
        );
        space.set_param("compression", CompressionAlg::Adaptive.as_u32() as u64).unwrap();
        let receipt = space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        assert_eq!(receipt.compression, CompressionAlg::None);
    }

    #[test]
    fn test_data_corruption_quarantines() {
        let (space, primary) = started_space(100);
        space.swap_out(0x9000, 5, &page(3), PriorityClass::Normal).unwrap();
        let entry = space.lookup(0x9000, 5).unwrap();
        corrupt_payload(primary.as_ref(), &entry);

        let mut buf = [0u8; TEST_PAGE];
        let err = space.swap_in(0x9000, 5, &mut buf).unwrap_err();
        assert_eq!(err, SwapError::DataChecksumMismatch);
        assert_eq!(space.page_state(0x9000, 5), PageState::Quarantined);
        assert_eq!(space.swap_in(0x9000, 5, &mut buf), Err(SwapError::PageQuarantined));
        assert_eq!(
            space.swap_out(0x9000, 5, &page(3), PriorityClass::Normal),
            Err(SwapError::PageQuarantined)
        );
        assert_eq!(space.stats().checksum_errors, 1);

        space.swap_free(0x9000, 5).unwrap();
        let info = &space.devices()[0];
        assert_eq!(info.retired_sectors, entry.location.sectors as u64);
        assert!(space.superblock().counters_consistent());
        assert_eq!(space.superblock().used_pages, 0);
        // the page can be stored again once freed
        space.swap_out(0x9000, 5, &page(3), PriorityClass::Normal).unwrap();
    }

    #[test]
    fn test_retired_sectors_survive_remount() {
        fn reopen(primary: &Arc<MemBlockDevice>) -> (SwapSpace, RecoveryReport) {
            let dyn_primary: Arc<dyn BlockDevice> = primary.clone();
            let space = SwapSpace::mount(dyn_primary.clone(), Arc::new(TestPlatform::new())).unwrap();
            let start = space.superblock().data_start_sector();
            let sectors = primary.size_bytes() / SECTOR_SIZE - start;
            space.add_device("primary", dyn_primary, start, sectors, 0).unwrap();
            let report = space.start().unwrap();
            (space, report)
        }
        fn overlaps(a: Extent, b: Extent) -> bool {
            a.device == b.device
                && a.start_sector < b.start_sector + b.sectors as u64
                && b.start_sector < a.start_sector + a.sectors as u64
        }

        // clean unmount: the checkpoint carries the retired extent
        // crash: the journal does
        for clean in [true, false] {
            let (space, primary) = started_space(100);
            space.swap_out(0x4000, 1, &page(8), PriorityClass::Normal).unwrap();
            let bad = space.lookup(0x4000, 1).unwrap().location;
            corrupt_payload(primary.as_ref(), &space.lookup(0x4000, 1).unwrap());
            assert!(space.swap_in_vec(0x4000, 1).is_err());
            space.swap_free(0x4000, 1).unwrap();
            assert_eq!(space.devices()[0].retired_sectors, bad.sectors as u64);
            if clean {
                space.unmount().unwrap();
            }
            drop(space);

            let (again, report) = reopen(&primary);
            assert!(report.lost.is_empty());
            assert_eq!(report.quarantined, 0);
            let info = &again.devices()[0];
            assert_eq!(info.retired_sectors, bad.sectors as u64);
            assert_eq!(info.extents, 0);
            for i in 0..5u64 {
                let receipt = again.swap_out(i, 2, &page(i as u8), PriorityClass::Normal).unwrap();
                assert!(!overlaps(receipt.location, bad), "{} reuses {}", receipt.location, bad);
            }
            let sb = again.superblock();
            assert_eq!((sb.used_pages, sb.free_pages), (5, 95));

            // and across a second restart
            again.unmount().unwrap();
            drop(again);
            let (third, _) = reopen(&primary);
            assert_eq!(third.devices()[0].retired_sectors, bad.sectors as u64);
        }
    }

    #[test]
    fn test_header_corruption_is_reported_distinctly() {
        let (space, primary) = started_space(100);
        space.swap_out(0xA000, 5, &page(4), PriorityClass::Normal).unwrap();
        let entry = space.lookup(0xA000, 5).unwrap();
        let at = entry.location.byte_offset() + 30;
        let mut b = [0u8; 1];
        primary.read_at(at, &mut b).unwrap();
        b[0] ^= 0x40;
        primary.write_at(at, &b).unwrap();
        assert_eq!(space.swap_in_vec(0xA000, 5), Err(SwapError::HeaderChecksumMismatch));
        assert_eq!(space.quarantined().len(), 1);
    }

    #[test]
    fn test_write_failure_leaves_no_entry() {
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(100, &platform);
        let flaky = Arc::new(FailingDevice::new(1000));
        space.add_device("flaky", flaky.clone(), 0, 1000, 1).unwrap();
        space.start().unwrap();
        flaky.fail_writes(true);
        assert_eq!(
            space.swap_out(1, 1, &page(1), PriorityClass::Normal),
            Err(SwapError::DeviceIo)
        );
        assert!(space.lookup(1, 1).is_none());
        assert_eq!(space.devices()[0].free_sectors, 1000);
        assert_eq!(space.page_state(1, 1), PageState::Resident);
        flaky.fail_writes(false);
        space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
    }

    #[test]
    fn test_read_failure_is_not_quarantined() {
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(100, &platform);
        let flaky = Arc::new(FailingDevice::new(1000));
        space.add_device("flaky", flaky.clone(), 0, 1000, 1).unwrap();
        space.start().unwrap();
        space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        flaky.fail_reads(true);
        assert_eq!(space.swap_in_vec(1, 1), Err(SwapError::DeviceIo));
        assert_eq!(space.page_state(1, 1), PageState::Stored);
        flaky.fail_reads(false);
        assert_eq!(space.swap_in_vec(1, 1).unwrap(), page(1));
    }

    #[test]
    fn test_operations_require_online() {
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(100, &platform);
        assert_eq!(
            space.swap_out(1, 1, &page(1), PriorityClass::Normal),
            Err(SwapError::NotOnline)
        );
        assert_eq!(space.swap_free(1, 1), Err(SwapError::NotOnline));
        // a freshly formatted space carries the dirty marker until started
        assert_eq!(space.unmount(), Err(SwapError::RecoveryRequired));
        space.start().unwrap();
        assert_eq!(space.start().unwrap_err(), SwapError::AlreadyOnline);
        space.unmount().unwrap();
        assert_eq!(space.lifecycle(), Lifecycle::Unmounted);
        assert_eq!(space.swap_in_vec(1, 1), Err(SwapError::NotOnline));
    }

    #[test]
    fn test_clean_remount_keeps_pages() {
        let platform = Arc::new(TestPlatform::new());
        let (space, primary) = started_space(100);
        for i in 0..10u64 {
            space.swap_out(i * 0x1000, 9, &page(i as u8), PriorityClass::Normal).unwrap();
        }
        space.swap_free(0x3000, 9).unwrap();
        space.unmount().unwrap();
        let on_disk = Superblock::read(primary.as_ref()).unwrap();
        assert!(!on_disk.is_dirty());
        assert_eq!(on_disk.used_pages, 9);

        let dyn_primary: Arc<dyn BlockDevice> = primary.clone();
        let again = SwapSpace::mount(dyn_primary.clone(), platform).unwrap();
        let start = on_disk.data_start_sector();
        let sectors = primary.size_bytes() / SECTOR_SIZE - start;
        again.add_device("primary", dyn_primary, start, sectors, 0).unwrap();
        let report = again.start().unwrap();
        assert!(!report.was_dirty);
        assert_eq!(report.recovered, 9);
        assert_eq!(report.replayed, 0);
        assert_eq!(again.swap_in_vec(0x5000, 9).unwrap(), page(5));
        assert_eq!(again.swap_in_vec(0x3000, 9), Err(SwapError::NotFound));
        assert!(Superblock::read(primary.as_ref()).unwrap().is_dirty());
    }

    #[test]
    fn test_crash_recovery_replays_journal() {
        let platform = Arc::new(TestPlatform::new());
        let (space, primary) = started_space(100);
        space.set_param("sync_superblock", 0).unwrap();
        for i in 0..6u64 {
            space.swap_out(i, 2, &page(i as u8 + 1), PriorityClass::High).unwrap();
        }
        space.swap_free(4, 2).unwrap();
        space.swap_out(1, 2, &page(0xEE), PriorityClass::High).unwrap();
        let entry = space.lookup(5, 2).unwrap();
        corrupt_payload(primary.as_ref(), &entry);
        assert!(space.swap_in_vec(5, 2).is_err());
        // crash: the handle is dropped without unmount
        drop(space);

        let dyn_primary: Arc<dyn BlockDevice> = primary.clone();
        let sb = Superblock::read(primary.as_ref()).unwrap();
        assert!(sb.is_dirty());
        let again = SwapSpace::mount(dyn_primary.clone(), platform).unwrap();
        let start = sb.data_start_sector();
        let sectors = primary.size_bytes() / SECTOR_SIZE - start;
        again.add_device("primary", dyn_primary, start, sectors, 0).unwrap();
        let report = again.start().unwrap();
        assert!(report.was_dirty);
        assert_eq!(report.recovered, 4);
        assert_eq!(report.quarantined, 1);
        assert!(report.lost.is_empty());
        assert!(report.replayed >= 9);
        assert_eq!(again.swap_in_vec(1, 2).unwrap(), page(0xEE));
        assert_eq!(again.swap_in_vec(0, 2).unwrap(), page(1));
        assert_eq!(again.swap_in_vec(4, 2), Err(SwapError::NotFound));
        assert_eq!(again.swap_in_vec(5, 2), Err(SwapError::PageQuarantined));
        let sb = again.superblock();
        assert_eq!((sb.used_pages, sb.free_pages), (5, 95));
        // rebuilt allocation never hands out a live extent
        let fresh = again.swap_out(77, 2, &page(7), PriorityClass::Normal).unwrap();
        for e in again.entries() {
            if e.key != PageKey::new(77, 2) {
                let end = e.location.start_sector + e.location.sectors as u64;
                let fresh_end = fresh.location.start_sector + fresh.location.sectors as u64;
                assert!(fresh_end <= e.location.start_sector || fresh.location.start_sector >= end);
            }
        }
    }

    #[test]
    fn test_start_marks_dirty_before_checkpoint() {
        let platform = Arc::new(TestPlatform::new());
        let flaky = Arc::new(FailingDevice::new(4096));
        let primary: Arc<dyn BlockDevice> = flaky.clone();
        SwapSpace::format(&primary, platform.as_ref(), &test_format(10)).unwrap();
        let attach = |space: &SwapSpace| {
            let start = space.superblock().data_start_sector();
            space
                .add_device("primary", primary.clone(), start, 4096 - start, 0)
                .unwrap();
        };

        let space = SwapSpace::mount(primary.clone(), platform.clone()).unwrap();
        attach(&space);
        space.start().unwrap();
        space.unmount().unwrap();
        assert!(!Superblock::read(primary.as_ref()).unwrap().is_dirty());

        let again = SwapSpace::mount(primary.clone(), platform).unwrap();
        attach(&again);
        flaky.fail_writes_from(again.superblock().metadata_offset());
        assert_eq!(again.start().unwrap_err(), SwapError::DeviceIo);
        // the marker reached the disk although the checkpoint did not
        assert!(Superblock::read(primary.as_ref()).unwrap().is_dirty());
        assert_eq!(again.lifecycle(), Lifecycle::Mounted);
    }

    #[test]
    fn test_journal_wraps_through_checkpoints() {
        let (space, primary) = started_space(200);
        // a 4-page journal holds 128 records
        for i in 0..150u64 {
            space.swap_out(i, 1, &page(i as u8), PriorityClass::Normal).unwrap();
        }
        assert!(space.stats().checkpoints >= 2);
        drop(space);
        let platform = Arc::new(TestPlatform::new());
        let dyn_primary: Arc<dyn BlockDevice> = primary.clone();
        let again = SwapSpace::mount(dyn_primary.clone(), platform).unwrap();
        let start = again.superblock().data_start_sector();
        let sectors = primary.size_bytes() / SECTOR_SIZE - start;
        again.add_device("primary", dyn_primary, start, sectors, 0).unwrap();
        let report = again.start().unwrap();
        assert_eq!(report.recovered, 150);
        assert_eq!(again.swap_in_vec(149, 1).unwrap(), page(149));
    }

    #[test]
    fn test_recovery_reports_missing_device() {
        let platform = Arc::new(TestPlatform::new());
        let (space, primary) = format_and_mount(100, &platform);
        let extra = data_device(100);
        space.add_device("extra", extra, 0, 100, 50).unwrap();
        space.start().unwrap();
        space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        space.unmount().unwrap();

        let dyn_primary: Arc<dyn BlockDevice> = primary.clone();
        let again = SwapSpace::mount(dyn_primary, platform).unwrap();
        let report = again.start().unwrap();
        assert_eq!(report.lost, vec![PageKey::new(1, 1)]);
        assert_eq!(again.superblock().used_pages, 0);
    }

    #[test]
    fn test_remove_device_rules() {
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(100, &platform);
        space.add_device("a", data_device(100), 0, 100, 9).unwrap();
        space.add_device("b", data_device(100), 0, 100, 1).unwrap();
        space.start().unwrap();
        space.swap_out(1, 1, &page(1), PriorityClass::Normal).unwrap();
        space.swap_out(2, 1, &page(2), PriorityClass::Normal).unwrap();

        assert_eq!(space.remove_device("a", false), Err(SwapError::DeviceBusy));
        assert_eq!(space.remove_device("zz", true), Err(SwapError::DeviceNotFound));
        let report = space.remove_device("a", true).unwrap();
        assert_eq!(report.relocated, 2);
        assert!(report.lost.is_empty());
        assert_eq!(space.swap_in_vec(1, 1).unwrap(), page(1));
        assert_eq!(space.swap_in_vec(2, 1).unwrap(), page(2));
        assert_eq!(space.devices().len(), 1);
        assert!(space.remove_device("b", false).is_err());
        let report = space.remove_device("b", true).unwrap();
        assert_eq!(report.lost.len(), 2);
        let sb = space.superblock();
        assert_eq!((sb.used_pages, sb.free_pages), (0, 100));
    }

    #[test]
    fn test_empty_device_removal_and_reuse_of_name() {
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(100, &platform);
        space.add_device("a", data_device(100), 0, 100, 9).unwrap();
        assert_eq!(
            space.add_device("a", data_device(100), 0, 100, 9),
            Err(SwapError::AlreadyExists)
        );
        assert_eq!(space.remove_device("a", false), Ok(RemovalReport::default()));
        space.add_device("a", data_device(100), 0, 100, 9).unwrap();
    }

    #[test]
    fn test_primary_reserved_area_is_protected() {
        let platform = Arc::new(TestPlatform::new());
        let (space, primary) = format_and_mount(100, &platform);
        let dyn_primary: Arc<dyn BlockDevice> = primary;
        assert_eq!(
            space.add_device("p", dyn_primary, 0, 10, 0),
            Err(SwapError::InvalidArgument)
        );
    }

    #[test]
    fn test_access_gate() {
        struct DenyAdds;
        impl AccessGate for DenyAdds {
            fn authorize(&self, _device: &str, op: DeviceOp) -> bool {
                op != DeviceOp::Add
            }
        }
        let platform = Arc::new(TestPlatform::new());
        let (space, _primary) = format_and_mount(100, &platform);
        space.set_access_gate(Arc::new(DenyAdds));
        assert_eq!(
            space.add_device("a", data_device(10), 0, 10, 0),
            Err(SwapError::AccessDenied)
        );
        assert!(space.devices().is_empty());
    }

    #[test]
    fn test_config_save_and_load() {
        let (space, _primary) = started_space(100);
        space.set_param("swappiness", 15).unwrap();
        space.save_config().unwrap();
        space.set_param("swappiness", 90).unwrap();
        let loaded = space.load_config().unwrap();
        assert_eq!(loaded.swappiness, 15);
        assert_eq!(space.get_param("swappiness"), Ok(15));
        assert_eq!(space.get_param("nope"), Err(SwapError::InvalidArgument));
    }

    #[test]
    fn test_mount_rejects_foreign_device() {
        let platform: Arc<dyn Platform> = Arc::new(TestPlatform::new());
        let blank: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(1 << 20));
        assert_eq!(
            SwapSpace::mount(blank, platform).unwrap_err(),
            SwapError::BadMagic
        );
    }

    #[test]
    fn test_oversized_reservations_are_rejected() {
        let platform = TestPlatform::new();
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(1 << 20));
        let options = FormatOptions::new(10, TEST_PAGE as u32).reserved_pages(u64::MAX / 2, 8);
        assert_eq!(
            SwapSpace::format(&dev, &platform, &options).unwrap_err(),
            SwapError::InvalidArgument
        );

        let mut sb = Superblock::create(10, 4096, CompressionAlg::None, ChecksumAlg::Crc32c, &platform)
            .unwrap()
            .with_reserved_pages(8, u64::MAX / 2);
        sb.write(dev.as_ref()).unwrap();
        assert_eq!(
            SwapSpace::mount(dev, Arc::new(TestPlatform::new())).unwrap_err(),
            SwapError::SuperblockCorrupt
        );
    }

    #[test]
    fn test_dumps() {
        let (space, _primary) = started_space(100);
        space.swap_out(0x7000, 3, &page(1), PriorityClass::Normal).unwrap();
        assert!(space.dump_superblock().contains("page size:      4096"));
        assert!(space.dump_devices().contains("primary"));
        assert!(space.dump_index().contains("0x7000/3"));
        assert!(space.dump_stats().contains("pages out/in/freed: 1/0/0"));
        let header = space.dump_page_header(0x7000, 3).unwrap();
        assert!(header.contains("pid 3"));
        assert!(space.stats().to_string().contains("Swap2 statistics"));
    }

    #[test]
    fn test_concurrent_swap_traffic() {
        use std::thread;

        let (space, _primary) = started_space(1000);
        let space = Arc::new(space);
        let mut workers = Vec::new();
        for t in 0..4u32 {
            let space = Arc::clone(&space);
            workers.push(thread::spawn(move || {
                for i in 0..25u64 {
                    let addr = i * 0x1000;
                    let data = page((t as u8) ^ (i as u8));
                    space.swap_out(addr, t, &data, PriorityClass::Normal).unwrap();
                    assert_eq!(space.swap_in_vec(addr, t).unwrap(), data);
                    if i % 2 == 0 {
                        space.swap_free(addr, t).unwrap();
                    }
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        let sb = space.superblock();
        assert!(sb.counters_consistent());
        assert_eq!(sb.used_pages, 4 * 12);
        assert_eq!(space.entries().len(), 48);
    }
}
