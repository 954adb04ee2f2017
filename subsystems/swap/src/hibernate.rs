//! Hibernation support.
//!
//! ```text
//!   Idle ──prepare──► Prepared ──enter──► Entered ─ ─ power off ─ ─┐
//!    ▲                  │                   │                      │
//!    └──────abort───────┴───────abort───────┘                      ▼
//!    ▲                                                    (new boot) Idle
//!    └──────────────── resume ◄── Resuming ◄──────resume───────────┘
//! ```
//!
//! `prepare` quiesces new swap-outs and checks capacity, `enter` writes
//! every resident page as a hibernation page and persists the image
//! marker in the superblock, `resume` reads the image back into memory
//! on the next boot. A failed resume discards the image and leaves the
//! space usable.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::error::{SwapError, SwapResult};
use crate::header::extent_sectors_for;
use crate::index::{EntryFlags, MetadataEntry, PageKey, PriorityClass};
use crate::platform::MemoryManager;
use crate::space::{SpaceState, SwapSpace};
use crate::superblock::SuperblockFlags;

/// Hibernation controller phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HibernationPhase {
    /// No hibernation in progress
    #[default]
    Idle,
    /// Swap-outs quiesced, capacity checked
    Prepared,
    /// Image written, marker persisted
    Entered,
    /// Image being read back
    Resuming,
}

/// Capacity check performed by [`SwapSpace::hibernate_prepare`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HibernationPlan {
    /// Pages the image must hold
    pub resident_pages: u64,
    /// Free logical pages
    pub free_pages: u64,
    /// Worst-case sectors for the image
    pub required_sectors: u64,
    /// Free sectors on active devices
    pub free_sectors: u64,
}

/// Outcome of a successful resume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Pages restored into memory
    pub restored: u64,
}

impl SwapSpace {
    /// Current controller phase
    pub fn hibernation_phase(&self) -> HibernationPhase {
        self.state.lock().hibernation
    }

    /// Quiesce swap-outs and verify the image fits.
    ///
    /// Waits (bounded by `quiesce_spin_limit`) for in-flight swap-outs to
    /// drain. On any failure the space is left unquiesced and idle.
    pub fn hibernate_prepare(&self, mm: &dyn MemoryManager) -> SwapResult<HibernationPlan> {
        let limit = {
            let mut st = self.state.lock();
            st.ensure_online()?;
            if st.hibernation != HibernationPhase::Idle {
                return Err(SwapError::HibernationState);
            }
            st.hibernation = HibernationPhase::Prepared;
            st.config.quiesce_spin_limit
        };
        self.quiesced.store(true, Ordering::SeqCst);

        let mut spins = 0u32;
        while self.outs_in_flight.load(Ordering::SeqCst) > 0 {
            if spins >= limit {
                self.cancel_prepare();
                log::warn!("swap: hibernation prepare timed out waiting for swap-outs");
                return Err(SwapError::TimedOut);
            }
            spins += 1;
            core::hint::spin_loop();
        }

        let resident = mm.resident_page_count();
        let plan = {
            let st = self.state.lock();
            let per_page = extent_sectors_for(st.superblock.page_bytes() as usize);
            HibernationPlan {
                resident_pages: resident,
                free_pages: st.superblock.free_pages,
                required_sectors: resident.saturating_mul(per_page),
                free_sectors: st.pool.active_free_sectors(),
            }
        };
        if plan.resident_pages > plan.free_pages || plan.required_sectors > plan.free_sectors {
            self.cancel_prepare();
            log::warn!(
                "swap: hibernation needs {} pages / {} sectors, have {} / {}",
                plan.resident_pages,
                plan.required_sectors,
                plan.free_pages,
                plan.free_sectors
            );
            return Err(SwapError::InsufficientCapacity);
        }
        log::info!("swap: hibernation prepared for {} pages", resident);
        Ok(plan)
    }

    fn cancel_prepare(&self) {
        self.state.lock().hibernation = HibernationPhase::Idle;
        self.quiesced.store(false, Ordering::SeqCst);
    }

    /// Write every resident page and persist the image marker.
    ///
    /// Returns the number of pages written. On failure the phase stays
    /// `Prepared`; call [`SwapSpace::hibernate_abort`] to discard the
    /// partial image.
    pub fn hibernate_enter(&self, mm: &dyn MemoryManager) -> SwapResult<u64> {
        {
            let st = self.state.lock();
            st.ensure_online()?;
            if st.hibernation != HibernationPhase::Prepared {
                return Err(SwapError::HibernationState);
            }
        }
        let mut written = 0u64;
        mm.for_each_resident_page(&mut |address: u64, pid: u32, data: &[u8]| -> SwapResult<()> {
            self.store_page(
                PageKey::new(address, pid),
                data,
                PriorityClass::Critical,
                EntryFlags::HIBERNATION,
            )?;
            written += 1;
            Ok(())
        })
        .map_err(|e| {
            log::error!("swap: hibernation image write failed: {}", e);
            e
        })?;

        let mut st = self.state.lock();
        st.superblock.flags.insert(SuperblockFlags::HIBERNATED);
        self.checkpoint_locked(&mut st)?;
        let staged = st.stage_superblock();
        self.write_superblock(staged)?;
        st.hibernation = HibernationPhase::Entered;
        log::info!("swap: hibernation image of {} pages written", written);
        Ok(written)
    }

    /// Restore a hibernation image into memory.
    ///
    /// Each page is read back, handed to the memory manager and released.
    /// On any failure the rest of the image is discarded, the marker is
    /// cleared and the error is returned.
    pub fn hibernate_resume(&self, mm: &dyn MemoryManager) -> SwapResult<ResumeReport> {
        let keys = {
            let mut st = self.state.lock();
            st.ensure_online()?;
            if !st.superblock.is_hibernated() {
                return Err(SwapError::NoHibernationImage);
            }
            if st.hibernation != HibernationPhase::Idle {
                return Err(SwapError::HibernationState);
            }
            st.hibernation = HibernationPhase::Resuming;
            if st.quarantine.values().any(is_image_page) {
                drop(st);
                return self.fail_resume(SwapError::DataChecksumMismatch);
            }
            image_keys(&st)
        };
        self.quiesced.store(true, Ordering::SeqCst);

        let mut report = ResumeReport::default();
        for key in keys {
            let step = self
                .swap_in_vec(key.address, key.pid)
                .and_then(|data| mm.restore_page(key.address, key.pid, &data))
                .and_then(|()| self.swap_free(key.address, key.pid));
            if let Err(err) = step {
                log::error!("swap: resume failed at {}: {}", key, err);
                return self.fail_resume(err);
            }
            report.restored += 1;
        }

        {
            let mut st = self.state.lock();
            st.superblock.flags.remove(SuperblockFlags::HIBERNATED);
            st.hibernation = HibernationPhase::Idle;
            self.checkpoint_locked(&mut st)?;
            let staged = st.stage_superblock();
            self.write_superblock(staged)?;
        }
        self.quiesced.store(false, Ordering::SeqCst);
        log::info!("swap: resumed {} pages from hibernation", report.restored);
        Ok(report)
    }

    fn fail_resume(&self, err: SwapError) -> SwapResult<ResumeReport> {
        self.discard_image()?;
        self.quiesced.store(false, Ordering::SeqCst);
        Err(err)
    }

    /// Abandon a prepared or entered hibernation, discarding any image
    pub fn hibernate_abort(&self) -> SwapResult<()> {
        {
            let st = self.state.lock();
            st.ensure_online()?;
            match st.hibernation {
                HibernationPhase::Prepared | HibernationPhase::Entered => {}
                _ => return Err(SwapError::HibernationState),
            }
        }
        self.discard_image()?;
        self.quiesced.store(false, Ordering::SeqCst);
        log::info!("swap: hibernation aborted");
        Ok(())
    }

    /// Free every hibernation page, clear the marker and go idle
    fn discard_image(&self) -> SwapResult<()> {
        let mut st = self.state.lock();
        let mut keys = image_keys(&st);
        keys.extend(
            st.quarantine
                .values()
                .filter(|q| is_image_page(q))
                .map(|q| q.key),
        );
        for key in &keys {
            self.free_locked(&mut st, *key)?;
        }
        st.superblock.flags.remove(SuperblockFlags::HIBERNATED);
        st.hibernation = HibernationPhase::Idle;
        self.checkpoint_locked(&mut st)?;
        let staged = st.stage_superblock();
        self.write_superblock(staged)?;
        if !keys.is_empty() {
            log::warn!("swap: discarded {} hibernation pages", keys.len());
        }
        Ok(())
    }
}

fn is_image_page(entry: &MetadataEntry) -> bool {
    entry.flags.contains(EntryFlags::HIBERNATION)
}

fn image_keys(st: &SpaceState) -> Vec<PageKey> {
    st.index
        .sorted()
        .into_iter()
        .filter(is_image_page)
        .map(|e| e.key)
        .collect()
}
