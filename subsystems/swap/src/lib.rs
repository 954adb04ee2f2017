//! # Swap2: Compressed, Integrity-Checked Swap
//!
//! Swap2 moves memory pages between RAM and one or more block devices.
//! Every stored page carries a self-describing header with checksums over
//! both header and payload, so corruption is detected on the way back in
//! instead of being handed to a process.
//!
//! ## Features
//!
//! - Per-page compression through pluggable codecs, with an adaptive mode
//!   that keeps only worthwhile results
//! - CRC32C, SHA-256 or BLAKE3 integrity (truncated to 32 bits on disk)
//! - Multiple prioritized devices with fallback and forced evacuation
//! - Write-ahead journal plus double-slotted metadata checkpoints for
//!   crash recovery
//! - Point-in-time snapshots and hibernation images
//! - Lock-free statistics and sysctl-style tunables
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        SwapSpace (space.rs)                       │
//! │   format / mount / start / unmount   swap_out / swap_in / free    │
//! ├──────────────┬───────────────┬──────────────┬─────────────────────┤
//! │  snapshot.rs │  hibernate.rs │   config.rs  │      stats.rs       │
//! ├──────────────┴───────┬───────┴──────────────┴─────────────────────┤
//! │   index.rs           │  journal.rs            │   codec.rs        │
//! │   MetadataIndex      │  Journal + Checkpoint  │   CodecRegistry   │
//! ├──────────────────────┼────────────────────────┼───────────────────┤
//! │   pool.rs            │  superblock.rs         │   header.rs       │
//! │   DevicePool/Extent  │  on-disk root          │   page extents    │
//! ├──────────────────────┴────────────────────────┴───────────────────┤
//! │   device.rs (BlockDevice)   checksum.rs   platform.rs   error.rs  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout (primary device)
//!
//! ```text
//! 0            64 KiB                 +journal           +metadata
//! ├─ superblock ─┼──── journal ring ────┼─ checkpoint A | B ─┼─ data ─►
//! ```
//!
//! Additional devices hold data extents only. Each extent is a 68-byte
//! page header followed by the (possibly compressed) payload, padded to
//! whole 512-byte sectors.
//!
//! ## Usage
//!
//! ```text
//! SwapSpace::format(&dev, &platform, &FormatOptions::new(pages, 4096))?;
//! let space = SwapSpace::mount(dev.clone(), platform)?;
//! space.add_device("sda2", dev, start, sectors, 10)?;
//! space.start()?;
//! space.swap_out(addr, pid, &page, PriorityClass::Normal)?;
//! space.swap_in(addr, pid, &mut buf)?;
//! space.swap_free(addr, pid)?;
//! space.unmount()?;
//! ```

#![no_std]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULES
// =============================================================================

pub mod checksum;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod header;
pub mod hibernate;
pub mod index;
pub mod journal;
pub mod platform;
pub mod pool;
pub mod snapshot;
pub mod space;
pub mod stats;
pub mod superblock;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use checksum::{checksum, ChecksumAlg, Crc32c};
pub use codec::{Codec, CodecRegistry, Compressed, CompressionAlg};
pub use config::{SwapConfig, PARAM_NAMES};
pub use device::{BlockDevice, MemBlockDevice, SECTOR_SIZE};
pub use error::{SwapError, SwapResult};
pub use header::{PageFlags, PageHeader, PAGE_HEADER_SIZE};
pub use hibernate::{HibernationPhase, HibernationPlan, ResumeReport};
pub use index::{EntryFlags, MetadataEntry, PageKey, PageState, PriorityClass};
pub use platform::{AccessGate, DeviceOp, MemoryManager, PageVisitor, Platform};
pub use pool::{DeviceId, DeviceInfo, Extent};
pub use snapshot::{Snapshot, SnapshotInfo};
pub use space::{
    FormatOptions, Lifecycle, RecoveryReport, RemovalReport, SwapOutReceipt, SwapSpace,
};
pub use stats::{StatsSnapshot, SwapStats};
pub use superblock::{PageSize, Superblock, SuperblockFlags, SWAP_MAGIC, SWAP_VERSION};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
