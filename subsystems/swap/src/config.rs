//! Swap tunables.
//!
//! Tunables are read and written as a whole struct or one parameter at a
//! time by name (sysctl style). They persist as a checksummed record at
//! the start of the superblock's reserved area.

use core::fmt;

use crate::checksum::{ChecksumAlg, Crc32c};
use crate::codec::CompressionAlg;
use crate::error::{SwapError, SwapResult};
use crate::superblock::{le_u32, RESERVED_SIZE};

const CONFIG_MAGIC: u32 = 0x5357_4346; // "SWCF"
const CONFIG_VERSION: u32 = 1;
const CONFIG_RECORD_SIZE: usize = 32;

/// Parameter names accepted by `get_param`/`set_param`
pub const PARAM_NAMES: [&str; 8] = [
    "compression",
    "checksum",
    "adaptive_min_savings_pct",
    "sync_superblock",
    "journal_enabled",
    "quiesce_spin_limit",
    "max_devices",
    "swappiness",
];

/// Swap tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapConfig {
    /// Algorithm applied by swap_out
    pub compression: CompressionAlg,
    /// Integrity algorithm for new pages
    pub checksum: ChecksumAlg,
    /// Minimum saving (percent) for adaptive compression to keep codec output
    pub adaptive_min_savings_pct: u8,
    /// Persist the superblock on every counter change
    pub sync_superblock: bool,
    /// Journal index mutations
    pub journal_enabled: bool,
    /// Spin iterations bounding quiescence waits
    pub quiesce_spin_limit: u32,
    /// Maximum attached devices
    pub max_devices: u32,
    /// Reclaim preference hint for the memory manager (0..=100)
    pub swappiness: u8,
}

impl SwapConfig {
    /// Defaults for a space formatted with the given algorithms
    pub const fn with_algorithms(compression: CompressionAlg, checksum: ChecksumAlg) -> Self {
        Self {
            compression,
            checksum,
            adaptive_min_savings_pct: 0,
            sync_superblock: true,
            journal_enabled: true,
            quiesce_spin_limit: 1 << 20,
            max_devices: 8,
            swappiness: 60,
        }
    }

    /// Check every value is in range
    pub fn validate(&self) -> SwapResult<()> {
        if self.adaptive_min_savings_pct > 100 || self.swappiness > 100 {
            return Err(SwapError::InvalidArgument);
        }
        if self.max_devices == 0 || self.quiesce_spin_limit == 0 {
            return Err(SwapError::InvalidArgument);
        }
        Ok(())
    }

    /// Read one parameter by name
    pub fn get_param(&self, name: &str) -> SwapResult<u64> {
        Ok(match name {
            "compression" => self.compression.as_u32() as u64,
            "checksum" => self.checksum.as_u32() as u64,
            "adaptive_min_savings_pct" => self.adaptive_min_savings_pct as u64,
            "sync_superblock" => self.sync_superblock as u64,
            "journal_enabled" => self.journal_enabled as u64,
            "quiesce_spin_limit" => self.quiesce_spin_limit as u64,
            "max_devices" => self.max_devices as u64,
            "swappiness" => self.swappiness as u64,
            _ => return Err(SwapError::InvalidArgument),
        })
    }

    /// Write one parameter by name, validating the result
    pub fn set_param(&mut self, name: &str, value: u64) -> SwapResult<()> {
        let mut next = *self;
        let small = |v: u64| u32::try_from(v).map_err(|_| SwapError::InvalidArgument);
        let byte = |v: u64| u8::try_from(v).map_err(|_| SwapError::InvalidArgument);
        let flag = |v: u64| match v {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SwapError::InvalidArgument),
        };
        match name {
            "compression" => {
                next.compression = CompressionAlg::from_u32(small(value)?)
                    .map_err(|_| SwapError::InvalidArgument)?
            }
            "checksum" => {
                next.checksum = ChecksumAlg::from_u32(small(value)?)
                    .map_err(|_| SwapError::InvalidArgument)?
            }
            "adaptive_min_savings_pct" => next.adaptive_min_savings_pct = byte(value)?,
            "sync_superblock" => next.sync_superblock = flag(value)?,
            "journal_enabled" => next.journal_enabled = flag(value)?,
            "quiesce_spin_limit" => next.quiesce_spin_limit = small(value)?,
            "max_devices" => next.max_devices = small(value)?,
            "swappiness" => next.swappiness = byte(value)?,
            _ => return Err(SwapError::InvalidArgument),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Store the record at the start of a superblock reserved area
    pub fn save_to(&self, reserved: &mut [u8; RESERVED_SIZE]) {
        let b = &mut reserved[..CONFIG_RECORD_SIZE];
        b.fill(0);
        b[0..4].copy_from_slice(&CONFIG_MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&CONFIG_VERSION.to_le_bytes());
        b[8..12].copy_from_slice(&self.compression.as_u32().to_le_bytes());
        b[12..16].copy_from_slice(&self.checksum.as_u32().to_le_bytes());
        b[16] = self.adaptive_min_savings_pct;
        b[17] = self.sync_superblock as u8;
        b[18] = self.journal_enabled as u8;
        b[19] = self.swappiness;
        b[20..24].copy_from_slice(&self.quiesce_spin_limit.to_le_bytes());
        b[24..28].copy_from_slice(&self.max_devices.to_le_bytes());
        let crc = Crc32c::hash(&b[..28]);
        b[28..32].copy_from_slice(&crc.to_le_bytes());
    }

    /// Load a record saved by [`SwapConfig::save_to`].
    ///
    /// Returns [`SwapError::NotFound`] when nothing was saved and
    /// [`SwapError::ConfigCorrupt`] when the record fails validation.
    pub fn load_from(reserved: &[u8; RESERVED_SIZE]) -> SwapResult<Self> {
        let b = &reserved[..CONFIG_RECORD_SIZE];
        if le_u32(b, 0) != CONFIG_MAGIC {
            return Err(SwapError::NotFound);
        }
        if le_u32(b, 4) != CONFIG_VERSION || Crc32c::hash(&b[..28]) != le_u32(b, 28) {
            return Err(SwapError::ConfigCorrupt);
        }
        let cfg = Self {
            compression: CompressionAlg::from_u32(le_u32(b, 8))
                .map_err(|_| SwapError::ConfigCorrupt)?,
            checksum: ChecksumAlg::from_u32(le_u32(b, 12)).map_err(|_| SwapError::ConfigCorrupt)?,
            adaptive_min_savings_pct: b[16],
            sync_superblock: b[17] != 0,
            journal_enabled: b[18] != 0,
            swappiness: b[19],
            quiesce_spin_limit: le_u32(b, 20),
            max_devices: le_u32(b, 24),
        };
        cfg.validate().map_err(|_| SwapError::ConfigCorrupt)?;
        Ok(cfg)
    }
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self::with_algorithms(CompressionAlg::None, ChecksumAlg::Crc32c)
    }
}

impl fmt::Display for SwapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in PARAM_NAMES {
            if let Ok(value) = self.get_param(name) {
                writeln!(f, "swap.{name} = {value}")?;
            }
        }
        Ok(())
    }
}
