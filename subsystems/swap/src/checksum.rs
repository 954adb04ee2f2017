//! Checksum engine.
//!
//! Integrity codes are 32 bits wide on disk regardless of algorithm:
//! - CRC32C (default, table driven, no dependencies)
//! - SHA-256 (first four digest bytes, little endian)
//! - BLAKE3 (first four digest bytes, little endian)
//!
//! Any field that is itself checksummed must be zeroed before the code is
//! computed, so generation and verification see identical bytes.

use core::fmt;

use sha2::{Digest, Sha256};

use crate::error::{SwapError, SwapResult};

// ============================================================================
// CRC32C Implementation
// ============================================================================

/// CRC32C lookup table (Castagnoli polynomial)
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let polynomial: u32 = 0x82F63B78; // Castagnoli polynomial (reversed)
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ polynomial;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Streaming CRC32C calculator.
#[derive(Clone, Debug)]
pub struct Crc32c {
    crc: u32,
}

impl Crc32c {
    /// Create new CRC calculator
    #[inline]
    pub const fn new() -> Self {
        Self { crc: !0u32 }
    }

    /// Update with data
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.crc ^ byte as u32) & 0xFF) as usize;
            self.crc = (self.crc >> 8) ^ CRC32C_TABLE[index];
        }
    }

    /// Feed `len` zero bytes without materialising them
    pub fn update_zeros(&mut self, len: usize) {
        for _ in 0..len {
            let index = (self.crc & 0xFF) as usize;
            self.crc = (self.crc >> 8) ^ CRC32C_TABLE[index];
        }
    }

    /// Finalize and return checksum
    #[inline]
    pub fn finish(self) -> u32 {
        !self.crc
    }

    /// One-shot checksum
    #[inline]
    pub fn hash(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finish()
    }
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Algorithm Selection
// ============================================================================

/// Checksum algorithm identifier, as stored in the superblock and page
/// headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ChecksumAlg {
    /// CRC32C (Castagnoli)
    Crc32c = 1,
    /// SHA-256, truncated
    Sha256 = 2,
    /// BLAKE3, truncated
    Blake3 = 3,
}

impl ChecksumAlg {
    /// All supported algorithms
    pub const ALL: [ChecksumAlg; 3] = [Self::Crc32c, Self::Sha256, Self::Blake3];

    /// Decode an on-disk id
    pub const fn from_u32(value: u32) -> SwapResult<Self> {
        match value {
            1 => Ok(Self::Crc32c),
            2 => Ok(Self::Sha256),
            3 => Ok(Self::Blake3),
            _ => Err(SwapError::UnsupportedAlgorithm),
        }
    }

    /// On-disk id
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Short name used in dumps and config
    pub const fn name(self) -> &'static str {
        match self {
            Self::Crc32c => "crc32c",
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Compute the 32-bit integrity code of `data`
    pub fn compute(self, data: &[u8]) -> u32 {
        match self {
            Self::Crc32c => Crc32c::hash(data),
            Self::Sha256 => {
                let digest = Sha256::digest(data);
                u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
            }
            Self::Blake3 => {
                let digest = blake3::hash(data);
                let bytes = digest.as_bytes();
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
        }
    }

    /// Compute the code of `data` as if `data[field..field + 4]` were zero
    pub fn compute_zeroed(self, data: &[u8], field: usize) -> u32 {
        match self {
            Self::Crc32c => {
                let mut crc = Crc32c::new();
                crc.update(&data[..field]);
                crc.update_zeros(4);
                crc.update(&data[field + 4..]);
                crc.finish()
            }
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(&data[..field]);
                hasher.update([0u8; 4]);
                hasher.update(&data[field + 4..]);
                let digest = hasher.finalize();
                u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
            }
            Self::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&data[..field]);
                hasher.update(&[0u8; 4]);
                hasher.update(&data[field + 4..]);
                let digest = hasher.finalize();
                let bytes = digest.as_bytes();
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
        }
    }

    /// Verify `data` against an expected code
    #[inline]
    pub fn verify(self, data: &[u8], expected: u32) -> bool {
        self.compute(data) == expected
    }
}

impl Default for ChecksumAlg {
    fn default() -> Self {
        Self::Crc32c
    }
}

impl fmt::Display for ChecksumAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compute the integrity code of `data` with `alg`.
#[inline]
pub fn checksum(alg: ChecksumAlg, data: &[u8]) -> u32 {
    alg.compute(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_known_vector() {
        assert_eq!(Crc32c::hash(b"123456789"), 0xE306_9283);
        assert_eq!(Crc32c::hash(b""), 0);
    }

    #[test]
    fn test_crc32c_streaming_matches_oneshot() {
        let data = b"swap pages are stored with a header and payload";
        let mut crc = Crc32c::new();
        crc.update(&data[..10]);
        crc.update(&data[10..]);
        assert_eq!(crc.finish(), Crc32c::hash(data));
    }

    #[test]
    fn test_zeroed_field_is_symmetric() {
        let mut buf = [0xA5u8; 64];
        for alg in ChecksumAlg::ALL {
            buf[20..24].copy_from_slice(&[1, 2, 3, 4]);
            let with_field = alg.compute_zeroed(&buf, 20);
            buf[20..24].copy_from_slice(&[0; 4]);
            assert_eq!(with_field, alg.compute(&buf), "{alg}");
        }
    }

    #[test]
    fn test_algorithms_detect_flips() {
        let data = [7u8; 512];
        let mut flipped = data;
        flipped[300] ^= 0x10;
        for alg in ChecksumAlg::ALL {
            let code = checksum(alg, &data);
            assert!(alg.verify(&data, code));
            assert!(!alg.verify(&flipped, code));
        }
    }

    #[test]
    fn test_ids_roundtrip() {
        for alg in ChecksumAlg::ALL {
            assert_eq!(ChecksumAlg::from_u32(alg.as_u32()), Ok(alg));
        }
        assert_eq!(ChecksumAlg::from_u32(0), Err(SwapError::UnsupportedAlgorithm));
    }
}
