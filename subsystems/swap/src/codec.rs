//! Codec abstraction.
//!
//! Concrete compressors live outside this crate and are plugged in through
//! the [`Codec`] trait. The registry owns algorithm selection: pass-through
//! for `None`, the compressed-size invariant for explicit algorithms, and
//! the shrink-or-fall-back rule for `Adaptive`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{SwapError, SwapResult};

// ============================================================================
// Algorithm Identifiers
// ============================================================================

/// Compression algorithm identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum CompressionAlg {
    /// Stored verbatim
    None     = 0,
    /// LZ4
    Lz4      = 1,
    /// Zstandard
    Zstd     = 2,
    /// LZMA
    Lzma     = 3,
    /// Pick the best registered codec, fall back to `None`
    Adaptive = 4,
}

impl CompressionAlg {
    /// Concrete algorithms tried by `Adaptive`, fastest first
    pub const ADAPTIVE_ORDER: [CompressionAlg; 3] = [Self::Lz4, Self::Zstd, Self::Lzma];

    /// Decode an on-disk id
    pub const fn from_u32(value: u32) -> SwapResult<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            3 => Ok(Self::Lzma),
            4 => Ok(Self::Adaptive),
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
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Lzma => "lzma",
            Self::Adaptive => "adaptive",
        }
    }

    /// Whether this id can describe stored bytes (adaptive never does)
    #[inline]
    pub const fn is_concrete(self) -> bool {
        !matches!(self, Self::Adaptive)
    }
}

impl Default for CompressionAlg {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for CompressionAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Codec Trait
// ============================================================================

/// A pluggable compressor for one concrete algorithm.
pub trait Codec: Send + Sync {
    /// Algorithm this codec implements
    fn alg(&self) -> CompressionAlg;

    /// Append the compressed form of `input` to `out`
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> SwapResult<()>;

    /// Append the decompressed form of `input` to `out`.
    ///
    /// `expected_size` is a capacity hint; the registry checks the final
    /// length itself.
    fn decompress(&self, input: &[u8], out: &mut Vec<u8>, expected_size: usize) -> SwapResult<()>;
}

/// Output of [`CodecRegistry::compress`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compressed {
    /// Algorithm actually applied (never `Adaptive`)
    pub alg: CompressionAlg,
    /// Stored bytes
    pub data: Vec<u8>,
}

// ============================================================================
// Codec Registry
// ============================================================================

/// Codecs keyed by algorithm id.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Create an empty registry (only `None` is available)
    pub fn new() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Register a codec, replacing any codec for the same algorithm
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> SwapResult<()> {
        let alg = codec.alg();
        if !alg.is_concrete() || alg == CompressionAlg::None {
            return Err(SwapError::InvalidArgument);
        }
        self.codecs.retain(|c| c.alg() != alg);
        self.codecs.push(codec);
        log::debug!("swap: registered {} codec", alg);
        Ok(())
    }

    /// Look up a codec
    pub fn get(&self, alg: CompressionAlg) -> Option<&Arc<dyn Codec>> {
        self.codecs.iter().find(|c| c.alg() == alg)
    }

    /// Whether `alg` can be used for compression right now
    pub fn supports(&self, alg: CompressionAlg) -> bool {
        match alg {
            CompressionAlg::None | CompressionAlg::Adaptive => true,
            other => self.get(other).is_some(),
        }
    }

    /// Registered algorithms
    pub fn algorithms(&self) -> Vec<CompressionAlg> {
        self.codecs.iter().map(|c| c.alg()).collect()
    }

    /// Compress `input` with `alg`.
    ///
    /// `min_savings_pct` only applies to `Adaptive`: the codec output is
    /// kept when it is strictly smaller than the input and saves at least
    /// that share of it, otherwise the page is stored verbatim.
    pub fn compress(
        &self,
        alg: CompressionAlg,
        input: &[u8],
        min_savings_pct: u8,
    ) -> SwapResult<Compressed> {
        match alg {
            CompressionAlg::None => Ok(Compressed {
                alg,
                data: input.to_vec(),
            }),
            CompressionAlg::Adaptive => {
                let codec = CompressionAlg::ADAPTIVE_ORDER
                    .iter()
                    .find_map(|candidate| self.get(*candidate));
                let Some(codec) = codec else {
                    return Ok(Compressed {
                        alg: CompressionAlg::None,
                        data: input.to_vec(),
                    });
                };
                let mut out = Vec::with_capacity(input.len());
                codec.compress(input, &mut out)?;
                let saved = input.len().saturating_sub(out.len());
                let wanted = input.len() * min_savings_pct as usize;
                if out.len() < input.len() && saved * 100 >= wanted {
                    Ok(Compressed {
                        alg: codec.alg(),
                        data: out,
                    })
                } else {
                    log::trace!(
                        "swap: adaptive fallback to none ({} -> {} bytes)",
                        input.len(),
                        out.len()
                    );
                    Ok(Compressed {
                        alg: CompressionAlg::None,
                        data: input.to_vec(),
                    })
                }
            }
            explicit => {
                let codec = self.get(explicit).ok_or(SwapError::CodecUnavailable)?;
                let mut out = Vec::with_capacity(input.len());
                codec.compress(input, &mut out)?;
                if out.len() > input.len() {
                    return Err(SwapError::CompressionInvariant);
                }
                Ok(Compressed {
                    alg: explicit,
                    data: out,
                })
            }
        }
    }

    /// Decompress `input` stored with `alg`.
    ///
    /// An output length different from `expected_size` is reported as
    /// [`SwapError::SizeMismatch`] (corruption), distinct from a codec
    /// fault.
    pub fn decompress(
        &self,
        alg: CompressionAlg,
        input: &[u8],
        expected_size: usize,
    ) -> SwapResult<Vec<u8>> {
        let out = match alg {
            CompressionAlg::None => input.to_vec(),
            CompressionAlg::Adaptive => return Err(SwapError::UnsupportedAlgorithm),
            explicit => {
                let codec = self.get(explicit).ok_or(SwapError::CodecUnavailable)?;
                let mut out = Vec::with_capacity(expected_size);
                codec
                    .decompress(input, &mut out, expected_size)
                    .map_err(|_| SwapError::DecompressionFailed)?;
                out
            }
        };
        if out.len() != expected_size {
            return Err(SwapError::SizeMismatch);
        }
        Ok(out)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("algorithms", &self.algorithms())
            .finish()
    }
}
