//! Swap statistics.
//!
//! Counters are monotonic and lock free; they are only reset on explicit
//! request. `active_devices` is a gauge refreshed by the pool owner.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Relaxed ordering - counters need no synchronization
const RELAXED: Ordering = Ordering::Relaxed;

// ============================================================================
// Atomic Counter
// ============================================================================

/// Atomic monotonic counter.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    /// Create a new counter with initial value
    #[inline]
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Load current value
    #[inline]
    pub fn load(&self) -> u64 {
        self.value.load(RELAXED)
    }

    /// Store a new value
    #[inline]
    pub fn store(&self, value: u64) {
        self.value.store(value, RELAXED);
    }

    /// Increment and return new value
    #[inline]
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, RELAXED) + 1
    }

    /// Add a value and return new value
    #[inline]
    pub fn add(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, RELAXED) + delta
    }

    /// Reset to zero, returning the old value
    #[inline]
    pub fn reset(&self) -> u64 {
        self.value.swap(0, RELAXED)
    }
}

// ============================================================================
// Swap Statistics
// ============================================================================

/// Live counters of one swap space.
#[derive(Debug, Default)]
pub struct SwapStats {
    /// Pages written to swap
    pub pages_out: AtomicCounter,
    /// Pages read back from swap
    pub pages_in: AtomicCounter,
    /// Pages released by swap_free
    pub pages_freed: AtomicCounter,
    /// Uncompressed bytes written
    pub bytes_out: AtomicCounter,
    /// Bytes returned to callers
    pub bytes_in: AtomicCounter,
    /// Payload bytes written to devices
    pub bytes_stored: AtomicCounter,
    /// Pages stored with a codec
    pub compressed_pages: AtomicCounter,
    /// Header or data checksum failures
    pub checksum_errors: AtomicCounter,
    /// Journal records appended
    pub journal_entries: AtomicCounter,
    /// Checkpoints written
    pub checkpoints: AtomicCounter,
    /// Active devices (gauge)
    pub active_devices: AtomicCounter,
    /// Summed swap-out and swap-in latency
    pub latency_total_ns: AtomicCounter,
    /// Latency samples
    pub latency_samples: AtomicCounter,
}

impl SwapStats {
    /// Create zeroed statistics
    pub const fn new() -> Self {
        Self {
            pages_out: AtomicCounter::new(0),
            pages_in: AtomicCounter::new(0),
            pages_freed: AtomicCounter::new(0),
            bytes_out: AtomicCounter::new(0),
            bytes_in: AtomicCounter::new(0),
            bytes_stored: AtomicCounter::new(0),
            compressed_pages: AtomicCounter::new(0),
            checksum_errors: AtomicCounter::new(0),
            journal_entries: AtomicCounter::new(0),
            checkpoints: AtomicCounter::new(0),
            active_devices: AtomicCounter::new(0),
            latency_total_ns: AtomicCounter::new(0),
            latency_samples: AtomicCounter::new(0),
        }
    }

    /// Record one timed operation
    #[inline]
    pub fn record_latency(&self, ns: u64) {
        self.latency_total_ns.add(ns);
        self.latency_samples.increment();
    }

    /// Consistent-enough copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages_out: self.pages_out.load(),
            pages_in: self.pages_in.load(),
            pages_freed: self.pages_freed.load(),
            bytes_out: self.bytes_out.load(),
            bytes_in: self.bytes_in.load(),
            bytes_stored: self.bytes_stored.load(),
            compressed_pages: self.compressed_pages.load(),
            checksum_errors: self.checksum_errors.load(),
            journal_entries: self.journal_entries.load(),
            checkpoints: self.checkpoints.load(),
            active_devices: self.active_devices.load(),
            latency_total_ns: self.latency_total_ns.load(),
            latency_samples: self.latency_samples.load(),
        }
    }

    /// Zero every counter except the device gauge
    pub fn reset(&self) {
        self.pages_out.reset();
        self.pages_in.reset();
        self.pages_freed.reset();
        self.bytes_out.reset();
        self.bytes_in.reset();
        self.bytes_stored.reset();
        self.compressed_pages.reset();
        self.checksum_errors.reset();
        self.journal_entries.reset();
        self.checkpoints.reset();
        self.latency_total_ns.reset();
        self.latency_samples.reset();
    }
}

/// Point-in-time copy of [`SwapStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Pages written to swap
    pub pages_out: u64,
    /// Pages read back from swap
    pub pages_in: u64,
    /// Pages released by swap_free
    pub pages_freed: u64,
    /// Uncompressed bytes written
    pub bytes_out: u64,
    /// Bytes returned to callers
    pub bytes_in: u64,
    /// Payload bytes written to devices
    pub bytes_stored: u64,
    /// Pages stored with a codec
    pub compressed_pages: u64,
    /// Header or data checksum failures
    pub checksum_errors: u64,
    /// Journal records appended
    pub journal_entries: u64,
    /// Checkpoints written
    pub checkpoints: u64,
    /// Active devices
    pub active_devices: u64,
    /// Summed latency
    pub latency_total_ns: u64,
    /// Latency samples
    pub latency_samples: u64,
}

impl StatsSnapshot {
    /// Aggregate stored/original ratio in thousandths (1000 = no savings)
    pub fn compression_ratio_permille(&self) -> u64 {
        if self.bytes_out == 0 {
            return 1000;
        }
        self.bytes_stored * 1000 / self.bytes_out
    }

    /// Average operation latency
    pub fn average_latency_ns(&self) -> u64 {
        if self.latency_samples == 0 {
            return 0;
        }
        self.latency_total_ns / self.latency_samples
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Swap2 statistics")?;
        writeln!(f, "  pages out/in/freed: {}/{}/{}", self.pages_out, self.pages_in, self.pages_freed)?;
        writeln!(f, "  bytes out/in:       {}/{}", self.bytes_out, self.bytes_in)?;
        writeln!(
            f,
            "  stored bytes:       {} (ratio {}\u{2030}, {} compressed pages)",
            self.bytes_stored,
            self.compression_ratio_permille(),
            self.compressed_pages
        )?;
        writeln!(f, "  checksum errors:    {}", self.checksum_errors)?;
        writeln!(f, "  journal entries:    {} ({} checkpoints)", self.journal_entries, self.checkpoints)?;
        writeln!(f, "  active devices:     {}", self.active_devices)?;
        write!(f, "  average latency:    {} ns", self.average_latency_ns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_counter_ops() {
        let c = AtomicCounter::new(5);
        assert_eq!(c.increment(), 6);
        assert_eq!(c.add(4), 10);
        assert_eq!(c.reset(), 10);
        assert_eq!(c.load(), 0);
    }

    #[test]
    fn test_derived_values() {
        let stats = SwapStats::new();
        let empty = stats.snapshot();
        assert_eq!(empty.compression_ratio_permille(), 1000);
        assert_eq!(empty.average_latency_ns(), 0);

        stats.bytes_out.add(8192);
        stats.bytes_stored.add(2048);
        stats.record_latency(100);
        stats.record_latency(300);
        let snap = stats.snapshot();
        assert_eq!(snap.compression_ratio_permille(), 250);
        assert_eq!(snap.average_latency_ns(), 200);
        assert!(snap.to_string().contains("ratio 250"));
    }

    #[test]
    fn test_reset_keeps_gauge() {
        let stats = SwapStats::new();
        stats.pages_out.add(3);
        stats.active_devices.store(2);
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.pages_out, 0);
        assert_eq!(snap.active_devices, 2);
    }
}
