//! External collaborators.
//!
//! The swap engine is architecture agnostic. Time, randomness, device
//! authorization and access to resident memory are supplied by the
//! embedding kernel through the traits below.

use crate::error::SwapResult;

/// Clock and entropy source.
pub trait Platform: Send + Sync {
    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Fill `buf` with random bytes (UUID generation)
    fn fill_random(&self, buf: &mut [u8]);
}

/// Device operation submitted to the [`AccessGate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceOp {
    /// Attach a device to the pool
    Add,
    /// Make a device eligible for allocation
    Activate,
    /// Detach a device from the pool
    Remove,
}

/// Security/audit callback consulted before device administration.
pub trait AccessGate: Send + Sync {
    /// Return `true` to allow `op` on the named device
    fn authorize(&self, device: &str, op: DeviceOp) -> bool;
}

/// Callback invoked for every resident page during hibernation.
pub type PageVisitor<'a> = dyn FnMut(u64, u32, &[u8]) -> SwapResult<()> + 'a;

/// The memory manager, as seen by the hibernation controller.
pub trait MemoryManager {
    /// Number of resident pages that a hibernation image must hold
    fn resident_page_count(&self) -> u64;

    /// Visit every resident page as `(address, pid, contents)`.
    ///
    /// Stops at and returns the first visitor error.
    fn for_each_resident_page(&self, visit: &mut PageVisitor<'_>) -> SwapResult<()>;

    /// Reinstate a page on resume
    fn restore_page(&self, address: u64, pid: u32, data: &[u8]) -> SwapResult<()>;
}

/// Build a random (version 4) UUID from platform entropy.
pub fn generate_uuid(platform: &dyn Platform) -> uuid::Uuid {
    let mut bytes = [0u8; 16];
    platform.fill_random(&mut bytes);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}
