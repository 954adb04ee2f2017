//! Error types and result handling for Swap2.
//!
//! Every failure path in the subsystem returns a distinct [`SwapError`]
//! variant. Callers branch on the exact cause (backpressure on capacity
//! errors, refusing a device on format errors, quarantining on integrity
//! errors), so nothing is collapsed into a generic error.

use core::fmt;

/// Result type alias for swap operations.
pub type SwapResult<T> = Result<T, SwapError>;

/// Error type for swap operations.
///
/// Codes are grouped by category so the numeric value alone tells the
/// caller which class of failure occurred.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum SwapError {
    // ========================================================================
    // General Errors (0-99)
    // ========================================================================
    /// Invalid argument
    InvalidArgument        = 1,

    /// Operation not valid in the current state
    InvalidState           = 2,

    /// Bounded wait expired
    TimedOut               = 3,

    /// Internal accounting error (bug in swap code)
    Internal               = 4,

    // ========================================================================
    // Format Errors (100-199)
    // ========================================================================
    /// Device does not hold a swap space
    BadMagic               = 100,

    /// Superblock version is not the one this code understands
    IncompatibleVersion    = 101,

    /// Page size is not 4, 8, 16 or 32 KiB
    UnsupportedPageSize    = 102,

    /// Unknown compression or checksum algorithm id
    UnsupportedAlgorithm   = 103,

    // ========================================================================
    // Integrity Errors (200-299)
    // ========================================================================
    /// Superblock checksum mismatch
    SuperblockCorrupt      = 200,

    /// Page header checksum mismatch
    HeaderChecksumMismatch = 201,

    /// Page data checksum mismatch
    DataChecksumMismatch   = 202,

    /// Decompressed size differs from the recorded size
    SizeMismatch           = 203,

    /// Page header belongs to a different (address, pid)
    MisdirectedPage        = 204,

    /// Metadata checkpoint failed validation
    CheckpointCorrupt      = 205,

    /// Saved configuration record failed validation
    ConfigCorrupt          = 206,

    // ========================================================================
    // Capacity Errors (300-399)
    // ========================================================================
    /// No active device has room for the page
    NoSpace                = 300,

    /// Targeted device has no room
    DeviceFull             = 301,

    /// Device pool is at its configured limit
    TooManyDevices         = 302,

    /// Metadata checkpoint region cannot hold the index
    MetadataRegionFull     = 303,

    // ========================================================================
    // Device I/O Errors (400-499)
    // ========================================================================
    /// Device returned fewer bytes than requested
    ShortRead              = 400,

    /// Device accepted fewer bytes than requested
    ShortWrite             = 401,

    /// Access beyond the end of the device
    OutOfRange             = 402,

    /// Device reported a media or transport error
    DeviceIo               = 403,

    /// Device referenced by metadata is not attached
    DeviceMissing          = 404,

    // ========================================================================
    // Logical Errors (500-599)
    // ========================================================================
    /// No metadata entry for the page
    NotFound               = 500,

    /// Key or name already registered
    AlreadyExists          = 501,

    /// Caller buffer is smaller than the stored page
    BufferTooSmall         = 502,

    /// Device name is not in the pool
    DeviceNotFound         = 503,

    /// Device or page is in use
    DeviceBusy             = 504,

    /// Page was quarantined after an integrity failure
    PageQuarantined        = 505,

    /// Access gate refused the operation
    AccessDenied           = 506,

    // ========================================================================
    // Lifecycle Errors (600-699)
    // ========================================================================
    /// Swap space has not been started or was unmounted
    NotOnline              = 600,

    /// Swap space was already started
    AlreadyOnline          = 601,

    /// Dirty space must be recovered before this operation
    RecoveryRequired       = 602,

    /// Swap-out traffic is quiesced for hibernation
    Quiesced               = 603,

    // ========================================================================
    // Snapshot Errors (700-799)
    // ========================================================================
    /// Snapshot not found
    SnapshotNotFound       = 700,

    /// Snapshot already exists
    SnapshotExists         = 701,

    /// Device storage is pinned by a snapshot
    SnapshotPinned         = 702,

    // ========================================================================
    // Hibernation Errors (800-899)
    // ========================================================================
    /// Superblock carries no hibernation marker
    NoHibernationImage     = 800,

    /// Not enough swap for a full memory image
    InsufficientCapacity   = 801,

    /// Hibernation phase does not allow this step
    HibernationState       = 802,

    // ========================================================================
    // Codec Errors (900-999)
    // ========================================================================
    /// No codec registered for the algorithm
    CodecUnavailable       = 900,

    /// Codec output violates compressed <= original
    CompressionInvariant   = 901,

    /// Codec failed to compress
    CompressionFailed      = 902,

    /// Codec failed to decompress
    DecompressionFailed    = 903,
}

impl SwapError {
    /// Numeric error code
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Convert error code to errno-compatible value
    pub const fn to_errno(self) -> i32 {
        match self {
            Self::NotFound | Self::DeviceNotFound | Self::SnapshotNotFound => 2, // ENOENT
            Self::NoHibernationImage => 2,                                     // ENOENT
            Self::ShortRead | Self::ShortWrite | Self::DeviceIo => 5,          // EIO
            Self::DeviceMissing => 6,                                          // ENXIO
            Self::Quiesced => 11,                                              // EAGAIN
            Self::AccessDenied => 13,                                          // EACCES
            Self::DeviceBusy | Self::SnapshotPinned => 16,                     // EBUSY
            Self::AlreadyExists | Self::SnapshotExists => 17,                  // EEXIST
            Self::InvalidArgument | Self::BufferTooSmall => 22,                // EINVAL
            Self::UnsupportedPageSize | Self::UnsupportedAlgorithm => 22,      // EINVAL
            Self::NoSpace | Self::DeviceFull | Self::MetadataRegionFull => 28, // ENOSPC
            Self::InsufficientCapacity | Self::TooManyDevices => 28,           // ENOSPC
            Self::OutOfRange => 34,                                            // ERANGE
            Self::CodecUnavailable => 95,                                      // EOPNOTSUPP
            Self::TimedOut => 110,                                             // ETIMEDOUT
            Self::BadMagic | Self::IncompatibleVersion => 117,                 // EUCLEAN
            Self::SuperblockCorrupt | Self::CheckpointCorrupt => 117,          // EUCLEAN
            Self::HeaderChecksumMismatch | Self::DataChecksumMismatch => 74,   // EBADMSG
            Self::SizeMismatch | Self::MisdirectedPage => 74,                  // EBADMSG
            _ => 5,                                                            // EIO
        }
    }

    /// Get human-readable error message
    pub const fn message(self) -> &'static str {
        match self {
            Self::InvalidArgument => "Invalid argument",
            Self::InvalidState => "Invalid state",
            Self::TimedOut => "Timed out",
            Self::Internal => "Internal error",
            Self::BadMagic => "Not a swap space",
            Self::IncompatibleVersion => "Incompatible swap version",
            Self::UnsupportedPageSize => "Unsupported page size",
            Self::UnsupportedAlgorithm => "Unsupported algorithm",
            Self::SuperblockCorrupt => "Superblock corrupt",
            Self::HeaderChecksumMismatch => "Page header checksum mismatch",
            Self::DataChecksumMismatch => "Page data checksum mismatch",
            Self::SizeMismatch => "Decompressed size mismatch",
            Self::MisdirectedPage => "Page header names another page",
            Self::CheckpointCorrupt => "Metadata checkpoint corrupt",
            Self::ConfigCorrupt => "Saved configuration corrupt",
            Self::NoSpace => "No swap space available",
            Self::DeviceFull => "Device full",
            Self::TooManyDevices => "Too many swap devices",
            Self::MetadataRegionFull => "Metadata region full",
            Self::ShortRead => "Short read",
            Self::ShortWrite => "Short write",
            Self::OutOfRange => "Access beyond end of device",
            Self::DeviceIo => "Device I/O error",
            Self::DeviceMissing => "Device not attached",
            Self::NotFound => "No such swapped page",
            Self::AlreadyExists => "Already exists",
            Self::BufferTooSmall => "Buffer too small",
            Self::DeviceNotFound => "No such swap device",
            Self::DeviceBusy => "Device or page busy",
            Self::PageQuarantined => "Page quarantined",
            Self::AccessDenied => "Access denied",
            Self::NotOnline => "Swap space not online",
            Self::AlreadyOnline => "Swap space already online",
            Self::RecoveryRequired => "Recovery required",
            Self::Quiesced => "Swap-out quiesced",
            Self::SnapshotNotFound => "Snapshot not found",
            Self::SnapshotExists => "Snapshot already exists",
            Self::SnapshotPinned => "Storage pinned by snapshot",
            Self::NoHibernationImage => "No hibernation image",
            Self::InsufficientCapacity => "Insufficient swap for hibernation",
            Self::HibernationState => "Invalid hibernation phase",
            Self::CodecUnavailable => "Codec unavailable",
            Self::CompressionInvariant => "Compressed size exceeds original",
            Self::CompressionFailed => "Compression failed",
            Self::DecompressionFailed => "Decompression failed",
        }
    }

    /// Check if this is a format error (refuse the device at mount)
    pub const fn is_format(self) -> bool {
        matches!(
            self,
            Self::BadMagic
                | Self::IncompatibleVersion
                | Self::UnsupportedPageSize
                | Self::UnsupportedAlgorithm
        )
    }

    /// Check if this is an integrity error (never auto-corrected)
    pub const fn is_integrity(self) -> bool {
        matches!(
            self,
            Self::SuperblockCorrupt
                | Self::HeaderChecksumMismatch
                | Self::DataChecksumMismatch
                | Self::SizeMismatch
                | Self::MisdirectedPage
                | Self::CheckpointCorrupt
                | Self::ConfigCorrupt
        )
    }

    /// Check if this is a capacity error (caller backpressure)
    pub const fn is_capacity(self) -> bool {
        matches!(
            self,
            Self::NoSpace
                | Self::DeviceFull
                | Self::TooManyDevices
                | Self::MetadataRegionFull
                | Self::InsufficientCapacity
        )
    }

    /// Check if this is a device I/O error
    pub const fn is_io(self) -> bool {
        matches!(
            self,
            Self::ShortRead
                | Self::ShortWrite
                | Self::OutOfRange
                | Self::DeviceIo
                | Self::DeviceMissing
        )
    }

    /// Check if this is a logical error (rejected before any mutation)
    pub const fn is_logical(self) -> bool {
        matches!(
            self,
            Self::NotFound
                | Self::AlreadyExists
                | Self::BufferTooSmall
                | Self::DeviceNotFound
                | Self::DeviceBusy
                | Self::PageQuarantined
                | Self::AccessDenied
                | Self::InvalidArgument
        )
    }

    /// Check if retrying later may succeed
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Quiesced | Self::DeviceBusy | Self::TimedOut)
    }
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (swap error {})", self.message(), self.code())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SwapError {}
