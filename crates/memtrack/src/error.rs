//! Errors reported when tracking is configured or started.
//!
//! Runtime operations on handles never fail: events on untracked memory, repeated disposal
//! and use of a disposed handle are all silent no-ops.

use thiserror::Error;

/// Result of configuring or starting tracking.
pub type Result<T> = core::result::Result<T, TrackingError>;

/// Reasons a tracker or a multi-region handle could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackingError {
    /// The page size is zero or not a power of two.
    #[error("invalid page size {0:#x} (must be a non-zero power of two)")]
    InvalidPageSize(u64),

    /// A multi-region handle was requested with a zero granularity.
    #[error("invalid tracking granularity {0:#x}")]
    InvalidGranularity(u64),

    /// A multi-region handle was requested over an empty range.
    #[error("cannot track an empty range")]
    EmptyRange,

    /// The range, once widened to whole pages, runs past the end of the address space.
    #[error("range at {address:#x} of {size:#x} bytes overflows the address space")]
    RangeOverflow { address: u64, size: u64 },
}
