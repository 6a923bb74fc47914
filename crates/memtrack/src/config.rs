//! Tracker configuration.

use crate::{Result, TrackingError};

/// Page size used when none is configured (4KiB host pages).
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Configuration for a [`crate::MemoryTracking`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingConfig {
    /// Host page size. Handle ranges are widened to this granularity, since that is the
    /// smallest unit the host can protect.
    pub page_size: u64,
}

impl TrackingConfig {
    /// Creates a configuration with the given page size.
    pub const fn new(page_size: u64) -> Self {
        Self { page_size }
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(TrackingError::InvalidPageSize(self.page_size));
        }
        Ok(())
    }

    #[inline]
    pub(crate) const fn page_mask(&self) -> u64 {
        self.page_size - 1
    }

    /// Widens `[address, address + size)` to whole pages.
    pub(crate) fn page_align(&self, address: u64, size: u64) -> (u64, u64) {
        let mask = self.page_mask();
        let start = address & !mask;
        let end = address.saturating_add(size).saturating_add(mask) & !mask;
        (start, end - start)
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}
