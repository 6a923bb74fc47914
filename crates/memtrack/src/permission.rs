//! Host page permissions requested by the tracker.

use bitflags::bitflags;

bitflags! {
    /// Host protection for a tracked range.
    ///
    /// Only three values are ever requested: [`READ_AND_WRITE`](Self::READ_AND_WRITE)
    /// (untracked), [`READ`](Self::READ) (writes trap) and [`NONE`](Self::NONE) (reads and
    /// writes trap). Combining the requirements of several handles is an intersection, so the
    /// most restrictive handle wins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_AND_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MemoryPermission {
    /// No access allowed; every access traps.
    pub const NONE: Self = Self::empty();

    /// Returns true if a read under this permission would fault.
    #[inline]
    pub fn traps_reads(self) -> bool {
        !self.contains(Self::READ)
    }

    /// Returns true if a write under this permission would fault.
    #[inline]
    pub fn traps_writes(self) -> bool {
        !self.contains(Self::WRITE)
    }

    /// Returns true if an access of the given kind would fault.
    #[inline]
    pub fn traps(self, write: bool) -> bool {
        if write {
            self.traps_writes()
        } else {
            self.traps_reads()
        }
    }
}

impl Default for MemoryPermission {
    fn default() -> Self {
        Self::READ_AND_WRITE
    }
}
