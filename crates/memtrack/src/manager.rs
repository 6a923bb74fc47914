//! The interface to whoever owns the host mappings.

use crate::MemoryPermission;

/// Applies host page protection on behalf of the tracker.
///
/// Implement this trait on the virtual memory manager that owns the guest address space.
/// The tracker calls it with the exact byte range whose protection changed; rounding that
/// range to host pages is the implementation's job.
///
/// Whatever catches the resulting protection faults is expected to report them back through
/// [`crate::MemoryTracking::virtual_memory_event`].
pub trait VirtualMemoryManager: Send + Sync {
    /// Applies `permission` to `[address, address + size)`.
    ///
    /// Must be idempotent. May be called with a range smaller than a host page.
    fn tracking_reprotect(&self, address: u64, size: u64, permission: MemoryPermission);

    /// Returns whether every page in `[address, address + size)` is currently mapped.
    ///
    /// Managers that never unmap tracked memory can rely on the default.
    fn is_range_mapped(&self, address: u64, size: u64) -> bool {
        let _ = (address, size);
        true
    }
}
