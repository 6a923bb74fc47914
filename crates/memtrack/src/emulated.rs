//! Software emulation of a virtual memory manager.
//!
//! Keeps a page table of mapped state and protection for a flat address space starting at
//! zero, and records every protection change the tracker asks for. There are no real host
//! faults: [`EmulatedMemoryManager::access`] checks the emulated protection and reports
//! trapping accesses to the tracker, the way a fault handler would.

use alloc::{boxed::Box, vec::Vec};
use core::ops::Range;

use spin::{Mutex, RwLock};

use crate::{HumanRange, MemoryPermission, MemoryTracking, VirtualMemoryManager};

type ProtectHook = Box<dyn Fn(u64, u64, MemoryPermission) + Send + Sync>;

/// A protection change requested by the tracker, exactly as it was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionCall {
    /// Start of the range, not rounded to pages.
    pub address: u64,
    /// Size of the range in bytes.
    pub size: u64,
    /// The protection applied to it.
    pub permission: MemoryPermission,
}

impl ProtectionCall {
    pub const fn new(address: u64, size: u64, permission: MemoryPermission) -> Self {
        Self {
            address,
            size,
            permission,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EmulatedPage {
    mapped: bool,
    permission: MemoryPermission,
}

impl EmulatedPage {
    const MAPPED: Self = Self {
        mapped: true,
        permission: MemoryPermission::READ_AND_WRITE,
    };
}

/// An emulated address space of `size` bytes, fully mapped and unprotected at creation.
pub struct EmulatedMemoryManager {
    page_size: u64,
    size: u64,
    pages: Mutex<Vec<EmulatedPage>>,
    calls: Mutex<Vec<ProtectionCall>>,
    hook: RwLock<Option<ProtectHook>>,
}

impl EmulatedMemoryManager {
    /// Creates an address space of `size` bytes split into `page_size` pages.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a non-zero power of two.
    pub fn new(size: u64, page_size: u64) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size must be a non-zero power of two"
        );

        let page_count = size.div_ceil(page_size) as usize;
        Self {
            page_size,
            size,
            pages: Mutex::new(alloc::vec![EmulatedPage::MAPPED; page_count]),
            calls: Mutex::new(Vec::new()),
            hook: RwLock::new(None),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Indexes of the pages touched by `[address, address + size)`, clamped to the address
    /// space. An empty range touches the page containing `address`.
    fn page_range(&self, address: u64, size: u64) -> Range<usize> {
        let page_count = self.size.div_ceil(self.page_size);
        let first = (address / self.page_size).min(page_count);
        let last = address
            .saturating_add(size.max(1))
            .div_ceil(self.page_size)
            .min(page_count);
        first as usize..last as usize
    }

    /// Maps `[address, address + size)` with full access.
    pub fn map_range(&self, address: u64, size: u64) {
        let range = self.page_range(address, size);
        self.pages.lock()[range].fill(EmulatedPage::MAPPED);
    }

    /// Unmaps `[address, address + size)`. Any access to it faults.
    pub fn unmap_range(&self, address: u64, size: u64) {
        let range = self.page_range(address, size);
        for page in &mut self.pages.lock()[range] {
            page.mapped = false;
        }
    }

    /// Returns the protection of the page containing `address`, or `None` if it is unmapped.
    pub fn permission(&self, address: u64) -> Option<MemoryPermission> {
        if address >= self.size {
            return None;
        }

        let page = self.pages.lock()[(address / self.page_size) as usize];
        page.mapped.then_some(page.permission)
    }

    /// Returns true if the access would fault on any page it touches.
    pub fn would_fault(&self, address: u64, size: u64, write: bool) -> bool {
        if address.saturating_add(size) > self.size {
            return true;
        }

        let range = self.page_range(address, size);
        self.pages.lock()[range]
            .iter()
            .any(|page| !page.mapped || page.permission.traps(write))
    }

    /// Performs an emulated guest access.
    ///
    /// Accesses that would fault are reported to `tracking`, and its verdict is returned:
    /// `false` means the access hit memory that really is unmapped. Accesses that don't
    /// fault never reach the tracker.
    pub fn access(&self, tracking: &MemoryTracking, address: u64, size: u64, write: bool) -> bool {
        if !self.would_fault(address, size, write) {
            return true;
        }

        log::trace!(
            "emulated {} fault at {}",
            if write { "write" } else { "read" },
            HumanRange::new(address, size)
        );
        tracking.virtual_memory_event(address, size, write, false)
    }

    /// Every protection change requested so far, oldest first.
    pub fn protection_calls(&self) -> Vec<ProtectionCall> {
        self.calls.lock().clone()
    }

    /// Returns and forgets the protection changes requested so far.
    pub fn take_protection_calls(&self) -> Vec<ProtectionCall> {
        core::mem::take(&mut *self.calls.lock())
    }

    /// Sets a callback run on every protection change, after it has been recorded.
    pub fn set_protect_hook<F>(&self, hook: F)
    where
        F: Fn(u64, u64, MemoryPermission) + Send + Sync + 'static,
    {
        *self.hook.write() = Some(Box::new(hook));
    }
}

impl VirtualMemoryManager for EmulatedMemoryManager {
    fn tracking_reprotect(&self, address: u64, size: u64, permission: MemoryPermission) {
        self.calls
            .lock()
            .push(ProtectionCall::new(address, size, permission));

        let range = self.page_range(address, size);
        for page in &mut self.pages.lock()[range] {
            // Protection on unmapped pages is lost, like on a real host.
            if page.mapped {
                page.permission = permission;
            }
        }

        if let Some(hook) = self.hook.read().as_ref() {
            hook(address, size, permission);
        }
    }

    fn is_range_mapped(&self, address: u64, size: u64) -> bool {
        if address.saturating_add(size) > self.size {
            return false;
        }

        let range = self.page_range(address, size);
        self.pages.lock()[range].iter().all(|page| page.mapped)
    }
}
