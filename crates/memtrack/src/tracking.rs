//! The tracking coordinator.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::AtomicBool;

use spin::RwLock;

use crate::{
    HumanRange, MultiRegionHandle, RegionHandle, Result, SmartMultiRegionHandle, TrackingConfig,
    TrackingError, VirtualMemoryManager,
    handle::{HandleState, PreciseOutcome},
    region::{HandleId, RegionTree},
};

/// State shared by the coordinator and every handle it created.
pub(crate) struct Shared {
    manager: Arc<dyn VirtualMemoryManager>,
    config: TrackingConfig,
    /// Structural changes take the write lock. Events, protection updates and queries only
    /// read the tree; per-handle state is atomic.
    tree: RwLock<RegionTree>,
}

impl Shared {
    /// Recomputes and applies protection for `[start, end)`.
    pub(crate) fn update_protection(&self, start: u64, end: u64) -> bool {
        self.tree
            .read()
            .update_protection(start, end, self.manager.as_ref())
    }

    pub(crate) fn remove_handle(&self, id: HandleId) {
        log::debug!("disposing handle {id:?}");
        self.tree.write().remove_handle(id, self.manager.as_ref());
    }
}

/// Diagnostic counts of the region tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCounts {
    /// Regions in the tree.
    pub regions: usize,
    /// Live handles registered in the tree, including multi-region sub-handles.
    pub handles: usize,
}

/// Tracks reads and writes to a guest address space.
///
/// Cloning is cheap and yields another reference to the same tracker.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use memtrack::{MemoryPermission, MemoryTracking, TrackingConfig, VirtualMemoryManager};
///
/// #[derive(Default)]
/// struct Host(Mutex<Vec<(u64, u64, MemoryPermission)>>);
///
/// impl VirtualMemoryManager for Host {
///     fn tracking_reprotect(&self, address: u64, size: u64, permission: MemoryPermission) {
///         self.0.lock().unwrap().push((address, size, permission));
///     }
/// }
///
/// let host = Arc::new(Host::default());
/// let tracking = MemoryTracking::new(host.clone(), TrackingConfig::default())?;
///
/// let handle = tracking.begin_tracking(0x1000, 0x1000);
/// assert!(handle.dirty());
///
/// handle.reprotect(false);
/// assert_eq!(
///     host.0.lock().unwrap().last(),
///     Some(&(0x1000, 0x1000, MemoryPermission::READ))
/// );
///
/// // The host's fault handler reports a write to the protected page.
/// tracking.virtual_memory_event(0x1004, 4, true, false);
/// assert!(handle.dirty());
/// # Ok::<(), memtrack::TrackingError>(())
/// ```
#[derive(Clone)]
pub struct MemoryTracking {
    shared: Arc<Shared>,
}

impl MemoryTracking {
    /// Creates a tracker driving protection through `manager`.
    pub fn new(manager: Arc<dyn VirtualMemoryManager>, config: TrackingConfig) -> Result<Self> {
        config.validate()?;

        log::debug!("memory tracking with {}B pages", config.page_size);
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                config,
                tree: RwLock::new(RegionTree::new()),
            }),
        })
    }

    /// Creates a tracker with the given page size and otherwise default configuration.
    pub fn with_page_size(manager: Arc<dyn VirtualMemoryManager>, page_size: u64) -> Result<Self> {
        Self::new(manager, TrackingConfig::new(page_size))
    }

    /// The configuration the tracker was created with.
    pub fn config(&self) -> &TrackingConfig {
        &self.shared.config
    }

    /// Host page size. Every handle is registered over whole pages of this size.
    pub fn page_size(&self) -> u64 {
        self.shared.config.page_size
    }

    fn manager(&self) -> &dyn VirtualMemoryManager {
        self.shared.manager.as_ref()
    }

    pub(crate) fn update_protection(&self, start: u64, end: u64) -> bool {
        self.shared.update_protection(start, end)
    }

    fn check_multi_region(&self, address: u64, size: u64, granularity: u64) -> Result<()> {
        if granularity == 0 {
            return Err(TrackingError::InvalidGranularity(granularity));
        }
        if size == 0 {
            return Err(TrackingError::EmptyRange);
        }

        // Every slice gets widened to whole pages, so the last page must fit too.
        address
            .checked_add(size)
            .and_then(|end| end.checked_add(self.shared.config.page_mask()))
            .ok_or(TrackingError::RangeOverflow { address, size })?;
        Ok(())
    }

    /// Starts tracking `[address, address + size)`.
    ///
    /// The range is widened to whole pages. The handle starts dirty, unless the memory is
    /// unmapped, and no protection is applied until its first
    /// [`reprotect`](RegionHandle::reprotect).
    pub fn begin_tracking(&self, address: u64, size: u64) -> RegionHandle {
        self.begin_tracking_with_id(address, size, 0)
    }

    /// Like [`begin_tracking`](Self::begin_tracking), tagging the handle with `id` so that
    /// [`virtual_memory_event_exempt`](Self::virtual_memory_event_exempt) can skip it.
    pub fn begin_tracking_with_id(&self, address: u64, size: u64, id: u32) -> RegionHandle {
        self.begin_tracking_inner(address, size, id, None)
    }

    pub(crate) fn begin_tracking_inner(
        &self,
        address: u64,
        size: u64,
        id: u32,
        parent: Option<Arc<AtomicBool>>,
    ) -> RegionHandle {
        debug_assert!(size > 0, "cannot track an empty range");
        let size = size.max(1);

        let aligned = self.shared.config.page_align(address, size);
        let mapped = self.manager().is_range_mapped(aligned.0, aligned.1);
        let state = Arc::new(HandleState::new(
            aligned,
            (address, size),
            id,
            mapped,
            parent,
        ));

        let handle_id = self.shared.tree.write().add_handle(state.clone());
        log::debug!(
            "tracking {} as handle {handle_id:?}{}",
            HumanRange::new(address, size),
            if mapped { "" } else { " (unmapped)" }
        );

        RegionHandle::new(handle_id, state, self.shared.clone())
    }

    /// Splits `[address, address + size)` into `granularity`-sized handles.
    pub fn begin_granular_tracking(
        &self,
        address: u64,
        size: u64,
        granularity: u64,
    ) -> Result<MultiRegionHandle> {
        self.begin_granular_tracking_with_id(address, size, granularity, 0)
    }

    pub fn begin_granular_tracking_with_id(
        &self,
        address: u64,
        size: u64,
        granularity: u64,
        id: u32,
    ) -> Result<MultiRegionHandle> {
        self.begin_granular_tracking_with_handles(address, size, Vec::new(), granularity, id)
    }

    /// Like [`begin_granular_tracking_with_id`](Self::begin_granular_tracking_with_id),
    /// carrying over the state of `handles` that previously tracked the range.
    ///
    /// A handle covering exactly one slice becomes that slice. Any other handle passes its
    /// dirty flag, sequence number and actions to the slices it overlaps and is disposed.
    /// Slices no handle overlaps start dirty, as usual. This keeps pending writes and armed
    /// actions across the resize of a resource.
    pub fn begin_granular_tracking_with_handles(
        &self,
        address: u64,
        size: u64,
        handles: impl IntoIterator<Item = RegionHandle>,
        granularity: u64,
        id: u32,
    ) -> Result<MultiRegionHandle> {
        self.check_multi_region(address, size, granularity)?;
        Ok(MultiRegionHandle::new(
            self,
            address,
            size,
            handles.into_iter().collect(),
            granularity,
            id,
        ))
    }

    /// Tracks `[address, address + size)` with handles that are retiled to match the ranges
    /// actually queried. `granularity` is the finest tiling ever used.
    pub fn begin_smart_granular_tracking(
        &self,
        address: u64,
        size: u64,
        granularity: u64,
    ) -> Result<SmartMultiRegionHandle> {
        self.begin_smart_granular_tracking_with_id(address, size, granularity, 0)
    }

    pub fn begin_smart_granular_tracking_with_id(
        &self,
        address: u64,
        size: u64,
        granularity: u64,
        id: u32,
    ) -> Result<SmartMultiRegionHandle> {
        self.check_multi_region(address, size, granularity)?;

        let (address, size) = self.shared.config.page_align(address, size);
        Ok(SmartMultiRegionHandle::new(
            self.clone(),
            address,
            size,
            granularity,
            id,
        ))
    }

    /// Reports an access to `[address, address + size)`.
    ///
    /// With `precise`, precise actions are consulted first. Returns `false` only when the
    /// access hit no tracked region and the memory is not mapped, so the caller should treat
    /// it as a genuine fault.
    pub fn virtual_memory_event(&self, address: u64, size: u64, write: bool, precise: bool) -> bool {
        self.signal_event(address, size, write, precise, None)
    }

    /// Like [`virtual_memory_event`](Self::virtual_memory_event), skipping handles tagged with
    /// `exempt_id`.
    pub fn virtual_memory_event_exempt(
        &self,
        address: u64,
        size: u64,
        write: bool,
        precise: bool,
        exempt_id: u32,
    ) -> bool {
        self.signal_event(address, size, write, precise, Some(exempt_id))
    }

    fn signal_event(
        &self,
        address: u64,
        size: u64,
        write: bool,
        precise: bool,
        exempt: Option<u32>,
    ) -> bool {
        if size == 0 {
            return true;
        }
        let end = address.saturating_add(size);

        // Handles are signalled outside of the tree lock, so actions can create and dispose
        // handles.
        let handles = {
            let tree = self.shared.tree.read();
            if !tree.any_overlapping(address, end) {
                drop(tree);

                if precise {
                    return true;
                }
                let mapped = self.manager().is_range_mapped(address, size);
                if !mapped {
                    log::warn!(
                        "access to unmapped memory at {}",
                        HumanRange::new(address, size)
                    );
                }
                return mapped;
            }
            tree.handles_overlapping(address, end)
        };

        let (mut start, mut stop) = (address, end);
        let mut any_regular = false;
        for handle in handles {
            if exempt == Some(handle.id) {
                continue;
            }

            let changed = if precise {
                match handle.signal_precise(address, size, write) {
                    PreciseOutcome::Handled => continue,
                    PreciseOutcome::Signalled { changed } => changed,
                }
            } else {
                handle.signal(address, size, write)
            };

            any_regular = true;
            if changed {
                start = start.min(handle.address);
                stop = stop.max(handle.end());
            }
        }

        if any_regular {
            self.shared.update_protection(start, stop);
        }

        true
    }

    /// Notifies the tracker that `[address, address + size)` was mapped.
    ///
    /// Handles whose whole range is mapped again resume tracking, clean, and protection is
    /// reapplied.
    pub fn map(&self, address: u64, size: u64) {
        let (address, size) = self.shared.config.page_align(address, size);
        let end = address + size;
        log::debug!("mapped {}", HumanRange::new(address, size));

        let tree = self.shared.tree.read();
        let (start, stop) = tree
            .signal_mapping_changed(address, end, true, self.manager())
            .map_or((address, end), |(lo, hi)| (lo.min(address), hi.max(end)));
        tree.update_protection(start, stop, self.manager());
    }

    /// Notifies the tracker that `[address, address + size)` was unmapped.
    ///
    /// Handles touching the range stop tracking until it is mapped again: they read as clean,
    /// drop armed actions without running them and ask for no protection.
    pub fn unmap(&self, address: u64, size: u64) {
        let (address, size) = self.shared.config.page_align(address, size);
        log::debug!("unmapped {}", HumanRange::new(address, size));

        self.shared.tree.read().signal_mapping_changed(
            address,
            address + size,
            false,
            self.manager(),
        );
    }

    /// Number of regions in the tree.
    pub fn region_count(&self) -> usize {
        self.shared.tree.read().region_count()
    }

    /// Number of regions and of live handles in the tree.
    pub fn region_counts(&self) -> RegionCounts {
        let tree = self.shared.tree.read();
        RegionCounts {
            regions: tree.region_count(),
            handles: tree.handle_count(),
        }
    }
}
