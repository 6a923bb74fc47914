//! Single-range tracking handles.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use crate::{HumanRange, MemoryPermission, region::HandleId, tracking::Shared};

/// One-shot action run before a tracked read or write proceeds.
///
/// Receives the address and size of the access, clamped to the handle's range.
pub type RegionSignal = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Action run for every precise access: `(address, size, write)`.
///
/// Returning `true` marks the access as fully handled, which skips the dirty flag and the
/// one-shot action for that access.
pub type PreciseRegionSignal = Arc<dyn Fn(u64, u64, bool) -> bool + Send + Sync>;

type DirtyEvent = Arc<dyn Fn() + Send + Sync>;

/// Sequence value meaning "never queried".
const NO_SEQUENCE: u64 = u64::MAX;

/// Outcome of delivering a precise access to a handle.
pub(crate) enum PreciseOutcome {
    /// The precise action claimed the access.
    Handled,
    /// The access went through regular tracking. `changed` is true if the handle's required
    /// permission may have changed.
    Signalled { changed: bool },
}

/// State shared between a [`RegionHandle`] and the region tree.
///
/// Everything mutable here is atomic or behind a per-handle lock, so accesses to different
/// handles never contend and the tree lock is never needed to flip a dirty flag.
pub(crate) struct HandleState {
    /// Page-aligned start, the range registered in the tree.
    pub(crate) address: u64,
    pub(crate) size: u64,
    /// The range the owner asked for.
    pub(crate) real_address: u64,
    pub(crate) real_size: u64,
    pub(crate) id: u32,

    dirty: AtomicBool,
    unmapped: AtomicBool,
    disposed: AtomicBool,
    sequence: AtomicU64,

    action: Mutex<Option<RegionSignal>>,
    precise_action: RwLock<Option<PreciseRegionSignal>>,
    dirty_events: RwLock<Vec<DirtyEvent>>,

    /// Write flag of the multi-region handle owning this one, if any. Replaced when a
    /// multi-region handle adopts this one.
    parent: RwLock<Option<Arc<AtomicBool>>>,
}

impl HandleState {
    pub(crate) fn new(
        (address, size): (u64, u64),
        (real_address, real_size): (u64, u64),
        id: u32,
        mapped: bool,
        parent: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            address,
            size,
            real_address,
            real_size,
            id,
            // Nothing is known about the memory yet, so the first query must see it dirty.
            dirty: AtomicBool::new(mapped),
            unmapped: AtomicBool::new(!mapped),
            disposed: AtomicBool::new(false),
            sequence: AtomicU64::new(NO_SEQUENCE),
            action: Mutex::new(None),
            precise_action: RwLock::new(None),
            dirty_events: RwLock::new(Vec::new()),
            parent: RwLock::new(parent),
        }
    }

    #[inline]
    pub(crate) fn end(&self) -> u64 {
        self.address + self.size
    }

    #[inline]
    pub(crate) fn real_end(&self) -> u64 {
        self.real_address + self.real_size
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Marks the handle disposed, returning false if it already was.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn sequence(&self) -> Option<u32> {
        match self.sequence.load(Ordering::Acquire) {
            NO_SEQUENCE => None,
            value => Some(value as u32),
        }
    }

    pub(crate) fn set_sequence(&self, sequence: Option<u32>) {
        let raw = sequence.map_or(NO_SEQUENCE, u64::from);
        self.sequence.store(raw, Ordering::Release);
    }

    /// The permission this handle needs on every region it covers.
    pub(crate) fn required_permission(&self) -> MemoryPermission {
        // Unmapped memory can't be dirtied, and a dirty handle has nothing left to catch.
        if self.unmapped.load(Ordering::Acquire) || self.is_dirty() || self.is_disposed() {
            return MemoryPermission::READ_AND_WRITE;
        }

        if self.action.lock().is_some() {
            MemoryPermission::NONE
        } else {
            MemoryPermission::READ
        }
    }

    /// Replaces the armed action, returning the previous one.
    pub(crate) fn arm(&self, action: RegionSignal) -> Option<RegionSignal> {
        self.action.lock().replace(action)
    }

    /// Atomically takes the armed action. Only one caller ever gets a given action.
    pub(crate) fn take_action(&self) -> Option<RegionSignal> {
        self.action.lock().take()
    }

    pub(crate) fn peek_action(&self) -> Option<RegionSignal> {
        self.action.lock().clone()
    }

    pub(crate) fn set_precise_action(&self, action: Option<PreciseRegionSignal>) {
        *self.precise_action.write() = action;
    }

    pub(crate) fn peek_precise_action(&self) -> Option<PreciseRegionSignal> {
        self.precise_action.read().clone()
    }

    pub(crate) fn set_parent(&self, parent: Arc<AtomicBool>) {
        *self.parent.write() = Some(parent);
    }

    pub(crate) fn add_dirty_event(&self, event: DirtyEvent) {
        self.dirty_events.write().push(event);
    }

    /// Clamps an access to this handle's requested range, falling back to the aligned range
    /// when the access only touched the alignment padding.
    fn clamp(&self, address: u64, size: u64) -> (u64, u64) {
        let end = address.saturating_add(size);

        let start = address.max(self.real_address);
        let stop = end.min(self.real_end());
        if start < stop {
            return (start, stop - start);
        }

        let start = address.max(self.address);
        let stop = end.min(self.end());
        (start, stop.saturating_sub(start))
    }

    /// Delivers a regular access. Returns true if the required permission may have changed.
    pub(crate) fn signal(&self, address: u64, size: u64, write: bool) -> bool {
        if self.is_disposed() {
            return false;
        }

        if self.unmapped.load(Ordering::Acquire) {
            // Drop the action so that it does not fire when the memory comes back.
            self.take_action();
            return false;
        }

        let mut changed = false;

        if let Some(action) = self.take_action() {
            let (start, len) = self.clamp(address, size);
            log::trace!(
                "running read action for {} on access {}",
                HumanRange::new(self.real_address, self.real_size),
                HumanRange::new(start, len)
            );
            action(start, len);
            changed = true;
        }

        if write {
            if !self.dirty.swap(true, Ordering::AcqRel) {
                changed = true;
                let events = self.dirty_events.read().clone();
                for event in events {
                    event();
                }
            }

            if let Some(parent) = self.parent.read().as_ref() {
                parent.store(true, Ordering::Release);
            }
        }

        changed
    }

    /// Delivers a precise access, consulting the precise action first.
    pub(crate) fn signal_precise(&self, address: u64, size: u64, write: bool) -> PreciseOutcome {
        if !self.unmapped.load(Ordering::Acquire) && !self.is_disposed() {
            // Clone out so the action can replace itself.
            let precise = self.peek_precise_action();
            if let Some(precise) = precise {
                if precise(address, size, write) {
                    return PreciseOutcome::Handled;
                }
            }
        }

        PreciseOutcome::Signalled {
            changed: self.signal(address, size, write),
        }
    }

    /// Updates the mapped state after the memory under this handle was mapped or unmapped.
    pub(crate) fn signal_mapping_changed(&self, mapped: bool) {
        let was_unmapped = self.unmapped.swap(!mapped, Ordering::AcqRel);
        if !mapped && !was_unmapped {
            self.set_dirty(false);
        }
    }

    #[inline]
    pub(crate) fn is_unmapped(&self) -> bool {
        self.unmapped.load(Ordering::Acquire)
    }
}

/// A tracked range of guest memory.
///
/// The handle starts dirty, because nothing is known about the memory when tracking begins,
/// and unprotected: protection is only applied on the first [`reprotect`](Self::reprotect),
/// so a new consumer can read the initial state without paying for a protection change.
///
/// Dropping the handle disposes it. Once disposed, every operation is a silent no-op and
/// [`dirty`](Self::dirty) reads `false`.
pub struct RegionHandle {
    id: HandleId,
    state: Arc<HandleState>,
    tracking: Arc<Shared>,
}

impl RegionHandle {
    pub(crate) fn new(id: HandleId, state: Arc<HandleState>, tracking: Arc<Shared>) -> Self {
        Self {
            id,
            state,
            tracking,
        }
    }

    pub(crate) fn state(&self) -> &Arc<HandleState> {
        &self.state
    }

    /// Page-aligned start of the tracked range.
    pub fn address(&self) -> u64 {
        self.state.address
    }

    /// Page-aligned size of the tracked range.
    pub fn size(&self) -> u64 {
        self.state.size
    }

    /// Page-aligned end of the tracked range, exclusive.
    pub fn end_address(&self) -> u64 {
        self.state.end()
    }

    /// Start of the range as it was requested.
    pub fn real_address(&self) -> u64 {
        self.state.real_address
    }

    /// Size of the range as it was requested.
    pub fn real_size(&self) -> u64 {
        self.state.real_size
    }

    /// End of the range as it was requested, exclusive.
    pub fn real_end_address(&self) -> u64 {
        self.state.real_end()
    }

    /// The id given when tracking began. Events can exempt handles by id.
    pub fn id(&self) -> u32 {
        self.state.id
    }

    /// True if a tracked write happened since the last [`reprotect`](Self::reprotect), or if
    /// the handle was never reprotected.
    pub fn dirty(&self) -> bool {
        !self.state.is_disposed() && self.state.is_dirty()
    }

    /// True if the memory under this handle is currently unmapped.
    pub fn unmapped(&self) -> bool {
        self.state.is_unmapped()
    }

    /// True once [`dispose`](Self::dispose) ran, directly or on drop.
    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    /// Clears the dirty flag and re-arms protection so the next write is caught.
    ///
    /// With `as_dirty` the flag is forced on instead of cleared.
    pub fn reprotect(&self, as_dirty: bool) {
        if self.state.is_disposed() {
            return;
        }

        self.state.set_dirty(as_dirty);
        self.tracking
            .update_protection(self.state.address, self.state.end());
    }

    /// Sets the dirty flag without touching protection.
    pub fn force_dirty(&self) {
        if !self.state.is_disposed() {
            self.state.set_dirty(true);
        }
    }

    /// Arms a one-shot action that runs on the next read or write reaching this handle.
    ///
    /// The action runs exactly once, even when several threads fault on the range at the
    /// same time. Registering again before it fires replaces it.
    pub fn register_action<F>(&self, action: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.register_signal(Arc::new(action));
    }

    pub(crate) fn register_signal(&self, action: RegionSignal) {
        if self.state.is_disposed() {
            return;
        }

        if self.state.arm(action).is_none() {
            self.tracking
                .update_protection(self.state.address, self.state.end());
        }
    }

    /// Sets the action consulted for every precise access overlapping this handle.
    pub fn register_precise_action<F>(&self, action: F)
    where
        F: Fn(u64, u64, bool) -> bool + Send + Sync + 'static,
    {
        self.state.set_precise_action(Some(Arc::new(action)));
    }

    pub(crate) fn register_precise_signal(&self, action: PreciseRegionSignal) {
        self.state.set_precise_action(Some(action));
    }

    /// Registers a callback run every time a write turns this handle from clean to dirty.
    ///
    /// Unlike [`register_action`](Self::register_action), it stays registered.
    pub fn register_dirty_event<F>(&self, event: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.add_dirty_event(Arc::new(event));
    }

    /// Returns true if this handle's aligned range overlaps `[address, address + size)`.
    pub fn overlaps_with(&self, address: u64, size: u64) -> bool {
        self.state.address < address.saturating_add(size) && address < self.state.end()
    }

    pub(crate) fn overlaps_real(&self, start: u64, end: u64) -> bool {
        self.state.real_address < end && start < self.state.real_end()
    }

    /// Returns true if both handles were requested over exactly the same range.
    pub fn range_equals(&self, other: &RegionHandle) -> bool {
        self.state.real_address == other.state.real_address
            && self.state.real_size == other.state.real_size
    }

    /// Stops tracking. Further calls are no-ops.
    pub fn dispose(&self) {
        if self.state.mark_disposed() {
            self.tracking.remove_handle(self.id);
        }
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl core::fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionHandle")
            .field("range", &HumanRange::new(self.address(), self.size()))
            .field("id", &self.state.id)
            .field("dirty", &self.dirty())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
