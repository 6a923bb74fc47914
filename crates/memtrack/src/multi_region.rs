//! Handles tracking a large range as many smaller ones.

use alloc::{sync::Arc, vec::Vec};
use core::{
    ops::Range,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{HumanRange, MemoryTracking, PreciseRegionSignal, RegionHandle, RegionSignal};

/// A range tracked through several [`RegionHandle`]s, queried in bulk.
///
/// Queries report maximal runs of contiguous modified sub-ranges in ascending address order,
/// and reprotect everything they report.
pub trait MultiRegion {
    /// Start of the tracked range.
    fn address(&self) -> u64;

    /// Size of the tracked range.
    fn size(&self) -> u64;

    /// True if any part of the range was written since the last
    /// [`query_all_modified`](Self::query_all_modified).
    fn dirty(&self) -> bool;

    /// Marks the sub-ranges overlapping `[address, address + size)` dirty without touching
    /// protection.
    fn force_dirty(&self, address: u64, size: u64);

    /// Reports and reprotects every modified run in the whole range.
    ///
    /// Does nothing unless the range was written since the last call.
    fn query_all_modified(&self, callback: &mut dyn FnMut(u64, u64));

    /// Reports and reprotects the modified runs overlapping `[address, address + size)`.
    fn query_modified(&self, address: u64, size: u64, callback: &mut dyn FnMut(u64, u64));

    /// Like [`query_modified`](Self::query_modified), skipping sub-ranges already reported
    /// under `sequence`. Every checked sub-range is stamped with `sequence`.
    fn query_modified_with_sequence(
        &self,
        address: u64,
        size: u64,
        sequence: u32,
        callback: &mut dyn FnMut(u64, u64),
    );

    /// Arms a one-shot action on every sub-range overlapping `[address, address + size)`.
    /// The action receives the range of the sub-range that fired.
    fn register_action(&self, address: u64, size: u64, action: RegionSignal);

    /// Sets the precise action of every sub-range overlapping `[address, address + size)`.
    fn register_precise_action(&self, address: u64, size: u64, action: PreciseRegionSignal);

    /// Stops tracking the whole range.
    fn dispose(&self);
}

#[derive(Debug, Clone, Copy)]
struct ModifiedRun {
    start: u64,
    end: u64,
    protect_start: u64,
    protect_end: u64,
}

/// Collects modified handles into contiguous runs.
///
/// Consumed handles have their dirty flag cleared right away; protection is only reapplied,
/// one update per run, when the runs are reported.
#[derive(Default)]
pub(crate) struct ModifiedRuns {
    runs: Vec<ModifiedRun>,
}

impl ModifiedRuns {
    pub(crate) fn consume(&mut self, handle: &RegionHandle) {
        handle.state().set_dirty(false);

        let (start, end) = (handle.real_address(), handle.real_end_address());
        let (protect_start, protect_end) = (handle.address(), handle.end_address());

        if let Some(run) = self.runs.last_mut() {
            if run.end == start {
                run.end = end;
                run.protect_end = run.protect_end.max(protect_end);
                return;
            }
        }

        self.runs.push(ModifiedRun {
            start,
            end,
            protect_start,
            protect_end,
        });
    }

    /// Reprotects each run, then reports it.
    pub(crate) fn report(self, tracking: &MemoryTracking, callback: &mut dyn FnMut(u64, u64)) {
        for run in self.runs {
            tracking.update_protection(run.protect_start, run.protect_end);
            callback(run.start, run.end - run.start);
        }
    }
}

/// Decides whether a dirty handle is reported by a query, stamping its sequence number.
pub(crate) fn check_modified(handle: &RegionHandle, sequence: Option<u32>) -> bool {
    let Some(sequence) = sequence else {
        return handle.dirty();
    };

    let state = handle.state();
    let eligible = handle.dirty() && state.sequence() != Some(sequence);
    state.set_sequence(Some(sequence));
    eligible
}

/// Carries the state of `sources`, the handles that tracked part of `slice`'s range before
/// it, over to `slice`.
///
/// The slice is dirty if any source was, keeps a sequence number only when all sources
/// agree on it, and takes the first armed action and precise action it finds.
fn inherit<'a>(slice: &RegionHandle, sources: impl Iterator<Item = &'a RegionHandle>) {
    let mut found = false;
    let mut dirty = false;
    let mut sequence: Option<Option<u32>> = None;
    let mut action = None;
    let mut precise = None;

    for source in sources.filter(|source| !source.is_disposed()) {
        let state = source.state();
        found = true;
        dirty |= source.dirty();
        sequence = match sequence {
            Some(seen) if seen != state.sequence() => Some(None),
            _ => Some(state.sequence()),
        };
        action = action.or_else(|| state.peek_action());
        precise = precise.or_else(|| state.peek_precise_action());
    }

    if !found {
        return;
    }

    slice.state().set_sequence(sequence.flatten());
    if let Some(precise) = precise {
        slice.register_precise_signal(precise);
    }
    if let Some(action) = action {
        slice.state().arm(action);
    }
    slice.reprotect(dirty);
}

/// A range split into fixed `granularity`-sized handles.
///
/// Every slice is `granularity` bytes except possibly the last.
pub struct MultiRegionHandle {
    tracking: MemoryTracking,
    address: u64,
    size: u64,
    granularity: u64,
    handles: Vec<RegionHandle>,
    /// Set by any write reaching one of the handles.
    dirty: Arc<AtomicBool>,
}

impl MultiRegionHandle {
    pub(crate) fn new(
        tracking: &MemoryTracking,
        address: u64,
        size: u64,
        mut inherited: Vec<RegionHandle>,
        granularity: u64,
        id: u32,
    ) -> Self {
        let dirty = Arc::new(AtomicBool::new(true));
        let end = address + size;
        let mut adopted = 0;

        let handles = (0..size.div_ceil(granularity))
            .map(|index| {
                let start = address + index * granularity;
                let len = granularity.min(end - start);

                let matching = inherited.iter().position(|handle| {
                    !handle.is_disposed()
                        && handle.real_address() == start
                        && handle.real_size() == len
                });
                if let Some(position) = matching {
                    let handle = inherited.remove(position);
                    handle.state().set_parent(dirty.clone());
                    adopted += 1;
                    return handle;
                }

                let slice = tracking.begin_tracking_inner(start, len, id, Some(dirty.clone()));
                inherit(
                    &slice,
                    inherited
                        .iter()
                        .filter(|handle| handle.overlaps_real(start, start + len)),
                );
                slice
            })
            .collect::<Vec<_>>();

        log::debug!(
            "granular tracking of {} in {} slices ({} adopted, {} inherited from)",
            HumanRange::new(address, size),
            handles.len(),
            adopted,
            inherited.len()
        );

        // Whatever wasn't adopted has passed its state on.
        drop(inherited);

        Self {
            tracking: tracking.clone(),
            address,
            size,
            granularity,
            handles,
            dirty,
        }
    }

    /// Size of every slice but possibly the last.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// The slices, in ascending address order.
    pub fn handles(&self) -> &[RegionHandle] {
        &self.handles
    }

    /// Gives up the slices without disposing them, so that a replacement can take them over
    /// through [`MemoryTracking::begin_granular_tracking_with_handles`].
    pub fn into_handles(self) -> Vec<RegionHandle> {
        self.handles
    }

    /// Indexes of the slices overlapping `[address, address + size)`.
    fn slices(&self, address: u64, size: u64) -> Range<usize> {
        let end = address.saturating_add(size).min(self.address + self.size);
        let start = address.max(self.address);
        if start >= end {
            return 0..0;
        }

        let first = (start - self.address) / self.granularity;
        let last = (end - self.address).div_ceil(self.granularity);
        first as usize..last as usize
    }

    fn query(
        &self,
        address: u64,
        size: u64,
        sequence: Option<u32>,
        callback: &mut dyn FnMut(u64, u64),
    ) {
        let mut runs = ModifiedRuns::default();
        for handle in &self.handles[self.slices(address, size)] {
            if check_modified(handle, sequence) {
                runs.consume(handle);
            }
        }
        runs.report(&self.tracking, callback);
    }
}

impl MultiRegion for MultiRegionHandle {
    fn address(&self) -> u64 {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn force_dirty(&self, address: u64, size: u64) {
        self.dirty.store(true, Ordering::Release);
        for handle in &self.handles[self.slices(address, size)] {
            handle.force_dirty();
        }
    }

    fn query_all_modified(&self, callback: &mut dyn FnMut(u64, u64)) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        self.query(self.address, self.size, None, callback);
    }

    fn query_modified(&self, address: u64, size: u64, callback: &mut dyn FnMut(u64, u64)) {
        self.query(address, size, None, callback);
    }

    fn query_modified_with_sequence(
        &self,
        address: u64,
        size: u64,
        sequence: u32,
        callback: &mut dyn FnMut(u64, u64),
    ) {
        self.query(address, size, Some(sequence), callback);
    }

    fn register_action(&self, address: u64, size: u64, action: RegionSignal) {
        for handle in &self.handles[self.slices(address, size)] {
            let (start, len) = (handle.real_address(), handle.real_size());
            let action = action.clone();
            handle.register_signal(Arc::new(move |_: u64, _: u64| action(start, len)));
        }
    }

    fn register_precise_action(&self, address: u64, size: u64, action: PreciseRegionSignal) {
        for handle in &self.handles[self.slices(address, size)] {
            handle.register_precise_signal(action.clone());
        }
    }

    fn dispose(&self) {
        for handle in &self.handles {
            handle.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

    use super::*;
    use crate::{EmulatedMemoryManager, MemoryPermission, ProtectionCall};

    const PAGE: u64 = 0x1000;
    const PAGES: u64 = 32;

    fn setup() -> (Arc<EmulatedMemoryManager>, MemoryTracking) {
        let manager = Arc::new(EmulatedMemoryManager::new(PAGE * PAGES * 2, PAGE));
        let tracking = MemoryTracking::with_page_size(manager.clone(), PAGE).unwrap();
        (manager, tracking)
    }

    fn modified(handle: &dyn MultiRegion, address: u64, size: u64) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        handle.query_modified(address, size, &mut |address, size| runs.push((address, size)));
        runs
    }

    fn modified_with_sequence(
        handle: &dyn MultiRegion,
        address: u64,
        size: u64,
        sequence: u32,
    ) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        handle.query_modified_with_sequence(address, size, sequence, &mut |address, size| {
            runs.push((address, size))
        });
        runs
    }

    #[test]
    fn slices_tile_range() {
        let (_, tracking) = setup();
        let handle = tracking
            .begin_granular_tracking(PAGE, PAGE * 5 / 2, PAGE)
            .unwrap();

        let ranges: Vec<_> = handle
            .handles()
            .iter()
            .map(|slice| (slice.real_address(), slice.real_size()))
            .collect();
        assert_eq!(ranges, [(PAGE, PAGE), (PAGE * 2, PAGE), (PAGE * 3, PAGE / 2)]);
        assert_eq!(handle.granularity(), PAGE);
        assert_eq!(tracking.region_counts().handles, 3);
    }

    #[test]
    fn first_query_reports_everything_once() {
        let (manager, tracking) = setup();
        let handle = tracking
            .begin_granular_tracking(0, PAGE * PAGES, PAGE)
            .unwrap();

        assert_eq!(modified(&handle, 0, PAGE * PAGES), [(0, PAGE * PAGES)]);
        assert!(modified(&handle, 0, PAGE * PAGES).is_empty());

        // The whole range was reprotected in one call.
        assert_eq!(
            manager.protection_calls(),
            [ProtectionCall::new(0, PAGE * PAGES, MemoryPermission::READ)]
        );
    }

    #[test]
    fn reports_written_pages_in_ascending_order() {
        let (_, tracking) = setup();
        let handle = tracking
            .begin_granular_tracking(0, PAGE * PAGES, PAGE)
            .unwrap();
        modified(&handle, 0, PAGE * PAGES);

        let mut rng = StdRng::seed_from_u64(7);
        let mut pages: Vec<u64> = (0..PAGES).collect();
        pages.shuffle(&mut rng);
        let written = &pages[..PAGES as usize / 2];

        for &page in written {
            tracking.virtual_memory_event(page * PAGE + 8, 4, true, false);
        }

        let runs = modified(&handle, 0, PAGE * PAGES);
        assert!(runs.windows(2).all(|pair| pair[0].0 + pair[0].1 < pair[1].0));

        let mut reported: Vec<u64> = runs
            .iter()
            .flat_map(|&(address, size)| (address / PAGE)..(address + size) / PAGE)
            .collect();
        let mut expected = written.to_vec();
        expected.sort();
        reported.dedup();
        assert_eq!(reported, expected);

        let total: u64 = runs.iter().map(|&(_, size)| size).sum();
        assert_eq!(total, written.len() as u64 * PAGE);
    }

    #[test]
    fn partial_query_only_touches_overlapping_slices() {
        let (_, tracking) = setup();
        let handle = tracking.begin_granular_tracking(0, PAGE * 8, PAGE).unwrap();

        assert_eq!(modified(&handle, PAGE * 2 + 1, PAGE), [(PAGE * 2, PAGE * 2)]);
        assert_eq!(modified(&handle, 0, PAGE * 8), [(0, PAGE * 2), (PAGE * 4, PAGE * 4)]);
        assert!(modified(&handle, PAGE * 8, PAGE).is_empty());
    }

    #[test]
    fn sequence_numbers_gate_repeats() {
        let (_, tracking) = setup();
        let handle = tracking
            .begin_granular_tracking(0, PAGE * PAGES, PAGE)
            .unwrap();
        modified(&handle, 0, PAGE * PAGES);

        // Consume the first half under sequence 1.
        tracking.virtual_memory_event(0, PAGE * PAGES, true, false);
        let half = PAGE * PAGES / 2;
        assert_eq!(modified_with_sequence(&handle, 0, half, 1), [(0, half)]);

        tracking.virtual_memory_event(0, PAGE * PAGES, true, false);
        assert_eq!(
            modified_with_sequence(&handle, 0, PAGE * PAGES, 1),
            [(half, half)]
        );
        assert!(modified_with_sequence(&handle, 0, PAGE * PAGES, 1).is_empty());

        // The first half is still dirty, and a new sequence reports it.
        assert_eq!(
            modified_with_sequence(&handle, 0, PAGE * PAGES, 2),
            [(0, half)]
        );
        assert!(modified_with_sequence(&handle, 0, PAGE * PAGES, 3).is_empty());
    }

    #[test]
    fn query_all_is_gated_by_write_flag() {
        let (_, tracking) = setup();
        let handle = tracking.begin_granular_tracking(0, PAGE * 4, PAGE).unwrap();
        assert!(handle.dirty());

        let mut runs = Vec::new();
        handle.query_all_modified(&mut |address, size| runs.push((address, size)));
        assert_eq!(runs, [(0, PAGE * 4)]);
        assert!(!handle.dirty());

        // Forced dirt on a slice is invisible to the gated query until a write arrives.
        handle.handles()[1].force_dirty();
        runs.clear();
        handle.query_all_modified(&mut |address, size| runs.push((address, size)));
        assert!(runs.is_empty());

        tracking.virtual_memory_event(PAGE * 3, 4, true, false);
        assert!(handle.dirty());
        handle.query_all_modified(&mut |address, size| runs.push((address, size)));
        assert_eq!(runs, [(PAGE, PAGE), (PAGE * 3, PAGE)]);
    }

    #[test]
    fn force_dirty_marks_overlapping_slices() {
        let (manager, tracking) = setup();
        let handle = tracking.begin_granular_tracking(0, PAGE * 4, PAGE).unwrap();
        modified(&handle, 0, PAGE * 4);
        manager.take_protection_calls();

        handle.force_dirty(PAGE, PAGE + 1);
        assert!(handle.dirty());
        assert!(manager.protection_calls().is_empty());
        assert_eq!(modified(&handle, 0, PAGE * 4), [(PAGE, PAGE * 2)]);
    }

    #[test]
    fn register_action_reports_slice_range() {
        let (_, tracking) = setup();
        let handle = tracking.begin_granular_tracking(0, PAGE * 4, PAGE).unwrap();
        modified(&handle, 0, PAGE * 4);

        let fired = Arc::new(Mutex::new(Vec::new()));
        let log = fired.clone();
        handle.register_action(
            PAGE,
            PAGE * 2,
            Arc::new(move |address: u64, size: u64| {
                log.lock().unwrap().push((address, size))
            }),
        );

        tracking.virtual_memory_event(PAGE * 2 + 16, 4, false, false);
        tracking.virtual_memory_event(0, 4, false, false);
        assert_eq!(*fired.lock().unwrap(), [(PAGE * 2, PAGE)]);
    }

    #[test]
    fn precise_action_applies_to_overlapping_slices() {
        let (_, tracking) = setup();
        let handle = tracking.begin_granular_tracking(0, PAGE * 4, PAGE).unwrap();
        modified(&handle, 0, PAGE * 4);

        handle.register_precise_action(0, PAGE, Arc::new(|_: u64, _: u64, _: bool| true));
        tracking.virtual_memory_event(0, PAGE * 2, true, true);

        assert_eq!(modified(&handle, 0, PAGE * 4), [(PAGE, PAGE)]);
    }

    #[test]
    fn overlapping_handles_are_independent() {
        let (manager, tracking) = setup();
        let a = tracking.begin_granular_tracking(0, PAGE * 4, PAGE).unwrap();
        let b = tracking
            .begin_granular_tracking(PAGE * 2, PAGE * 4, PAGE * 2)
            .unwrap();

        modified(&a, 0, PAGE * 4);

        // Dirty slices of `b` don't lift the write protection `a` needs.
        assert_eq!(manager.permission(PAGE * 3), Some(MemoryPermission::READ));

        tracking.virtual_memory_event(PAGE * 3, 4, true, false);
        assert_eq!(
            manager.permission(PAGE * 3),
            Some(MemoryPermission::READ_AND_WRITE)
        );
        assert_eq!(modified(&a, 0, PAGE * 4), [(PAGE * 3, PAGE)]);
        assert_eq!(modified(&b, 0, PAGE * 8), [(PAGE * 2, PAGE * 4)]);
    }

    #[test]
    fn dispose_removes_every_slice() {
        let (_, tracking) = setup();
        let handle = tracking.begin_granular_tracking(0, PAGE * 4, PAGE).unwrap();
        assert_eq!(tracking.region_count(), 4);

        handle.dispose();
        assert_eq!(tracking.region_count(), 0);
        assert!(modified(&handle, 0, PAGE * 4).is_empty());

        drop(handle);
        assert_eq!(tracking.region_counts().handles, 0);
    }

    #[test]
    fn matching_handles_are_adopted() {
        let (_, tracking) = setup();
        let old = tracking.begin_granular_tracking(0, PAGE * 4, PAGE).unwrap();
        modified(&old, 0, PAGE * 4);
        tracking.virtual_memory_event(PAGE * 2, 4, true, false);

        let handle = tracking
            .begin_granular_tracking_with_handles(0, PAGE * 8, old.into_handles(), PAGE, 0)
            .unwrap();
        assert_eq!(tracking.region_counts().handles, 8);

        // The pending write survived, the new slices start dirty.
        assert_eq!(
            modified(&handle, 0, PAGE * 8),
            [(PAGE * 2, PAGE), (PAGE * 4, PAGE * 4)]
        );

        let mut runs = Vec::new();
        handle.query_all_modified(&mut |address, size| runs.push((address, size)));
        assert!(runs.is_empty());
        assert!(!handle.dirty());

        // Adopted slices report writes to their new owner.
        tracking.virtual_memory_event(PAGE, 4, true, false);
        assert!(handle.dirty());
    }

    #[test]
    fn larger_handle_passes_state_to_slices() {
        let (_, tracking) = setup();
        let old = tracking.begin_tracking(PAGE, PAGE * 2);
        old.reprotect(false);

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        old.register_action(move |address, size| sink.lock().unwrap().push((address, size)));

        let handle = tracking
            .begin_granular_tracking_with_handles(0, PAGE * 4, [old], PAGE, 0)
            .unwrap();
        assert_eq!(tracking.region_counts().handles, 4);
        assert_eq!(modified(&handle, 0, PAGE * 4), [(0, PAGE), (PAGE * 3, PAGE)]);

        tracking.virtual_memory_event(PAGE * 2 + 8, 4, false, false);
        tracking.virtual_memory_event(PAGE * 2 + 8, 4, false, false);
        assert_eq!(*fired.lock().unwrap(), [(PAGE * 2 + 8, 4)]);
    }

    #[test]
    fn inherited_sequence_numbers_still_gate() {
        let (_, tracking) = setup();
        let old = tracking.begin_granular_tracking(0, PAGE * 4, PAGE * 2).unwrap();
        assert_eq!(modified_with_sequence(&old, 0, PAGE * 4, 7), [(0, PAGE * 4)]);
        tracking.virtual_memory_event(0, PAGE * 4, true, false);

        let handle = tracking
            .begin_granular_tracking_with_handles(0, PAGE * 4, old.into_handles(), PAGE, 0)
            .unwrap();
        assert_eq!(handle.handles().len(), 4);

        assert!(modified_with_sequence(&handle, 0, PAGE * 4, 7).is_empty());
        assert_eq!(modified_with_sequence(&handle, 0, PAGE * 4, 8), [(0, PAGE * 4)]);
    }
}
