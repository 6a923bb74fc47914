//! The virtual region tree.
//!
//! The tracked address space is partitioned into non-overlapping [`VirtualRegion`]s, each a
//! range over which the set of interested handles is constant. Creating a handle splits the
//! regions at its boundaries and fills the gaps it covers; disposing one drops the regions
//! left without handles and merges neighbours that became indistinguishable.
//!
//! Regions live in a generational arena and are indexed by start address. Regions refer to
//! handles by arena index rather than by reference, so the tree never keeps a handle alive.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    vec::Vec,
};

use spin::{Mutex, MutexGuard};

use crate::{
    HumanAddress, HumanRange, MemoryPermission, VirtualMemoryManager,
    arena::{Arena, Index},
    handle::HandleState,
};

pub(crate) type HandleId = Index<Arc<HandleState>>;
pub(crate) type RegionId = Index<VirtualRegion>;

/// A maximal range with a constant set of interested handles.
pub(crate) struct VirtualRegion {
    pub(crate) start: u64,
    pub(crate) end: u64,
    /// Handles covering this whole region, sorted.
    pub(crate) handles: Vec<HandleId>,
    /// Protection last handed to the manager. `None` when it is unknown, for example after
    /// the memory was unmapped.
    applied: Mutex<Option<MemoryPermission>>,
}

impl VirtualRegion {
    fn new(
        start: u64,
        end: u64,
        handles: Vec<HandleId>,
        applied: Option<MemoryPermission>,
    ) -> Self {
        Self {
            start,
            end,
            handles,
            applied: Mutex::new(applied),
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.end - self.start
    }

    pub(crate) fn applied(&self) -> Option<MemoryPermission> {
        *self.applied.lock()
    }
}

/// A protection change to hand to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProtectionChange {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) permission: MemoryPermission,
}

/// Records a change, extending the previous one when the two are contiguous and agree.
fn push_change(
    changes: &mut Vec<ProtectionChange>,
    start: u64,
    end: u64,
    permission: MemoryPermission,
) {
    if let Some(last) = changes.last_mut() {
        if last.end == start && last.permission == permission {
            last.end = end;
            return;
        }
    }

    changes.push(ProtectionChange {
        start,
        end,
        permission,
    });
}

fn apply_changes(changes: &[ProtectionChange], manager: &dyn VirtualMemoryManager) {
    for change in changes {
        let size = change.end - change.start;
        log::trace!(
            "reprotecting {} as {:?}",
            HumanRange::new(change.start, size),
            change.permission
        );
        manager.tracking_reprotect(change.start, size, change.permission);
    }
}

/// Regions and the handles registered on them.
pub(crate) struct RegionTree {
    regions: Arena<VirtualRegion>,
    by_start: BTreeMap<u64, RegionId>,
    handles: Arena<Arc<HandleState>>,
}

impl RegionTree {
    pub(crate) const fn new() -> Self {
        Self {
            regions: Arena::new(),
            by_start: BTreeMap::new(),
            handles: Arena::new(),
        }
    }

    /// Number of regions in the tree.
    pub(crate) fn region_count(&self) -> usize {
        self.by_start.len()
    }

    /// Number of live handles registered in the tree.
    pub(crate) fn handle_count(&self) -> usize {
        self.handles.len()
    }

    fn region(&self, id: RegionId) -> &VirtualRegion {
        self.regions
            .get(id)
            .expect("region index points at a removed region")
    }

    fn region_mut(&mut self, id: RegionId) -> &mut VirtualRegion {
        self.regions
            .get_mut(id)
            .expect("region index points at a removed region")
    }

    /// Regions overlapping `[start, end)`, in ascending address order.
    pub(crate) fn overlapping(
        &self,
        start: u64,
        end: u64,
    ) -> impl Iterator<Item = (RegionId, &VirtualRegion)> + '_ {
        // The region containing `start` may begin before it.
        let from = match self.by_start.range(..=start).next_back() {
            Some((&region_start, &id)) if self.region(id).end > start => region_start,
            _ => start,
        };

        self.by_start
            .range(from..end.max(from))
            .map(|(_, &id)| (id, self.region(id)))
    }

    /// Returns true if any region overlaps `[start, end)`.
    pub(crate) fn any_overlapping(&self, start: u64, end: u64) -> bool {
        !self.handles.is_empty() && self.overlapping(start, end).next().is_some()
    }

    /// Distinct handles registered on regions overlapping `[start, end)`, in order of first
    /// appearance.
    pub(crate) fn handles_overlapping(&self, start: u64, end: u64) -> Vec<Arc<HandleState>> {
        let mut seen = BTreeSet::new();
        let mut handles = Vec::new();

        for (_, region) in self.overlapping(start, end) {
            for &id in &region.handles {
                if !seen.insert(id) {
                    continue;
                }
                if let Some(handle) = self.handles.get(id) {
                    handles.push(handle.clone());
                }
            }
        }

        handles
    }

    /// Splits the region strictly containing `address`, if any, so that a region boundary
    /// falls on `address`. The upper half keeps the handles and the applied protection.
    fn split_at(&mut self, address: u64) {
        let Some((_, &id)) = self.by_start.range(..address).next_back() else {
            return;
        };

        let region = self.region_mut(id);
        if region.end <= address {
            return;
        }

        let applied = *region.applied.lock();
        let upper = VirtualRegion::new(address, region.end, region.handles.clone(), applied);
        log::trace!(
            "splitting region {} at {}",
            HumanRange::new(region.start, region.size()),
            HumanAddress(address)
        );
        region.end = address;

        let upper = self.regions.insert(upper);
        self.by_start.insert(address, upper);
    }

    fn insert_region(&mut self, start: u64, end: u64) -> RegionId {
        log::trace!("adding region {}", HumanRange::new(start, end - start));

        // Untracked memory is left unprotected.
        let region = VirtualRegion::new(
            start,
            end,
            Vec::new(),
            Some(MemoryPermission::READ_AND_WRITE),
        );
        let id = self.regions.insert(region);
        self.by_start.insert(start, id);
        id
    }

    /// Returns the regions exactly covering `[start, end)`, splitting existing regions at the
    /// boundaries and creating regions over the gaps.
    fn get_or_add_regions(&mut self, start: u64, end: u64) -> Vec<RegionId> {
        self.split_at(start);
        self.split_at(end);

        // After the splits every region overlapping the range starts inside it.
        let existing: Vec<(u64, RegionId)> = self
            .by_start
            .range(start..end)
            .map(|(&region_start, &id)| (region_start, id))
            .collect();

        let mut regions = Vec::with_capacity(existing.len() + 1);
        let mut cursor = start;
        for (region_start, id) in existing {
            if cursor < region_start {
                regions.push(self.insert_region(cursor, region_start));
            }
            regions.push(id);
            cursor = self.region(id).end;
        }

        if cursor < end {
            regions.push(self.insert_region(cursor, end));
        }

        regions
    }

    /// Registers a handle on every region covering its aligned range.
    ///
    /// Does not change protection. New handles start dirty or unmapped, and either way they
    /// allow everything.
    pub(crate) fn add_handle(&mut self, state: Arc<HandleState>) -> HandleId {
        let (start, end) = (state.address, state.end());
        let id = self.handles.insert(state);

        for region in self.get_or_add_regions(start, end) {
            let handles = &mut self.region_mut(region).handles;
            if let Err(position) = handles.binary_search(&id) {
                handles.insert(position, id);
            }
        }

        id
    }

    /// Unregisters a handle, reverting its protection contribution.
    pub(crate) fn remove_handle(&mut self, id: HandleId, manager: &dyn VirtualMemoryManager) {
        let Some(state) = self.handles.remove(id) else {
            return;
        };
        let (start, end) = (state.address, state.end());

        let affected: Vec<RegionId> = self.overlapping(start, end).map(|(id, _)| id).collect();
        for &region in &affected {
            let handles = &mut self.region_mut(region).handles;
            if let Ok(position) = handles.binary_search(&id) {
                handles.remove(position);
            }
        }

        let mut changes = Vec::new();
        for &region_id in &affected {
            let region = self.region(region_id);
            let required = self.required_permission(region);
            let mut applied = region.applied.lock();
            if *applied != Some(required) {
                *applied = Some(required);
                push_change(&mut changes, region.start, region.end, required);
            }
        }

        for &region_id in &affected {
            if self.region(region_id).handles.is_empty() {
                if let Some(region) = self.regions.remove(region_id) {
                    log::trace!(
                        "removing region {}",
                        HumanRange::new(region.start, region.size())
                    );
                    self.by_start.remove(&region.start);
                }
            }
        }

        self.merge_around(start, end);
        apply_changes(&changes, manager);
    }

    /// Merges adjacent regions around `[start, end)` that have the same handles and the same
    /// applied protection.
    fn merge_around(&mut self, start: u64, end: u64) {
        let candidates: Vec<RegionId> = self
            .overlapping(start.saturating_sub(1), end.saturating_add(1))
            .map(|(id, _)| id)
            .collect();

        let mut candidates = candidates.into_iter();
        let Some(mut current) = candidates.next() else {
            return;
        };

        for next in candidates {
            let (lower, upper) = (self.region(current), self.region(next));
            let mergeable = lower.end == upper.start
                && lower.handles == upper.handles
                && lower.applied() == upper.applied();

            if !mergeable {
                current = next;
                continue;
            }

            let Some(upper) = self.regions.remove(next) else {
                continue;
            };
            self.by_start.remove(&upper.start);

            let lower = self.region_mut(current);
            log::trace!(
                "merging region {} into {}",
                HumanRange::new(upper.start, upper.size()),
                HumanRange::new(lower.start, lower.size())
            );
            lower.end = upper.end;
        }
    }

    /// The protection every handle on `region` can live with.
    fn required_permission(&self, region: &VirtualRegion) -> MemoryPermission {
        let mut required = MemoryPermission::READ_AND_WRITE;

        for &id in &region.handles {
            if let Some(handle) = self.handles.get(id) {
                required &= handle.required_permission();
                if required == MemoryPermission::NONE {
                    break;
                }
            }
        }

        required
    }

    /// Recomputes protection for the regions overlapping `[start, end)` and hands changes to
    /// the manager, one call per contiguous run with the same new permission.
    ///
    /// The regions stay locked in ascending order until the manager has been called, so two
    /// concurrent updates of the same region can't apply their results out of order.
    pub(crate) fn update_protection(
        &self,
        start: u64,
        end: u64,
        manager: &dyn VirtualMemoryManager,
    ) -> bool {
        let mut guards: Vec<MutexGuard<'_, Option<MemoryPermission>>> = Vec::new();
        let mut changes = Vec::new();

        for (_, region) in self.overlapping(start, end) {
            let mut applied = region.applied.lock();
            let required = self.required_permission(region);
            if *applied != Some(required) {
                *applied = Some(required);
                push_change(&mut changes, region.start, region.end, required);
            }
            guards.push(applied);
        }

        apply_changes(&changes, manager);
        drop(guards);

        !changes.is_empty()
    }

    /// Updates the mapped state of the handles on regions overlapping `[start, end)` and
    /// forgets the protection applied to those regions.
    ///
    /// On map, only handles whose whole range is mapped again are restored. Returns the span
    /// of the handles whose state changed, if any.
    pub(crate) fn signal_mapping_changed(
        &self,
        start: u64,
        end: u64,
        mapped: bool,
        manager: &dyn VirtualMemoryManager,
    ) -> Option<(u64, u64)> {
        for (_, region) in self.overlapping(start, end) {
            *region.applied.lock() = None;
        }

        let mut span: Option<(u64, u64)> = None;
        for handle in self.handles_overlapping(start, end) {
            if handle.is_unmapped() == !mapped {
                continue;
            }
            if mapped && !manager.is_range_mapped(handle.address, handle.size) {
                continue;
            }

            handle.signal_mapping_changed(mapped);
            span = Some(match span {
                Some((lo, hi)) => (lo.min(handle.address), hi.max(handle.end())),
                None => (handle.address, handle.end()),
            });
        }

        span
    }

    /// Checks the structural invariants of the tree.
    #[cfg(test)]
    pub(crate) fn validate(&self) {
        let mut previous_end = None;
        for (&start, &id) in &self.by_start {
            let region = self.region(id);
            assert_eq!(region.start, start, "index key differs from region start");
            assert!(region.start < region.end, "empty region at {start:#x}");
            assert!(!region.handles.is_empty(), "region at {start:#x} has no handles");
            if let Some(previous_end) = previous_end {
                assert!(previous_end <= region.start, "regions overlap at {start:#x}");
            }
            previous_end = Some(region.end);

            let mut expected: Vec<HandleId> = self
                .handles
                .iter()
                .filter(|(_, handle)| handle.address <= region.start && region.end <= handle.end())
                .map(|(id, _)| id)
                .collect();
            expected.sort();
            assert_eq!(region.handles, expected, "wrong handles at {start:#x}");
        }

        for (id, handle) in self.handles.iter() {
            let covered: u64 = self
                .overlapping(handle.address, handle.end())
                .filter(|(_, region)| region.handles.contains(&id))
                .map(|(_, region)| region.size())
                .sum();
            assert_eq!(covered, handle.size, "handle {id:?} is not fully covered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    const PAGE: u64 = 0x1000;

    #[derive(Default)]
    struct RecordingManager {
        calls: Mutex<Vec<(u64, u64, MemoryPermission)>>,
    }

    impl VirtualMemoryManager for RecordingManager {
        fn tracking_reprotect(&self, address: u64, size: u64, permission: MemoryPermission) {
            self.calls.lock().push((address, size, permission));
        }
    }

    fn handle(address: u64, size: u64) -> Arc<HandleState> {
        Arc::new(HandleState::new((address, size), (address, size), 0, true, None))
    }

    fn ranges(tree: &RegionTree) -> Vec<(u64, u64)> {
        tree.overlapping(0, u64::MAX)
            .map(|(_, region)| (region.start, region.end))
            .collect()
    }

    #[test]
    fn contained_handle_splits_into_three() {
        let manager = RecordingManager::default();
        let mut tree = RegionTree::new();

        let small = tree.add_handle(handle(PAGE, PAGE));
        let big = tree.add_handle(handle(0, PAGE * 4));
        tree.validate();
        assert_eq!(
            ranges(&tree),
            [(0, PAGE), (PAGE, PAGE * 2), (PAGE * 2, PAGE * 4)]
        );

        tree.remove_handle(big, &manager);
        tree.validate();
        assert_eq!(ranges(&tree), [(PAGE, PAGE * 2)]);

        tree.remove_handle(small, &manager);
        tree.validate();
        assert_eq!(tree.region_count(), 0);
        assert_eq!(tree.handle_count(), 0);
    }

    #[test]
    fn disjoint_handles_leave_gap_untracked() {
        let mut tree = RegionTree::new();
        tree.add_handle(handle(0, PAGE));
        tree.add_handle(handle(PAGE * 4, PAGE));
        tree.validate();

        assert_eq!(ranges(&tree), [(0, PAGE), (PAGE * 4, PAGE * 5)]);
        assert!(!tree.any_overlapping(PAGE, PAGE * 4));
        assert!(tree.any_overlapping(PAGE * 3, PAGE * 4 + 1));
    }

    #[test]
    fn removal_merges_identical_neighbours() {
        let manager = RecordingManager::default();
        let mut tree = RegionTree::new();

        tree.add_handle(handle(0, PAGE * 3));
        let middle = tree.add_handle(handle(PAGE, PAGE));
        assert_eq!(tree.region_count(), 3);

        tree.remove_handle(middle, &manager);
        tree.validate();
        assert_eq!(ranges(&tree), [(0, PAGE * 3)]);
    }

    #[test]
    fn split_keeps_applied_protection() {
        let manager = RecordingManager::default();
        let mut tree = RegionTree::new();

        let state = handle(0, PAGE * 2);
        state.set_dirty(false);
        tree.add_handle(state);
        assert!(tree.update_protection(0, PAGE * 2, &manager));

        tree.add_handle(handle(PAGE, PAGE * 2));
        let applied: Vec<_> = tree
            .overlapping(0, PAGE * 3)
            .map(|(_, region)| region.applied())
            .collect();
        assert_eq!(
            applied,
            [
                Some(MemoryPermission::READ),
                Some(MemoryPermission::READ),
                Some(MemoryPermission::READ_AND_WRITE)
            ]
        );
    }

    #[test]
    fn update_protection_coalesces_runs() {
        let manager = RecordingManager::default();
        let mut tree = RegionTree::new();

        for page in 0..4 {
            let state = handle(page * PAGE, PAGE);
            state.set_dirty(false);
            tree.add_handle(state);
        }

        assert!(tree.update_protection(0, PAGE * 4, &manager));
        assert_eq!(
            *manager.calls.lock(),
            [(0, PAGE * 4, MemoryPermission::READ)]
        );

        // Nothing changed, nothing to apply.
        assert!(!tree.update_protection(0, PAGE * 4, &manager));
        assert_eq!(manager.calls.lock().len(), 1);
    }

    #[test]
    fn most_restrictive_handle_wins() {
        let manager = RecordingManager::default();
        let mut tree = RegionTree::new();

        let reader = handle(0, PAGE);
        reader.set_dirty(false);
        reader.arm(Arc::new(|_: u64, _: u64| {}));
        tree.add_handle(reader);
        tree.add_handle(handle(0, PAGE));

        tree.update_protection(0, PAGE, &manager);
        assert_eq!(*manager.calls.lock(), [(0, PAGE, MemoryPermission::NONE)]);
    }

    #[test]
    fn removing_last_handle_unprotects() {
        let manager = RecordingManager::default();
        let mut tree = RegionTree::new();

        let state = handle(0, PAGE);
        state.set_dirty(false);
        let id = tree.add_handle(state);
        tree.update_protection(0, PAGE, &manager);

        tree.remove_handle(id, &manager);
        assert_eq!(
            *manager.calls.lock(),
            [
                (0, PAGE, MemoryPermission::READ),
                (0, PAGE, MemoryPermission::READ_AND_WRITE)
            ]
        );
    }

    #[test]
    fn handles_overlapping_is_deduplicated() {
        let mut tree = RegionTree::new();
        tree.add_handle(handle(0, PAGE * 4));
        tree.add_handle(handle(PAGE, PAGE));
        tree.add_handle(handle(PAGE * 2, PAGE));

        assert_eq!(tree.handles_overlapping(0, PAGE * 4).len(), 3);
        assert_eq!(tree.handles_overlapping(PAGE * 3, PAGE * 4).len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { page: u64, pages: u64 },
        Remove { pick: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u64..32, 1u64..8).prop_map(|(page, pages)| Op::Add { page, pages }),
            2 => any::<usize>().prop_map(|pick| Op::Remove { pick }),
        ]
    }

    proptest! {
        #[test]
        fn tree_stays_consistent(ops in prop::collection::vec(op_strategy(), 1..64)) {
            let manager = RecordingManager::default();
            let mut tree = RegionTree::new();
            let mut live = Vec::new();

            for op in ops {
                match op {
                    Op::Add { page, pages } => {
                        live.push(tree.add_handle(handle(page * PAGE, pages * PAGE)));
                    }
                    Op::Remove { pick } if !live.is_empty() => {
                        let id = live.swap_remove(pick % live.len());
                        tree.remove_handle(id, &manager);
                    }
                    Op::Remove { .. } => {}
                }
                tree.validate();
                prop_assert_eq!(tree.handle_count(), live.len());
            }

            for id in live.drain(..) {
                tree.remove_handle(id, &manager);
            }
            prop_assert_eq!(tree.region_count(), 0);
        }
    }
}
