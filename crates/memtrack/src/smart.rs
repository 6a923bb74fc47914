//! Multi-region handles that adapt their tiling to the queries they get.
//!
//! A smart handle starts as a single tile over its whole range. Every query splits the
//! tiles straddling its boundaries, rounded out to the granularity, so that later queries
//! of the same shape are answered by whole tiles. Tiles are never merged back: a resource
//! checked in large chunks keeps few handles, one checked finely ends up tracked finely.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::{
    HumanAddress, HumanRange, MemoryTracking, PreciseRegionSignal, RegionHandle, RegionSignal,
    multi_region::{ModifiedRuns, MultiRegion, check_modified},
};

struct Tile {
    handle: RegionHandle,
    /// The action last registered on this tile, as the caller gave it. The handle is armed
    /// with a wrapper reporting the tile's range instead.
    action: Option<RegionSignal>,
}

impl Tile {
    fn new(handle: RegionHandle) -> Self {
        Self {
            handle,
            action: None,
        }
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.handle.overlaps_real(start, end)
    }

    fn arm(&mut self, action: RegionSignal) {
        let (start, len) = (self.handle.real_address(), self.handle.real_size());
        let reported = action.clone();
        self.action = Some(action);
        self.handle
            .register_signal(Arc::new(move |_: u64, _: u64| reported(start, len)));
    }
}

/// A multi-region handle with query-driven tiling.
pub struct SmartMultiRegionHandle {
    tracking: MemoryTracking,
    address: u64,
    size: u64,
    granularity: u64,
    id: u32,
    /// Sorted by address, tiling `[address, address + size)` exactly. Empty once disposed.
    tiles: Mutex<Vec<Tile>>,
    dirty: Arc<AtomicBool>,
}

impl SmartMultiRegionHandle {
    pub(crate) fn new(
        tracking: MemoryTracking,
        address: u64,
        size: u64,
        granularity: u64,
        id: u32,
    ) -> Self {
        let dirty = Arc::new(AtomicBool::new(true));
        let tile = tracking.begin_tracking_inner(address, size, id, Some(dirty.clone()));

        log::debug!(
            "smart tracking of {} with granularity {}",
            HumanRange::new(address, size),
            HumanAddress(granularity)
        );

        Self {
            tracking,
            address,
            size,
            granularity,
            id,
            tiles: Mutex::new(alloc::vec![Tile::new(tile)]),
            dirty,
        }
    }

    /// The finest tiling a query can produce.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// The current tiling, as `(address, size)` pairs in ascending order.
    pub fn tiles(&self) -> Vec<(u64, u64)> {
        self.tiles
            .lock()
            .iter()
            .map(|tile| (tile.handle.real_address(), tile.handle.real_size()))
            .collect()
    }

    fn end(&self) -> u64 {
        self.address + self.size
    }

    fn track(&self, address: u64, size: u64) -> Tile {
        Tile::new(
            self.tracking
                .begin_tracking_inner(address, size, self.id, Some(self.dirty.clone())),
        )
    }

    /// Makes `at` a tile boundary, splitting the tile straddling it.
    fn split_at(&self, tiles: &mut Vec<Tile>, at: u64) {
        let index = tiles.partition_point(|tile| tile.handle.real_end_address() <= at);
        match tiles.get(index) {
            Some(tile) if tile.handle.real_address() < at => {}
            _ => return,
        }

        let old = &tiles[index].handle;
        let was_dirty = old.dirty();
        let state = old.state();
        let precise = state.peek_precise_action();
        let sequence = state.sequence();
        // Only an action that hasn't fired yet moves to the halves.
        let pending = tiles[index]
            .action
            .clone()
            .filter(|_| state.peek_action().is_some());

        log::debug!(
            "splitting tile {} at {}",
            HumanRange::new(old.real_address(), old.real_size()),
            HumanAddress(at)
        );

        // The halves are registered before the old tile goes away, so a write landing
        // during the split reaches at least one of them.
        let mut low = self.track(old.real_address(), at - old.real_address());
        let mut high = self.track(at, old.real_end_address() - at);
        for half in [&mut low, &mut high] {
            half.handle.state().set_sequence(sequence);
            if let Some(precise) = &precise {
                half.handle.register_precise_signal(precise.clone());
            }
            if let Some(action) = &pending {
                half.arm(action.clone());
            }
            if !was_dirty {
                half.handle.reprotect(false);
            }
        }

        // The halves are armed before the action leaves the old tile, so an access in between
        // can't slip past all of them. If it fired on the old tile meanwhile, it is spent.
        if pending.is_some() && state.take_action().is_none() {
            for half in [&mut low, &mut high] {
                half.action = None;
                half.handle.state().take_action();
                self.tracking
                    .update_protection(half.handle.address(), half.handle.end_address());
            }
        }

        // A write between the dirty check and the reprotect above would be lost otherwise.
        let raced = !was_dirty && state.is_dirty();

        let old = tiles.splice(index..=index, [low, high]).collect::<Vec<_>>();
        for tile in &old {
            tile.handle.dispose();
        }

        if raced {
            tiles[index].handle.force_dirty();
            tiles[index + 1].handle.force_dirty();
        }
    }

    fn query(
        &self,
        address: u64,
        size: u64,
        sequence: Option<u32>,
        callback: &mut dyn FnMut(u64, u64),
    ) {
        let start = address.max(self.address);
        let end = address.saturating_add(size).min(self.end());
        if start >= end {
            return;
        }

        // Retile on granularity boundaries.
        let lo = self.address + (start - self.address) / self.granularity * self.granularity;
        let hi = self.address
            + (end - self.address)
                .div_ceil(self.granularity)
                .checked_mul(self.granularity)
                .map_or(self.size, |span| span.min(self.size));

        let mut runs = ModifiedRuns::default();
        {
            let mut tiles = self.tiles.lock();
            if tiles.is_empty() {
                return;
            }

            self.split_at(&mut tiles, lo);
            self.split_at(&mut tiles, hi);

            let first = tiles.partition_point(|tile| tile.handle.real_end_address() <= lo);
            for tile in &tiles[first..] {
                if tile.handle.real_address() >= hi {
                    break;
                }
                if check_modified(&tile.handle, sequence) {
                    runs.consume(&tile.handle);
                }
            }
        }

        // Callbacks run unlocked so they may query again.
        runs.report(&self.tracking, callback);
    }

    /// Runs `f` on every tile overlapping `[address, address + size)`.
    fn for_overlapping(&self, address: u64, size: u64, mut f: impl FnMut(&mut Tile)) {
        let end = address.saturating_add(size);
        for tile in self.tiles.lock().iter_mut() {
            if tile.overlaps(address, end) {
                f(tile);
            }
        }
    }
}

impl MultiRegion for SmartMultiRegionHandle {
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
        self.for_overlapping(address, size, |tile| tile.handle.force_dirty());
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
        self.for_overlapping(address, size, |tile| tile.arm(action.clone()));
    }

    fn register_precise_action(&self, address: u64, size: u64, action: PreciseRegionSignal) {
        self.for_overlapping(address, size, |tile| {
            tile.handle.register_precise_signal(action.clone());
        });
    }

    fn dispose(&self) {
        let tiles = core::mem::take(&mut *self.tiles.lock());
        for tile in &tiles {
            tile.handle.dispose();
        }
    }
}
