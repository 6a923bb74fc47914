#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Memory Tracking (memtrack)
//!
//! Detects reads and writes to emulated guest memory at page granularity, so that caches
//! built on top of guest memory (translated code, GPU resources, snapshots) can refresh
//! their state without rescanning memory on every access. It provides:
//!
//! - A tree of non-overlapping virtual regions, each holding the set of handles interested
//!   in it and the host protection currently applied to it.
//! - [`RegionHandle`]s with a dirty flag, one-shot read actions and precise actions.
//! - Granular and "smart" multi-region handles with bulk [`MultiRegion::query_modified`].
//!
//! The engine never changes host page protection itself. It computes the permission each
//! region needs and hands it to a [`VirtualMemoryManager`], and it expects whoever catches
//! protection faults to report them through [`MemoryTracking::virtual_memory_event`].

extern crate alloc;

mod arena;
mod config;
#[cfg(any(test, feature = "software-emulation"))]
mod emulated;
mod error;
mod handle;
mod human;
mod manager;
mod multi_region;
mod permission;
mod region;
mod smart;
mod tracking;

pub use config::{DEFAULT_PAGE_SIZE, TrackingConfig};
#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::{EmulatedMemoryManager, ProtectionCall};
pub use error::{Result, TrackingError};
pub use handle::{PreciseRegionSignal, RegionHandle, RegionSignal};
pub use human::{HumanAddress, HumanRange, HumanSize};
pub use manager::VirtualMemoryManager;
pub use multi_region::{MultiRegion, MultiRegionHandle};
pub use permission::MemoryPermission;
pub use smart::SmartMultiRegionHandle;
pub use tracking::{MemoryTracking, RegionCounts};
