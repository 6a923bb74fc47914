//! Generational slot arena.
//!
//! The region tree stores both its regions and its handle references in arenas. Removed
//! slots are reused, and every removal bumps the slot's generation, so an [`Index`] that
//! outlived its value resolves to `None` instead of aliasing whatever took the slot next.

use alloc::vec::Vec;
use core::{cmp::Ordering, fmt, hash, marker::PhantomData};

/// A typed reference into an [`Arena`].
pub struct Index<T> {
    slot: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Index<T> {
    const fn new(slot: u32, generation: u32) -> Self {
        Self {
            slot,
            generation,
            _marker: PhantomData,
        }
    }

    /// Returns the slot this index points at.
    #[inline]
    pub const fn slot(self) -> usize {
        self.slot as usize
    }
}

// Manual impls: deriving would put bounds on `T`.
impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Index<T> {}

impl<T> PartialEq for Index<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Index<T> {}

impl<T> PartialOrd for Index<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Index<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.slot, self.generation).cmp(&(other.slot, other.generation))
    }
}

impl<T> hash::Hash for Index<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index({}v{})", self.slot, self.generation)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slot storage with generation-checked lookups.
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Returns the number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores a value, reusing a free slot if one exists.
    pub fn insert(&mut self, value: T) -> Index<T> {
        self.len += 1;

        if let Some(slot) = self.free_head {
            let entry = &mut self.entries[slot as usize];
            let generation = match *entry {
                Entry::Vacant {
                    generation,
                    next_free,
                } => {
                    self.free_head = next_free;
                    generation
                }
                Entry::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *entry = Entry::Occupied { generation, value };
            return Index::new(slot, generation);
        }

        let slot = u32::try_from(self.entries.len()).expect("arena slot count overflow");
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        Index::new(slot, 0)
    }

    /// Removes and returns the value at `index`, or `None` if the index is stale.
    pub fn remove(&mut self, index: Index<T>) -> Option<T> {
        let entry = self.entries.get_mut(index.slot())?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == index.generation => {}
            _ => return None,
        }

        let vacant = Entry::Vacant {
            generation: index.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Entry::Occupied { value, .. } = core::mem::replace(entry, vacant) else {
            unreachable!()
        };

        self.free_head = Some(index.slot);
        self.len -= 1;
        Some(value)
    }

    /// Returns the value at `index` if the index is still live.
    pub fn get(&self, index: Index<T>) -> Option<&T> {
        match self.entries.get(index.slot())? {
            Entry::Occupied { generation, value } if *generation == index.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Returns the value at `index` mutably if the index is still live.
    pub fn get_mut(&mut self, index: Index<T>) -> Option<&mut T> {
        match self.entries.get_mut(index.slot())? {
            Entry::Occupied { generation, value } if *generation == index.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Iterates over all live values in slot order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (Index<T>, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Entry::Occupied { generation, value } => {
                    Some((Index::new(slot as u32, *generation), value))
                }
                Entry::Vacant { .. } => None,
            })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
