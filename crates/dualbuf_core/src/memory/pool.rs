//! # Slot Pool
//!
//! Growable slot allocator backing the reader registry.

/// A pool of slots addressed by generation-tagged handles.
///
/// The initial capacity is allocated up front. Freed slots are reused before
/// the pool grows, and growth only fails if the allocator does. A slot that is
/// freed and reused gets a new generation, so a handle kept around after its
/// slot was freed no longer resolves and cannot free the slot's new occupant.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. The registry wraps it in a mutex.
///
/// # Example
///
/// ```rust
/// use dualbuf_core::memory::SlotPool;
///
/// let mut pool: SlotPool<&str> = SlotPool::new(1);
/// let handle = pool.insert("reader").unwrap();
/// assert_eq!(pool.get(handle), Some(&"reader"));
///
/// // Grows past the initial capacity
/// let second = pool.insert("another").unwrap();
/// assert_eq!(pool.capacity(), 2);
/// assert_eq!(pool.get(second), Some(&"another"));
///
/// assert_eq!(pool.remove(handle), Some("reader"));
/// assert_eq!(pool.remove(handle), None);
/// ```
#[derive(Debug)]
pub struct SlotPool<T> {
    /// The storage array. Only ever grows.
    storage: Vec<Slot<T>>,
    /// Free list - indices of available slots.
    free_list: Vec<usize>,
    /// Number of occupied slots.
    len: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Handle to an occupied slot in a [`SlotPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: usize,
    generation: u32,
}

impl SlotHandle {
    /// Index of the slot this handle points at.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }

    /// Generation the slot had when this handle was issued.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> SlotPool<T> {
    /// Creates a pool with room for `capacity` values before it has to grow.
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than zero");

        let storage: Vec<Slot<T>> = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();

        Self {
            storage,
            free_list: (0..capacity).rev().collect(),
            len: 0,
        }
    }

    /// Returns the number of slots allocated so far, occupied or not.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Returns the number of occupied slots.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is occupied.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` in a free slot, growing the pool if none is left.
    ///
    /// Returns the value back if growing the pool failed to allocate.
    pub fn insert(&mut self, value: T) -> Result<SlotHandle, T> {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => match self.grow() {
                Some(index) => index,
                None => return Err(value),
            },
        };

        let slot = &mut self.storage[index];
        slot.value = Some(value);
        self.len += 1;

        Ok(SlotHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Appends one empty slot and returns its index.
    ///
    /// Reserves room in the free list too, so freeing the slot later never
    /// allocates.
    fn grow(&mut self) -> Option<usize> {
        self.storage.try_reserve(1).ok()?;
        // Only called with an empty free list
        self.free_list.try_reserve(self.storage.len() + 1).ok()?;

        let index = self.storage.len();
        self.storage.push(Slot {
            generation: 0,
            value: None,
        });
        Some(index)
    }

    /// Frees the slot behind `handle` and returns its value.
    ///
    /// Returns None if the handle is out of range, the slot is empty, or the
    /// slot has been reused since the handle was issued.
    pub fn remove(&mut self, handle: SlotHandle) -> Option<T> {
        let slot = self.storage.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.len -= 1;

        Some(value)
    }

    /// Gets a reference to the value behind `handle`.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        let slot = self.storage.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Removes every value, invalidating all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, slot) in self.storage.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index);
                drained.push(value);
            }
        }
        self.len = 0;
        drained
    }

    /// Iterates over all occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.storage.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotHandle {
                        index,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_insert_remove() {
        let mut pool: SlotPool<u32> = SlotPool::new(10);

        let h1 = pool.insert(42).unwrap();
        assert_eq!(*pool.get(h1).unwrap(), 42);
        assert_eq!(pool.len(), 1);

        let freed = pool.remove(h1).unwrap();
        assert_eq!(freed, 42);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_grows_when_full() {
        let mut pool: SlotPool<u32> = SlotPool::new(2);

        let handles: Vec<_> = (0..100).map(|i| pool.insert(i).unwrap()).collect();
        assert_eq!(pool.len(), 100);
        assert_eq!(pool.capacity(), 100);
        for (i, handle) in (0..100).zip(&handles) {
            assert_eq!(pool.get(*handle), Some(&i));
        }

        // Freed slots are reused before growing again
        for handle in &handles[..50] {
            pool.remove(*handle);
        }
        for i in 0..50 {
            assert!(pool.insert(i).is_ok());
        }
        assert_eq!(pool.capacity(), 100);
    }

    #[test]
    fn test_pool_reuse_bumps_generation() {
        let mut pool: SlotPool<u32> = SlotPool::new(1);

        let h1 = pool.insert(1).unwrap();
        pool.remove(h1);

        let h2 = pool.insert(2).unwrap();
        assert_eq!(h1.index(), h2.index()); // Same slot reused
        assert_ne!(h1.generation(), h2.generation());

        // Stale handle neither resolves nor frees the new occupant
        assert!(pool.get(h1).is_none());
        assert!(pool.remove(h1).is_none());
        assert_eq!(*pool.get(h2).unwrap(), 2);
    }

    #[test]
    fn test_pool_drain() {
        let mut pool: SlotPool<u32> = SlotPool::new(4);
        let h1 = pool.insert(1).unwrap();
        let _ = pool.insert(2).unwrap();

        let mut drained = pool.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(pool.is_empty());
        assert!(pool.remove(h1).is_none());

        // Every slot is free again
        for i in 0..4 {
            assert!(pool.insert(i).is_ok());
        }
    }

    #[test]
    fn test_pool_iter() {
        let mut pool: SlotPool<u32> = SlotPool::new(3);
        let h1 = pool.insert(10).unwrap();
        let h2 = pool.insert(20).unwrap();
        pool.remove(h1);

        let live: Vec<_> = pool.iter().collect();
        assert_eq!(live, vec![(h2, &20)]);
    }
}
