//! # Slot Pool
//!
//! Fixed-capacity slot storage for objects that are allocated and freed
//! individually and addressed through copyable handles.
//!
//! Every slot carries a generation counter. Freeing a slot bumps it, so a
//! handle kept after `free` no longer resolves instead of silently pointing
//! at whatever reused the slot.

use thiserror::Error;

/// Errors returned by [`SlotPool`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is in use.
    #[error("slot pool exhausted: capacity {capacity}")]
    Exhausted {
        /// Total capacity of the pool.
        capacity: usize,
    },

    /// The handle was already freed or belongs to a previous generation.
    #[error("stale slot handle: index {index}, generation {generation}")]
    StaleHandle {
        /// Slot index carried by the handle.
        index: u32,
        /// Generation carried by the handle.
        generation: u32,
    },
}

/// Handle to a value stored in a [`SlotPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    /// Index into the pool.
    index: u32,
    /// Generation of the slot when the handle was issued.
    generation: u32,
}

impl SlotHandle {
    /// Slot index of this handle.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of this handle.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// A fixed-capacity pool of `T` addressed by [`SlotHandle`].
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. Use one pool per thread or wrap in a mutex.
///
/// # Example
///
/// ```rust
/// use conduit_core::SlotPool;
///
/// let mut pool: SlotPool<&str> = SlotPool::new(4);
/// let handle = pool.allocate("owner").unwrap();
/// assert_eq!(pool.get(handle), Some(&"owner"));
/// assert_eq!(pool.free(handle), Ok("owner"));
/// assert!(pool.get(handle).is_none());
/// ```
pub struct SlotPool<T> {
    /// The storage array.
    slots: Box<[Slot<T>]>,
    /// Free list - indices of available slots.
    free_list: Vec<u32>,
    /// Number of allocated objects.
    allocated_count: usize,
}

impl<T> SlotPool<T> {
    /// Creates a new pool with the specified capacity.
    ///
    /// All slot memory is reserved upfront. A capacity of zero yields a pool
    /// that refuses every allocation.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        let slots: Vec<Slot<T>> = (0..capacity)
            .map(|_| Slot {
                value: None,
                generation: 0,
            })
            .collect();

        // Reverse order so index 0 is handed out first.
        let free_list: Vec<u32> = (0..capacity as u32).rev().collect();

        Self {
            slots: slots.into_boxed_slice(),
            free_list,
            allocated_count: 0,
        }
    }

    /// Returns the total capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of currently allocated objects.
    #[inline]
    #[must_use]
    pub const fn allocated_count(&self) -> usize {
        self.allocated_count
    }

    /// Returns the number of free slots.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Stores `value` in a free slot. O(1), no heap allocation.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] when every slot is in use.
    pub fn allocate(&mut self, value: T) -> Result<SlotHandle, PoolError> {
        let index = self.free_list.pop().ok_or(PoolError::Exhausted {
            capacity: self.slots.len(),
        })?;

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.allocated_count += 1;

        Ok(SlotHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Frees the slot behind `handle` and returns its value.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::StaleHandle`] when the handle was already freed
    /// or does not belong to this pool.
    pub fn free(&mut self, handle: SlotHandle) -> Result<T, PoolError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(PoolError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            })?;

        let value = slot.value.take().ok_or(PoolError::StaleHandle {
            index: handle.index,
            generation: handle.generation,
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.allocated_count -= 1;

        Ok(value)
    }

    /// Returns true when `handle` still resolves to a live value.
    #[inline]
    #[must_use]
    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Gets a reference to an allocated object.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?
            .value
            .as_ref()
    }

    /// Gets a mutable reference to an allocated object.
    #[inline]
    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?
            .value
            .as_mut()
    }

    /// Frees every slot. Outstanding handles become stale.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free_list.clear();
        self.free_list.extend((0..self.slots.len() as u32).rev());
        self.allocated_count = 0;
    }

    /// Iterates over all allocated objects.
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotHandle {
                        index: index as u32,
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
    fn test_pool_allocate_free() {
        let mut pool: SlotPool<u32> = SlotPool::new(10);

        let h1 = pool.allocate(42).unwrap();
        assert_eq!(*pool.get(h1).unwrap(), 42);
        assert_eq!(pool.allocated_count(), 1);

        assert_eq!(pool.free(h1), Ok(42));
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool: SlotPool<u8> = SlotPool::new(2);
        pool.allocate(1).unwrap();
        pool.allocate(2).unwrap();

        assert_eq!(pool.allocate(3), Err(PoolError::Exhausted { capacity: 2 }));
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut pool: SlotPool<&str> = SlotPool::new(1);

        let old = pool.allocate("first").unwrap();
        pool.free(old).unwrap();
        let new = pool.allocate("second").unwrap();

        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(pool.get(old).is_none());
        assert!(matches!(pool.free(old), Err(PoolError::StaleHandle { .. })));
        assert_eq!(pool.get(new), Some(&"second"));
    }

    #[test]
    fn test_double_free_rejected() {
        let mut pool: SlotPool<u32> = SlotPool::new(4);
        let handle = pool.allocate(7).unwrap();

        assert!(pool.free(handle).is_ok());
        assert!(pool.free(handle).is_err());
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut pool: SlotPool<u32> = SlotPool::new(4);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(2).unwrap();

        pool.clear();

        assert!(!pool.contains(a));
        assert!(!pool.contains(b));
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.iter().count(), 0);
    }

    #[test]
    fn test_get_mut_and_iter() {
        let mut pool: SlotPool<Vec<u64>> = SlotPool::new(3);
        let handle = pool.allocate(vec![1]).unwrap();
        pool.get_mut(handle).unwrap().push(2);

        let collected: Vec<_> = pool.iter().map(|(h, v)| (h, v.clone())).collect();
        assert_eq!(collected, vec![(handle, vec![1, 2])]);
    }
}
