//! # Frame Ring
//!
//! Fixed-depth ring of per-tick slots. The current index receives this
//! tick's data, the next index may already receive data destined for the
//! following tick, and `rotate` moves the ring forward one tick.
//!
//! ## Architecture
//!
//! ```text
//!   depth = 3          current
//!                         │
//!            ┌─────────┬──▼──────┬─────────┐
//!            │ slot 0  │ slot 1  │ slot 2  │
//!            └─────────┴─────────┴──▲──────┘
//!                                   │
//!                                  next
//! ```
//!
//! All slots are built once in [`FrameRing::new`] and reused forever.

/// Smallest usable ring depth: one current slot and one next slot.
pub const MIN_RING_DEPTH: usize = 2;

/// Fixed-depth ring of reusable slots.
pub struct FrameRing<T> {
    /// Slots, built upfront.
    slots: Box<[T]>,
    /// Index of the current slot.
    current: usize,
    /// Number of completed rotations.
    rotations: u64,
}

impl<T> FrameRing<T> {
    /// Creates a ring of `depth` slots built by `factory`.
    ///
    /// Depths below [`MIN_RING_DEPTH`] are raised to it.
    #[must_use]
    pub fn new(depth: usize, mut factory: impl FnMut(usize) -> T) -> Self {
        let depth = depth.max(MIN_RING_DEPTH);
        let slots: Vec<T> = (0..depth).map(&mut factory).collect();
        Self {
            slots: slots.into_boxed_slice(),
            current: 0,
            rotations: 0,
        }
    }

    /// Number of slots in the ring.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Index of the current slot.
    #[inline]
    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current
    }

    /// Index of the slot that becomes current after the next rotation.
    #[inline]
    #[must_use]
    pub fn next_index(&self) -> usize {
        (self.current + 1) % self.slots.len()
    }

    /// Number of completed rotations.
    #[inline]
    #[must_use]
    pub const fn rotations(&self) -> u64 {
        self.rotations
    }

    /// The current slot.
    #[inline]
    #[must_use]
    pub fn current(&self) -> &T {
        &self.slots[self.current]
    }

    /// The current slot, mutably.
    #[inline]
    pub fn current_mut(&mut self) -> &mut T {
        &mut self.slots[self.current]
    }

    /// The next slot.
    #[inline]
    #[must_use]
    pub fn next(&self) -> &T {
        &self.slots[self.next_index()]
    }

    /// The next slot, mutably.
    #[inline]
    pub fn next_mut(&mut self) -> &mut T {
        let index = self.next_index();
        &mut self.slots[index]
    }

    /// Moves the current index forward by one slot.
    #[inline]
    pub fn rotate(&mut self) {
        self.current = self.next_index();
        self.rotations += 1;
    }

    /// Iterates over every slot in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    /// Iterates mutably over every slot in storage order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_depth() {
        let ring: FrameRing<u8> = FrameRing::new(0, |_| 0);
        assert_eq!(ring.depth(), MIN_RING_DEPTH);
    }

    #[test]
    fn test_rotation_wraps() {
        let mut ring = FrameRing::new(3, |index| index);
        assert_eq!(*ring.current(), 0);
        assert_eq!(*ring.next(), 1);

        ring.rotate();
        ring.rotate();
        assert_eq!(*ring.current(), 2);
        assert_eq!(*ring.next(), 0);

        ring.rotate();
        assert_eq!(ring.current_index(), 0);
        assert_eq!(ring.rotations(), 3);
    }

    #[test]
    fn test_next_slot_becomes_current() {
        let mut ring: FrameRing<Vec<u32>> = FrameRing::new(2, |_| Vec::new());
        ring.next_mut().push(9);
        assert!(ring.current().is_empty());

        ring.rotate();
        assert_eq!(ring.current(), &vec![9]);
    }
}
