//! # Recycler
//!
//! Free list of reusable scratch objects. `acquire` hands out a retained
//! object (or builds a fresh one), `release` resets it and keeps it for the
//! next caller, so steady-state operation performs no allocation.

/// Objects that can be reset to an empty state for reuse.
pub trait Recyclable {
    /// Resets the object so the next `acquire` sees it as fresh.
    fn recycle(&mut self);
}

/// Free-list recycler for objects of type `T`.
///
/// # Thread Safety
///
/// This recycler is NOT thread-safe. Use one recycler per thread.
pub struct Recycler<T> {
    /// Objects waiting for reuse.
    free: Vec<T>,
    /// Upper bound on retained objects.
    max_retained: usize,
    /// Builds a new object when the free list is empty.
    factory: Box<dyn Fn() -> T>,
    /// Objects currently handed out.
    outstanding: usize,
}

impl<T: Recyclable> Recycler<T> {
    /// Creates a recycler that retains at most `max_retained` objects.
    #[must_use]
    pub fn new(max_retained: usize, factory: impl Fn() -> T + 'static) -> Self {
        Self {
            free: Vec::with_capacity(max_retained),
            max_retained,
            factory: Box::new(factory),
            outstanding: 0,
        }
    }

    /// Creates a recycler and fills it with `count` objects upfront.
    #[must_use]
    pub fn prefilled(count: usize, factory: impl Fn() -> T + 'static) -> Self {
        let mut recycler = Self::new(count, factory);
        for _ in 0..count {
            let value = (recycler.factory)();
            recycler.free.push(value);
        }
        recycler
    }

    /// Takes an object from the free list, building one if it is empty.
    pub fn acquire(&mut self) -> T {
        self.outstanding += 1;
        match self.free.pop() {
            Some(value) => value,
            None => (self.factory)(),
        }
    }

    /// Resets `value` and returns it to the free list.
    ///
    /// Objects beyond `max_retained` are dropped.
    pub fn release(&mut self, mut value: T) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.max_retained {
            value.recycle();
            self.free.push(value);
        }
    }

    /// Number of objects ready for reuse.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of objects acquired and not yet released.
    #[inline]
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Recyclable for Vec<u8> {
        fn recycle(&mut self) {
            self.clear();
        }
    }

    #[test]
    fn test_acquire_release_reuses_storage() {
        let mut recycler: Recycler<Vec<u8>> = Recycler::new(2, || Vec::with_capacity(64));

        let mut buffer = recycler.acquire();
        buffer.extend_from_slice(b"payload");
        let capacity = buffer.capacity();
        recycler.release(buffer);

        let reused = recycler.acquire();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
    }

    #[test]
    fn test_release_beyond_limit_drops() {
        let mut recycler: Recycler<Vec<u8>> = Recycler::new(1, Vec::new);

        let a = recycler.acquire();
        let b = recycler.acquire();
        assert_eq!(recycler.outstanding(), 2);

        recycler.release(a);
        recycler.release(b);
        assert_eq!(recycler.available(), 1);
        assert_eq!(recycler.outstanding(), 0);
    }

    #[test]
    fn test_prefilled() {
        let mut recycler: Recycler<Vec<u8>> = Recycler::prefilled(3, Vec::new);
        assert_eq!(recycler.available(), 3);
        let _ = recycler.acquire();
        assert_eq!(recycler.available(), 2);
    }
}
