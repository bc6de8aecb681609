//! Fixed-capacity circular buffer with separate index and time order.
//!
//! Once the buffer has wrapped, slot index order and insertion order diverge;
//! callers pick the order they mean explicitly and never do index arithmetic
//! themselves.

use crate::domain::EngineError;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Slot the next push writes to
    tail: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer holding at most `capacity` entries.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidConfig`] for a zero capacity and
    /// [`EngineError::Allocation`] if the storage cannot be reserved.
    pub fn try_new(capacity: usize) -> Result<Self, EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidConfig("ring buffer capacity must be > 0".into()));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|source| EngineError::Allocation { what: "sample ring", source })?;
        Ok(Self { slots, capacity, tail: 0 })
    }

    /// Append `value`, returning the evicted oldest entry once full
    pub fn push_overwriting(&mut self, value: T) -> Option<T> {
        let evicted = if self.slots.len() < self.capacity {
            self.slots.push(value);
            None
        } else {
            Some(std::mem::replace(&mut self.slots[self.tail], value))
        };
        self.tail = (self.tail + 1) % self.capacity;
        evicted
    }

    /// Most recently pushed entry
    #[must_use]
    pub fn newest(&self) -> Option<&T> {
        if self.slots.is_empty() {
            return None;
        }
        let index = (self.tail + self.capacity - 1) % self.capacity;
        self.slots.get(index)
    }

    /// Entry that the next push will evict, once full
    #[must_use]
    pub fn oldest(&self) -> Option<&T> {
        self.iter_newest_to_oldest().last()
    }

    /// Entries in time order, newest first
    pub fn iter_newest_to_oldest(&self) -> impl Iterator<Item = &T> + '_ {
        let len = self.slots.len();
        (0..len).map(move |i| &self.slots[(self.tail + self.capacity - 1 - i) % self.capacity])
    }

    /// Entries in storage order, which is not time order once wrapped
    pub fn iter_by_index(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.tail = 0;
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..64, pushes in 0usize..500) {
            let mut ring = RingBuffer::try_new(capacity).unwrap();
            for i in 0..pushes {
                ring.push_overwriting(i);
                prop_assert!(ring.len() <= capacity);
            }
        }

        #[test]
        fn prop_oldest_is_evicted_next(
            capacity in 1usize..32,
            values in prop::collection::vec(any::<u32>(), 1..200)
        ) {
            let mut ring = RingBuffer::try_new(capacity).unwrap();
            for &v in &values {
                let expected = if ring.len() == capacity { ring.oldest().copied() } else { None };
                prop_assert_eq!(ring.push_overwriting(v), expected);
            }
        }

        #[test]
        fn prop_newest_to_oldest_matches_history(
            capacity in 1usize..32,
            values in prop::collection::vec(any::<u32>(), 0..200)
        ) {
            let mut ring = RingBuffer::try_new(capacity).unwrap();
            for &v in &values {
                ring.push_overwriting(v);
            }
            let expected: Vec<u32> = values.iter().rev().take(capacity).copied().collect();
            let actual: Vec<u32> = ring.iter_newest_to_oldest().copied().collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
