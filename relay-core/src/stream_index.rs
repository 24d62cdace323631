//! One collision-free stream index space over several producers.
//!
//! The first producer ever seen keeps index 0 for its stream 0: some
//! downstream protocols treat stream 0 specially. Every other
//! `(producer, index)` pair gets the next free integer the first time it is
//! seen, and keeps it until the owner starts a new generation.

use std::{collections::HashMap, hash::Hash};

use parking_lot::Mutex;

pub struct StreamIndexUnifier<K> {
    inner: Mutex<Generation<K>>,
    floor: usize,
}

struct Generation<K> {
    slots: Vec<K>,
    map: HashMap<(K, usize), usize>,
    assigned: HashMap<usize, (K, usize)>,
    next: usize,
}

impl<K> Generation<K> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            map: HashMap::new(),
            assigned: HashMap::new(),
            next: 1,
        }
    }
}

impl<K> StreamIndexUnifier<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::with_floor(1)
    }

    /// Allocations never go below `floor`; used when the index space already
    /// holds `floor` streams that must not be collided with.
    pub fn with_floor(floor: usize) -> Self {
        Self {
            inner: Mutex::new(Generation::new()),
            floor: floor.max(1),
        }
    }

    pub fn assign(&self, source: K, original: usize) -> usize {
        let mut generation = self.inner.lock();
        let slot = match generation.slots.iter().position(|s| *s == source) {
            Some(slot) => slot,
            None => {
                generation.slots.push(source);
                generation.slots.len() - 1
            }
        };
        if slot == 0 && original == 0 {
            return 0;
        }
        if let Some(index) = generation.map.get(&(source, original)) {
            return *index;
        }

        let index = generation.next.max(self.floor);
        let previous = generation.assigned.insert(index, (source, original));
        assert!(
            previous.is_none(),
            "stream index {} assigned twice: {:?} and {:?}",
            index,
            previous,
            (source, original)
        );
        generation.map.insert((source, original), index);
        generation.next = index + 1;
        index
    }

    /// Starts a new generation: every mapping and the counter are dropped.
    pub fn reset(&self) {
        *self.inner.lock() = Generation::new();
    }

    /// Number of cached mappings (the special index 0 is not cached).
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for StreamIndexUnifier<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_first_source_zero_is_zero() {
        let u = StreamIndexUnifier::<u32>::new();
        assert_eq!(u.assign(7, 0), 0);
        assert_eq!(u.assign(7, 0), 0);
        assert_eq!(u.assign(7, 1), 1);
        assert_eq!(u.assign(8, 0), 2);
        assert_eq!(u.assign(8, 1), 3);
        assert_eq!(u.assign(7, 1), 1);
        assert_eq!(u.assign(8, 0), 2);
    }

    #[test]
    fn test_function_and_injective() {
        let u = StreamIndexUnifier::<u8>::new();
        let mut seen: HashMap<(u8, usize), usize> = HashMap::new();
        let mut values = HashSet::new();
        // pseudo-random but deterministic sequence of pairs
        let mut x: u64 = 12345;
        for _ in 0..500 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let source = ((x >> 33) % 4) as u8;
            let index = ((x >> 17) % 6) as usize;
            let unified = u.assign(source, index);
            match seen.get(&(source, index)) {
                Some(prev) => assert_eq!(*prev, unified),
                None => {
                    assert!(values.insert(unified), "collision on {}", unified);
                    seen.insert((source, index), unified);
                }
            }
        }
    }

    #[test]
    fn test_reset_starts_new_generation() {
        let u = StreamIndexUnifier::<u8>::new();
        assert_eq!(u.assign(1, 0), 0);
        assert_eq!(u.assign(2, 0), 1);
        assert_eq!(u.len(), 1);
        u.reset();
        assert!(u.is_empty());
        // source 2 is now the first source encountered
        assert_eq!(u.assign(2, 0), 0);
        assert_eq!(u.assign(1, 0), 1);
    }

    #[test]
    fn test_floor() {
        let u = StreamIndexUnifier::<u8>::with_floor(3);
        assert_eq!(u.assign(0, 0), 0);
        assert_eq!(u.assign(0, 1), 3);
        assert_eq!(u.assign(1, 0), 4);
        assert_eq!(u.assign(1, 1), 5);
    }
}
