//! Resource tables
//!
//! Every dynamically created kernel object (tasks, ports, CFS scheduling
//! records) lives in a `Table` slot and is addressed by a typed handle.
//!
//! Design:
//! - Slots are found with a rover that resumes where the last search ended
//! - Capacity doubles whenever the table is full
//! - Each slot carries a generation; freeing bumps it, so a handle taken
//!   before `remove` never resolves again (stale handles are detectable)

use std::marker::PhantomData;

/// Initial slot count of a fresh table
const DEFAULT_CAPACITY: usize = 16;

/// A typed, generation-checked index into a [`Table`]
pub trait Handle: Copy + Eq + std::fmt::Debug {
    fn from_parts(index: u32, generation: u32) -> Self;
    fn index(self) -> usize;
    fn generation(self) -> u32;
}

/// Declare a handle type for a table
macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl $crate::kernel::table::Handle for $name {
            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            fn index(self) -> usize {
                self.index as usize
            }

            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.index)
            }
        }
    };
}

pub(crate) use handle;

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Growable slot allocator
#[derive(Debug)]
pub struct Table<K, T> {
    slots: Vec<Slot<T>>,
    rover: usize,
    used: usize,
    _key: PhantomData<K>,
}

impl<K: Handle, T> Table<K, T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(1));
        slots.resize_with(capacity.max(1), || Slot {
            generation: 0,
            value: None,
        });
        Self {
            slots,
            rover: 0,
            used: 0,
            _key: PhantomData,
        }
    }

    /// Allocate a slot for `value` and return its handle
    pub fn insert(&mut self, value: T) -> K {
        self.insert_with(|_| value)
    }

    /// Allocate a slot, building the value from its own handle
    pub fn insert_with(&mut self, build: impl FnOnce(K) -> T) -> K {
        if self.used == self.slots.len() {
            self.grow();
        }
        let len = self.slots.len();
        let mut index = self.rover % len;
        while self.slots[index].value.is_some() {
            index = (index + 1) % len;
        }
        self.rover = index + 1;
        self.used += 1;

        let slot = &mut self.slots[index];
        let key = K::from_parts(index as u32, slot.generation);
        slot.value = Some(build(key));
        key
    }

    fn grow(&mut self) {
        let old = self.slots.len();
        self.slots.resize_with(old * 2, || Slot {
            generation: 0,
            value: None,
        });
        self.rover = old;
    }

    /// Free a slot, returning its value. Stale handles return `None`.
    pub fn remove(&mut self, key: K) -> Option<T> {
        let slot = self.slots.get_mut(key.index())?;
        if slot.generation != key.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.used -= 1;
        Some(value)
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.slots
            .get(key.index())
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.slots
            .get_mut(key.index())
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Current slot count (grows by doubling)
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (K::from_parts(index as u32, slot.generation), value))
        })
    }

    /// Handles of live entries in slot order
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(key, _)| key).collect()
    }
}

impl<K: Handle, T> Default for Table<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    handle!(TestId);

    #[test]
    fn test_insert_and_get() {
        let mut table: Table<TestId, &str> = Table::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_ne!(a, b);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut table: Table<TestId, u32> = Table::with_capacity(1);
        let first = table.insert(1);
        assert_eq!(table.remove(first), Some(1));

        // Same slot reused with a new generation
        let second = table.insert(2);
        assert_eq!(first.index(), second.index());
        assert_eq!(table.get(first), None);
        assert_eq!(table.remove(first), None);
        assert_eq!(table.get(second), Some(&2));
    }

    #[test]
    fn test_growth_doubles() {
        let mut table: Table<TestId, usize> = Table::with_capacity(2);
        for i in 0..5 {
            table.insert(i);
        }
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_insert_with_sees_own_key() {
        let mut table: Table<TestId, TestId> = Table::new();
        let key = table.insert_with(|k| k);
        assert_eq!(table.get(key), Some(&key));
    }

    #[test]
    fn test_rover_skips_used_slots() {
        let mut table: Table<TestId, u32> = Table::with_capacity(4);
        let a = table.insert(0);
        let b = table.insert(1);
        table.remove(a);
        let c = table.insert(2);
        // Rover continues past b before wrapping back to a's slot
        assert_eq!(c.index(), 2);
        assert!(table.contains(b));
    }

    proptest! {
        #[test]
        fn prop_live_handles_always_resolve(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let mut table: Table<TestId, usize> = Table::with_capacity(1);
            let mut live: Vec<(TestId, usize)> = Vec::new();
            let mut dead: Vec<TestId> = Vec::new();
            for (n, insert) in ops.into_iter().enumerate() {
                if insert || live.is_empty() {
                    live.push((table.insert(n), n));
                } else {
                    let (key, value) = live.remove(n % live.len());
                    prop_assert_eq!(table.remove(key), Some(value));
                    dead.push(key);
                }
            }
            for (key, value) in &live {
                prop_assert_eq!(table.get(*key), Some(value));
            }
            for key in &dead {
                prop_assert!(table.get(*key).is_none());
            }
            prop_assert_eq!(table.len(), live.len());
        }
    }
}
