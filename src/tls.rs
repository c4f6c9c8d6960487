//! Dynamic thread-local slots.
//!
//! The chunk-caching pool needs one thread-local word per *pool instance*;
//! `thread_local!` is per static, not per value. This module hands out
//! process-wide slot indices; each thread lazily grows its own value table.
//! Dropping a slot bumps its generation, so a reused index never observes a
//! value written for a previous owner — a thread that cached a pointer for
//! a dead pool reads 0, never the stale pointer.

use crate::sync::{Mutex, static_mutex};
use std::cell::RefCell;

struct Registry {
    /// Current generation per ever-allocated index.
    generations: Vec<u64>,
    /// Indices available for reuse.
    free: Vec<usize>,
}

impl Registry {
    const fn new() -> Self {
        Self {
            generations: Vec::new(),
            free: Vec::new(),
        }
    }
}

static_mutex! {
    static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());
}

thread_local! {
    /// (generation, value) per slot index, grown on demand.
    static VALUES: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

/// A process-wide thread-local slot. Each thread sees its own value;
/// unset (and stale) values read as 0.
pub(crate) struct TlsSlot {
    index: usize,
    generation: u64,
}

impl TlsSlot {
    pub(crate) fn new() -> Self {
        let mut registry = REGISTRY.lock().unwrap();
        if let Some(index) = registry.free.pop() {
            let generation = registry.generations[index];
            Self { index, generation }
        } else {
            registry.generations.push(0);
            Self {
                index: registry.generations.len() - 1,
                generation: 0,
            }
        }
    }

    /// The calling thread's value, or 0 if this thread never set one while
    /// this slot owned its index.
    pub(crate) fn get(&self) -> usize {
        VALUES.with(|values| {
            values
                .borrow()
                .get(self.index)
                .map_or(0, |&(generation, value)| {
                    if generation == self.generation {
                        value
                    } else {
                        0
                    }
                })
        })
    }

    /// Set the calling thread's value.
    pub(crate) fn set(&self, value: usize) {
        VALUES.with(|values| {
            let mut values = values.borrow_mut();
            if values.len() <= self.index {
                values.resize(self.index + 1, (0, 0));
            }
            values[self.index] = (self.generation, value);
        });
    }
}

impl Drop for TlsSlot {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock().unwrap();
        // Invalidate every thread's cached value before the index can be
        // reused.
        registry.generations[self.index] = registry.generations[self.index].wrapping_add(1);
        registry.free.push(self.index);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::thread;

    #[test]
    fn test_unset_reads_zero() {
        let slot = TlsSlot::new();
        assert_eq!(slot.get(), 0);
    }

    #[test]
    fn test_set_get_round_trip() {
        let slot = TlsSlot::new();
        slot.set(42);
        assert_eq!(slot.get(), 42);
        slot.set(7);
        assert_eq!(slot.get(), 7);
    }

    #[test]
    fn test_slots_are_independent() {
        let a = TlsSlot::new();
        let b = TlsSlot::new();
        a.set(1);
        b.set(2);
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
    }

    #[test]
    fn test_values_are_per_thread() {
        let slot = TlsSlot::new();
        slot.set(99);

        let slot_ref = &slot;
        std::thread::scope(|scope| {
            scope
                .spawn(move || {
                    // Another thread starts unset …
                    assert_eq!(slot_ref.get(), 0);
                    slot_ref.set(123);
                    assert_eq!(slot_ref.get(), 123);
                })
                .join()
                .unwrap();
        });

        // … and never disturbs ours.
        assert_eq!(slot.get(), 99);
    }

    #[test]
    fn test_reused_index_never_leaks_old_value() {
        let first = TlsSlot::new();
        let index = first.index;
        first.set(555);
        drop(first);

        // Grab slots until the freed index comes back (it is on top of the
        // free list, so the next allocation reuses it).
        let second = TlsSlot::new();
        assert_eq!(second.index, index);
        assert_eq!(second.get(), 0, "stale value visible through reused slot");
        second.set(1);
        assert_eq!(second.get(), 1);
    }

    #[test]
    fn test_threads_see_own_values_concurrently() {
        use crate::sync::Arc;

        let slot = Arc::new(TlsSlot::new());
        let mut handles = Vec::new();
        for t in 1..=4usize {
            let slot = Arc::clone(&slot);
            handles.push(thread::spawn(move || {
                slot.set(t * 100);
                thread::yield_now();
                assert_eq!(slot.get(), t * 100);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
