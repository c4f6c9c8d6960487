//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-pool counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Total address space reserved by pool arenas
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Total physical memory committed by pool arenas
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}
// Committed bytes attributable to bulk arenas
crate::sync::static_atomic! {
    pub static ARENA_COMMITTED: Counter = Counter::new();
}
// Overflow nodes currently alive across all pools
crate::sync::static_atomic! {
    pub static OVERFLOW_NODES: Counter = Counter::new();
}

/// Point-in-time aggregate of the global gauges.
#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub arena_committed: usize,
    pub overflow_nodes: usize,
}

#[must_use]
pub fn snapshot() -> VmStats {
    VmStats {
        total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
        total_committed: TOTAL_COMMITTED.load(Ordering::Relaxed),
        arena_committed: ARENA_COMMITTED.load(Ordering::Relaxed),
        overflow_nodes: OVERFLOW_NODES.load(Ordering::Relaxed),
    }
}
