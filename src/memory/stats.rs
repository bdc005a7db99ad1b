//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., committed may briefly exceed reserved while another
//! thread is between two updates). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
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

// Address space reserved by guard allocators (small groups, group arenas and
// large reservations, guard pages included).
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Physical memory committed by guard allocators. Guard pages never count.
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown
crate::sync::static_atomic! {
    pub static SMALL_GROUPS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static LIVE_SMALL: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static LIVE_LARGE: Counter = Counter::new();
}

/// Point-in-time copy of the process-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub small_groups: usize,
    pub live_small_allocations: usize,
    pub live_large_allocations: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
        total_committed: TOTAL_COMMITTED.load(Ordering::Relaxed),
        small_groups: SMALL_GROUPS.load(Ordering::Relaxed),
        live_small_allocations: LIVE_SMALL.load(Ordering::Relaxed),
        live_large_allocations: LIVE_LARGE.load(Ordering::Relaxed),
    }
}
