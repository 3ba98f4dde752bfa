//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., mapped may briefly disagree with cached plus live
//! arena bytes). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
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
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn fetch_add(&self, val: usize, ordering: Ordering) -> usize {
        self.0.fetch_add(Self::delta(val), ordering).max(0).cast_unsigned()
    }
}

// Bytes currently obtained from the page source (page blocks that have not
// been released back, whether in a pool ring or an allocator freelist).
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}
// Bytes currently parked in allocator freelists (subset of TOTAL_MAPPED).
crate::sync::static_atomic! {
    pub static FREELIST_CACHED: Counter = Counter::new();
}
// Number of live pools.
crate::sync::static_atomic! {
    pub static LIVE_POOLS: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time view of the crate-wide gauges.
pub struct PoolStats {
    pub mapped_bytes: usize,
    pub cached_bytes: usize,
    pub live_pools: usize,
}

/// Snapshot the diagnostic counters.
#[must_use]
pub fn snapshot() -> PoolStats {
    PoolStats {
        mapped_bytes: TOTAL_MAPPED.load(Ordering::Relaxed),
        cached_bytes: FREELIST_CACHED.load(Ordering::Relaxed),
        live_pools: LIVE_POOLS.load(Ordering::Relaxed),
    }
}
