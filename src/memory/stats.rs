//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., heap bytes may briefly disagree with the page
//! counters they are carved from). This is acceptable for diagnostic
//! display. Do NOT use these values for allocation decisions.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    pub const fn new() -> Self {
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

// Pages currently handed out from the high (buddy) arena.
pub static HIGH_PAGES_LIVE: Counter = Counter::new();
// Pages currently granted to the low (heap bump) side.
pub static LOW_PAGES_LIVE: Counter = Counter::new();

// Breakdown by subsystem
pub static HEAP_BYTES_LIVE: Counter = Counter::new();
pub static SLOB_FRAMES_LIVE: Counter = Counter::new();
pub static SLOB_OBJECTS_LIVE: Counter = Counter::new();

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}
