//! Composition Cache Counters
//!
//! Cheap process-wide counters for cache behavior. They exist for tests
//! and for the occasional debug log line; nothing in the core branches on
//! them.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use log::debug;

pub(crate) struct CacheStats {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
    pub adds: AtomicUsize,
    pub dels: AtomicUsize,
    pub total_size: AtomicIsize,
    pub num_states: AtomicIsize,
}

pub(crate) static CACHE_STATS: CacheStats = CacheStats {
    hits: AtomicUsize::new(0),
    misses: AtomicUsize::new(0),
    adds: AtomicUsize::new(0),
    dels: AtomicUsize::new(0),
    total_size: AtomicIsize::new(0),
    num_states: AtomicIsize::new(0),
};

impl CacheStats {
    pub fn inc_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_adds(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dels(&self) {
        self.dels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_total_size(&self, delta: isize) {
        self.total_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn add_num_states(&self, delta: isize) {
        self.num_states.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheReport {
    pub hits: usize,
    pub misses: usize,
    pub adds: usize,
    pub dels: usize,
    /// Live composition-cache entries across all states.
    pub total_size: isize,
    /// Live `RenderState` allocations, interned or not.
    pub num_states: isize,
}

/// Reads the counters and emits a debug log line.
#[must_use]
pub fn report() -> CacheReport {
    let report = CacheReport {
        hits: CACHE_STATS.hits.load(Ordering::Relaxed),
        misses: CACHE_STATS.misses.load(Ordering::Relaxed),
        adds: CACHE_STATS.adds.load(Ordering::Relaxed),
        dels: CACHE_STATS.dels.load(Ordering::Relaxed),
        total_size: CACHE_STATS.total_size.load(Ordering::Relaxed),
        num_states: CACHE_STATS.num_states.load(Ordering::Relaxed),
    };
    debug!(
        "state cache: {} hits, {} misses, {} entries over {} states",
        report.hits, report.misses, report.total_size, report.num_states
    );
    report
}
