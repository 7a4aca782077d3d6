//! Atomic counters fed by the allocation/deallocation/purge paths and
//! read back out through `ctl`.
//!
//! Granularity matches what jemalloc's own `stats.c` test exercises:
//! a process-wide total plus, per arena, small/large allocated bytes
//! and purge counters.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct ArenaStats {
    pub small_allocated: AtomicU64,
    pub large_allocated: AtomicU64,
    pub npurge: AtomicU64,
    pub nmadvise: AtomicU64,
    pub purged: AtomicU64,
}

impl ArenaStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn small_alloc(&self, size: usize) {
        self.small_allocated.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn small_dalloc(&self, size: usize) {
        self.small_allocated.fetch_sub(size as u64, Ordering::Relaxed);
    }

    pub fn large_alloc(&self, size: usize) {
        self.large_allocated.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn large_dalloc(&self, size: usize) {
        self.large_allocated.fetch_sub(size as u64, Ordering::Relaxed);
    }

    pub fn record_purge(&self, npages_purged: u64, bytes: u64) {
        self.npurge.fetch_add(1, Ordering::Relaxed);
        self.nmadvise.fetch_add(1, Ordering::Relaxed);
        self.purged.fetch_add(npages_purged, Ordering::Relaxed);
        let _ = bytes;
    }

    pub fn allocated(&self) -> u64 {
        self.small_allocated.load(Ordering::Relaxed) + self.large_allocated.load(Ordering::Relaxed)
    }
}

/// Process-wide totals, derived by summing every arena's `ArenaStats`
/// at read time rather than kept as a separate running counter -- the
/// same approach jemalloc's `ctl_refresh` takes for `stats.allocated`.
#[derive(Default)]
pub struct GlobalStats {
    pub active_arenas: AtomicU64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_small_alloc_dalloc_balances() {
        let stats = ArenaStats::new();
        stats.small_alloc(64);
        stats.small_alloc(128);
        stats.small_dalloc(64);
        assert_eq!(stats.allocated(), 128);
    }

    #[test]
    fn test_purge_accounting() {
        let stats = ArenaStats::new();
        stats.record_purge(4, 4 * 4096);
        assert_eq!(stats.npurge.load(Ordering::Relaxed), 1);
        assert_eq!(stats.purged.load(Ordering::Relaxed), 4);
    }
}
