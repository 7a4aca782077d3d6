//! Thread caches: per-thread, per-size-class stashes of free blocks
//! that let the fast allocate/deallocate path avoid an arena's bin
//! mutex entirely in the common case.
//!
//! Generalizes a one-magazine-per-user-registered-`Class` cache to one
//! magazine *pair* per size-class index, shared by every thread bound
//! to the same arena. Each
//! `TcacheBin` keeps two active magazines -- `pop` being drained by
//! `allocate`, `push` being filled by `deallocate` -- plus one spare
//! slot (`LocalMagazineCache`) so a drained/filled active magazine can
//! be swapped for a ready one without touching the arena-wide depot.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::arena::Arena;
use crate::linear_ref::LinearRef;
use crate::magazine::{LocalMagazineCache, Magazine};
use crate::magazine_stack::MagazineStack;
use crate::size_class::{self, SizeClassId};

/// Classes at or below this size get a thread-cache bin. Exposed as a
/// runtime option (`config::Options::lg_tcache_max`); large allocations
/// above it go straight to `Arena::alloc_large`/`dealloc_large`, since
/// a magazine's fixed-size inline array makes caching many-megabyte
/// objects wasteful of both memory and the bin's own bookkeeping.
pub const DEFAULT_LG_TCACHE_MAX: u32 = 15; // 32 KiB

/// One arena's shared depot: per-class stacks of magazines flushed by
/// threads whose local bin filled up, and the source threads with an
/// empty local bin draw from.
pub struct TcacheDepot {
    per_class: Vec<MagazineStack>,
}

impl TcacheDepot {
    pub fn new(nclasses: usize) -> Self {
        let mut per_class = Vec::with_capacity(nclasses);
        per_class.resize_with(nclasses, MagazineStack::new);
        Self { per_class }
    }

    fn stack(&self, class: SizeClassId) -> &MagazineStack {
        &self.per_class[class.as_usize()]
    }
}

struct TcacheBin {
    pop: Magazine<false>,
    push: Magazine<true>,
    spare: LocalMagazineCache,
    /// Smallest total cached-block count observed since the last GC
    /// tick; surplus (`low_water / 2`) is what the next tick flushes
    /// back to the depot, per spec.md §4.6's low-water heuristic.
    low_water: usize,
}

impl TcacheBin {
    fn new() -> Self {
        Self {
            pop: Magazine::new(),
            push: Magazine::new(),
            spare: LocalMagazineCache::default(),
            low_water: 0,
        }
    }

    /// Total blocks this bin currently holds across both active
    /// magazines and the spare slot.
    fn ncached(&self) -> usize {
        self.pop.len() + self.push.len() + self.spare.cached_len()
    }

    /// Runs one GC tick: if the bin's low-water mark shows blocks that
    /// have sat idle since the last tick, flushes half of them to the
    /// depot, then resets the mark to the current fill level.
    fn gc_tick(&mut self, depot: &TcacheDepot, class: SizeClassId) {
        if self.low_water > 0 {
            let mut to_flush = self.low_water / 2;

            while to_flush > 0 {
                if let Some(full) = self.spare.steal_full() {
                    to_flush = to_flush.saturating_sub(full.len());
                    depot.stack(class).push(full);
                    continue;
                }
                if !self.push.is_empty() {
                    let full = std::mem::replace(&mut self.push, Magazine::new());
                    to_flush = to_flush.saturating_sub(full.len());
                    depot.stack(class).push(full);
                    continue;
                }
                break;
            }
        }

        self.low_water = self.ncached();
    }

    fn allocate(&mut self, depot: &TcacheDepot, arena: &Arena, class: SizeClassId) -> Option<LinearRef> {
        let result = self.allocate_inner(depot, arena, class);
        self.low_water = self.low_water.min(self.ncached());
        result
    }

    fn allocate_inner(&mut self, depot: &TcacheDepot, arena: &Arena, class: SizeClassId) -> Option<LinearRef> {
        if let Some(r) = self.pop.get() {
            return Some(r);
        }

        if let Some(full) = self.spare.steal_full() {
            self.pop = full;
            return self.pop.get();
        }

        if let Some(full) = depot.stack(class).try_pop::<false>() {
            self.pop = full;
            return self.pop.get();
        }

        // Slow path: refill in a batch straight from the arena's bin,
        // generalized to every size class instead of one registered
        // `Class`.
        self.pop.populate(|| arena.alloc_small(class).map(LinearRef::new));
        self.pop.get()
    }

    fn deallocate(&mut self, depot: &TcacheDepot, class: SizeClassId, block: LinearRef) {
        self.deallocate_inner(depot, class, block);
        self.low_water = self.low_water.min(self.ncached());
    }

    fn deallocate_inner(&mut self, depot: &TcacheDepot, class: SizeClassId, block: LinearRef) {
        if let Some(spill) = self.push.put(block) {
            let full = std::mem::replace(&mut self.push, Magazine::new());
            if let Some(leftover) = self.spare.populate(full) {
                depot.stack(class).push(leftover);
            }
            assert_eq!(
                self.push.put(spill),
                None,
                "a freshly emptied push magazine always has room for one more"
            );
        }
    }

    /// Flushes every block this bin is holding back to the depot, for
    /// use when a thread is tearing down its cache.
    fn flush(&mut self, depot: &TcacheDepot, class: SizeClassId) {
        let pop = std::mem::replace(&mut self.pop, Magazine::new());
        let push = std::mem::replace(&mut self.push, Magazine::new());
        depot.stack(class).push(pop);
        depot.stack(class).push(push);

        if let Some(full) = self.spare.steal_full() {
            depot.stack(class).push(full);
        }
        if let Some(empty) = self.spare.steal_empty() {
            depot.stack(class).push(empty);
        }
    }
}

/// A thread's full set of per-class bins, created lazily on first use
/// and flushed back to its bound arena's depots when the owning
/// thread exits.
pub struct ThreadCache {
    bins: Vec<TcacheBin>,
    /// `classes[i]` is the size class `bins[i]` caches; small classes
    /// are contiguous from index 0, so this is just the leading slice
    /// of `size_class::small_class_ids()`.
    classes: Vec<SizeClassId>,
    lg_tcache_max: u32,
    /// Decremented on every cache operation; reaching zero runs a GC
    /// tick (spec.md §4.6) and resets to `GC_TICK_PERIOD`.
    gc_ticker: u32,
}

/// Cache operations between each GC tick. jemalloc derives this from
/// `opt.lg_tcache_gc_incr`; a fixed period is simpler and still bounds
/// long-term overcommitment the way the low-water heuristic intends.
const GC_TICK_PERIOD: u32 = 1024;

impl ThreadCache {
    pub fn new(lg_tcache_max: u32) -> Self {
        let nclasses = cached_class_count(lg_tcache_max);
        let mut bins = Vec::with_capacity(nclasses);
        bins.resize_with(nclasses, TcacheBin::new);
        let classes = size_class::small_class_ids().take(nclasses).collect();
        Self {
            bins,
            classes,
            lg_tcache_max,
            gc_ticker: GC_TICK_PERIOD,
        }
    }

    /// Whether `class` has a bin in this cache. A small class beyond
    /// the configured `lg_tcache_max` threshold is small but *not*
    /// cached, so this checks `is_small` too rather than relying on
    /// `bins.len()` alone, which a small `lg_tcache_max` could make
    /// shorter than the full small-class range.
    fn is_cached(&self, class: SizeClassId) -> bool {
        size_class::is_small(class) && class.as_usize() < self.bins.len()
    }

    /// Decrements the GC ticker; when it reaches zero, flushes each
    /// bin's surplus (`low_water / 2`) to the depot and resets the
    /// ticker. Called once per cache operation.
    fn tick(&mut self, depot: &TcacheDepot) {
        self.gc_ticker -= 1;
        if self.gc_ticker > 0 {
            return;
        }
        self.gc_ticker = GC_TICK_PERIOD;

        for (bin, &class) in self.bins.iter_mut().zip(self.classes.iter()) {
            bin.gc_tick(depot, class);
        }
    }

    pub fn allocate(&mut self, depot: &TcacheDepot, arena: &Arena, class: SizeClassId) -> Option<NonNull<c_void>> {
        self.allocate_aligned(depot, arena, class, size_class::PAGE)
    }

    /// As `allocate`, but if `class` falls through to the arena rather
    /// than a cached bin, requests the extent aligned to `alignment`
    /// (used for `allocate_aligned` requests whose large class was
    /// forced by an over-page alignment; see `size_class::lookup`).
    pub fn allocate_aligned(
        &mut self,
        depot: &TcacheDepot,
        arena: &Arena,
        class: SizeClassId,
        alignment: usize,
    ) -> Option<NonNull<c_void>> {
        self.tick(depot);

        if !self.is_cached(class) {
            return if size_class::is_small(class) {
                arena.alloc_small(class)
            } else {
                arena.alloc_large_aligned(class, alignment)
            };
        }

        self.bins[class.as_usize()]
            .allocate(depot, arena, class)
            .map(LinearRef::convert_to_non_null)
    }

    pub fn deallocate(&mut self, depot: &TcacheDepot, arena: &Arena, class: SizeClassId, ptr: NonNull<c_void>) {
        self.tick(depot);

        if !self.is_cached(class) {
            if size_class::is_small(class) {
                arena.dealloc_small(class, ptr);
            } else {
                arena.dealloc_large(ptr);
            }
            return;
        }

        self.bins[class.as_usize()].deallocate(depot, class, LinearRef::new(ptr));
    }

    /// Returns every cached block to `depot`; called when a thread
    /// detaches from its bound arena (on exit, or on explicit
    /// `tcache.destroy`).
    pub fn flush(&mut self, depot: &TcacheDepot) {
        for (bin, &class) in self.bins.iter_mut().zip(self.classes.iter()) {
            bin.flush(depot, class);
        }
    }

    pub fn lg_tcache_max(&self) -> u32 {
        self.lg_tcache_max
    }
}

/// Number of leading size classes (by index) a thread cache covers for
/// a given `lg_tcache_max` threshold.
pub fn cached_class_count(lg_tcache_max: u32) -> usize {
    let threshold = 1usize << lg_tcache_max;
    size_class::small_class_ids()
        .filter(|&id| size_class::class_to_size(id) <= threshold)
        .count()
        .max(1)
}

/// Opaque handle to an explicitly created thread cache (spec.md §4.6's
/// `tcache.create` facility), for a pool of short-lived tasks that want
/// tcache-speed allocation without each task paying for a fresh
/// `ThreadCache` of its own, and without binding to any one OS thread
/// the way the implicit per-thread cache in `tsd.rs` does.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExplicitTcacheId(u32);

impl ExplicitTcacheId {
    /// Recovers an id from the raw `u32` handed across the C ABI.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw `u32` handed across the C ABI.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A `ThreadCache` not tied to thread-local storage: any caller holding
/// the id can drive it from any thread, same as jemalloc's own
/// `MALLOCX_TCACHE(id)` flag selects an explicit cache instead of the
/// calling thread's own.
struct ExplicitTcache {
    arena_ind: u32,
    cache: ThreadCache,
}

impl ExplicitTcache {
    fn new(arena_ind: u32, lg_tcache_max: u32) -> Self {
        Self {
            arena_ind,
            cache: ThreadCache::new(lg_tcache_max),
        }
    }

    fn allocate(&mut self, arena: &Arena, depot: &TcacheDepot, class: SizeClassId, alignment: usize) -> Option<NonNull<c_void>> {
        self.cache.allocate_aligned(depot, arena, class, alignment)
    }

    fn deallocate(&mut self, arena: &Arena, depot: &TcacheDepot, class: SizeClassId, ptr: NonNull<c_void>) {
        self.cache.deallocate(depot, arena, class, ptr);
    }

    fn flush(&mut self, depot: &TcacheDepot) {
        self.cache.flush(depot);
    }
}

/// Process-wide slots for explicit caches, reused by index the same
/// way `rtree.rs`'s leaves are indexed rather than hashed: a freed slot
/// is handed back out by the next `create_explicit` call instead of the
/// pool growing without bound under churn.
struct ExplicitTcachePool {
    slots: Mutex<Vec<Option<ExplicitTcache>>>,
}

impl ExplicitTcachePool {
    fn new() -> Self {
        Self { slots: Mutex::new(Vec::new()) }
    }

    fn create(&self, arena_ind: u32, lg_tcache_max: u32) -> ExplicitTcacheId {
        let mut slots = self.slots.lock().unwrap();
        let tcache = ExplicitTcache::new(arena_ind, lg_tcache_max);
        if let Some((i, slot)) = slots.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
            *slot = Some(tcache);
            return ExplicitTcacheId(i as u32);
        }
        slots.push(Some(tcache));
        ExplicitTcacheId((slots.len() - 1) as u32)
    }

    /// Flushes and frees `id`'s slot. A repeat `destroy` of an
    /// already-destroyed or never-issued id is a no-op, mirroring
    /// `deallocate`'s tolerance of a foreign pointer.
    fn destroy(&self, id: ExplicitTcacheId, depot: &TcacheDepot) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(id.0 as usize) {
            if let Some(mut tcache) = slot.take() {
                tcache.flush(depot);
            }
        }
    }

    fn with<R>(&self, id: ExplicitTcacheId, f: impl FnOnce(&mut ExplicitTcache) -> R) -> Option<R> {
        let mut slots = self.slots.lock().unwrap();
        slots.get_mut(id.0 as usize)?.as_mut().map(f)
    }
}

lazy_static::lazy_static! {
    static ref EXPLICIT_POOL: ExplicitTcachePool = ExplicitTcachePool::new();
}

/// Creates an explicit thread cache bound to `arena_ind`, returning a
/// handle valid until `destroy_explicit` is called with it.
pub fn create_explicit(arena_ind: u32, lg_tcache_max: u32) -> ExplicitTcacheId {
    EXPLICIT_POOL.create(arena_ind, lg_tcache_max)
}

/// Flushes `id`'s cached blocks back to its arena's depot and frees the
/// slot for reuse.
pub fn destroy_explicit(id: ExplicitTcacheId, depot: &TcacheDepot) {
    EXPLICIT_POOL.destroy(id, depot);
}

/// Allocates through the explicit cache `id`, or `None` if `id` does
/// not name a live cache.
pub fn allocate_explicit(
    id: ExplicitTcacheId,
    arena: &Arena,
    depot: &TcacheDepot,
    class: SizeClassId,
    alignment: usize,
) -> Option<NonNull<c_void>> {
    EXPLICIT_POOL.with(id, |tcache| tcache.allocate(arena, depot, class, alignment)).flatten()
}

/// Releases `ptr` back through the explicit cache `id`; a no-op if
/// `id` does not name a live cache.
pub fn deallocate_explicit(id: ExplicitTcacheId, arena: &Arena, depot: &TcacheDepot, class: SizeClassId, ptr: NonNull<c_void>) {
    EXPLICIT_POOL.with(id, |tcache| tcache.deallocate(arena, depot, class, ptr));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arena::{Arena, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT};

    #[test]
    fn test_allocate_deallocate_roundtrip() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        let mut cache = ThreadCache::new(DEFAULT_LG_TCACHE_MAX);
        let class = size_class::lookup(64, 1).unwrap();

        let a = cache.allocate(&depot, &arena, class).expect("should allocate");
        let b = cache.allocate(&depot, &arena, class).expect("should allocate");
        assert_ne!(a, b);

        cache.deallocate(&depot, &arena, class, a);
        let c = cache.allocate(&depot, &arena, class).expect("should reuse freed block");
        assert_eq!(c, a, "freed block should be handed back out first");

        cache.deallocate(&depot, &arena, class, b);
        cache.deallocate(&depot, &arena, class, c);
    }

    #[test]
    fn test_flush_returns_blocks_to_depot() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        let mut cache = ThreadCache::new(DEFAULT_LG_TCACHE_MAX);
        let class = size_class::lookup(64, 1).unwrap();

        let a = cache.allocate(&depot, &arena, class).expect("should allocate");
        cache.deallocate(&depot, &arena, class, a);
        cache.flush(&depot);

        let mut cache2 = ThreadCache::new(DEFAULT_LG_TCACHE_MAX);
        let reused = cache2.allocate(&depot, &arena, class).expect("should come from the depot");
        assert_eq!(reused, a);
    }

    #[test]
    fn test_large_class_bypasses_cache() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        let mut cache = ThreadCache::new(DEFAULT_LG_TCACHE_MAX);
        let class = size_class::lookup(1 << 20, 1).unwrap();

        let ptr = cache.allocate(&depot, &arena, class).expect("should allocate");
        cache.deallocate(&depot, &arena, class, ptr);
    }

    #[test]
    fn test_gc_tick_flushes_surplus_to_depot() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        let class = size_class::lookup(64, 1).unwrap();

        let mut bin = TcacheBin::new();
        for _ in 0..8 {
            let block = arena.alloc_small(class).map(LinearRef::new).expect("should allocate");
            bin.deallocate(&depot, class, block);
        }
        assert!(bin.ncached() > 0);

        // No ticks have run yet: the low-water mark still reflects an
        // empty bin, so the first tick has nothing idle to flush.
        bin.gc_tick(&depot, class);
        let after_first_tick = bin.ncached();
        assert_eq!(after_first_tick, bin.low_water);

        // A second tick with no intervening allocate/deallocate calls
        // sees the whole fill as idle surplus and flushes half of it.
        bin.gc_tick(&depot, class);
        assert!(bin.ncached() <= after_first_tick);
    }

    #[test]
    fn test_low_water_tracks_minimum_since_last_tick() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        let class = size_class::lookup(64, 1).unwrap();

        let mut bin = TcacheBin::new();
        let block = arena.alloc_small(class).map(LinearRef::new).expect("should allocate");
        bin.deallocate(&depot, class, block);
        bin.gc_tick(&depot, class); // low_water now tracks the filled bin

        let a = bin.allocate(&depot, &arena, class).expect("should allocate");
        // Draining the bin to zero should pull low_water down to 0,
        // not leave it at the pre-drain fill level.
        assert_eq!(bin.low_water, 0);
        std::mem::forget(a);
    }

    #[test]
    fn test_explicit_tcache_roundtrip() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        let class = size_class::lookup(64, 1).unwrap();

        let id = create_explicit(0, DEFAULT_LG_TCACHE_MAX);
        let ptr = allocate_explicit(id, &arena, &depot, class, size_class::PAGE).expect("should allocate");
        deallocate_explicit(id, &arena, &depot, class, ptr);
        destroy_explicit(id, &depot);
    }

    #[test]
    fn test_explicit_tcache_use_after_destroy_is_harmless_none() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        let class = size_class::lookup(64, 1).unwrap();

        let id = create_explicit(0, DEFAULT_LG_TCACHE_MAX);
        destroy_explicit(id, &depot);
        assert!(allocate_explicit(id, &arena, &depot, class, size_class::PAGE).is_none());
    }

    #[test]
    fn test_explicit_tcache_ids_are_distinct() {
        let id_a = create_explicit(0, DEFAULT_LG_TCACHE_MAX);
        let id_b = create_explicit(0, DEFAULT_LG_TCACHE_MAX);
        assert_ne!(id_a, id_b);

        let depot = TcacheDepot::new(cached_class_count(DEFAULT_LG_TCACHE_MAX));
        destroy_explicit(id_a, &depot);
        destroy_explicit(id_b, &depot);
    }
}
