//! Arenas: independent memory-management domains that own every slab
//! and large extent backing the allocations routed to them.
//!
//! Partitioning state this way is what bounds lock contention on a
//! multi-processor system: two threads bound to different arenas never
//! block on each other, and even within one arena, small-allocation
//! traffic for distinct size classes goes through distinct bin
//! mutexes (`bin.rs`) rather than one arena-wide lock.
//!
//! An extent is heap-allocated exactly once and never moved; whichever
//! structure is its current owner (`large`, `slab_extents`, or a
//! `chunk::ExtentTrees`) hands out a borrowed pointer to the global
//! radix tree so the free path can find it from a bare address. A
//! `LinkedList`/`BTreeMap` node holds the `Box` without ever relocating
//! the pointee, so that borrowed pointer stays valid for as long as the
//! entry remains in its owning collection.
use std::collections::{BTreeMap, LinkedList};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::bin::{Bin, BinState};
use crate::chunk::{self, ExtentTrees};
use crate::extent::{Extent, ExtentKind, ExtentState};
use crate::hooks::ChunkHooks;
use crate::size_class::{self, SizeClassId};
use crate::slab::Slab;
use crate::stats::ArenaStats;

/// Chunk size: the granularity at which the arena asks the chunk layer
/// for fresh address space to carve slabs out of.  A power of two, per
/// spec; `lg_chunk` is also exposed as a runtime option (`config.rs`).
pub const DEFAULT_LG_CHUNK: u32 = 21; // 2 MiB

/// Ratio of dirty (purgeable) to live pages above which an arena
/// starts purging: `ndirty > npages_allocated >> lg_dirty_mult`.
pub const DEFAULT_LG_DIRTY_MULT: u32 = 3; // 1/8

pub struct Arena {
    id: u32,
    bins: Vec<Bin>,
    large: Mutex<LinkedList<Box<Extent>>>,
    /// Extent descriptors backing live slabs, keyed by the slab's base
    /// address; `bin.rs`/`slab.rs` track regions within a slab but know
    /// nothing of the extent that backs it, so the arena is where that
    /// association has to live.
    slab_extents: Mutex<BTreeMap<usize, Box<Extent>>>,
    chunks: Mutex<ExtentTrees>,
    hooks: ChunkHooks,
    lg_chunk: u32,
    lg_dirty_mult: u32,
    ndirty: AtomicUsize,
    npages_allocated: AtomicUsize,
    nthreads: AtomicUsize,
    pub stats: ArenaStats,
}

/// Holds every mutex guard this arena contributes to a `fork()`
/// critical section; dropping it (at `postfork_parent`/`postfork_child`
/// time) unlocks everything it acquired, in reverse order.
pub(crate) struct ArenaForkGuard<'a> {
    _bins: Vec<MutexGuard<'a, BinState>>,
    _large: MutexGuard<'a, LinkedList<Box<Extent>>>,
    _slab_extents: MutexGuard<'a, BTreeMap<usize, Box<Extent>>>,
    _chunks: MutexGuard<'a, ExtentTrees>,
}

impl Arena {
    pub fn new(id: u32, lg_chunk: u32, lg_dirty_mult: u32) -> Self {
        let bins = size_class::small_class_ids().map(Bin::new).collect();

        Self {
            id,
            bins,
            large: Mutex::new(LinkedList::new()),
            slab_extents: Mutex::new(BTreeMap::new()),
            chunks: Mutex::new(ExtentTrees::new()),
            hooks: ChunkHooks::default_hooks(),
            lg_chunk,
            lg_dirty_mult,
            ndirty: AtomicUsize::new(0),
            npages_allocated: AtomicUsize::new(0),
            nthreads: AtomicUsize::new(0),
            stats: ArenaStats::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn chunksize(&self) -> usize {
        1usize << self.lg_chunk
    }

    /// This arena's chunk hooks, so a caller (typically `init::boot`,
    /// honoring `config::Options::file_backed`) can swap in an
    /// alternative backing store such as `file_backed_mapper` before
    /// any allocation happens.
    pub fn hooks(&self) -> &ChunkHooks {
        &self.hooks
    }

    pub fn bind_thread(&self) {
        self.nthreads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unbind_thread(&self) {
        self.nthreads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn live_threads(&self) -> usize {
        self.nthreads.load(Ordering::Relaxed)
    }

    fn bin(&self, class: SizeClassId) -> &Bin {
        &self.bins[class.as_usize()]
    }

    pub(crate) fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Locks every mutex this arena owns, in a fixed order, for the
    /// duration of a `fork()`; see `fork::prefork`. The returned guards
    /// keep the locks held until dropped.
    pub(crate) fn fork_lock(&self) -> ArenaForkGuard<'_> {
        let bin_guards = self.bins.iter().map(Bin::fork_lock).collect();
        ArenaForkGuard {
            _bins: bin_guards,
            _large: self.large.lock().unwrap(),
            _slab_extents: self.slab_extents.lock().unwrap(),
            _chunks: self.chunks.lock().unwrap(),
        }
    }

    /// Services a small allocation request, refilling the bin's slab
    /// set from the chunk layer on a miss.
    pub fn alloc_small(&self, class: SizeClassId) -> Option<NonNull<c_void>> {
        let region_size = size_class::class_to_size(class);
        let ptr = self.bin(class).alloc(|| self.carve_slab(region_size))?;
        self.stats.small_alloc(region_size);
        Some(ptr)
    }

    /// Releases a small allocation previously returned by
    /// `alloc_small` for the same `class`.
    pub fn dealloc_small(&self, class: SizeClassId, ptr: NonNull<c_void>) {
        let region_size = size_class::class_to_size(class);
        self.stats.small_dalloc(region_size);
        if let Some(empty_slab) = self.bin(class).dealloc(ptr, region_size) {
            self.release_slab(empty_slab);
        }
    }

    fn carve_slab(&self, region_size: usize) -> Option<Box<Slab>> {
        let chunksize = self.chunksize();
        let mut zero = false;
        let mut commit = false;

        let mut chunks = self.chunks.lock().unwrap();
        let mut extent = chunk::chunk_alloc(
            &mut chunks,
            &self.hooks,
            self.id,
            chunksize,
            chunksize,
            ExtentKind::Slab {
                class: size_class::lookup(region_size, 1)?,
            },
            &mut zero,
            &mut commit,
        )?;
        drop(chunks);

        if !commit {
            if (self.hooks.commit())(extent.base(), extent.size()) {
                let mut chunks = self.chunks.lock().unwrap();
                chunks.insert_retained(extent);
                return None;
            }
            extent.set_committed(true);
        }
        extent.set_state(ExtentState::Active);

        let base = extent.base();
        let nregions = extent.size() / region_size;
        self.npages_allocated
            .fetch_add(extent.size() / size_class::PAGE, Ordering::Relaxed);

        let mut slab_extents = self.slab_extents.lock().unwrap();
        let key = base.as_ptr() as usize;
        let extent_size = extent.size();
        slab_extents.insert(key, extent);
        let stored: &Extent = slab_extents.get(&key).expect("just inserted");
        crate::rtree::global().insert_range(key, extent_size, NonNull::from(stored));
        drop(slab_extents);

        Some(Box::new(Slab::new(base, region_size, nregions)))
    }

    fn release_slab(&self, slab: Box<Slab>) {
        let base_addr = slab.base().as_ptr() as usize;
        drop(slab);

        let extent = {
            let mut slab_extents = self.slab_extents.lock().unwrap();
            match slab_extents.remove(&base_addr) {
                Some(extent) => extent,
                // Another thread already reclaimed this slab's
                // extent (shouldn't happen: a slab is evicted at
                // most once); nothing left to return.
                None => return,
            }
        };
        crate::rtree::global().remove_range(base_addr, extent.size());

        self.npages_allocated
            .fetch_sub(extent.size() / size_class::PAGE, Ordering::Relaxed);
        self.ndirty
            .fetch_add(extent.size() / size_class::PAGE, Ordering::Relaxed);

        let mut chunks = self.chunks.lock().unwrap();
        chunk::chunk_dalloc(&mut chunks, &self.hooks, extent);
        drop(chunks);

        self.maybe_purge();
    }

    /// Services a large (chunk-backed) allocation request, the extent
    /// itself aligned to at least a page.
    pub fn alloc_large(&self, class: SizeClassId) -> Option<NonNull<c_void>> {
        self.alloc_large_aligned(class, size_class::PAGE)
    }

    /// As `alloc_large`, but requests the extent aligned to `alignment`
    /// (floored to a page) from the chunk layer, rather than a page.
    /// Used for `allocate_aligned` requests whose `alignment` exceeds a
    /// page: `size_class::lookup` already forces such a request into a
    /// large class, since only the chunk layer -- not a slab, which
    /// only ever promises page alignment -- can honor it.
    pub fn alloc_large_aligned(&self, class: SizeClassId, alignment: usize) -> Option<NonNull<c_void>> {
        let size = size_class::class_to_size(class);
        let aligned = size_class::align_up(size, size_class::PAGE);
        let chunk_alignment = alignment.max(size_class::PAGE);
        let mut zero = false;
        let mut commit = false;

        let mut chunks = self.chunks.lock().unwrap();
        let mut extent = chunk::chunk_alloc(
            &mut chunks,
            &self.hooks,
            self.id,
            aligned,
            chunk_alignment,
            ExtentKind::Large { class },
            &mut zero,
            &mut commit,
        )?;
        drop(chunks);

        if !commit {
            if (self.hooks.commit())(extent.base(), extent.size()) {
                let mut chunks = self.chunks.lock().unwrap();
                chunks.insert_retained(extent);
                return None;
            }
            extent.set_committed(true);
        }
        extent.set_state(ExtentState::Active);

        let ptr = extent.base();
        let extent_size = extent.size();
        self.npages_allocated
            .fetch_add(extent_size / size_class::PAGE, Ordering::Relaxed);

        let mut large = self.large.lock().unwrap();
        large.push_back(extent);
        let stored: &Extent = large.back().expect("just pushed");
        crate::rtree::global().insert_range(ptr.as_ptr() as usize, extent_size, NonNull::from(stored));
        drop(large);

        self.stats.large_alloc(size);
        Some(ptr)
    }

    /// Releases a large allocation previously returned by
    /// `alloc_large`.
    pub fn dealloc_large(&self, ptr: NonNull<c_void>) {
        let addr = ptr.as_ptr() as usize;

        let extent = {
            let mut large = self.large.lock().unwrap();
            let mut remaining = LinkedList::new();
            let mut found = None;
            while let Some(extent) = large.pop_front() {
                if found.is_none() && extent.base().as_ptr() as usize == addr {
                    found = Some(extent);
                } else {
                    remaining.push_back(extent);
                }
            }
            *large = remaining;
            found
        };

        let Some(extent) = extent else { return };
        crate::rtree::global().remove_range(addr, extent.size());

        self.stats.large_dalloc(extent.size());
        self.npages_allocated
            .fetch_sub(extent.size() / size_class::PAGE, Ordering::Relaxed);
        self.ndirty
            .fetch_add(extent.size() / size_class::PAGE, Ordering::Relaxed);

        let mut chunks = self.chunks.lock().unwrap();
        chunk::chunk_dalloc(&mut chunks, &self.hooks, extent);
        drop(chunks);

        self.maybe_purge();
    }

    /// Attempts to resize a live large allocation to `new_class` in
    /// place. Succeeds without moving anything when the extent's
    /// already page-rounded backing size is large enough to cover the
    /// new class's nominal size -- spec.md §4.7's "grow/shrink in
    /// place (adjacent extent available in cache)" path collapses to
    /// this for the common case, since every large extent is already
    /// over-allocated to a page multiple. Returns `false` (caller falls
    /// back to allocate-copy-free) when the new class needs more bytes
    /// than the extent actually has backing it.
    pub fn try_resize_large(&self, ptr: NonNull<c_void>, new_class: SizeClassId) -> bool {
        let addr = ptr.as_ptr() as usize;
        let new_size = size_class::class_to_size(new_class);

        let mut large = self.large.lock().unwrap();
        for extent in large.iter_mut() {
            if extent.base().as_ptr() as usize != addr {
                continue;
            }

            if new_size > extent.size() {
                return false;
            }

            let old_size = size_class::class_to_size(match extent.kind() {
                ExtentKind::Large { class } => class,
                ExtentKind::Slab { .. } => unreachable!("large list only holds large extents"),
            });
            extent.set_kind(ExtentKind::Large { class: new_class });

            if new_size >= old_size {
                self.stats.large_alloc(new_size - old_size);
            } else {
                self.stats.large_dalloc(old_size - new_size);
            }
            return true;
        }

        false
    }

    /// Purges dirty pages down to the configured ratio, if exceeded.
    pub fn maybe_purge(&self) {
        let ndirty = self.ndirty.load(Ordering::Relaxed);
        let npages = self.npages_allocated.load(Ordering::Relaxed);
        let threshold = npages >> self.lg_dirty_mult;

        if ndirty <= threshold {
            return;
        }

        let excess_pages = ndirty - threshold;
        let mut chunks = self.chunks.lock().unwrap();
        let purged_bytes = chunk::purge_cached(&mut chunks, &self.hooks, excess_pages * size_class::PAGE);
        drop(chunks);

        let purged_pages = (purged_bytes / size_class::PAGE).min(ndirty);
        self.ndirty.fetch_sub(purged_pages, Ordering::Relaxed);
        self.stats.record_purge(purged_pages as u64, purged_bytes as u64);
    }

    pub fn ndirty(&self) -> usize {
        self.ndirty.load(Ordering::Relaxed)
    }

    pub fn npages_allocated(&self) -> usize {
        self.npages_allocated.load(Ordering::Relaxed)
    }

    pub fn cached_bytes(&self) -> usize {
        self.chunks.lock().unwrap().cached_bytes()
    }

    pub fn retained_bytes(&self) -> usize {
        self.chunks.lock().unwrap().retained_bytes()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_small_alloc_dealloc_roundtrip() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let class = size_class::lookup(24, 1).unwrap();

        let a = arena.alloc_small(class).expect("should allocate");
        let b = arena.alloc_small(class).expect("should allocate");
        assert_ne!(a, b);

        arena.dealloc_small(class, a);
        arena.dealloc_small(class, b);
    }

    #[test]
    fn test_same_class_allocations_share_slab_and_slab_returns_on_empty() {
        let arena = Arena::new(1, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let class = size_class::lookup(24, 1).unwrap();
        assert_eq!(size_class::class_to_size(class), 24, "24 bytes is itself a size class and should round to itself");

        let p = arena.alloc_small(class).expect("should allocate");
        let q = arena.alloc_small(class).expect("should allocate");
        assert_ne!(p, q);
        assert_eq!(arena.bins()[class.as_usize()].nslabs(), 1, "both allocations should share one slab");

        arena.dealloc_small(class, p);
        arena.dealloc_small(class, q);
        // The bin keeps a sole emptied slab rather than evicting it (see
        // `bin::test_dealloc_keeps_sole_slab`), to avoid thrashing the
        // chunk cache on an alloc/dealloc cycle confined to one slab; a
        // slab is only returned once a second slab exists alongside it.
        assert_eq!(arena.bins()[class.as_usize()].nslabs(), 1);
    }

    #[test]
    fn test_large_alloc_dealloc_roundtrip() {
        let arena = Arena::new(0, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let class = size_class::lookup(1 << 20, 1).unwrap();

        let ptr = arena.alloc_large(class).expect("should allocate");
        assert!(arena.npages_allocated() > 0);

        arena.dealloc_large(ptr);
    }

    #[test]
    fn test_alloc_large_aligned_honors_chunk_sized_alignment() {
        let arena = Arena::new(4, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let class = size_class::lookup(100, 1 << 21).unwrap();

        let ptr = arena.alloc_large_aligned(class, 1 << 21).expect("should allocate");
        assert_eq!(ptr.as_ptr() as usize % (1 << 21), 0, "extent base must be chunk-aligned");

        arena.dealloc_large(ptr);
    }

    #[test]
    fn test_large_roundtrips_through_rtree() {
        let arena = Arena::new(1, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let class = size_class::lookup(1 << 20, 1).unwrap();

        let ptr = arena.alloc_large(class).expect("should allocate");
        let found = crate::rtree::global()
            .lookup(ptr.as_ptr() as usize)
            .expect("should be registered in the radix tree");
        assert_eq!(unsafe { found.as_ref() }.base(), ptr);

        arena.dealloc_large(ptr);
        assert!(crate::rtree::global().lookup(ptr.as_ptr() as usize).is_none());
    }

    #[test]
    fn test_try_resize_large_shrinks_in_place() {
        let arena = Arena::new(2, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let class = size_class::lookup(5_000_000, 1).unwrap();
        let ptr = arena.alloc_large(class).expect("should allocate");

        let smaller = size_class::lookup(4_000_000, 1).unwrap();
        assert!(arena.try_resize_large(ptr, smaller), "shrink should fit the page-rounded extent");

        // The radix tree entry still resolves to the same base address.
        let found = crate::rtree::global()
            .lookup(ptr.as_ptr() as usize)
            .expect("extent should still be registered");
        assert_eq!(unsafe { found.as_ref() }.base(), ptr);

        arena.dealloc_large(ptr);
    }

    #[test]
    fn test_try_resize_large_fails_when_too_big() {
        let arena = Arena::new(3, DEFAULT_LG_CHUNK, DEFAULT_LG_DIRTY_MULT);
        let class = size_class::lookup(1 << 16, 1).unwrap();
        let ptr = arena.alloc_large(class).expect("should allocate");

        let bigger = size_class::lookup(1 << 30, 1).unwrap();
        assert!(!arena.try_resize_large(ptr, bigger), "growing past the backing extent must fail");

        arena.dealloc_large(ptr);
    }
}
