//! Top-level dispatch: routes a bare `(size, alignment)` request or a
//! bare pointer to the size class, arena, and thread cache that own it.
//!
//! Every public entry point here is the Rust-side counterpart of one
//! `parcel_*` C ABI function in `lib.rs`; this module stays pure Rust
//! (`NonNull<c_void>`/`Option`/`usize`) so it can be unit-tested without
//! going through the `unsafe extern "C"` boundary.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::extent::{Extent, ExtentKind};
use crate::init;
use crate::size_class::{self, SizeClassId};
use crate::tcache::{self, ExplicitTcacheId};
use crate::tsd;

/// Byte pattern written into a freshly carved region when `junk` is
/// enabled, to turn "read before write" bugs into reproducible garbage.
const JUNK_ALLOC: u8 = 0xa5;
/// Byte pattern written into a region just before it is freed, to turn
/// use-after-free into reproducible garbage instead of silently
/// reading back whatever the next allocation leaves behind.
const JUNK_FREE: u8 = 0x5a;

fn class_and_arena_of(ptr: NonNull<c_void>) -> Option<(SizeClassId, u32)> {
    let extent = crate::rtree::global().lookup(ptr.as_ptr() as usize)?;
    let extent: &Extent = unsafe { extent.as_ref() };
    let class = match extent.kind() {
        ExtentKind::Slab { class } => class,
        ExtentKind::Large { class } => class,
    };
    Some((class, extent.arena_ind()))
}

/// Allocates `size` bytes aligned to `alignment` (a power of two).
/// Zero-fills the usable region when `zero` is set, otherwise junk-fills
/// it when `options.junk` is set. Returns `None` on invalid arguments or
/// OOM.
pub fn allocate(size: usize, alignment: usize, zero: bool) -> Option<NonNull<c_void>> {
    if !alignment.is_power_of_two() || size > size_class::LARGE_MAXCLASS {
        return None;
    }

    let class = size_class::lookup(size, alignment)?;
    let ptr = tsd::allocate(class, alignment)?;
    let usable = size_class::class_to_size(class);

    let globals = init::global();
    if zero {
        unsafe { std::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0, usable) };
    } else if globals.options.junk {
        unsafe { std::ptr::write_bytes(ptr.as_ptr() as *mut u8, JUNK_ALLOC, usable) };
    }

    Some(ptr)
}

/// Allocates `nmemb * size` bytes, zero-filled, failing on overflow the
/// same way libc's `calloc` does.
pub fn calloc(nmemb: usize, size: usize) -> Option<NonNull<c_void>> {
    let total = nmemb.checked_mul(size)?;
    allocate(total, 1, true)
}

/// Releases `ptr`, previously returned by `allocate`/`calloc`/
/// `reallocate`. A `None`/dangling `ptr` not owned by this allocator is
/// a caller bug; like libc's `free`, we trust the caller and do not
/// defend against it beyond the `rtree` lookup returning `None`, in
/// which case this is a no-op.
pub fn deallocate(ptr: NonNull<c_void>) {
    let Some((class, arena_ind)) = class_and_arena_of(ptr) else {
        return;
    };

    let globals = init::global();
    if globals.options.junk || globals.options.zero {
        let usable = size_class::class_to_size(class);
        let byte = if globals.options.zero { 0 } else { JUNK_FREE };
        unsafe { std::ptr::write_bytes(ptr.as_ptr() as *mut u8, byte, usable) };
    }

    let arena = globals.arena(arena_ind);
    tsd::deallocate(class, ptr, arena);
}

/// Returns the usable size of the allocation at `ptr`, i.e. the size of
/// the class it was rounded up to, or `0` if `ptr` is not a live
/// allocation from this allocator.
pub fn usable_size(ptr: NonNull<c_void>) -> usize {
    class_and_arena_of(ptr)
        .map(|(class, _)| size_class::class_to_size(class))
        .unwrap_or(0)
}

/// Resizes the allocation at `ptr` to `new_size` bytes aligned to
/// `alignment`, preserving the lesser of the old and new sizes' worth of
/// content. Returns `None` (leaving `ptr` untouched) on invalid
/// arguments or OOM; a `NULL` old `ptr` behaves like `allocate`.
pub fn reallocate(ptr: Option<NonNull<c_void>>, new_size: usize, alignment: usize) -> Option<NonNull<c_void>> {
    let Some(ptr) = ptr else {
        return allocate(new_size, alignment, false);
    };

    if new_size == 0 {
        deallocate(ptr);
        return None;
    }

    let (old_class, arena_ind) = class_and_arena_of(ptr)?;
    let new_class = size_class::lookup(new_size, alignment)?;

    // Same class: the existing region already satisfies the request,
    // jemalloc's own `ralloc` short-circuit for the common "barely
    // grew/shrank" case.
    if new_class == old_class {
        return Some(ptr);
    }

    // Large-to-large resize: try to grow/shrink in place before paying
    // for an allocate-copy-free round trip (spec.md §4.7).
    if !size_class::is_small(old_class) && !size_class::is_small(new_class) {
        let arena = init::global().arena(arena_ind);
        if arena.try_resize_large(ptr, new_class) {
            return Some(ptr);
        }
    }

    let new_ptr = allocate(new_size, alignment, false)?;
    let old_size = size_class::class_to_size(old_class);
    let copy_size = old_size.min(new_size);
    unsafe {
        std::ptr::copy_nonoverlapping(ptr.as_ptr() as *const u8, new_ptr.as_ptr() as *mut u8, copy_size);
    }
    deallocate(ptr);
    Some(new_ptr)
}

/// Creates an explicit thread cache (spec.md §4.6's `tcache.create`)
/// bound to whichever arena `Globals::choose_arena` currently favors,
/// for a pool of short-lived tasks to share instead of each paying for
/// its own lazily-created per-thread cache. The returned arena index
/// must be passed back into every later `*_with_tcache`/
/// `destroy_explicit_tcache` call for this id: the cache itself is not
/// thread-local, so nothing else remembers which arena it's bound to.
pub fn create_explicit_tcache() -> (ExplicitTcacheId, u32) {
    let globals = init::global();
    let arena_ind = globals.choose_arena();
    (tcache::create_explicit(arena_ind, globals.options.lg_tcache_max), arena_ind)
}

/// Flushes and releases an explicit thread cache. A repeat call on an
/// already-destroyed id is a harmless no-op.
pub fn destroy_explicit_tcache(id: ExplicitTcacheId, arena_ind: u32) {
    tcache::destroy_explicit(id, init::global().depot(arena_ind));
}

/// Allocates through an explicit thread cache rather than the calling
/// thread's own, for callers that created one with
/// `create_explicit_tcache`.
pub fn allocate_with_tcache(id: ExplicitTcacheId, arena_ind: u32, size: usize, alignment: usize) -> Option<NonNull<c_void>> {
    if !alignment.is_power_of_two() || size > size_class::LARGE_MAXCLASS {
        return None;
    }

    let class = size_class::lookup(size, alignment)?;
    let globals = init::global();
    let arena = globals.arena(arena_ind);
    let depot = globals.depot(arena_ind);
    let ptr = tcache::allocate_explicit(id, arena, depot, class, alignment)?;

    if globals.options.junk {
        let usable = size_class::class_to_size(class);
        unsafe { std::ptr::write_bytes(ptr.as_ptr() as *mut u8, JUNK_ALLOC, usable) };
    }
    Some(ptr)
}

/// Releases `ptr` (previously returned by `allocate_with_tcache` for
/// the same `id`/`arena_ind`) back through the explicit cache.
pub fn deallocate_with_tcache(id: ExplicitTcacheId, arena_ind: u32, ptr: NonNull<c_void>) {
    let Some((class, owning_arena)) = class_and_arena_of(ptr) else {
        return;
    };

    let globals = init::global();
    if globals.options.junk || globals.options.zero {
        let usable = size_class::class_to_size(class);
        let byte = if globals.options.zero { 0 } else { JUNK_FREE };
        unsafe { std::ptr::write_bytes(ptr.as_ptr() as *mut u8, byte, usable) };
    }

    let arena = globals.arena(owning_arena);
    if size_class::is_small(class) && owning_arena == arena_ind {
        tcache::deallocate_explicit(id, arena, globals.depot(arena_ind), class, ptr);
    } else {
        // Either a large allocation (never cached) or a block that
        // migrated to a different arena than this explicit cache is
        // bound to; hand it straight back to its owning arena, the
        // same fallback `tsd::deallocate` uses for cross-arena frees.
        if size_class::is_small(class) {
            arena.dealloc_small(class, ptr);
        } else {
            arena.dealloc_large(ptr);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_deallocate_roundtrip() {
        let ptr = allocate(128, 1, false).expect("should allocate");
        assert!(usable_size(ptr) >= 128);
        deallocate(ptr);
    }

    #[test]
    fn test_calloc_zeroes() {
        let ptr = calloc(16, 8).expect("should allocate");
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr() as *const u8, 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        deallocate(ptr);
    }

    #[test]
    fn test_calloc_overflow_fails() {
        assert!(calloc(usize::MAX, 2).is_none());
    }

    #[test]
    fn test_reallocate_grows_and_preserves_prefix() {
        let ptr = allocate(16, 1, false).expect("should allocate");
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0x11, 16);
        }

        let grown = reallocate(Some(ptr), 4096, 1).expect("should reallocate");
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr() as *const u8, 16) };
        assert!(bytes.iter().all(|&b| b == 0x11));

        deallocate(grown);
    }

    #[test]
    fn test_reallocate_same_class_is_noop() {
        let ptr = allocate(100, 1, false).expect("should allocate");
        let same = reallocate(Some(ptr), 101, 1).expect("should reallocate");
        assert_eq!(ptr, same);
        deallocate(same);
    }

    #[test]
    fn test_reallocate_large_shrink_is_in_place() {
        let ptr = allocate(5_000_000, 1, false).expect("should allocate");
        let shrunk = reallocate(Some(ptr), 4_000_000, 1).expect("should reallocate");
        assert_eq!(ptr, shrunk, "shrinking within the same page-rounded extent should not move");
        assert!(usable_size(shrunk) >= 4_000_000);
        deallocate(shrunk);
    }

    #[test]
    fn test_reallocate_null_behaves_like_allocate() {
        let ptr = reallocate(None, 64, 1).expect("should allocate");
        deallocate(ptr);
    }

    #[test]
    fn test_reallocate_to_zero_frees() {
        let ptr = allocate(64, 1, false).expect("should allocate");
        assert!(reallocate(Some(ptr), 0, 1).is_none());
    }

    #[test]
    fn test_usable_size_of_foreign_pointer_is_zero() {
        let mut x = 0u8;
        let fake = NonNull::new(&mut x as *mut u8 as *mut c_void).unwrap();
        assert_eq!(usable_size(fake), 0);
    }

    #[test]
    fn test_oversized_allocation_fails() {
        assert!(allocate(size_class::LARGE_MAXCLASS + 1, 1, false).is_none());
    }

    #[test]
    fn test_zero_size_allocation_succeeds_with_minimal_class() {
        let ptr = allocate(0, 1, false).expect("allocate(0) should not abort");
        assert!(usable_size(ptr) > 0);
        deallocate(ptr);
    }

    #[test]
    fn test_allocate_aligned_to_chunksize_is_chunk_aligned() {
        let chunksize = 1usize << 21;
        let ptr = allocate(100, chunksize, false).expect("should allocate");
        assert_eq!(ptr.as_ptr() as usize % chunksize, 0, "over-page alignment must be honored exactly");
        deallocate(ptr);
    }

    #[test]
    fn test_maxclass_allocation_succeeds() {
        let ptr = allocate(size_class::LARGE_MAXCLASS, 1, false).expect("should allocate the largest class");
        deallocate(ptr);
    }

    #[test]
    fn test_explicit_tcache_roundtrip() {
        let (id, arena_ind) = create_explicit_tcache();
        let ptr = allocate_with_tcache(id, arena_ind, 64, 1).expect("should allocate");
        assert!(usable_size(ptr) >= 64);
        deallocate_with_tcache(id, arena_ind, ptr);
        destroy_explicit_tcache(id, arena_ind);
    }

    #[test]
    fn test_explicit_tcache_large_allocation_bypasses_cache() {
        let (id, arena_ind) = create_explicit_tcache();
        let ptr = allocate_with_tcache(id, arena_ind, 1 << 20, 1).expect("should allocate");
        deallocate_with_tcache(id, arena_ind, ptr);
        destroy_explicit_tcache(id, arena_ind);
    }

    #[test]
    fn test_cross_thread_free_routes_to_allocating_thread_arena() {
        // A pointer allocated on one thread and freed on another must
        // still resolve, via the rtree, to its actual owning arena
        // rather than whichever arena the freeing thread is bound to.
        let addr = std::thread::spawn(|| allocate(64, 1, false).expect("should allocate").as_ptr() as usize)
            .join()
            .unwrap();

        std::thread::spawn(move || {
            let ptr = NonNull::new(addr as *mut c_void).unwrap();
            assert!(usable_size(ptr) >= 64);
            deallocate(ptr);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_concurrent_allocate_free_storm_leaves_no_leaks() {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..1000 {
                        let ptr = allocate(64, 1, false).expect("should allocate");
                        deallocate(ptr);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
