//! Thread-specific data: binds the calling thread to one arena and
//! carries its thread cache, flushing that cache back to the arena's
//! depot when the thread exits.
//!
//! Binds a per-thread `ThreadCache` to one of several arenas, generalized
//! from a thread-local holding one magazine per registered class with no
//! arena concept at all. Thread-exit ordering falls back to a path that
//! does not need the thread-local: an allocation made *after* this
//! thread's cache has been torn down goes straight to an arena instead.
//! jemalloc's own C tsd implementation describes the same boundary
//! (`thd_start_reincarnated`): an allocation during destructor teardown
//! gets a fresh tsd (`Reincarnated`) instead of failing. Safe
//! Rust's `thread_local!` does not expose the raw re-registration hook
//! `tsd.c` uses for that, so here the externally visible behavior --
//! teardown-time allocation keeps working -- is preserved via the same
//! `try_with` fallback, going straight to an arena with no thread cache
//! involved.
use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::init;
use crate::size_class::{self, SizeClassId};
use crate::tcache::ThreadCache;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Nominal,
    /// This thread's cache has been flushed and dropped; any further
    /// allocation on this thread bypasses the cache entirely.
    Purgatory,
    /// An allocation was observed after `Purgatory`; recorded purely
    /// for introspection; see the module doc comment for why this
    /// does not, unlike jemalloc's C tsd, spin up a second real cache.
    Reincarnated,
}

struct Tsd {
    arena_ind: u32,
    cache: ThreadCache,
    state: State,
}

impl Tsd {
    fn new() -> Self {
        let globals = init::global();
        let arena_ind = globals.choose_arena();
        globals.arena(arena_ind).bind_thread();
        Self {
            arena_ind,
            cache: ThreadCache::new(globals.options.lg_tcache_max),
            state: State::Nominal,
        }
    }
}

impl Drop for Tsd {
    fn drop(&mut self) {
        self.state = State::Purgatory;
        let globals = init::global();
        self.cache.flush(globals.depot(self.arena_ind));
        globals.arena(self.arena_ind).unbind_thread();
    }
}

thread_local! {
    static TSD: RefCell<Tsd> = RefCell::new(Tsd::new());
}

/// The arena this thread-local's last `Tsd` was bound to. Used by the
/// teardown fallback path below, which otherwise has no binding to
/// consult -- picking arena 0 is a harmless simplification; a thread
/// allocating during its own exit sequence is rare enough that losing
/// that one thread's arena affinity for its last few frees is not
/// worth extra bookkeeping.
fn fallback_arena() -> &'static Arena {
    init::global().arena(0)
}

fn cache_enabled() -> bool {
    init::global().options.tcache
}

/// Allocates a region for `class` aligned to `alignment`, through this
/// thread's cache when one is available and enabled, otherwise
/// straight from an arena. `alignment` only matters for a large class
/// that falls through to `Arena::alloc_large_aligned`: `size_class::
/// lookup` already forces any over-page alignment into a large class,
/// since a slab only ever promises page alignment.
pub fn allocate(class: SizeClassId, alignment: usize) -> Option<NonNull<c_void>> {
    if !cache_enabled() {
        return direct_alloc(fallback_arena(), class, alignment);
    }

    TSD.try_with(|cell| {
        let mut tsd = cell.borrow_mut();
        let globals = init::global();
        let arena = globals.arena(tsd.arena_ind);
        let depot = globals.depot(tsd.arena_ind);
        tsd.cache.allocate_aligned(depot, arena, class, alignment)
    })
    .unwrap_or_else(|_| direct_alloc(fallback_arena(), class, alignment))
}

/// Releases `ptr`, previously returned by `allocate` for the same
/// `class`, back through this thread's cache, or directly to `arena`
/// if the cache is unavailable or disabled.
pub fn deallocate(class: SizeClassId, ptr: NonNull<c_void>, arena: &Arena) {
    if !cache_enabled() {
        direct_dealloc(arena, class, ptr);
        return;
    }

    let handled = TSD
        .try_with(|cell| {
            let mut tsd = cell.borrow_mut();
            let globals = init::global();
            if globals.arena(tsd.arena_ind).id() == arena.id() {
                let depot = globals.depot(tsd.arena_ind);
                tsd.cache.deallocate(depot, arena, class, ptr);
                true
            } else {
                // Freed from an arena other than this thread's own
                // binding (the block was allocated by, or migrated
                // to, a different thread); hand it straight back to
                // its owning arena rather than cache it under the
                // wrong arena's depot.
                false
            }
        })
        .unwrap_or(false);

    if !handled {
        direct_dealloc(arena, class, ptr);
    }
}

fn direct_alloc(arena: &Arena, class: SizeClassId, alignment: usize) -> Option<NonNull<c_void>> {
    if size_class::is_small(class) {
        arena.alloc_small(class)
    } else {
        arena.alloc_large_aligned(class, alignment)
    }
}

fn direct_dealloc(arena: &Arena, class: SizeClassId, ptr: NonNull<c_void>) {
    if size_class::is_small(class) {
        arena.dealloc_small(class, ptr);
    } else {
        arena.dealloc_large(ptr);
    }
}

/// Flushes this thread's own implicit cache early, without waiting for
/// thread exit. Distinct from `tcache::destroy_explicit`, which tears
/// down a separate, non-thread-bound cache created by
/// `tcache::create_explicit` (spec.md §4.6's `tcache.create` facility).
pub fn flush() {
    let _ = TSD.try_with(|cell| {
        let mut tsd = cell.borrow_mut();
        let globals = init::global();
        tsd.cache.flush(globals.depot(tsd.arena_ind));
    });
}

/// The arena index this thread is currently bound to, creating the
/// binding if this is the thread's first call into the allocator.
pub fn current_arena_ind() -> Option<u32> {
    TSD.try_with(|cell| cell.borrow().arena_ind).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_deallocate_roundtrip() {
        let class = size_class::lookup(64, 1).unwrap();
        let ptr = allocate(class, size_class::PAGE).expect("should allocate");
        let arena_ind = current_arena_ind().expect("tsd should be bound by now");
        let arena = init::global().arena(arena_ind);
        deallocate(class, ptr, arena);
    }

    #[test]
    fn test_current_arena_ind_is_stable_within_a_thread() {
        let a = current_arena_ind();
        let b = current_arena_ind();
        assert_eq!(a, b);
    }

    #[test]
    fn test_large_class_roundtrip() {
        let class = size_class::lookup(1 << 20, 1).unwrap();
        let ptr = allocate(class, size_class::PAGE).expect("should allocate");
        let arena_ind = current_arena_ind().unwrap();
        let arena = init::global().arena(arena_ind);
        deallocate(class, ptr, arena);
    }
}
