//! Chunk hooks: the pluggable set of functions an arena uses to grow
//! and shrink its backing address space.
//!
//! Each field is installed independently and read independently: a
//! caller may swap out `purge` without disturbing `alloc`, and two
//! concurrent allocations may each read a different, individually
//! consistent function pointer if a hook is replaced mid-flight.  We
//! therefore store each field as its own `AtomicPtr`-backed slot rather
//! than behind one lock or one `dyn Trait` object, since a trait object
//! cannot be swapped one field at a time.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::page;

/// Request to reserve and commit `size` bytes, ideally at `new_addr`
/// (a hint, not a requirement) aligned to `alignment`.  Returns `None`
/// on failure; sets `*commit` to whether the returned region is
/// already committed.
pub type AllocHook =
    fn(new_addr: Option<NonNull<c_void>>, size: usize, alignment: usize, commit: &mut bool) -> Option<NonNull<c_void>>;

/// Releases an extent back to the hook's backing store.  Returns
/// `false` on success, `true` if the extent could not be released (in
/// which case the caller retains ownership and must find another use
/// for it, e.g. the cache).
pub type DallocHook = fn(addr: NonNull<c_void>, size: usize, committed: bool) -> bool;

/// Commits (makes accessible) `[addr, addr + size)`.  Returns `true` on
/// failure.
pub type CommitHook = fn(addr: NonNull<c_void>, size: usize) -> bool;

/// Decommits `[addr, addr + size)`.  Returns `true` on failure.
pub type DecommitHook = fn(addr: NonNull<c_void>, size: usize) -> bool;

/// Advises the OS that `[addr, addr + size)` may be reclaimed; contents
/// become undefined, but the mapping stays valid.  Returns `true` on
/// failure.
pub type PurgeHook = fn(addr: NonNull<c_void>, size: usize) -> bool;

/// Splits an extent of `size` bytes at `addr` into two extents of
/// `size_a` and `size_b` bytes.  Returns `true` on failure (some
/// backing stores, e.g. System V shared memory, cannot be split).
pub type SplitHook = fn(addr: NonNull<c_void>, size: usize, size_a: usize, size_b: usize, committed: bool) -> bool;

/// Merges two adjacent extents, `addr_a` of `size_a` bytes immediately
/// followed by `addr_b` of `size_b` bytes, into one.  Returns `true` on
/// failure.
pub type MergeHook =
    fn(addr_a: NonNull<c_void>, size_a: usize, addr_b: NonNull<c_void>, size_b: usize, committed: bool) -> bool;

fn default_alloc(
    new_addr: Option<NonNull<c_void>>,
    size: usize,
    alignment: usize,
    commit: &mut bool,
) -> Option<NonNull<c_void>> {
    // The default hook ignores `new_addr`: it is a hint our `page`
    // primitives have no way to honor without a fixed mmap, which
    // would risk clobbering existing mappings.
    let _ = new_addr;

    let reserve_size = size + alignment;
    let base = page::reserve_region(crate::size_class::align_up(reserve_size, page::page_size())).ok()?;

    let base_addr = base.as_ptr() as usize;
    let aligned_addr = crate::size_class::align_up(base_addr, alignment.max(page::page_size()));
    let aligned = NonNull::new(aligned_addr as *mut c_void)?;

    if page::allocate_region(aligned, size).is_err() {
        return None;
    }

    *commit = true;
    Some(aligned)
}

fn default_dalloc(addr: NonNull<c_void>, size: usize, _committed: bool) -> bool {
    page::release_region(addr, size).is_err()
}

fn default_commit(addr: NonNull<c_void>, size: usize) -> bool {
    page::allocate_region(addr, size).is_err()
}

fn default_decommit(addr: NonNull<c_void>, size: usize) -> bool {
    page::decommit_region(addr, size).is_err()
}

fn default_purge(addr: NonNull<c_void>, size: usize) -> bool {
    page::purge_region(addr, size).is_err()
}

fn default_split(_addr: NonNull<c_void>, _size: usize, _size_a: usize, _size_b: usize, _committed: bool) -> bool {
    false
}

fn default_merge(
    _addr_a: NonNull<c_void>,
    _size_a: usize,
    _addr_b: NonNull<c_void>,
    _size_b: usize,
    _committed: bool,
) -> bool {
    false
}

/// Packs a hook's function pointer into an `AtomicUsize` slot; each
/// field updates independently of its siblings.
struct HookSlot<T> {
    raw: AtomicUsize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> HookSlot<T> {
    fn new(initial: T) -> Self {
        // SAFETY: `T` is one of our `*Hook` fn-pointer types, which are
        // always `usize`-sized and `usize`-aligned.
        let raw = unsafe { std::mem::transmute_copy::<T, usize>(&initial) };
        Self {
            raw: AtomicUsize::new(raw),
            _marker: std::marker::PhantomData,
        }
    }

    fn load(&self) -> T {
        let raw = self.raw.load(Ordering::Acquire);
        unsafe { std::mem::transmute_copy::<usize, T>(&raw) }
    }

    fn store(&self, value: T) {
        let raw = unsafe { std::mem::transmute_copy::<T, usize>(&value) };
        self.raw.store(raw, Ordering::Release);
    }
}

/// The set of hooks an arena uses to manage its chunks' backing store.
///
/// Matches jemalloc's `extent_hooks_t`: every field may be read and
/// written independently and concurrently with the others.
pub struct ChunkHooks {
    alloc: HookSlot<AllocHook>,
    dalloc: HookSlot<DallocHook>,
    commit: HookSlot<CommitHook>,
    decommit: HookSlot<DecommitHook>,
    purge: HookSlot<PurgeHook>,
    split: HookSlot<SplitHook>,
    merge: HookSlot<MergeHook>,
}

impl ChunkHooks {
    /// Returns the default set of hooks, backed by `libc` mmap/madvise
    /// primitives via the `page` module.
    pub fn default_hooks() -> Self {
        Self {
            alloc: HookSlot::new(default_alloc as AllocHook),
            dalloc: HookSlot::new(default_dalloc as DallocHook),
            commit: HookSlot::new(default_commit as CommitHook),
            decommit: HookSlot::new(default_decommit as DecommitHook),
            purge: HookSlot::new(default_purge as PurgeHook),
            split: HookSlot::new(default_split as SplitHook),
            merge: HookSlot::new(default_merge as MergeHook),
        }
    }

    pub fn alloc(&self) -> AllocHook {
        self.alloc.load()
    }

    pub fn set_alloc(&self, hook: AllocHook) {
        self.alloc.store(hook);
    }

    pub fn dalloc(&self) -> DallocHook {
        self.dalloc.load()
    }

    pub fn set_dalloc(&self, hook: DallocHook) {
        self.dalloc.store(hook);
    }

    pub fn commit(&self) -> CommitHook {
        self.commit.load()
    }

    pub fn set_commit(&self, hook: CommitHook) {
        self.commit.store(hook);
    }

    pub fn decommit(&self) -> DecommitHook {
        self.decommit.load()
    }

    pub fn set_decommit(&self, hook: DecommitHook) {
        self.decommit.store(hook);
    }

    pub fn purge(&self) -> PurgeHook {
        self.purge.load()
    }

    pub fn set_purge(&self, hook: PurgeHook) {
        self.purge.store(hook);
    }

    pub fn split(&self) -> SplitHook {
        self.split.load()
    }

    pub fn set_split(&self, hook: SplitHook) {
        self.split.store(hook);
    }

    pub fn merge(&self) -> MergeHook {
        self.merge.load()
    }

    pub fn set_merge(&self, hook: MergeHook) {
        self.merge.store(hook);
    }
}

impl Default for ChunkHooks {
    fn default() -> Self {
        Self::default_hooks()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_roundtrip() {
        let hooks = ChunkHooks::default_hooks();
        let mut commit = false;
        let region = (hooks.alloc())(None, page::page_size(), page::page_size(), &mut commit)
            .expect("default alloc should succeed");
        assert!(commit);

        assert!(!(hooks.dalloc())(region, page::page_size(), true));
    }

    #[test]
    fn test_custom_hook_overrides_independently() {
        fn noop_purge(_addr: NonNull<c_void>, _size: usize) -> bool {
            false
        }

        let hooks = ChunkHooks::default_hooks();
        let original_alloc = hooks.alloc();
        hooks.set_purge(noop_purge);

        // Only `purge` should have changed.
        assert_eq!(hooks.alloc() as usize, original_alloc as usize);
        assert_eq!(hooks.purge() as usize, noop_purge as usize);
    }
}
