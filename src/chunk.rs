//! The chunk layer: acquiring and recycling chunk-aligned virtual
//! memory ranges on behalf of an arena.
//!
//! Every arena keeps two pairs of trees over its own extents: a
//! *cached* pair (still committed, recently freed, ready for instant
//! reuse) and a *retained* pair (decommitted, kept only as an address
//! space reservation).  Each pair is indexed both by `(size, address)`
//! -- for first-best-fit selection -- and by address alone -- to find
//! an extent's immediate neighbor when coalescing.  We keep the
//! by-address index as a set of addresses rather than a second copy of
//! the `Extent` boxes, so there is exactly one owner for each extent
//! at a time.
use std::collections::BTreeSet;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::extent::{Extent, ExtentKind, ExtentPool, ExtentState};
use crate::hooks::ChunkHooks;
use crate::size_class::align_up;

/// One arena's cached and retained extent trees.
#[derive(Default)]
pub struct ExtentTrees {
    cached: ExtentPool,
    cached_addrs: BTreeSet<usize>,
    retained: ExtentPool,
    retained_addrs: BTreeSet<usize>,
}

impl ExtentTrees {
    pub fn new() -> Self {
        Self::default()
    }

    fn neighbor_following(addrs: &BTreeSet<usize>, end: usize) -> Option<usize> {
        addrs.range(end..).next().copied().filter(|&a| a == end)
    }

    fn neighbor_preceding(pool: &ExtentPool, addrs: &BTreeSet<usize>, base: usize) -> Option<(usize, usize)> {
        let candidate = *addrs.range(..base).next_back()?;
        let size = pool.size_at(candidate)?;
        if candidate + size == base {
            Some((candidate, size))
        } else {
            None
        }
    }

    /// Inserts `extent` into the cached tree, first attempting to
    /// coalesce it with an immediately adjacent cached extent in
    /// either direction.  Coalescing is skipped (not an error) when
    /// the `committed` flags disagree or the hooks' `merge` refuses.
    pub fn insert_cached(&mut self, mut extent: Box<Extent>, hooks: &ChunkHooks) {
        extent.set_state(ExtentState::Cached);
        extent = self.try_coalesce(extent, hooks, true);
        let key = extent.base().as_ptr() as usize;
        self.cached_addrs.insert(key);
        self.cached.insert(extent);
    }

    /// Same as `insert_cached`, but in the retained tree (decommitted
    /// extents held only as a reservation).
    pub fn insert_retained(&mut self, mut extent: Box<Extent>) {
        extent.set_state(ExtentState::Retained);
        let key = extent.base().as_ptr() as usize;
        self.retained_addrs.insert(key);
        self.retained.insert(extent);
    }

    fn try_coalesce(&mut self, extent: Box<Extent>, hooks: &ChunkHooks, cached: bool) -> Box<Extent> {
        let (pool, addrs) = if cached {
            (&mut self.cached, &mut self.cached_addrs)
        } else {
            (&mut self.retained, &mut self.retained_addrs)
        };

        let base = extent.base().as_ptr() as usize;
        let size = extent.size();
        let end = base + size;
        let mut merged = extent;

        if let Some(following_addr) = Self::neighbor_following(addrs, end) {
            if let Some(following) = pool.remove_at(pool.size_at(following_addr).unwrap_or(0), following_addr) {
                if following.committed() == merged.committed()
                    && !(hooks.merge())(
                        merged.base(),
                        merged.size(),
                        following.base(),
                        following.size(),
                        merged.committed(),
                    )
                {
                    addrs.remove(&following_addr);
                    merged = Box::new(Extent::new(
                        merged.base(),
                        merged.size() + following.size(),
                        merged.kind(),
                        merged.state(),
                        merged.committed(),
                        merged.zeroed() && following.zeroed(),
                        merged.arena_ind(),
                    ));
                } else {
                    pool.insert(following);
                }
            }
        }

        if let Some((preceding_addr, preceding_size)) = Self::neighbor_preceding(pool, addrs, merged.base().as_ptr() as usize)
        {
            if let Some(preceding) = pool.remove_at(preceding_size, preceding_addr) {
                if preceding.committed() == merged.committed()
                    && !(hooks.merge())(
                        preceding.base(),
                        preceding.size(),
                        merged.base(),
                        merged.size(),
                        merged.committed(),
                    )
                {
                    addrs.remove(&preceding_addr);
                    merged = Box::new(Extent::new(
                        preceding.base(),
                        preceding.size() + merged.size(),
                        merged.kind(),
                        merged.state(),
                        merged.committed(),
                        merged.zeroed() && preceding.zeroed(),
                        merged.arena_ind(),
                    ));
                } else {
                    pool.insert(preceding);
                }
            }
        }

        merged
    }

    /// First-best-fit removal from the cached tree.
    pub fn remove_cached_best_fit(&mut self, size: usize) -> Option<Box<Extent>> {
        let extent = self.cached.remove_best_fit(size)?;
        self.cached_addrs.remove(&(extent.base().as_ptr() as usize));
        Some(extent)
    }

    /// First-best-fit removal from the retained tree.
    pub fn remove_retained_best_fit(&mut self, size: usize) -> Option<Box<Extent>> {
        let extent = self.retained.remove_best_fit(size)?;
        self.retained_addrs.remove(&(extent.base().as_ptr() as usize));
        Some(extent)
    }

    pub fn cached_bytes(&self) -> usize {
        self.cached.total_bytes()
    }

    pub fn retained_bytes(&self) -> usize {
        self.retained.total_bytes()
    }
}

/// Requests a chunk-aligned (or `alignment`-aligned, whichever is
/// coarser) range of at least `size` bytes for `arena_ind`.
///
/// Tries, in order: the cached tree, the retained tree (re-committing
/// before returning it), then the OS via `hooks`.  Returns `None` on
/// OOM.  `*zero` and `*commit` are set to whether the returned range
/// is zero-filled and committed, respectively.
pub fn chunk_alloc(
    trees: &mut ExtentTrees,
    hooks: &ChunkHooks,
    arena_ind: u32,
    size: usize,
    alignment: usize,
    kind: ExtentKind,
    zero: &mut bool,
    commit: &mut bool,
) -> Option<Box<Extent>> {
    if let Some(mut extent) = trees.remove_cached_best_fit(size) {
        let (lead, trail) = split_for_request(&mut extent, size, alignment, arena_ind);
        if let Some(lead) = lead {
            trees.insert_cached(lead, hooks);
        }
        if let Some(trail) = trail {
            trees.insert_cached(trail, hooks);
        }
        *zero = extent.zeroed();
        *commit = extent.committed();
        return Some(extent);
    }

    if let Some(mut extent) = trees.remove_retained_best_fit(size) {
        if (hooks.commit())(extent.base(), extent.size()) {
            // Recommit failed: the range stays a valid reservation,
            // just put it back rather than leak it.
            trees.insert_retained(extent);
            return None;
        }
        extent.set_committed(true);
        extent.set_zeroed(false);

        let (lead, trail) = split_for_request(&mut extent, size, alignment, arena_ind);
        if let Some(lead) = lead {
            trees.insert_retained(lead);
        }
        if let Some(trail) = trail {
            trees.insert_retained(trail);
        }
        *zero = extent.zeroed();
        *commit = extent.committed();
        return Some(extent);
    }

    let mut os_commit = false;
    let base = (hooks.alloc())(None, size, alignment, &mut os_commit)?;
    *zero = true;
    *commit = os_commit;

    Some(Box::new(Extent::new(
        base,
        size,
        kind,
        ExtentState::Active,
        os_commit,
        true,
        arena_ind,
    )))
}

/// Splits `extent` (already removed from its tree) down to exactly
/// `size` bytes, aligned to `alignment`, returning any lead/trail
/// slop as separate extents to be reinserted by the caller.
fn split_for_request(
    extent: &mut Box<Extent>,
    size: usize,
    alignment: usize,
    arena_ind: u32,
) -> (Option<Box<Extent>>, Option<Box<Extent>>) {
    let base = extent.base().as_ptr() as usize;
    let aligned = align_up(base, alignment);
    let leadsize = aligned - base;
    let trailsize = extent.size() - leadsize - size;

    let lead = if leadsize > 0 {
        Some(Box::new(Extent::new(
            extent.base(),
            leadsize,
            extent.kind(),
            extent.state(),
            extent.committed(),
            extent.zeroed(),
            arena_ind,
        )))
    } else {
        None
    };

    let trail = if trailsize > 0 {
        let trail_base = NonNull::new((aligned + size) as *mut c_void).expect("nonzero address");
        Some(Box::new(Extent::new(
            trail_base,
            trailsize,
            extent.kind(),
            extent.state(),
            extent.committed(),
            extent.zeroed(),
            arena_ind,
        )))
    } else {
        None
    };

    if leadsize > 0 || trailsize > 0 {
        let aligned_base = NonNull::new(aligned as *mut c_void).expect("nonzero address");
        *extent = Box::new(Extent::new(
            aligned_base,
            size,
            extent.kind(),
            extent.state(),
            extent.committed(),
            extent.zeroed(),
            arena_ind,
        ));
    }

    (lead, trail)
}

/// Returns `extent` to the chunk layer: attempts to coalesce with a
/// cached neighbor, then inserts it into the cached tree as dirty.
pub fn chunk_dalloc(trees: &mut ExtentTrees, hooks: &ChunkHooks, extent: Box<Extent>) {
    trees.insert_cached(extent, hooks);
}

/// Moves `bytes` worth of the coldest cached extents to the retained
/// tree, decommitting them via `hooks`.  Returns the number of bytes
/// actually purged (may be less than requested if the cache runs dry).
pub fn purge_cached(trees: &mut ExtentTrees, hooks: &ChunkHooks, mut bytes: usize) -> usize {
    let mut purged = 0;
    while bytes > 0 {
        let Some(mut extent) = trees.remove_cached_best_fit(0) else {
            break;
        };
        let size = extent.size();
        if (hooks.decommit())(extent.base(), size) {
            // Could not decommit: this implementation leaks the
            // virtual range rather than double-count it as both
            // cached and purged.
            break;
        }
        extent.set_committed(false);
        trees.insert_retained(extent);
        purged += size;
        bytes = bytes.saturating_sub(size);
    }
    purged
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::size_class::lookup as size_lookup;

    fn class_for(size: usize) -> ExtentKind {
        ExtentKind::Large {
            class: size_lookup(size, 1).unwrap(),
        }
    }

    #[test]
    fn test_alloc_from_os_then_recycle() {
        let mut trees = ExtentTrees::new();
        let hooks = ChunkHooks::default_hooks();
        let page = crate::page::page_size();

        let mut zero = false;
        let mut commit = false;
        let extent = chunk_alloc(&mut trees, &hooks, 0, page, page, class_for(page), &mut zero, &mut commit)
            .expect("OS alloc should succeed");
        assert!(commit);

        let base = extent.base();
        let size = extent.size();
        chunk_dalloc(&mut trees, &hooks, extent);
        assert_eq!(trees.cached_bytes(), size);

        let mut zero2 = false;
        let mut commit2 = false;
        let recycled = chunk_alloc(&mut trees, &hooks, 0, page, page, class_for(page), &mut zero2, &mut commit2)
            .expect("cache hit should succeed");
        assert_eq!(recycled.base(), base, "should reuse the freed range");
        assert_eq!(trees.cached_bytes(), 0);

        let dalloc_hook = hooks.dalloc();
        dalloc_hook(recycled.base(), recycled.size(), recycled.committed());
    }

    #[test]
    fn test_coalesce_adjacent_frees() {
        let mut trees = ExtentTrees::new();
        let hooks = ChunkHooks::default_hooks();
        let page = crate::page::page_size();

        let mut zero = false;
        let mut commit = false;
        let whole = chunk_alloc(
            &mut trees,
            &hooks,
            0,
            page * 2,
            page,
            class_for(page * 2),
            &mut zero,
            &mut commit,
        )
        .unwrap();
        let base = whole.base().as_ptr() as usize;

        let first = Box::new(Extent::new(
            whole.base(),
            page,
            class_for(page),
            ExtentState::Active,
            true,
            true,
            0,
        ));
        let second = Box::new(Extent::new(
            NonNull::new((base + page) as *mut c_void).unwrap(),
            page,
            class_for(page),
            ExtentState::Active,
            true,
            true,
            0,
        ));

        chunk_dalloc(&mut trees, &hooks, first);
        chunk_dalloc(&mut trees, &hooks, second);

        assert_eq!(trees.cached_bytes(), page * 2, "coalesced into one extent of the same total size");

        let mut z = false;
        let mut c = false;
        let reunited = chunk_alloc(&mut trees, &hooks, 0, page * 2, page, class_for(page * 2), &mut z, &mut c)
            .expect("a single coalesced extent should satisfy the original request");
        assert_eq!(reunited.base().as_ptr() as usize, base);
    }
}
