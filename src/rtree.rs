//! Radix tree mapping an address to the `Extent` that backs it.
//!
//! Given a bare pointer, finds which extent (and therefore which arena
//! and size class) it belongs to, without a global lock -- the lookup
//! `free`/`realloc` need to work from a pointer alone.
//!
//! Grounded directly on jemalloc's `rtree.h`: a fixed-depth trie over
//! the bits of an address, where each level's fanout is chosen so the
//! tree is no more than a few levels deep on a 64-bit address space.
//! Node publication is two-stage and lock-free: a slot starts `null`;
//! the thread that wins a CAS from `null` to a sentinel becomes
//! responsible for allocating the child node and then release-storing
//! the real pointer, so every other reader either sees `null` (not yet
//! created) or a fully-initialized node (never a half-built one).
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::extent::Extent;

/// Bits of address consumed at each trie level.  Two levels of 13 and
/// 11 bits cover a 48-bit (current x86-64/aarch64) virtual address
/// space above the page-aligned low bits.
const LG_LEVEL1_FANOUT: u32 = 13;
const LG_LEVEL2_FANOUT: u32 = 11;
const LG_PAGE: u32 = crate::size_class::LG_PAGE;

const LEVEL1_SIZE: usize = 1 << LG_LEVEL1_FANOUT;
const LEVEL2_SIZE: usize = 1 << LG_LEVEL2_FANOUT;

/// Sentinel written into a slot mid-construction: any value other than
/// null and not 8-byte aligned can serve, since a real `Leaf` pointer
/// is always aligned.
const BUILDING: usize = 1;

struct Leaf {
    extent: AtomicPtr<Extent>,
    /// Low bit of the stored pointer doubles as the lock jemalloc's
    /// rtree leaves use for in-place updates (e.g. changing which
    /// extent a freshly split/merged range maps to) without a
    /// separate lock table.
    lock: AtomicUsize,
}

impl Leaf {
    fn new() -> Self {
        Self {
            extent: AtomicPtr::new(std::ptr::null_mut()),
            lock: AtomicUsize::new(0),
        }
    }
}

struct Level2Node {
    leaves: Vec<AtomicPtr<Leaf>>,
}

impl Level2Node {
    fn new() -> Self {
        let mut leaves = Vec::with_capacity(LEVEL2_SIZE);
        for _ in 0..LEVEL2_SIZE {
            leaves.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Self { leaves }
    }
}

/// A lock-free address-keyed trie from page-aligned addresses to the
/// `Extent` covering them.
///
/// The top level is a plain `Vec` sized at construction time (it is
/// never resized, so no synchronization is needed to read it); the
/// second level and the leaves are built lazily, published through a
/// CAS-then-release-store protocol so concurrent creators never race
/// on the same slot.
pub struct RadixTree {
    level1: Vec<AtomicPtr<Level2Node>>,
    // Guards the (rare) creation of a Level2Node/Leaf so concurrent
    // creators block rather than both allocating and leaking one.
    create_lock: Mutex<()>,
}

fn level1_index(addr: usize) -> usize {
    (addr >> (LG_PAGE + LG_LEVEL2_FANOUT)) & (LEVEL1_SIZE - 1)
}

fn level2_index(addr: usize) -> usize {
    (addr >> LG_PAGE) & (LEVEL2_SIZE - 1)
}

impl RadixTree {
    pub fn new() -> Self {
        let mut level1 = Vec::with_capacity(LEVEL1_SIZE);
        for _ in 0..LEVEL1_SIZE {
            level1.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Self {
            level1,
            create_lock: Mutex::new(()),
        }
    }

    fn get_or_create_level2(&self, idx: usize) -> &Level2Node {
        let slot = &self.level1[idx];

        loop {
            let current = slot.load(Ordering::Acquire);
            if !current.is_null() && current as usize != BUILDING {
                return unsafe { &*current };
            }

            if current as usize == BUILDING {
                std::hint::spin_loop();
                continue;
            }

            let _guard = self.create_lock.lock().unwrap();
            // Re-check: someone may have finished while we waited for
            // the lock.
            let current = slot.load(Ordering::Acquire);
            if !current.is_null() {
                drop(_guard);
                continue;
            }

            slot.store(BUILDING as *mut Level2Node, Ordering::Relaxed);
            let node = Box::into_raw(Box::new(Level2Node::new()));
            slot.store(node, Ordering::Release);
            return unsafe { &*node };
        }
    }

    fn get_or_create_leaf(&self, level2: &Level2Node, idx: usize) -> &Leaf {
        let slot = &level2.leaves[idx];

        loop {
            let current = slot.load(Ordering::Acquire);
            if !current.is_null() && current as usize != BUILDING {
                return unsafe { &*current };
            }

            if current as usize == BUILDING {
                std::hint::spin_loop();
                continue;
            }

            let _guard = self.create_lock.lock().unwrap();
            let current = slot.load(Ordering::Acquire);
            if !current.is_null() {
                drop(_guard);
                continue;
            }

            slot.store(BUILDING as *mut Leaf, Ordering::Relaxed);
            let leaf = Box::into_raw(Box::new(Leaf::new()));
            slot.store(leaf, Ordering::Release);
            return unsafe { &*leaf };
        }
    }

    fn find_leaf(&self, addr: usize) -> Option<&Leaf> {
        let l1_idx = level1_index(addr);
        let slot = self.level1[l1_idx].load(Ordering::Acquire);
        if slot.is_null() || slot as usize == BUILDING {
            return None;
        }
        let level2 = unsafe { &*slot };

        let l2_idx = level2_index(addr);
        let leaf_ptr = level2.leaves[l2_idx].load(Ordering::Acquire);
        if leaf_ptr.is_null() || leaf_ptr as usize == BUILDING {
            return None;
        }
        Some(unsafe { &*leaf_ptr })
    }

    /// Registers `extent` as covering `addr`'s page, creating
    /// intermediate trie nodes as needed.
    pub fn insert(&self, addr: usize, extent: NonNull<Extent>) {
        let l1_idx = level1_index(addr);
        let level2 = self.get_or_create_level2(l1_idx);
        let l2_idx = level2_index(addr);
        let leaf = self.get_or_create_leaf(level2, l2_idx);

        while leaf
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        leaf.extent.store(extent.as_ptr(), Ordering::Release);
        leaf.lock.store(0, Ordering::Release);
    }

    /// Removes any mapping for `addr`'s page.
    pub fn remove(&self, addr: usize) {
        if let Some(leaf) = self.find_leaf(addr) {
            while leaf
                .lock
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
            leaf.extent.store(std::ptr::null_mut(), Ordering::Release);
            leaf.lock.store(0, Ordering::Release);
        }
    }

    /// Looks up the extent covering `addr`, if any is registered.
    pub fn lookup(&self, addr: usize) -> Option<NonNull<Extent>> {
        let leaf = self.find_leaf(addr)?;
        NonNull::new(leaf.extent.load(Ordering::Acquire))
    }

    /// Registers `extent` as covering every page in `[addr, addr +
    /// size)`, so `lookup` succeeds for any address inside a
    /// multi-page extent, not just its base page.
    pub fn insert_range(&self, addr: usize, size: usize, extent: NonNull<Extent>) {
        let page = 1usize << LG_PAGE;
        let mut a = addr;
        while a < addr + size {
            self.insert(a, extent);
            a += page;
        }
    }

    /// Removes the mapping for every page in `[addr, addr + size)`.
    pub fn remove_range(&self, addr: usize, size: usize) {
        let page = 1usize << LG_PAGE;
        let mut a = addr;
        while a < addr + size {
            self.remove(a);
            a += page;
        }
    }
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the process-wide radix tree every arena publishes its
/// extents into, so the free path can find an owning extent (and
/// therefore arena) from a bare pointer without knowing its arena in
/// advance.
pub fn global() -> &'static RadixTree {
    lazy_static::lazy_static! { static ref TREE: RadixTree = RadixTree::new(); }
    &TREE
}

// The tree only ever hands out shared references to its nodes and
// ordinary atomic loads/stores of the `Extent` pointers they guard;
// nothing here is thread-affine.
unsafe impl Send for RadixTree {}
unsafe impl Sync for RadixTree {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extent::{ExtentKind, ExtentState};
    use crate::size_class::lookup as size_lookup;
    use std::ffi::c_void;

    fn fake_extent(addr: usize, size: usize) -> Box<Extent> {
        Box::new(Extent::new(
            NonNull::new(addr as *mut c_void).unwrap(),
            size,
            ExtentKind::Large {
                class: size_lookup(size, 1).unwrap(),
            },
            ExtentState::Active,
            true,
            false,
            0,
        ))
    }

    #[test]
    fn test_insert_and_lookup() {
        let tree = RadixTree::new();
        let extent = Box::leak(fake_extent(0x7f0000001000, 4096));
        let extent_ptr = NonNull::from(&*extent);

        tree.insert(0x7f0000001000, extent_ptr);
        let found = tree.lookup(0x7f0000001000).expect("should find extent");
        assert_eq!(found.as_ptr() as usize, extent_ptr.as_ptr() as usize);
    }

    #[test]
    fn test_lookup_miss() {
        let tree = RadixTree::new();
        assert!(tree.lookup(0x7f0000002000).is_none());
    }

    #[test]
    fn test_remove() {
        let tree = RadixTree::new();
        let extent = Box::leak(fake_extent(0x7f0000003000, 4096));
        tree.insert(0x7f0000003000, NonNull::from(&*extent));
        assert!(tree.lookup(0x7f0000003000).is_some());

        tree.remove(0x7f0000003000);
        assert!(tree.lookup(0x7f0000003000).is_none());
    }

    #[test]
    fn test_insert_range_covers_every_page() {
        let tree = RadixTree::new();
        let size = 4 * crate::size_class::PAGE;
        let extent = Box::leak(fake_extent(0x7f0000010000, size));
        let extent_ptr = NonNull::from(&*extent);

        tree.insert_range(0x7f0000010000, size, extent_ptr);
        for i in 0..4 {
            let addr = 0x7f0000010000 + i * crate::size_class::PAGE;
            assert!(tree.lookup(addr).is_some(), "page {} should be covered", i);
        }

        tree.remove_range(0x7f0000010000, size);
        for i in 0..4 {
            let addr = 0x7f0000010000 + i * crate::size_class::PAGE;
            assert!(tree.lookup(addr).is_none());
        }
    }

    #[test]
    fn test_concurrent_insert_distinct_addresses() {
        use std::sync::Arc;
        use std::thread;

        let tree = Arc::new(RadixTree::new());
        let mut handles = Vec::new();

        for i in 0..8usize {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                let addr = 0x7f0000100000 + i * 0x100000;
                let extent = Box::leak(fake_extent(addr, 4096));
                tree.insert(addr, NonNull::from(&*extent));
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        for i in 0..8usize {
            let addr = 0x7f0000100000 + i * 0x100000;
            assert!(tree.lookup(addr).is_some());
        }
    }
}
