//! Bins: per-arena, per-size-class bookkeeping for small allocations.
//!
//! A bin tracks every slab backing one size class in this arena, split
//! into the slabs with free regions (`nonfull`) and the slabs with
//! none (`full`).  Both sets are kept in a `BTreeMap` ordered by the
//! slab's base address, so the lowest-address nonfull slab --
//! `nonfull.iter().next()` -- is always available in O(log n) without
//! a separate "current slab" field to keep in sync: concentrating
//! allocation pressure on the oldest slab is what lets a slab that
//! empties out get noticed and reclaimed promptly.
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::size_class::SizeClassId;
use crate::slab::Slab;

#[derive(Default)]
pub(crate) struct BinState {
    nonfull: BTreeMap<usize, Box<Slab>>,
    full: BTreeMap<usize, Box<Slab>>,
}

/// Per-arena, per-size-class state: a mutex guarding the slab sets.
pub struct Bin {
    class: SizeClassId,
    state: Mutex<BinState>,
}

fn slab_key(slab: &Slab) -> usize {
    slab.base().as_ptr() as usize
}

impl Bin {
    pub fn new(class: SizeClassId) -> Self {
        Self {
            class,
            state: Mutex::new(BinState::default()),
        }
    }

    #[inline]
    pub fn class(&self) -> SizeClassId {
        self.class
    }

    /// Allocates one region, refilling with a freshly carved slab via
    /// `refill` if every existing slab is full.
    ///
    /// `refill` is only called while the bin's own mutex is held, so
    /// two threads racing to refill the same bin will serialize; the
    /// loser simply finds the slab the winner installed.
    pub fn alloc(&self, mut refill: impl FnMut() -> Option<Box<Slab>>) -> Option<NonNull<c_void>> {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some((&key, slab)) = state.nonfull.iter_mut().next() {
                let region = slab.alloc_region();
                if slab.is_full() {
                    let slab = state.nonfull.remove(&key).expect("just observed present");
                    state.full.insert(key, slab);
                }
                return region;
            }

            let fresh = refill()?;
            state.nonfull.insert(slab_key(&fresh), fresh);
        }
    }

    /// Releases `addr` (which must have come from `alloc` on this
    /// bin) back to its owning slab.
    ///
    /// Returns the evicted slab's base address when the slab this
    /// freed region belonged to became entirely free and was not the
    /// bin's only slab -- the caller (the arena) is then responsible
    /// for returning that extent to the chunk layer.
    pub fn dealloc(&self, addr: NonNull<c_void>, region_size: usize) -> Option<Box<Slab>> {
        let mut state = self.state.lock().unwrap();
        let target = addr.as_ptr() as usize;

        let key = find_owning_key(&state.full, target, region_size)
            .or_else(|| find_owning_key(&state.nonfull, target, region_size))?;

        let was_full = state.full.contains_key(&key);
        let slab = if was_full {
            state.full.get_mut(&key).unwrap()
        } else {
            state.nonfull.get_mut(&key).unwrap()
        };
        slab.dalloc_region(addr);

        if was_full {
            let slab = state.full.remove(&key).unwrap();
            state.nonfull.insert(key, slab);
        }

        let total_slabs = state.nonfull.len() + state.full.len();
        if total_slabs > 1 {
            if let Some(slab) = state.nonfull.get(&key) {
                if slab.is_empty() {
                    return state.nonfull.remove(&key);
                }
            }
        }
        None
    }

    pub fn nslabs(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.nonfull.len() + state.full.len()
    }

    /// Locks this bin's mutex for the duration of a `fork()`, returning
    /// an opaque guard; used by `fork::prefork` so a concurrent
    /// allocation in another thread can't be caught mid-update when
    /// the process forks.
    pub(crate) fn fork_lock(&self) -> std::sync::MutexGuard<'_, BinState> {
        self.state.lock().unwrap()
    }
}

fn find_owning_key(map: &BTreeMap<usize, Box<Slab>>, addr: usize, _region_size: usize) -> Option<usize> {
    // A slab's base address is its key, and `Slab::contains` already
    // checks the full `[base, base + nregions * region_size)` range,
    // so the owning slab (if any) is the one immediately at-or-below
    // `addr` that claims to contain it.
    map.range(..=addr)
        .next_back()
        .filter(|(_, slab)| slab.contains(addr))
        .map(|(&k, _)| k)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::size_class::lookup;

    fn fake_slab(base: usize, nregions: usize, region_size: usize) -> Box<Slab> {
        Box::new(Slab::new(
            NonNull::new(base as *mut c_void).unwrap(),
            region_size,
            nregions,
        ))
    }

    #[test]
    fn test_alloc_refills_on_full() {
        let bin = Bin::new(lookup(32, 1).unwrap());
        let mut refill_calls = 0;

        let mut refill = || {
            refill_calls += 1;
            Some(fake_slab(0x10000 * refill_calls, 2, 32))
        };

        let a = bin.alloc(&mut refill).unwrap();
        let b = bin.alloc(&mut refill).unwrap();
        assert_ne!(a, b);
        assert_eq!(refill_calls, 1);

        // Bin is now full; next alloc should refill a second slab.
        let c = bin.alloc(&mut refill).unwrap();
        assert_eq!(refill_calls, 2);
        assert_ne!(c, a);
    }

    #[test]
    fn test_dealloc_evicts_empty_nonsingular_slab() {
        let bin = Bin::new(lookup(32, 1).unwrap());
        let mut next = 0x10000usize;
        let mut refill = || {
            next += 0x10000;
            Some(fake_slab(next, 1, 32))
        };

        let a = bin.alloc(&mut refill).unwrap();
        let _b = bin.alloc(&mut refill).unwrap();
        assert_eq!(bin.nslabs(), 2);

        let evicted = bin.dealloc(a, 32);
        assert!(evicted.is_some(), "freeing the only region in its slab should evict it");
        assert_eq!(bin.nslabs(), 1);
    }

    #[test]
    fn test_dealloc_keeps_sole_slab() {
        let bin = Bin::new(lookup(32, 1).unwrap());
        let mut refill = || Some(fake_slab(0x20000, 1, 32));

        let a = bin.alloc(&mut refill).unwrap();
        let evicted = bin.dealloc(a, 32);
        assert!(evicted.is_none(), "the bin's only slab is never evicted");
        assert_eq!(bin.nslabs(), 1);
    }
}
