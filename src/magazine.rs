//! The cache layer always allocates from and releases into small
//! arrays of pointers to pre-allocated blocks.  These small arrays are
//! "magazines"; a `MagazineStack` leaks and recycles their backing
//! storage directly rather than through a separate pooling layer.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map;
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_type_map;
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::size_class::SizeClassId;

use crate::linear_ref::LinearRef;
use crate::magazine_impl::MagazineImpl;
use std::mem::MaybeUninit;

/// A Magazine is a thin wrapper around MagazineImpl: the wrapping lets
/// us impose a tighter contract on the interface used in the
/// allocator, while keeping the internal implementation testable.
///
/// A `PUSH_MAG: true` magazine can only grow, and a `PUSH_MAG: false`
/// one can only shrink.
#[repr(transparent)]
pub struct Magazine<const PUSH_MAG: bool>(pub(crate) MagazineImpl);

pub type PushMagazine = Magazine<true>;
pub type PopMagazine = Magazine<false>;

impl<const PUSH_MAG: bool> Default for Magazine<PUSH_MAG> {
    fn default() -> Self {
        Self(MagazineImpl::default())
    }
}

/// Thread-local allocation caches also cache one spare magazine of
/// each polarity locally.  Buffering one magazine before pushing it to
/// the bin's shared `MagazineStack` helps avoid contention for common
/// patterns like back-to-back allocation and deallocation.
pub enum LocalMagazineCache {
    Nothing,
    Empty(PopMagazine), // Always an empty magazine.
    Full(PushMagazine), // Always a full magazine.
}

impl Default for LocalMagazineCache {
    fn default() -> Self {
        LocalMagazineCache::Nothing
    }
}

impl LocalMagazineCache {
    /// Stores `mag` in the cache, and returns the previously-cached
    /// magazine, if any, converted back to `mag`'s polarity.
    ///
    /// If `mag` cannot be cached (it is neither full nor empty),
    /// returns `mag` unchanged.
    pub fn populate<const PUSH_MAG: bool>(&mut self, mag: Magazine<PUSH_MAG>) -> Option<Magazine<PUSH_MAG>> {
        use LocalMagazineCache::*;

        if mag.is_full() {
            let mut local = Full(Magazine(mag.0));
            std::mem::swap(self, &mut local);
            return match local {
                Nothing => None,
                Empty(cached) => Some(Magazine(cached.0)),
                Full(cached) => Some(Magazine(cached.0)),
            };
        }

        if mag.is_empty() {
            let mut local = Empty(Magazine(mag.0));
            std::mem::swap(self, &mut local);
            return match local {
                Nothing => None,
                Empty(cached) => Some(Magazine(cached.0)),
                Full(cached) => Some(Magazine(cached.0)),
            };
        }

        Some(mag)
    }

    /// Returns a full `PopMagazine` if one is cached.
    pub fn steal_full(&mut self) -> Option<PopMagazine> {
        use LocalMagazineCache::*;

        match self {
            Full(_) => {
                let mut private = Nothing;
                std::mem::swap(&mut private, self);
                match private {
                    Full(mag) => Some(Magazine(mag.0)),
                    _ => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Number of blocks held in whatever magazine is currently cached
    /// here (`0` if `Nothing` or `Empty`), for the GC ticker's
    /// low-water accounting.
    pub fn cached_len(&self) -> usize {
        match self {
            LocalMagazineCache::Nothing | LocalMagazineCache::Empty(_) => 0,
            LocalMagazineCache::Full(mag) => mag.len(),
        }
    }

    /// Returns an empty `PushMagazine` if one is cached.
    pub fn steal_empty(&mut self) -> Option<PushMagazine> {
        use LocalMagazineCache::*;

        match self {
            Empty(_) => {
                let mut private = Nothing;
                std::mem::swap(&mut private, self);
                match private {
                    Empty(mag) => Some(Magazine(mag.0)),
                    _ => unreachable!(),
                }
            }
            _ => None,
        }
    }
}

impl<const PUSH_MAG: bool> Magazine<PUSH_MAG> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `self` and returns the inner implementation, e.g. to
    /// hand to a `MagazineStack` node.
    pub(crate) fn into_impl(self) -> MagazineImpl {
        self.0
    }

    pub(crate) fn from_impl(inner: MagazineImpl) -> Self {
        Self(inner)
    }

    /// Checks that current object's state is valid.
    ///
    /// If a size class is provided, all allocations must match it.
    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    pub fn check_rep(&self, maybe_class: Option<SizeClassId>) -> Result<(), &'static str> {
        if !self.0.check_rep() {
            return Err("MagazineImpl fails check_rep");
        }

        if let Some(class) = maybe_class {
            for i in 0..self.0.len() {
                if let Some(alloc) = self.0.nth(i) {
                    debug_allocation_map::can_be_allocated(class, alloc.get())?;
                    debug_type_map::is_class(class, alloc)?;
                }
            }
        }

        Ok(())
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.0.is_full()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Magazine</*PUSH_MAG=*/ true> {
    /// Attempts to put an unused block back in the magazine.
    ///
    /// Returns that unused block on failure.
    #[invariant(self.check_rep(None).is_ok())]
    #[inline(always)]
    pub fn put(&mut self, freed: LinearRef) -> Option<LinearRef> {
        self.0.put(freed)
    }
}

impl Magazine</*PUSH_MAG=*/ false> {
    /// Attempts to get an unused block from the magazine.
    #[invariant(self.check_rep(None).is_ok())]
    #[inline(always)]
    pub fn get(&mut self) -> Option<LinearRef> {
        self.0.get()
    }

    /// Fills unused slots in the magazine with whatever `allocator`
    /// produces, stopping early if it returns `None`.
    #[invariant(self.check_rep(None).is_ok())]
    #[inline(always)]
    pub fn populate(&mut self, allocator: impl FnMut() -> Option<LinearRef>) {
        self.0.populate(allocator)
    }
}

impl MagazineImpl {
    /// Returns the `index`-th populated slot, for contract checks.
    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    pub(crate) fn nth(&self, index: usize) -> Option<&LinearRef> {
        if index >= self.num_allocated as usize {
            return None;
        }
        Some(unsafe { &*self.allocations[index].as_ptr() })
    }

    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    pub(crate) fn len(&self) -> usize {
        self.num_allocated as usize
    }

    #[cfg(not(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    )))]
    pub(crate) fn len(&self) -> usize {
        self.num_allocated as usize
    }
}

#[allow(dead_code)]
fn assert_maybeuninit_layout(_: MaybeUninit<LinearRef>) {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let mut push_mag: Magazine<true> = Magazine::new();
        assert_eq!(push_mag.put(LinearRef::from_address(0x1000)), None);
        assert_eq!(push_mag.put(LinearRef::from_address(0x2000)), None);

        let mut pop_mag: Magazine<false> = Magazine::from_impl(push_mag.into_impl());
        let top = pop_mag.get().expect("should have a value");
        assert_eq!(top.address(), 0x2000);
        std::mem::forget(top);
    }

    #[test]
    fn test_local_cache_populate_and_steal() {
        let mut cache = LocalMagazineCache::default();

        let empty: Magazine<false> = Magazine::new();
        assert!(cache.populate(empty).is_none());
        assert!(cache.steal_empty().is_some());

        let mut full: Magazine<true> = Magazine::new();
        let mut addr = 0x3000usize;
        while !full.is_full() {
            if let Some(rejected) = full.put(LinearRef::from_address(addr)) {
                std::mem::forget(rejected);
                break;
            }
            addr += 1;
        }
        assert!(cache.populate(full).is_none());
        assert!(cache.steal_full().is_some());
    }
}
