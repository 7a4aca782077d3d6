//! Size classes: the fixed table of request sizes every allocation is
//! rounded up to, and the O(1) arithmetic used to go from a requested
//! size to a class index and back.
//!
//! The table is generated the way jemalloc's `size_classes.sh` derives
//! it: starting at `QUANTUM`, each doubling of size is subdivided into
//! `NGROUP` equally-spaced classes, which keeps internal fragmentation
//! bounded to `1 / NGROUP` regardless of how large the class gets.
use std::convert::TryFrom;

/// Allocation requests smaller than this share the smallest class
/// instead of getting sub-quantum classes of their own; matches the
/// teacher's preference for a small, fixed set of "common" constants.
pub const LG_QUANTUM: u32 = 4;
pub const QUANTUM: usize = 1 << LG_QUANTUM;

pub const LG_PAGE: u32 = 12;
pub const PAGE: usize = 1 << LG_PAGE;

/// Number of size classes per doubling of size, above the quantum.
/// jemalloc calls this `NGROUP`; it bounds worst-case internal
/// fragmentation to `1/NGROUP` of the requested size.
const NGROUP: usize = 4;
const LG_NGROUP: u32 = 2;

/// Requests at or below this many bytes are handled by the slab
/// allocator (bins of fixed-size regions carved out of a shared slab).
/// Above it, every allocation becomes its own chunk-backed extent.
pub const SMALL_MAXCLASS: usize = 14 * 1024;

/// No single allocation may exceed this many bytes; chosen so that a
/// large class's chunk always fits in one arena `chunk_alloc` (see
/// `chunk.rs`), grounded on `CHUNK_CEILING` in `chunk.h`.
pub const LARGE_MAXCLASS: usize = 1usize << 31;

fn generate_classes() -> Vec<usize> {
    let mut classes = Vec::new();

    // Sub-quantum tiny classes: powers of two from 8 up to QUANTUM / 2.
    let mut tiny = 8usize;
    while tiny < QUANTUM {
        classes.push(tiny);
        tiny *= 2;
    }

    let mut lg_grp = LG_QUANTUM;
    loop {
        let grp_base = 1usize << lg_grp;
        let grp_delta = grp_base >> LG_NGROUP;

        for i in 0..NGROUP {
            let size = grp_base + i * grp_delta;
            if size < QUANTUM {
                continue;
            }
            if size > LARGE_MAXCLASS {
                return classes;
            }
            classes.push(size);
        }

        lg_grp += 1;
    }
}

lazy_static::lazy_static! {
    static ref SIZE_CLASSES: Vec<usize> = generate_classes();

    /// Index of the first class whose size exceeds `SMALL_MAXCLASS`;
    /// everything before it is slab-backed, everything from it on is
    /// chunk-backed.
    static ref NUM_SMALL_CLASSES: usize =
        SIZE_CLASSES.iter().take_while(|&&size| size <= SMALL_MAXCLASS).count();
}

/// Opaque index into the size class table.  `0` is the smallest class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClassId(u32);

impl SizeClassId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Total number of size classes, small and large combined.
#[inline]
pub fn num_classes() -> usize {
    SIZE_CLASSES.len()
}

/// Number of classes served by the slab allocator.
#[inline]
pub fn num_small_classes() -> usize {
    *NUM_SMALL_CLASSES
}

/// Whether `id` refers to a slab-backed (small) size class, as opposed
/// to a chunk-backed (large) one.
#[inline]
pub fn is_small(id: SizeClassId) -> bool {
    id.as_usize() < num_small_classes()
}

/// Iterates every small (slab-backed) class id, in ascending order;
/// used by the arena to allocate one `Bin` per small class.
pub fn small_class_ids() -> impl Iterator<Item = SizeClassId> {
    (0..num_small_classes() as u32).map(SizeClassId)
}

/// Rounds `size` up to the nearest multiple of `align`.  `align` must
/// be a power of two.
#[inline]
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Rounds `size` down to the nearest multiple of `align`.  `align` must
/// be a power of two.
#[inline]
pub fn align_down(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    size & !(align - 1)
}

/// Returns the class index covering a request of `size` bytes with
/// `alignment` (a power of two), or `None` if no class is large enough.
///
/// Over-aligned requests are satisfied by the smallest class whose size
/// is itself a multiple of `alignment`; a slab only ever guarantees its
/// regions start aligned to `PAGE`, so an `alignment` beyond a page can
/// only be honored by the chunk layer handing back its own
/// individually-aligned extent -- this forces any such request into a
/// large class even when `size` alone would have fit in a slab, so
/// `Arena::alloc_large_aligned` can pass the real alignment through to
/// `chunk::chunk_alloc` rather than a slab's mere page alignment.
pub fn lookup(size: usize, alignment: usize) -> Option<SizeClassId> {
    debug_assert!(alignment.is_power_of_two());

    if size == 0 && alignment <= QUANTUM {
        return Some(SizeClassId(0));
    }

    let mut needed = size.max(alignment);
    if alignment > PAGE {
        needed = needed.max(SMALL_MAXCLASS + 1);
    }
    let classes = &*SIZE_CLASSES;

    let start = classes.partition_point(|&c| c < needed);
    for idx in start..classes.len() {
        let class_size = classes[idx];
        if class_size < size {
            continue;
        }

        let satisfies_alignment = if alignment > PAGE {
            // Only a large, chunk-backed class gets here (`needed` was
            // bumped above `SMALL_MAXCLASS`); `alloc_large_aligned`
            // requests this exact alignment from the chunk layer, so
            // the class's own size doesn't need to be a multiple of it.
            class_size > SMALL_MAXCLASS
        } else {
            alignment <= QUANTUM || class_size % alignment == 0
        };

        if satisfies_alignment {
            return Some(SizeClassId(u32::try_from(idx).expect("class count fits u32")));
        }
    }

    None
}

/// Returns the byte size of class `id`.
#[inline]
pub fn class_to_size(id: SizeClassId) -> usize {
    SIZE_CLASSES[id.as_usize()]
}

/// Computes, for a chunk-backed (large) class, how many pages its
/// regions occupy.
#[inline]
pub fn class_to_pages(id: SizeClassId) -> usize {
    debug_assert!(!is_small(id));
    align_up(class_to_size(id), PAGE) / PAGE
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classes_ascending_and_unique() {
        let classes = &*SIZE_CLASSES;
        for window in classes.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn test_lookup_covers_request() {
        for &size in &[1usize, 7, 8, 9, 16, 17, 100, 1000, 14336, 14337, 1 << 20] {
            let id = lookup(size, 1).expect("should find a class");
            assert!(class_to_size(id) >= size, "class for {} too small", size);
        }
    }

    #[test]
    fn test_lookup_monotonic() {
        let a = lookup(100, 1).unwrap();
        let b = lookup(1000, 1).unwrap();
        assert!(a <= b);
    }

    #[test]
    fn test_small_large_boundary() {
        let boundary_id = lookup(SMALL_MAXCLASS, 1).unwrap();
        assert!(is_small(boundary_id));

        let above_id = lookup(SMALL_MAXCLASS + 1, 1).unwrap();
        assert!(!is_small(above_id));
    }

    #[test]
    fn test_alignment_respected() {
        let id = lookup(100, 256).expect("should find a class");
        let size = class_to_size(id);
        assert_eq!(size % 256, 0);
        assert!(size >= 100);
    }

    #[test]
    fn test_above_page_alignment_forces_large_class() {
        // A slab can only ever promise its regions start aligned to a
        // page; an alignment above that can only be honored by the
        // chunk layer's own per-extent alignment, so even a small
        // `size` must be routed to a large class.
        let id = lookup(100, 1 << 21).expect("should find a class");
        assert!(!is_small(id), "alignment above a page must force a large, chunk-backed class");
    }

    #[test]
    fn test_align_up_down() {
        assert_eq!(align_up(10, 8), 16);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(10, 8), 8);
        assert_eq!(align_down(16, 8), 16);
    }

    #[test]
    fn test_oversized_request_fails() {
        assert!(lookup(LARGE_MAXCLASS + 1, 1).is_none());
    }

    #[test]
    fn test_request_at_class_boundary_rounds_to_that_class_not_the_next() {
        let classes = &*SIZE_CLASSES;
        let boundary = classes[5];
        let id = lookup(boundary, 1).unwrap();
        assert_eq!(class_to_size(id), boundary, "a request exactly at a class size must land on that class");
    }
}
