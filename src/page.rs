//! Page-granularity primitives: reserving, releasing, committing, and
//! purging ranges of address space.
//!
//! Everything above this module talks in terms of extents and chunks,
//! never raw `mmap`/`madvise`.  We implement the boundary itself with
//! `libc`, the crate this corpus reaches for whenever it needs to touch
//! the OS directly (`mmtk-core`, `mimalloc-rs`) rather than hand-rolled
//! FFI declarations.
use std::ffi::c_void;
use std::ptr::NonNull;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to determine page size: sysconf returned {}", ret);
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Attempts to reserve an *address space* region of `size` bytes.
///
/// The region is mapped `PROT_NONE`: callers must `allocate_region` any
/// sub-range before touching it.  The `size` argument must be a multiple
/// of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        return Err(errno());
    }

    NonNull::new(ret).ok_or(libc::ENOMEM)
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Backs a region of `size` bytes starting at `base` with
/// (demand-faulted, zero-filled) read-write memory.
///
/// The size argument must be a multiple of the page size.
pub fn allocate_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Decommits a region, making its pages inaccessible again without
/// releasing the underlying address-space reservation.
pub fn decommit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!((size % page_size()) == 0, "Bad region size={}", size);

    // MADV_DONTNEED drops the pages' contents; PROT_NONE keeps the
    // caller from touching them again by accident before a matching
    // `allocate_region` re-commits the range.
    let advise = unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) };
    if advise != 0 {
        return Err(errno());
    }

    let ret = unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_NONE) };
    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Purges dirty pages in `[base, base + size)`, returning them to the OS
/// without giving up the address-space reservation or the ability to
/// write to the range again (unlike `decommit_region`).
pub fn purge_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!((size % page_size()) == 0, "Bad region size={}", size);

    let ret = unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) };
    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Extends the data segment by `increment` bytes via `sbrk`, for the
/// opt-in DSS allocation strategy (§6 `dss` option).
///
/// # Safety
///
/// `sbrk` is not thread-safe with respect to other callers of `sbrk` or
/// `brk`; this is only ever invoked while `chunks_mtx` is held.
pub unsafe fn sbrk(increment: isize) -> Result<NonNull<c_void>, i32> {
    let ret = libc::sbrk(increment);

    if ret == (-1isize as *mut c_void) {
        return Err(errno());
    }

    NonNull::new(ret).ok_or(libc::ENOMEM)
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert_eq!(page_size() % 4096, 0);
}

// Simulate a data + metadata allocation workflow: overallocate, trim
// the slop, and ask for real memory in some of the remaining space.
#[test]
fn smoke_test() {
    let region_size = 1usize << 21;
    let mut base = reserve_region(3 * region_size).expect("reserve should succeed");

    assert!(region_size > 3 * page_size());

    // We overallocated `base` by 3x.  Drop the bottom and top
    // `region_size` bytes from the range.
    release_region(base, region_size).expect("should release the bottom slop");
    base = NonNull::new((base.as_ptr() as usize + region_size) as *mut c_void)
        .expect("Should be non-null");

    let top_slop = NonNull::new((base.as_ptr() as usize + region_size) as *mut c_void)
        .expect("Should be non-null");
    release_region(top_slop, region_size).expect("should release the top slop");

    // Conceptually split the region in three ranges: a one-page
    // region at the base, a guard page just after, and the rest.
    let bottom = base; // one page
    let _guard = NonNull::new((base.as_ptr() as usize + page_size()) as *mut c_void)
        .expect("Should be non-null");
    let remainder = NonNull::new((base.as_ptr() as usize + 2 * page_size()) as *mut c_void)
        .expect("Should be non-null");

    allocate_region(bottom, page_size()).expect("should allocate bottom");
    allocate_region(remainder, region_size - 2 * page_size()).expect("should allocate remainder");

    unsafe {
        std::ptr::write_bytes(bottom.as_ptr() as *mut u8, 0x42, 1);
    }

    release_region(base, region_size).expect("should release everything");
}

#[test]
fn test_decommit_then_recommit() {
    let size = page_size();
    let base = reserve_region(size).expect("reserve should succeed");

    allocate_region(base, size).expect("allocate should succeed");
    unsafe {
        std::ptr::write_bytes(base.as_ptr() as *mut u8, 0xa5, size);
    }

    decommit_region(base, size).expect("decommit should succeed");
    allocate_region(base, size).expect("re-allocate should succeed");

    // Re-committed pages must read back as zero.
    let byte = unsafe { std::ptr::read(base.as_ptr() as *const u8) };
    assert_eq!(byte, 0);

    release_region(base, size).expect("release should succeed");
}
