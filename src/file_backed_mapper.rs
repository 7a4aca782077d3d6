//! A chunk-hook pair that backs its data pages with a private temporary
//! file instead of anonymous memory, so the operating system is free to
//! swap cold chunks out under memory pressure the same way it would any
//! other file-backed mapping.
//!
//! Implemented as a plain `hooks::AllocHook`/`hooks::DallocHook` pair any
//! arena can swap in via `ChunkHooks::set_alloc`/`set_dalloc`, matching
//! this crate's field-wise hook model rather than a trait-object-based
//! mapper.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use contracts::*;
#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
use crate::debug_arange_map;
use crate::{page, size_class};

lazy_static::lazy_static! {
    static ref FILE_BACKED_PATH: Mutex<Option<PathBuf>> = Default::default();
}

/// Updates the parent directory new file-backed chunks' temporary
/// files are created in.  `None` reverts to the process-wide `TMPDIR`.
pub fn set_file_backed_slab_directory(path: Option<PathBuf>) {
    *FILE_BACKED_PATH.lock().unwrap() = path;
}

fn get_temp_file() -> std::io::Result<File> {
    let path = FILE_BACKED_PATH.lock().unwrap();
    match &*path {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
}

/// `hooks::AllocHook`-compatible: reserves `size` bytes of address
/// space aligned to `alignment` and maps a fresh temporary file's
/// contents over it, `MAP_SHARED`, instead of anonymous memory.
///
/// Ignores `new_addr`, same as `hooks::default_alloc`: it is a hint our
/// primitives have no way to honor without risking an existing mapping.
#[ensures(ret.is_some() -> debug_arange_map::reserve_range(ret.unwrap().as_ptr() as usize, size).is_ok())]
pub fn alloc(new_addr: Option<NonNull<c_void>>, size: usize, alignment: usize, commit: &mut bool) -> Option<NonNull<c_void>> {
    let _ = new_addr;

    let file = get_temp_file().ok()?;
    file.set_len(size as u64).ok()?;

    // Reserve (and immediately release) an over-sized anonymous range
    // purely to find an address wide and aligned enough for `size`,
    // then re-map the file over the aligned sub-range -- the same
    // reserve/trim technique `hooks::default_alloc` uses, with a final
    // `MAP_FIXED` re-mapping in place of `mprotect` since a file-backed
    // range cannot be produced by reprotecting an anonymous one.
    let reserve_size = size_class::align_up(size + alignment, page::page_size());
    let scratch = page::reserve_region(reserve_size).ok()?;
    let scratch_addr = scratch.as_ptr() as usize;
    let aligned_addr = size_class::align_up(scratch_addr, alignment.max(page::page_size()));
    page::release_region(scratch, reserve_size).ok()?;

    let mapped = unsafe {
        libc::mmap(
            aligned_addr as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    if mapped == libc::MAP_FAILED {
        return None;
    }

    *commit = true;
    NonNull::new(mapped)
}

/// `hooks::DallocHook`-compatible: unmaps a file-backed range
/// previously returned by `alloc`.  Returns `true` on failure.
#[requires(debug_arange_map::releasable_range(addr.as_ptr() as usize, size).is_ok())]
pub fn dalloc(addr: NonNull<c_void>, size: usize, _committed: bool) -> bool {
    unsafe { libc::munmap(addr.as_ptr(), size) != 0 }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_alloc_dalloc_roundtrip() {
        let mut commit = false;
        let region = alloc(None, page::page_size(), page::page_size(), &mut commit).expect("should allocate");
        assert!(commit);

        unsafe {
            std::ptr::write_bytes(region.as_ptr() as *mut u8, 0x5a, page::page_size());
        }

        assert!(!dalloc(region, page::page_size(), true));
    }

    #[test]
    fn test_alloc_respects_large_alignment() {
        let mut commit = false;
        let alignment = 1 << 16;
        let region = alloc(None, page::page_size(), alignment, &mut commit).expect("should allocate");
        assert_eq!(region.as_ptr() as usize % alignment, 0);

        assert!(!dalloc(region, page::page_size(), true));
    }

    #[test]
    fn test_set_file_backed_slab_directory_roundtrip() {
        set_file_backed_slab_directory(Some(std::env::temp_dir()));
        let mut commit = false;
        let region = alloc(None, page::page_size(), page::page_size(), &mut commit).expect("should allocate");
        assert!(!dalloc(region, page::page_size(), true));
        set_file_backed_slab_directory(None);
    }
}
