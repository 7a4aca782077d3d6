//! `parcel`: a multi-arena, multi-threaded slab-and-chunk memory
//! allocator.
//!
//! Allocation requests are rounded to one of a fixed set of size
//! classes (`size_class`), then routed through a per-thread cache
//! (`tsd`, `tcache`) to an arena (`arena`), which carves slabs
//! (`slab`, `bin`) for small requests and chunk-backed extents
//! (`chunk`, `extent`) for large ones. A process-wide radix tree
//! (`rtree`) maps any live pointer back to the extent -- and therefore
//! the arena and size class -- that owns it, which is what lets `free`
//! and `realloc` work from a bare pointer alone.
mod arena;
mod bin;
mod chunk;
mod config;
mod ctl;
mod dispatch;
mod extent;
mod file_backed_mapper;
mod fork;
mod hooks;
mod init;
mod linear_ref;
mod magazine;
mod magazine_impl;
mod magazine_stack;
mod page;
mod rtree;
mod size_class;
mod slab;
mod stats;
mod tcache;
mod tsd;

#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
mod debug_allocation_map;
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
mod debug_arange_map;
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
mod debug_type_map;

use std::ffi::c_void;
use std::os::raw::c_char;
use std::ptr::NonNull;

pub use config::{Dss, Options};
pub use ctl::{CtlError, CtlValue};
pub use file_backed_mapper::set_file_backed_slab_directory;
pub use hooks::{AllocHook, ChunkHooks, CommitHook, DallocHook, DecommitHook, MergeHook, PurgeHook, SplitHook};
use tcache::ExplicitTcacheId;

/// Creates an explicit thread cache (spec.md §4.6's `tcache.create`
/// facility) for a pool of short-lived tasks to share. Writes the
/// arena index the cache is bound to into `*arena_ind_out` (must be
/// passed back into every `parcel_allocate_with_tcache`/
/// `parcel_release_with_tcache`/`parcel_tcache_destroy` call for the
/// returned id) and returns the id itself.
///
/// # Safety
///
/// `arena_ind_out` must be valid for one `u32` write.
#[no_mangle]
pub unsafe extern "C" fn parcel_tcache_create(arena_ind_out: *mut u32) -> u32 {
    let (id, arena_ind) = dispatch::create_explicit_tcache();
    *arena_ind_out = arena_ind;
    id.raw()
}

/// Flushes and destroys an explicit thread cache previously created by
/// `parcel_tcache_create`. A repeat call with an already-destroyed
/// `tcache_id` is a harmless no-op.
#[no_mangle]
pub extern "C" fn parcel_tcache_destroy(tcache_id: u32, arena_ind: u32) {
    dispatch::destroy_explicit_tcache(ExplicitTcacheId::from_raw(tcache_id), arena_ind);
}

/// Allocates `size` bytes aligned to `alignment` through the explicit
/// thread cache `tcache_id`/`arena_ind` (as returned by
/// `parcel_tcache_create`) instead of the calling thread's own cache.
/// Returns `NULL` on invalid arguments, OOM, or an unknown
/// `tcache_id`.
#[no_mangle]
pub extern "C" fn parcel_allocate_with_tcache(tcache_id: u32, arena_ind: u32, size: usize, alignment: usize) -> *mut c_void {
    dispatch::allocate_with_tcache(ExplicitTcacheId::from_raw(tcache_id), arena_ind, size, alignment)
        .map(|p| p.as_ptr())
        .unwrap_or(std::ptr::null_mut())
}

/// Releases `ptr`, previously returned by `parcel_allocate_with_tcache`
/// for the same `tcache_id`/`arena_ind`, back through that cache.
///
/// # Safety
///
/// `ptr` must be `NULL` or a pointer previously returned by this
/// allocator and not yet released.
#[no_mangle]
pub unsafe extern "C" fn parcel_release_with_tcache(tcache_id: u32, arena_ind: u32, ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr) {
        dispatch::deallocate_with_tcache(ExplicitTcacheId::from_raw(tcache_id), arena_ind, ptr);
    }
}

/// Allocates `size` bytes aligned to `alignment` (must be a power of
/// two). Returns `NULL` on invalid arguments or OOM.
///
/// # Safety
///
/// `alignment` must be a power of two; this is a thin wrapper with no
/// other precondition beyond the ordinary C `malloc`/`aligned_alloc`
/// contract.
#[no_mangle]
pub unsafe extern "C" fn parcel_allocate(size: usize, alignment: usize) -> *mut c_void {
    dispatch::allocate(size, alignment, false)
        .map(|p| p.as_ptr())
        .unwrap_or(std::ptr::null_mut())
}

/// Allocates `size` bytes aligned to `alignment`, as `parcel_allocate`.
/// Kept as a distinct symbol: a dedicated entry point per C ABI call
/// shape even when the implementation is shared.
///
/// # Safety
///
/// Same contract as `parcel_allocate`.
#[no_mangle]
pub unsafe extern "C" fn parcel_allocate_aligned(size: usize, alignment: usize) -> *mut c_void {
    parcel_allocate(size, alignment)
}

/// Allocates `nmemb * size` bytes, zero-filled. Returns `NULL` on
/// overflow, invalid arguments, or OOM.
///
/// # Safety
///
/// No precondition beyond the ordinary C `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn parcel_calloc(nmemb: usize, size: usize) -> *mut c_void {
    dispatch::calloc(nmemb, size).map(|p| p.as_ptr()).unwrap_or(std::ptr::null_mut())
}

/// Resizes the allocation at `ptr` (or allocates fresh if `ptr` is
/// `NULL`) to `new_size` bytes aligned to `alignment`. Returns `NULL`
/// (leaving `ptr` untouched) on invalid arguments or OOM; a `new_size`
/// of `0` frees `ptr` and returns `NULL`.
///
/// # Safety
///
/// `ptr` must be `NULL` or a pointer previously returned by
/// `parcel_allocate`/`parcel_calloc`/`parcel_reallocate` and not yet
/// released.
#[no_mangle]
pub unsafe extern "C" fn parcel_reallocate(ptr: *mut c_void, new_size: usize, alignment: usize) -> *mut c_void {
    let ptr = NonNull::new(ptr);
    dispatch::reallocate(ptr, new_size, alignment)
        .map(|p| p.as_ptr())
        .unwrap_or(std::ptr::null_mut())
}

/// Releases `ptr`, previously returned by `parcel_allocate`/
/// `parcel_calloc`/`parcel_reallocate`. A `NULL` `ptr` is a no-op.
///
/// # Safety
///
/// `ptr` must be `NULL` or a pointer previously returned by this
/// allocator and not yet released.
#[no_mangle]
pub unsafe extern "C" fn parcel_release(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr) {
        dispatch::deallocate(ptr);
    }
}

/// Returns the usable size of the allocation at `ptr`, or `0` if `ptr`
/// is `NULL` or not a live allocation from this allocator.
///
/// # Safety
///
/// `ptr` must be `NULL` or a pointer previously returned by this
/// allocator and not yet released.
#[no_mangle]
pub unsafe extern "C" fn parcel_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr) {
        Some(ptr) => dispatch::usable_size(ptr),
        None => 0,
    }
}

/// Updates the directory for the file-backed chunk hook's temporary
/// files. `NULL` reverts to the process-wide `TMPDIR`.
///
/// # Safety
///
/// `path` must be `NULL` or a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn parcel_set_file_backed_slab_directory(path: *const c_char) {
    use std::ffi::CStr;

    if path.is_null() {
        set_file_backed_slab_directory(None);
        return;
    }

    let path_str = CStr::from_ptr(path).to_str().expect("path must be valid UTF-8").to_owned();
    set_file_backed_slab_directory(Some(path_str.into()));
}

/// `mallctl`-style introspection entry point: reads the current value
/// of `name` (a NUL-terminated dotted path, e.g. `"stats.allocated"`)
/// into `out`, writing its `CtlValue` kind as a single tagged byte
/// followed by the value's native representation. Returns `0` on
/// success, `-1` if `name` is not a valid UTF-8 C string, `-2` if
/// `name` does not resolve to a known entry, and `-3` if `out_len` is
/// too small for the resolved value.
///
/// Kinds: `0` = `i64`, `1` = `u64`, `2` = `usize`, `3` = `bool` (one
/// byte), `4` = UTF-8 string (remaining bytes, unterminated).
///
/// # Safety
///
/// `name` must be a valid, NUL-terminated C string; `out` must be
/// valid for `out_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn parcel_mallctl(name: *const c_char, out: *mut u8, out_len: usize) -> i32 {
    use std::ffi::CStr;

    let name = match CStr::from_ptr(name).to_str() {
        Ok(s) => s,
        Err(_) => return -1,
    };

    let value = match ctl::get(name) {
        Ok(v) => v,
        // A path with no readable value (e.g. `"arena.0.purge"`) may
        // still be a valid command: run it and report success/failure
        // instead of trying to serialize a value that doesn't exist.
        Err(_) => return if ctl::invoke(name).is_ok() { 0 } else { -2 },
    };

    let buf: Vec<u8> = match value {
        CtlValue::Int(v) => std::iter::once(0u8).chain(v.to_ne_bytes()).collect(),
        CtlValue::Uint(v) => std::iter::once(1u8).chain(v.to_ne_bytes()).collect(),
        CtlValue::Size(v) => std::iter::once(2u8).chain((v as u64).to_ne_bytes()).collect(),
        CtlValue::Bool(v) => vec![3u8, v as u8],
        CtlValue::Str(s) => std::iter::once(4u8).chain(s.into_bytes()).collect(),
    };

    if buf.len() > out_len {
        return -3;
    }

    let out = std::slice::from_raw_parts_mut(out, buf.len());
    out.copy_from_slice(&buf);
    0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_c_abi_allocate_release_roundtrip() {
        unsafe {
            let ptr = parcel_allocate(128, 1);
            assert!(!ptr.is_null());
            assert!(parcel_usable_size(ptr) >= 128);
            parcel_release(ptr);
        }
    }

    #[test]
    fn test_c_abi_calloc_then_realloc() {
        unsafe {
            let ptr = parcel_calloc(16, 4);
            assert!(!ptr.is_null());
            let grown = parcel_reallocate(ptr, 4096, 1);
            assert!(!grown.is_null());
            parcel_release(grown);
        }
    }

    #[test]
    fn test_c_abi_release_null_is_noop() {
        unsafe {
            parcel_release(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_mallctl_reads_narenas() {
        use std::ffi::CString;

        let name = CString::new("arenas.narenas").unwrap();
        let mut out = [0u8; 9];
        let rc = unsafe { parcel_mallctl(name.as_ptr(), out.as_mut_ptr(), out.len()) };
        assert_eq!(rc, 0);
        assert_eq!(out[0], 2); // Size
    }

    #[test]
    fn test_mallctl_unknown_path() {
        use std::ffi::CString;

        let name = CString::new("no.such.entry").unwrap();
        let mut out = [0u8; 16];
        let rc = unsafe { parcel_mallctl(name.as_ptr(), out.as_mut_ptr(), out.len()) };
        assert_eq!(rc, -2);
    }

    #[test]
    fn test_mallctl_invoke_purge() {
        use std::ffi::CString;

        let name = CString::new("arena.0.purge").unwrap();
        let mut out = [0u8; 16];
        let rc = unsafe { parcel_mallctl(name.as_ptr(), out.as_mut_ptr(), out.len()) };
        assert_eq!(rc, 0);
    }

    #[test]
    fn test_c_abi_explicit_tcache_roundtrip() {
        unsafe {
            let mut arena_ind = 0u32;
            let id = parcel_tcache_create(&mut arena_ind as *mut u32);

            let ptr = parcel_allocate_with_tcache(id, arena_ind, 64, 1);
            assert!(!ptr.is_null());
            assert!(parcel_usable_size(ptr) >= 64);

            parcel_release_with_tcache(id, arena_ind, ptr);
            parcel_tcache_destroy(id, arena_ind);
        }
    }
}
