//! A general-purpose, C- and Rust-callable heap.
//!
//! The engine is a three-tier design: thread-sharded arenas of tiny
//! pools for small objects, a best-fit radix tree dispensing medium
//! chunks with immediate coalescing, and a page map fronting a
//! pluggable page provider for everything larger.  Pointers carry no
//! back-reference; deallocation classifies them from their headers
//! alone, so foreign pointers are detected and refused rather than
//! corrupting the heap.
//!
//! Rust callers go through [`Heap`] or [`process_heap`]; C callers
//! link the static library and use the `micro_*` entry points, whose
//! semantics follow POSIX/glibc.
mod arena;
mod bitmask;
mod bump;
mod headers;
mod heap;
mod lock;
mod manager;
mod mapper;
mod os;
mod page_map;
mod params;
mod radix;
mod recursion;
mod stats;
mod thread_id;
mod tiny;

use std::os::raw::c_int;
use std::os::raw::c_void;

pub use heap::process_heap;
pub use heap::Heap;
pub use mapper::mapper_from_params;
pub use mapper::FileBackedMapper;
pub use mapper::MemoryMapper;
pub use mapper::OsMapper;
pub use mapper::PageMapper;
pub use params::Parameters;
pub use params::ProviderType;
pub use stats::HeapStats;
pub use stats::TypeStatsSnapshot;

fn set_errno(err: c_int) {
    errno::set_errno(errno::Errno(err));
}

/// malloc(3) against the process heap.
#[no_mangle]
pub extern "C" fn micro_malloc(size: usize) -> *mut c_void {
    let p = process_heap().allocate(size);
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p as *mut c_void
}

/// free(3).  Null and foreign pointers are no-ops.
///
/// # Safety
///
/// `p` must be null, or a pointer obtained from this allocator that
/// has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn micro_free(p: *mut c_void) {
    process_heap().deallocate(p as *mut u8);
}

/// calloc(3): zero-filled, overflow-checked.
#[no_mangle]
pub extern "C" fn micro_calloc(count: usize, size: usize) -> *mut c_void {
    let p = process_heap().allocate_zeroed(count, size);
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p as *mut c_void
}

/// realloc(3).  A foreign pointer yields null and is left alone.
///
/// # Safety
///
/// `p` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn micro_realloc(p: *mut c_void, size: usize) -> *mut c_void {
    let heap = process_heap();
    if !p.is_null() && size != 0 && heap.usable_size(p as *mut u8) == 0 {
        set_errno(libc::EINVAL);
        return std::ptr::null_mut();
    }
    let ret = heap.reallocate(p as *mut u8, size);
    if ret.is_null() && size != 0 {
        set_errno(libc::ENOMEM);
    }
    ret as *mut c_void
}

/// realloc that frees the original on failure.
///
/// # Safety
///
/// Same contract as [`micro_realloc`].
#[no_mangle]
pub unsafe extern "C" fn micro_reallocf(p: *mut c_void, size: usize) -> *mut c_void {
    let ret = micro_realloc(p, size);
    if ret.is_null() && size != 0 && !p.is_null() {
        micro_free(p);
    }
    ret
}

/// reallocarray(3): realloc with an overflow-checked element count.
///
/// # Safety
///
/// Same contract as [`micro_realloc`].
#[no_mangle]
pub unsafe extern "C" fn micro_reallocarray(
    p: *mut c_void,
    count: usize,
    size: usize,
) -> *mut c_void {
    match count.checked_mul(size) {
        Some(bytes) => micro_realloc(p, bytes),
        None => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

/// aligned_alloc(3).  The alignment must be a power of two.
#[no_mangle]
pub extern "C" fn micro_aligned_alloc(align: usize, size: usize) -> *mut c_void {
    if align == 0 || !align.is_power_of_two() {
        set_errno(libc::EINVAL);
        return std::ptr::null_mut();
    }
    let p = process_heap().allocate_aligned(size, align);
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p as *mut c_void
}

/// posix_memalign(3).
///
/// # Safety
///
/// `out` must be a valid pointer to writable storage.
#[no_mangle]
pub unsafe extern "C" fn micro_posix_memalign(
    out: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    if out.is_null()
        || !align.is_power_of_two()
        || align % std::mem::size_of::<*mut c_void>() != 0
    {
        return libc::EINVAL;
    }
    let p = process_heap().allocate_aligned(size, align);
    if p.is_null() {
        return libc::ENOMEM;
    }
    *out = p as *mut c_void;
    0
}

/// memalign(3).
#[no_mangle]
pub extern "C" fn micro_memalign(align: usize, size: usize) -> *mut c_void {
    micro_aligned_alloc(align, size)
}

/// valloc(3): page-aligned allocation.
#[no_mangle]
pub extern "C" fn micro_valloc(size: usize) -> *mut c_void {
    micro_aligned_alloc(os::page_size(), size)
}

/// pvalloc(3): like valloc, with the size rounded up to a page.
#[no_mangle]
pub extern "C" fn micro_pvalloc(size: usize) -> *mut c_void {
    let page = os::page_size();
    match size.checked_add(page - 1) {
        Some(padded) => micro_aligned_alloc(page, padded & !(page - 1)),
        None => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

/// malloc_usable_size(3); 0 for null or foreign pointers.
///
/// # Safety
///
/// `p` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn micro_usable_size(p: *mut c_void) -> usize {
    process_heap().usable_size(p as *mut u8)
}

/// The size a request of `size` bytes actually reserves.
#[no_mangle]
pub extern "C" fn micro_good_size(size: usize) -> usize {
    process_heap().good_size(size)
}
