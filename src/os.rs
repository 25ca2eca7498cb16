//! Thin wrappers over the mmap family.  Failures surface as
//! `Err(errno)`; the caller decides whether that is an out-of-memory
//! condition or a bug.
use std::ffi::c_void;
use std::ptr::NonNull;

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(ret > 0, "unable to find the system page size");
        ret as usize
    };
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Maps `size` bytes of demand-zero memory.
///
/// The `size` argument must be a positive multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && size % page_size() == 0,
        "bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(errno::errno().0);
    }
    NonNull::new(base).ok_or(libc::EINVAL)
}

/// Unmaps a region of `size` bytes starting at `base`.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }
    assert!(
        size % page_size() == 0,
        "bad region size={} page_size={}",
        size,
        page_size()
    );

    if unsafe { libc::munmap(base.as_ptr(), size) } != 0 {
        let err = errno::errno();
        log::warn!(
            "munmap failed: {}, addr {:p}, size {}",
            err,
            base.as_ptr(),
            size
        );
        return Err(err.0);
    }
    Ok(())
}

/// Gives the physical pages of a span back to the kernel while
/// keeping the address range reserved.  Used instead of `munmap` for
/// spans that cannot be unmapped piecemeal.
pub fn decommit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }
    if unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) } != 0 {
        let err = errno::errno();
        log::warn!(
            "madvise failed: {}, addr {:p}, size {}",
            err,
            base.as_ptr(),
            size
        );
        return Err(err.0);
    }
    Ok(())
}

/// Maps `size` bytes of `fd` at `offset` with shared read/write
/// access.  Both `offset` and `size` must be page multiples.
pub fn map_file_region(
    fd: std::os::unix::io::RawFd,
    offset: u64,
    size: usize,
) -> Result<NonNull<c_void>, i32> {
    assert!(size > 0 && size % page_size() == 0);
    assert!(offset % page_size() as u64 == 0);

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(errno::errno().0);
    }
    NonNull::new(base).ok_or(libc::EINVAL)
}
