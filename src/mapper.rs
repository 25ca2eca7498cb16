//! A `PageMapper` supplies and releases page runs for a heap.  It is
//! the only polymorphic seam in the crate: the OS variant sits on
//! mmap, the fixed-memory variant carves a caller-supplied block, and
//! the file-backed variant maps private temporary files so the
//! operating system can eagerly swap out cold data.
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::lock::SpinLock;
use crate::os;
use crate::params::Parameters;
use crate::params::ProviderType;
use crate::params::FILE_GROWING;

/// Contract of every page provider.
///
/// `allocate_pages` returns `count` contiguous pages aligned to the
/// allocation granularity, or `None` on exhaustion; exhaustion is
/// never an abort.  The fixed-memory and file variants hand out
/// zero-filled pages.
pub trait PageMapper: Send + Sync {
    /// Page size; constant over the mapper's lifetime.
    fn page_size(&self) -> usize;

    /// Alignment of every returned run; usually the page size.
    fn allocation_granularity(&self) -> usize {
        self.page_size()
    }

    fn allocate_pages(&self, count: usize) -> Option<NonNull<c_void>>;

    fn deallocate_pages(&self, base: NonNull<c_void>, count: usize);

    /// Whether the heap must return the pages on destruction.  False
    /// when the backing block belongs to the caller.
    fn owns_pages(&self) -> bool {
        true
    }

    /// Forgets every outstanding run.  Called from `Heap::clear`
    /// after the runs themselves have been released.
    fn reset(&self);
}

/// Builds the mapper described by `params`.
pub fn mapper_from_params(params: &Parameters) -> Box<dyn PageMapper> {
    match params.provider_type {
        ProviderType::Os => Box::new(OsMapper),
        ProviderType::OsPrealloc => Box::new(MemoryMapper::prealloc(
            params.page_memory_size as usize,
            params.page_size as usize,
            params.allow_os_page_alloc,
        )),
        ProviderType::Memory => Box::new(MemoryMapper::fixed(
            params.page_memory_provider,
            params.page_memory_size as usize,
            params.page_size as usize,
            params.allow_os_page_alloc,
        )),
        ProviderType::File => Box::new(FileBackedMapper::new(params)),
    }
}

/// Plain mmap/munmap.
#[derive(Debug, Default)]
pub struct OsMapper;

impl PageMapper for OsMapper {
    fn page_size(&self) -> usize {
        os::page_size()
    }

    fn allocate_pages(&self, count: usize) -> Option<NonNull<c_void>> {
        os::reserve_region(count * self.page_size()).ok()
    }

    fn deallocate_pages(&self, base: NonNull<c_void>, count: usize) {
        let _ = os::release_region(base, count * self.page_size());
    }

    fn reset(&self) {}
}

/// Intrusive list of free spans, written into the spans themselves.
#[repr(C)]
struct FreeSpan {
    next: *mut FreeSpan,
    pages: usize,
}

/// First-fit carver over one contiguous region: either a
/// caller-supplied block or an anonymous mapping reserved up front.
pub struct MemoryMapper {
    lock: SpinLock,
    base: *mut u8,
    size: usize,
    page: usize,
    /// The heap releases a preallocated region on destruction, but
    /// never a caller-supplied one.
    owns: bool,
    os_fallback: bool,
    bump: UnsafeCell<usize>,
    free: UnsafeCell<*mut FreeSpan>,
}

unsafe impl Send for MemoryMapper {}
unsafe impl Sync for MemoryMapper {}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl MemoryMapper {
    /// Carves from `block`; the block stays owned by the caller.
    pub fn fixed(block: *mut u8, size: usize, page: usize, os_fallback: bool) -> MemoryMapper {
        let aligned = align_up(block as usize, page);
        let slack = aligned.wrapping_sub(block as usize);
        MemoryMapper {
            lock: SpinLock::new(),
            base: if block.is_null() {
                std::ptr::null_mut()
            } else {
                aligned as *mut u8
            },
            size: size.saturating_sub(slack) & !(page - 1),
            page,
            owns: false,
            os_fallback,
            bump: UnsafeCell::new(0),
            free: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    /// Reserves `size` bytes from the OS up front and carves from
    /// them, preserving the reservation across `reset`.
    pub fn prealloc(size: usize, page: usize, os_fallback: bool) -> MemoryMapper {
        let rounded = align_up(size.max(page), os::page_size());
        let base = os::reserve_region(rounded)
            .map(|p| p.as_ptr() as *mut u8)
            .unwrap_or(std::ptr::null_mut());
        let mut mapper = Self::fixed(base, rounded, page, os_fallback);
        mapper.owns = true;
        mapper
    }

    fn contains(&self, addr: *mut u8) -> bool {
        !self.base.is_null()
            && addr >= self.base
            && (addr as usize) < self.base as usize + self.size
    }

    /// First-fit over the free list, splitting oversized spans.
    /// Holds `lock`.
    unsafe fn take_free(&self, count: usize) -> Option<*mut u8> {
        let mut prev: *mut *mut FreeSpan = self.free.get();
        let mut span = *prev;
        while !span.is_null() {
            if (*span).pages >= count {
                let rest = (*span).pages - count;
                if rest == 0 {
                    *prev = (*span).next;
                } else {
                    let tail = (span as *mut u8).add(count * self.page) as *mut FreeSpan;
                    (*tail).next = (*span).next;
                    (*tail).pages = rest;
                    *prev = tail;
                }
                return Some(span as *mut u8);
            }
            prev = &mut (*span).next;
            span = *prev;
        }
        None
    }
}

impl Drop for MemoryMapper {
    fn drop(&mut self) {
        if self.owns && !self.base.is_null() {
            if let Some(base) = NonNull::new(self.base as *mut c_void) {
                let _ = os::release_region(base, self.size);
            }
        }
    }
}

impl PageMapper for MemoryMapper {
    fn page_size(&self) -> usize {
        self.page
    }

    fn allocate_pages(&self, count: usize) -> Option<NonNull<c_void>> {
        self.lock.lock();
        let span = unsafe {
            self.take_free(count).or_else(|| {
                let bump = self.bump.get();
                if !self.base.is_null() && *bump + count * self.page <= self.size {
                    let ret = self.base.add(*bump);
                    *bump += count * self.page;
                    Some(ret)
                } else {
                    None
                }
            })
        };
        self.lock.unlock();

        if let Some(span) = span {
            // The contract hands out zero-filled pages; recycled and
            // caller-supplied spans are dirty.
            unsafe { std::ptr::write_bytes(span, 0, count * self.page) };
            return NonNull::new(span as *mut c_void);
        }

        if self.os_fallback {
            os::reserve_region(count * self.page).ok()
        } else {
            None
        }
    }

    fn deallocate_pages(&self, base: NonNull<c_void>, count: usize) {
        let addr = base.as_ptr() as *mut u8;
        if self.contains(addr) {
            if self.owns && self.page % os::page_size() == 0 {
                // Preallocated regions stay reserved; hand the
                // physical pages back and keep the address range.
                let _ = os::decommit_region(base, count * self.page);
            }
            self.lock.lock();
            unsafe {
                let span = addr as *mut FreeSpan;
                (*span).next = *self.free.get();
                (*span).pages = count;
                *self.free.get() = span;
            }
            self.lock.unlock();
        } else {
            let _ = os::release_region(base, count * self.page);
        }
    }

    fn owns_pages(&self) -> bool {
        self.owns
    }

    fn reset(&self) {
        self.lock.lock();
        unsafe {
            *self.bump.get() = 0;
            *self.free.get() = std::ptr::null_mut();
        }
        self.lock.unlock();
    }
}

/// Maps every run to its own unlinked temporary file.  Dropping the
/// `File` right after mapping is fine: the kernel keeps the inode
/// alive until the span is unmapped.
pub struct FileBackedMapper {
    page: usize,
    directory: Option<std::path::PathBuf>,
    /// Byte budget when the file flags forbid growth; 0 is unlimited.
    budget: u64,
    os_fallback: bool,
    outstanding: std::sync::atomic::AtomicU64,
}

impl FileBackedMapper {
    pub fn new(params: &Parameters) -> FileBackedMapper {
        let directory = if params.page_file_provider_dir.is_empty() {
            None
        } else {
            Some(std::path::PathBuf::from(&params.page_file_provider_dir))
        };
        FileBackedMapper {
            page: params.page_size as usize,
            directory,
            budget: if params.page_file_flags & FILE_GROWING != 0 {
                0
            } else {
                params.page_memory_size
            },
            os_fallback: params.allow_os_page_alloc,
            outstanding: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// The backing files are anonymous: unlinked on creation, gone
    /// with their last mapping.
    fn temp_file(&self) -> std::io::Result<std::fs::File> {
        match &self.directory {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
    }

    fn fallback(&self, count: usize) -> Option<NonNull<c_void>> {
        if self.os_fallback {
            os::reserve_region(count * self.page).ok()
        } else {
            None
        }
    }

    fn release_budget(&self, bytes: u64) {
        use std::sync::atomic::Ordering;

        if self.budget == 0 {
            return;
        }
        let mut cur = self.outstanding.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(bytes);
            match self.outstanding.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

impl PageMapper for FileBackedMapper {
    fn page_size(&self) -> usize {
        self.page
    }

    fn allocation_granularity(&self) -> usize {
        // mmap aligns to the OS page size regardless of the
        // configured provider page size.
        os::page_size().min(self.page)
    }

    fn allocate_pages(&self, count: usize) -> Option<NonNull<c_void>> {
        use std::os::unix::io::AsRawFd;
        use std::sync::atomic::Ordering;

        let bytes = (count * self.page) as u64;
        if self.budget != 0
            && self.outstanding.fetch_add(bytes, Ordering::Relaxed) + bytes > self.budget
        {
            self.outstanding.fetch_sub(bytes, Ordering::Relaxed);
            return self.fallback(count);
        }

        let file = match self.temp_file() {
            Ok(file) => file,
            Err(e) => {
                log::warn!("file page provider cannot open a backing file: {}", e);
                self.release_budget(bytes);
                return self.fallback(count);
            }
        };
        if unsafe { libc::ftruncate(file.as_raw_fd(), bytes as libc::off_t) } != 0 {
            self.release_budget(bytes);
            return self.fallback(count);
        }

        match os::map_file_region(file.as_raw_fd(), 0, bytes as usize) {
            Ok(base) => Some(base),
            Err(_) => {
                self.release_budget(bytes);
                self.fallback(count)
            }
        }
    }

    fn deallocate_pages(&self, base: NonNull<c_void>, count: usize) {
        // File-backed or OS-fallback, releasing is one munmap; the
        // backing inode dies with the last mapping.  The accounting
        // may briefly overcount fallback spans, which only delays
        // new file mappings, never correctness.
        let _ = os::release_region(base, count * self.page);
        self.release_budget((count * self.page) as u64);
    }

    fn reset(&self) {
        self.outstanding.store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn check_mapper(mapper: &dyn PageMapper) {
        let count = crate::headers::BLOCK_SIZE / mapper.page_size();
        let run = mapper.allocate_pages(count).expect("should allocate");
        assert_eq!(
            run.as_ptr() as usize % mapper.allocation_granularity(),
            0,
            "runs are granularity-aligned"
        );

        let bytes = run.as_ptr() as *mut u8;
        unsafe {
            std::ptr::write(bytes, 1);
            std::ptr::write(bytes.add(count * mapper.page_size() - 1), 2);
        }
        mapper.deallocate_pages(run, count);
    }

    #[test]
    fn os_mapper_smoke() {
        check_mapper(&OsMapper);
    }

    #[test]
    fn prealloc_mapper_smoke() {
        let mapper = MemoryMapper::prealloc(4 * crate::headers::BLOCK_SIZE, 4096, false);
        check_mapper(&mapper);
        assert!(mapper.owns_pages());
        mapper.reset();
        check_mapper(&mapper);
    }

    #[test]
    fn fixed_mapper_recycles_and_zeroes() {
        let mut block = vec![0xffu8; 65 * 4096];
        let mapper = MemoryMapper::fixed(block.as_mut_ptr(), 65 * 4096, 4096, false);

        let a = mapper.allocate_pages(4).expect("should allocate");
        unsafe {
            // The contract hands out zeroed pages even from a dirty block.
            assert_eq!(std::ptr::read(a.as_ptr() as *const u8), 0);
            std::ptr::write_bytes(a.as_ptr() as *mut u8, 0xab, 4 * 4096);
        }
        mapper.deallocate_pages(a, 4);

        let b = mapper.allocate_pages(2).expect("should reuse the span");
        assert_eq!(b.as_ptr(), a.as_ptr());
        unsafe { assert_eq!(std::ptr::read(b.as_ptr() as *const u8), 0) };
        mapper.deallocate_pages(b, 2);
    }

    #[test]
    fn fixed_mapper_exhausts_without_fallback() {
        let mut block = vec![0u8; 8 * 4096];
        let mapper = MemoryMapper::fixed(block.as_mut_ptr(), 8 * 4096, 4096, false);

        assert!(mapper.allocate_pages(1024).is_none());
    }

    #[test]
    fn file_mapper_smoke() {
        let mut params = Parameters::default();
        params.provider_type = ProviderType::File;
        params.allow_os_page_alloc = false;
        let mapper = FileBackedMapper::new(&params);
        check_mapper(&mapper);
    }

    #[test]
    fn file_mapper_respects_static_budget() {
        let mut params = Parameters::default();
        params.provider_type = ProviderType::File;
        params.page_memory_size = 8 * 4096;
        params.page_file_flags = crate::params::FILE_STATIC_SIZE;
        params.allow_os_page_alloc = false;
        let mapper = FileBackedMapper::new(&params);

        let a = mapper.allocate_pages(8).expect("within budget");
        assert!(mapper.allocate_pages(1).is_none(), "budget exhausted");
        mapper.deallocate_pages(a, 8);
        let b = mapper.allocate_pages(8).expect("budget released");
        mapper.deallocate_pages(b, 8);
    }
}
