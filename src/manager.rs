//! The heap engine.  A `MemoryManager` owns the arenas, the page map,
//! the page provider, the bookkeeping pool and the statistics, and
//! implements allocation routing, pointer classification and
//! teardown.
//!
//! Lock hierarchy, outermost first: the global manager-list lock
//! (classification only), the per-heap recursive structural lock
//! (page allocation and clear), the page-map latch, the provider's
//! own lock, radix bucket spinlocks, chunk spinlocks, tiny-pool class
//! spinlocks.  Bucket holders only ever try-lock chunks, which keeps
//! the two orders compatible.
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::io::Write;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Instant;

use crate::arena::Arena;
use crate::bump::BumpPool;
use crate::headers::BigHeader;
use crate::headers::ChunkHeader;
use crate::headers::MediumHeader;
use crate::headers::PageRun;
use crate::headers::ALIGNED_POOL;
use crate::headers::BLOCK_SIZE;
use crate::headers::GUARD;
use crate::headers::HEADER_BYTES;
use crate::headers::MIN_ALIGN;
use crate::headers::STATUS_BIG;
use crate::headers::STATUS_MEDIUM;
use crate::headers::STATUS_SMALL_BLOCK;
use crate::lock::RecursiveSpinLock;
use crate::mapper;
use crate::mapper::PageMapper;
use crate::page_map::PageMap;
use crate::params::Parameters;
use crate::params::STATS_ON_BYTES;
use crate::params::STATS_ON_TIME;
use crate::radix::bytes_to_elems;
use crate::recursion;
use crate::stats::HeapStats;
use crate::stats::Statistics;
use crate::thread_id;
use crate::tiny;
use crate::tiny::TinyBlockPool;
use crate::tiny::TinyMemPool;

/// A depleted arena scans `arena_count / DEPLETE_ARENA_FACTOR`
/// siblings (at least one) before falling back to page allocation.
const DEPLETE_ARENA_FACTOR: u32 = 2;

lazy_static::lazy_static! {
    // Live managers, for the classifier's forensic walk.  Addresses
    // are stored as integers; the managers unregister on drop.
    static ref MANAGERS: Mutex<Vec<usize>> = Default::default();
}

/// The manager installed as the process-wide default, if any.  Only
/// the default manager pays for recursion detection.
static MAIN_MANAGER: AtomicUsize = AtomicUsize::new(0);

pub fn set_main_manager(mgr: *mut MemoryManager) {
    MAIN_MANAGER.store(mgr as usize, Ordering::Relaxed);
}

fn main_manager() -> usize {
    MAIN_MANAGER.load(Ordering::Relaxed)
}

enum StatsSink {
    Stdout,
    Stderr,
    File(std::fs::File),
}

impl StatsSink {
    fn write_all(&mut self, data: &str) {
        let _ = match self {
            StatsSink::Stdout => std::io::stdout().write_all(data.as_bytes()),
            StatsSink::Stderr => std::io::stderr().write_all(data.as_bytes()),
            StatsSink::File(f) => f.write_all(data.as_bytes()),
        };
    }
}

/// Result of classifying a pointer: its chunk status (0 for foreign),
/// and for small objects the owning block and heap.
pub struct Classified {
    pub status: u16,
    pub block: *mut TinyBlockPool,
    pub mgr: *mut MemoryManager,
}

impl Classified {
    fn plain(status: u16) -> Classified {
        Classified {
            status,
            block: std::ptr::null_mut(),
            mgr: std::ptr::null_mut(),
        }
    }
}

pub struct MemoryManager {
    params: Parameters,
    mapper: Box<dyn PageMapper>,
    mem_stats: Statistics,

    /// Structural lock, recursive because clearing or growing the
    /// bookkeeping pool re-enters page allocation.
    lock: RecursiveSpinLock,

    os_psize: usize,
    os_psize_bits: u32,
    os_granularity: usize,
    /// Pages per medium run.
    max_medium_pages: usize,
    /// Largest request served by the radix tree.
    max_medium_size: usize,

    free_page_count: AtomicUsize,
    used_pages: AtomicUsize,
    used_spans: AtomicUsize,
    max_pages: AtomicUsize,
    side_pages: AtomicUsize,

    page_map: PageMap,
    bump: BumpPool,
    arenas: AtomicPtr<Arena>,

    start_time: Instant,
    last_bytes: AtomicU64,
    last_time_ms: AtomicU64,
    header_printed: AtomicBool,
    init_done: AtomicBool,
    exit_done: AtomicBool,
    stats_out: Mutex<Option<StatsSink>>,

    /// Sentinel of the all-runs list.
    end: UnsafeCell<PageRun>,
    /// Sentinel of the cached-free-runs list.
    end_free: UnsafeCell<PageRun>,
}

unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

impl MemoryManager {
    /// Builds a manager behind a stable address; the embedded list
    /// sentinels are self-referential.
    pub fn new_boxed(params: &Parameters) -> Box<MemoryManager> {
        let params = params.validate();
        let mapper = mapper::mapper_from_params(&params);
        let os_psize = mapper.page_size();
        let os_granularity = mapper.allocation_granularity();
        let max_medium_pages = BLOCK_SIZE / os_psize;
        let max_medium_size =
            BLOCK_SIZE - std::mem::size_of::<PageRun>() - HEADER_BYTES;

        let mgr = Box::new(MemoryManager {
            params,
            mapper,
            mem_stats: Statistics::default(),
            lock: RecursiveSpinLock::new(),
            os_psize,
            os_psize_bits: os_psize.trailing_zeros(),
            os_granularity,
            max_medium_pages,
            max_medium_size,
            free_page_count: AtomicUsize::new(0),
            used_pages: AtomicUsize::new(0),
            used_spans: AtomicUsize::new(0),
            max_pages: AtomicUsize::new(0),
            side_pages: AtomicUsize::new(0),
            page_map: PageMap::new(os_granularity),
            bump: BumpPool::new(),
            arenas: AtomicPtr::new(std::ptr::null_mut()),
            start_time: Instant::now(),
            last_bytes: AtomicU64::new(0),
            last_time_ms: AtomicU64::new(0),
            header_printed: AtomicBool::new(false),
            init_done: AtomicBool::new(false),
            exit_done: AtomicBool::new(false),
            stats_out: Mutex::new(None),
            end: UnsafeCell::new(PageRun::sentinel()),
            end_free: UnsafeCell::new(PageRun::sentinel()),
        });

        unsafe {
            PageRun::init(mgr.end_ptr(), std::mem::size_of::<PageRun>() as u64);
            PageRun::init(mgr.end_free_ptr(), std::mem::size_of::<PageRun>() as u64);
        }
        MANAGERS.lock().unwrap().push(mgr.as_ptr() as usize);
        mgr.init_internal();
        mgr
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut MemoryManager {
        self as *const MemoryManager as *mut MemoryManager
    }

    #[inline]
    fn end_ptr(&self) -> *mut PageRun {
        self.end.get()
    }

    #[inline]
    fn end_free_ptr(&self) -> *mut PageRun {
        self.end_free.get()
    }

    #[inline]
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    #[inline]
    pub fn stats(&self) -> &Statistics {
        &self.mem_stats
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.os_psize
    }

    /// Largest allocation served by the radix tree; anything above
    /// takes the big path.
    #[inline]
    pub fn max_medium_size(&self) -> usize {
        self.max_medium_size
    }

    #[inline]
    fn stats_enabled(&self) -> bool {
        self.params.print_stats_trigger != 0
    }

    // ------------------------------------------------------------------
    // Arenas.

    #[cold]
    fn initialize_arenas(&self) -> bool {
        self.lock.lock();
        if self.arenas.load(Ordering::Relaxed).is_null() {
            let bytes = std::mem::size_of::<Arena>() * self.params.max_arenas as usize;
            let raw = self.allocate_and_forget(bytes as u32);
            if raw.is_null() {
                self.lock.unlock();
                return false;
            }
            let arr = raw as *mut Arena;
            for i in 0..self.params.max_arenas as usize {
                unsafe { Arena::init(arr.add(i), self.as_ptr()) };
            }
            // Publish last so other threads never see half-built
            // arenas.
            self.arenas.store(arr, Ordering::Release);
        }
        self.lock.unlock();
        true
    }

    #[inline]
    unsafe fn arena_at(&self, idx: usize) -> *mut Arena {
        self.arenas.load(Ordering::Acquire).add(idx)
    }

    #[inline]
    unsafe fn select_arena(&self) -> *mut Arena {
        let mask = thread_id::thread_mask() & (self.params.max_arenas - 1);
        let id = thread_id::current_thread_id_for_arena() & mask;
        self.arena_at(id as usize)
    }

    // ------------------------------------------------------------------
    // Page runs.

    /// Returns `count` pages as a run, reusing a cached free run for
    /// medium-sized requests.  Null when the provider is exhausted or
    /// the memory limit would be exceeded.
    pub unsafe fn allocate_pages(&self, count: usize) -> *mut PageRun {
        let mut count = count;
        let mut size_bytes = count << self.os_psize_bits;
        if size_bytes & (self.os_granularity - 1) != 0 {
            size_bytes = (size_bytes / self.os_granularity + 1) * self.os_granularity;
            count = size_bytes >> self.os_psize_bits;
        }

        let mut run = std::ptr::null_mut();
        let mut fresh = false;
        {
            self.lock.lock();
            let end_free = self.end_free_ptr();
            if count == self.max_medium_pages && (*end_free).right_free != end_free {
                run = (*end_free).right_free;
                PageRun::remove_free(run);
                self.free_page_count
                    .fetch_sub(self.max_medium_pages, Ordering::Relaxed);
            } else {
                let current =
                    self.used_pages.load(Ordering::Relaxed) + self.free_page_count.load(Ordering::Relaxed);
                let limit = self.params.memory_limit;
                if limit != 0 && limit < ((current + count) * self.os_psize) as u64 {
                    self.lock.unlock();
                    return std::ptr::null_mut();
                }
            }
            self.lock.unlock();
        }

        if run.is_null() {
            let base = match self.mapper.allocate_pages(count) {
                Some(base) => base,
                None => return std::ptr::null_mut(),
            };
            run = base.as_ptr() as *mut PageRun;
            PageRun::init(run, size_bytes as u64);
            fresh = true;
        }

        if count < self.max_medium_pages {
            self.side_pages.fetch_add(count, Ordering::Relaxed);
        }
        (*run).arena = self.as_ptr() as *mut ();
        self.used_pages.fetch_add(count, Ordering::Relaxed);
        self.used_spans.fetch_add(1, Ordering::Relaxed);

        self.lock.lock();
        if fresh {
            PageRun::insert(run, self.end_ptr());
        }
        let live =
            self.used_pages.load(Ordering::Relaxed) + self.free_page_count.load(Ordering::Relaxed);
        if live > self.max_pages.load(Ordering::Relaxed) {
            self.max_pages.store(live, Ordering::Relaxed);
        }
        self.lock.unlock();
        run
    }

    pub unsafe fn allocate_pages_for_bytes(&self, bytes: usize) -> *mut PageRun {
        let mut pages = bytes >> self.os_psize_bits;
        if pages << self.os_psize_bits < bytes {
            pages += 1;
        }
        self.allocate_pages(pages.max(1))
    }

    /// A run sized for the radix tree, registered in the page map.
    pub unsafe fn allocate_medium_block(&self) -> *mut PageRun {
        let run = self.allocate_pages(self.max_medium_pages);
        if !run.is_null() && !self.page_map.insert(run, false, &|sz| self.allocate_and_forget(sz)) {
            self.deallocate_pages(run);
            return std::ptr::null_mut();
        }
        run
    }

    /// Returns a run to the cache or the provider.  Full medium runs
    /// are cached first; the cache is trimmed down to the
    /// `backend_memory` budget on every call.
    pub unsafe fn deallocate_pages(&self, run: *mut PageRun) {
        let count = ((*run).size_bytes >> self.os_psize_bits) as usize;

        let limit = if self.params.backend_memory == 0 {
            0
        } else if self.params.backend_memory <= 100 {
            ((self.used_pages.load(Ordering::Relaxed) as u64 * self.params.backend_memory) / 100)
                << self.os_psize_bits
        } else {
            self.params.backend_memory
        };

        let mut to_free: *mut PageRun = std::ptr::null_mut();
        {
            self.lock.lock();
            let end_free = self.end_free_ptr();

            // Trim the cache down to the budget.
            let mut r = (*end_free).right_free;
            while r != end_free
                && ((self.free_page_count.load(Ordering::Relaxed) << self.os_psize_bits) as u64)
                    > limit
            {
                let next = (*r).right_free;
                PageRun::remove(r);
                PageRun::remove_free(r);
                (*r).right_free = to_free;
                to_free = r;
                r = next;
                self.free_page_count
                    .fetch_sub(self.max_medium_pages, Ordering::Relaxed);
            }

            if (*run).size_bytes as usize == self.max_medium_pages << self.os_psize_bits {
                PageRun::insert_free(run, end_free);
                self.free_page_count
                    .fetch_add(self.max_medium_pages, Ordering::Relaxed);
            } else {
                PageRun::remove(run);
                (*run).right_free = to_free;
                to_free = run;
            }

            self.used_pages.fetch_sub(count, Ordering::Relaxed);
            self.used_spans.fetch_sub(1, Ordering::Relaxed);

            self.page_map.erase(run, &|sz| self.allocate_and_forget(sz));
            self.lock.unlock();
        }

        // Actual release happens outside the structural lock.
        while !to_free.is_null() {
            let next = (*to_free).right_free;
            let pages = ((*to_free).size_bytes >> self.os_psize_bits) as usize;
            if let Some(base) = NonNull::new(to_free as *mut c_void) {
                self.mapper.deallocate_pages(base, pages);
            }
            to_free = next;
        }
    }

    /// Bump-pool allocation that is never individually freed.
    pub fn allocate_and_forget(&self, size: u32) -> *mut u8 {
        self.bump.allocate(size, |min| unsafe {
            let run = self.allocate_bookkeeping_run(min as usize);
            if run.is_null() {
                None
            } else {
                Some((
                    PageRun::start(run),
                    ((*run).size_bytes as usize - std::mem::size_of::<PageRun>()) as u32,
                ))
            }
        })
    }

    unsafe fn allocate_bookkeeping_run(&self, min_bytes: usize) -> *mut PageRun {
        // Size bookkeeping runs for their biggest customers: the
        // arena array, or a couple of pages of leaves and map keys.
        let mut bytes = 2 * ALIGNED_POOL - std::mem::size_of::<PageRun>();
        let arenas_bytes = std::mem::size_of::<Arena>() * self.params.max_arenas as usize;
        bytes = bytes.max(arenas_bytes).max(min_bytes);
        bytes += std::mem::size_of::<PageRun>();

        let run = self.allocate_pages_for_bytes(bytes);
        if !run.is_null() {
            (*run).arena = self.as_ptr() as *mut ();
        }
        run
    }

    // ------------------------------------------------------------------
    // Allocation paths.

    /// Big path: a dedicated run holding one allocation.
    unsafe fn allocate_big(&self, bytes: usize, align: u32) -> *mut u8 {
        let requested = bytes
            + std::mem::size_of::<PageRun>()
            + std::mem::size_of::<BigHeader>()
            + if align > MIN_ALIGN as u32 {
                align as usize
            } else {
                0
            };
        let run = self.allocate_pages_for_bytes(requested);
        if run.is_null() {
            return std::ptr::null_mut();
        }

        if !self.page_map.insert(run, true, &|sz| self.allocate_and_forget(sz)) {
            self.deallocate_pages(run);
            return std::ptr::null_mut();
        }

        let mut res = PageRun::start(run).add(std::mem::size_of::<BigHeader>()) as usize;
        if align > MIN_ALIGN as u32 {
            debug_assert!(align.is_power_of_two());
            let mask = align as usize - 1;
            if res & mask != 0 {
                res = (res & !mask) + align as usize;
            }
        }
        let res = res as *mut u8;

        let h = (res as *mut BigHeader).sub(1);
        std::ptr::write(
            h,
            BigHeader {
                size: bytes as u64,
                th: ChunkHeader {
                    guard: GUARD,
                    status: STATUS_BIG,
                    // Byte offset: big runs can exceed the unit
                    // range, and nothing else shares the encoding.
                    offset: (h as usize - run as usize) as u32,
                },
            },
        );
        res
    }

    unsafe fn allocate_big_path(&self, bytes: usize, align: u32) -> *mut u8 {
        let timer = if self.stats_enabled() {
            Some(Instant::now())
        } else {
            None
        };
        let res = self.allocate_big(bytes, align);
        if !res.is_null() {
            if let Some(t) = timer {
                self.mem_stats.update_alloc_time(t.elapsed().as_nanos() as u64);
                self.mem_stats.allocate_big(Self::usable_size_ptr(res) as u64);
                self.print_stats_if_necessary(false);
            }
        }
        res
    }

    /// Scans a random subset of sibling arenas for memory before the
    /// heap falls back to fresh pages.
    unsafe fn allocate_in_other_arenas(
        &self,
        bytes: usize,
        elems: u32,
        align: u32,
        first: *mut Arena,
    ) -> *mut u8 {
        if !self.params.deplete_arenas || self.params.max_arenas == 1 {
            return std::ptr::null_mut();
        }

        let count = thread_id::max_thread_count()
            .min(self.params.max_arenas)
            .max(1) as usize;
        let inspect = (count / DEPLETE_ARENA_FACTOR as usize).max(1);
        let mut start = (thread_id::random_u32() as usize) % count;
        let is_small = bytes <= self.params.small_alloc_threshold as usize
            && align <= MIN_ALIGN as u32;

        for _ in 0..inspect {
            if start >= count {
                start = 0;
            }
            let a = self.arena_at(start);
            start += 1;
            if a == first {
                continue;
            }
            if is_small {
                let r = TinyMemPool::allocate((*a).tiny_pool(), bytes as u32, false);
                if !r.is_null() {
                    return r;
                }
            } else {
                // Skip arenas that are themselves scanning, or that
                // never held memory.
                if (*a).is_depleted() {
                    continue;
                }
                let r = (*a).tree().allocate_elems(elems, align, false);
                if !r.is_null() {
                    return r;
                }
            }
        }

        if is_small {
            // The siblings' tiny pools were dry; probe their radix
            // trees without blocking on any contended lock.
            for _ in 0..inspect {
                if start >= count {
                    start = 0;
                }
                let a = self.arena_at(start);
                start += 1;
                if a != first {
                    let r = (*a).tree().allocate_small_fast(elems);
                    if !r.is_null() {
                        return r;
                    }
                }
            }
        }
        std::ptr::null_mut()
    }

    /// Carve path for the tiny pools: an aligned block from the radix
    /// tree, or failing that a lone object (`is_small` reports
    /// which).  Tries the owning arena, then depletion, then forced
    /// page allocation.
    pub unsafe fn allocate_no_tiny_pool(
        &self,
        bytes: usize,
        obj_size: u32,
        align: u32,
        is_small: &mut bool,
    ) -> *mut u8 {
        debug_assert!(bytes < self.max_medium_size);

        if self.arenas.load(Ordering::Acquire).is_null() && !self.initialize_arenas() {
            return std::ptr::null_mut();
        }

        let elems = bytes_to_elems(bytes);
        let obj_elems = bytes_to_elems(obj_size as usize);
        let arena = self.select_arena();

        let mut r = (*arena).tree().allocate_elems(elems, align, false);

        // Aligned carving leaves plenty of holes; a lone object may
        // still fit where a whole block does not.
        if r.is_null() && obj_size != 0 && (*arena).tree().has_small_free_chunks() {
            r = (*arena).tree().allocate_elems(obj_elems, 0, false);
            if !r.is_null() {
                *is_small = true;
            }
        }

        if r.is_null() && self.params.deplete_arenas {
            (*arena).begin_depletion();
            r = self.allocate_in_other_arenas(bytes, elems, align, arena);
            if r.is_null() && obj_size != 0 {
                r = self.allocate_in_other_arenas(obj_size as usize, obj_elems, 0, arena);
                if !r.is_null() {
                    *is_small = true;
                }
            }
            (*arena).end_depletion();
        }

        if r.is_null() {
            r = (*arena).tree().allocate_elems(elems, align, true);
        }
        r
    }

    /// Counterpart of `allocate_no_tiny_pool` for retired blocks.
    pub unsafe fn deallocate_no_tiny_pool(&self, ptr: *mut u8) {
        let h = (ptr as *mut MediumHeader).sub(1);
        debug_assert_eq!((*h).th.guard, GUARD);
        debug_assert_eq!((*h).th.status, STATUS_MEDIUM);
        let run = MediumHeader::parent(h);
        let arena = (*run).arena as *mut Arena;
        (*arena).tree().deallocate(ptr);
    }

    /// Allocates `bytes` with the given alignment (0 or a power of
    /// two).  Null on exhaustion; never panics, never blocks on I/O.
    pub fn allocate(&self, bytes: usize, align: u32) -> *mut u8 {
        unsafe {
            if self.arenas.load(Ordering::Acquire).is_null() && !self.initialize_arenas() {
                return std::ptr::null_mut();
            }
            debug_assert!(align == 0 || align.is_power_of_two());

            if align as usize >= ALIGNED_POOL || bytes > self.max_medium_size - align as usize {
                return self.allocate_big_path(bytes, align);
            }

            let bytes = bytes.max(1);

            // Re-entry (logging, TLS teardown) on the default heap is
            // served straight from arena 0's tree, skipping the tiny
            // pools and the statistics that could recurse again.
            let mut _token = None;
            if main_manager() == self.as_ptr() as usize {
                _token = recursion::enter(thread_id::current_thread_id_hash());
                if _token.is_none() {
                    let elems = bytes_to_elems(bytes);
                    return (*self.arena_at(0)).tree().allocate_elems(elems, align, true);
                }
            }

            let arena = self.select_arena();
            let timer = if self.stats_enabled() {
                Some(Instant::now())
            } else {
                None
            };

            let small = bytes <= self.params.small_alloc_threshold as usize
                && align <= MIN_ALIGN as u32;
            let res = if small {
                TinyMemPool::allocate((*arena).tiny_pool(), bytes as u32, true)
            } else {
                let elems = bytes_to_elems(bytes);
                // Do not grab fresh pages yet; the siblings may have
                // free chunks.
                let mut r =
                    (*arena)
                        .tree()
                        .allocate_elems(elems, align, self.params.max_arenas == 1);
                if r.is_null() {
                    if self.params.deplete_arenas {
                        (*arena).begin_depletion();
                        r = self.allocate_in_other_arenas(bytes, elems, align, arena);
                        (*arena).end_depletion();
                    }
                    if r.is_null() {
                        r = (*arena).tree().allocate_elems(elems, align, true);
                    }
                }
                r
            };

            if let (Some(t), false) = (timer, res.is_null()) {
                self.mem_stats.update_alloc_time(t.elapsed().as_nanos() as u64);
                let usable = Self::usable_size_ptr(res) as u64;
                if small {
                    self.mem_stats.allocate_small(usable);
                } else {
                    self.mem_stats.allocate_medium(usable);
                }
                self.print_stats_if_necessary(false);
            }

            debug_assert!(
                res.is_null() || align <= MIN_ALIGN as u32 || res as usize % align as usize == 0
            );
            res
        }
    }

    // ------------------------------------------------------------------
    // Classification.

    /// Whether `pool` is one of this manager's arena pools.
    unsafe fn has_mem_pool(&self, pool: *mut TinyMemPool) -> bool {
        let arenas = self.arenas.load(Ordering::Acquire);
        if arenas.is_null() {
            return false;
        }
        for i in 0..self.params.max_arenas as usize {
            if (*arenas.add(i)).tiny_pool() == pool {
                return true;
            }
        }
        false
    }

    /// The manager owning `run`, found by walking the live-heap list.
    unsafe fn find_from_page_run(run: *mut PageRun) -> *mut MemoryManager {
        let managers = MANAGERS.lock().unwrap();
        for &m in managers.iter() {
            let mgr = m as *mut MemoryManager;
            if (*mgr).page_map.find(run) {
                return mgr;
            }
        }
        std::ptr::null_mut()
    }

    #[cfg(test)]
    unsafe fn find_from_ptr(p: *const u8) -> *mut MemoryManager {
        let managers = MANAGERS.lock().unwrap();
        for &m in managers.iter() {
            let mgr = m as *mut MemoryManager;
            if (*mgr).page_map.own(p) {
                return mgr;
            }
        }
        std::ptr::null_mut()
    }

    /// Forensic disambiguation: a candidate small block whose slot
    /// also carries a plausible medium/big header 16 bytes before the
    /// pointer.  Believe the small block only if its run, its slot
    /// bit and its owning pool all check out; otherwise the chunk
    /// header wins.
    #[cold]
    unsafe fn classify_ambiguous(
        tiny: *mut ChunkHeader,
        masked: *mut TinyBlockPool,
        block: *mut TinyBlockPool,
        p: *mut u8,
    ) -> u16 {
        // Derive the run from the unvalidated masked candidate: its
        // slot-granular offset is pure arithmetic (for a first-slot
        // block the masked address already is the run), whereas the
        // resolved block's chunk header may not exist at all yet.
        let run_from_block =
            crate::headers::SmallBlockHeader::parent(std::ptr::addr_of_mut!((*masked).header));

        if (*tiny).status == STATUS_MEDIUM {
            // Most common alias: a live medium chunk right at the end
            // of a retired (or foreign) block slot.
            let medium = (p as *mut MediumHeader).sub(1);
            let run_from_medium = MediumHeader::parent(medium);
            if run_from_block == run_from_medium {
                // The run is real, so the block address can be probed
                // directly.
                let inside = (block as usize) > run_from_block as usize
                    && (block as usize)
                        < run_from_block as usize + (*run_from_block).size_bytes as usize;
                if inside
                    && (!TinyBlockPool::is_inside(block, p) || (*block).header.guard != GUARD)
                {
                    return (*tiny).status;
                }
            }
        }

        let mgr = Self::find_from_page_run(run_from_block);
        if mgr.is_null() {
            return (*tiny).status;
        }
        if !TinyBlockPool::is_inside(block, p) || !(*mgr).has_mem_pool((*block).parent) {
            return (*tiny).status;
        }
        if !(*mgr).page_map.find(run_from_block) {
            return (*tiny).status;
        }
        if !PageRun::test_pool(run_from_block, block as *mut u8) {
            return (*tiny).status;
        }
        STATUS_SMALL_BLOCK
    }

    /// Classifies `p` without any per-pointer back-reference: masked
    /// small-block probe first, then the chunk header at `p - 16`.
    /// Status 0 means foreign (including corrupted headers).
    pub unsafe fn classify(p: *mut u8) -> Classified {
        let tiny = (p as *mut ChunkHeader).sub(1);
        let masked = (p as usize & !(ALIGNED_POOL - 1)) as *mut TinyBlockPool;

        if masked as *mut u8 != p
            && (*masked).header.guard == GUARD
            && (*masked).header.status == STATUS_SMALL_BLOCK
        {
            // A run whose first slot hosts a block answers the masked
            // probe with the run header itself; the real block sits
            // just past the run and chunk headers.
            let block = if (*masked).header.class_idx_plus_one == 0 {
                (masked as *mut u8).add(std::mem::size_of::<PageRun>() + HEADER_BYTES)
                    as *mut TinyBlockPool
            } else {
                masked
            };

            let chunk_alias = (*tiny).guard == GUARD
                && ((*tiny).status == STATUS_MEDIUM || (*tiny).status == STATUS_BIG);
            let status = if chunk_alias {
                Self::classify_ambiguous(tiny, masked, block, p)
            } else {
                STATUS_SMALL_BLOCK
            };

            if status == STATUS_SMALL_BLOCK {
                let pool = (*block).parent;
                if pool.is_null() {
                    return Classified::plain(if chunk_alias { (*tiny).status } else { 0 });
                }
                let mgr = TinyMemPool::manager(pool);
                if mgr.is_null() {
                    return Classified::plain(if chunk_alias { (*tiny).status } else { 0 });
                }
                return Classified {
                    status: STATUS_SMALL_BLOCK,
                    block,
                    mgr,
                };
            }
            return Classified::plain(status);
        }

        if (*tiny).guard == GUARD
            && ((*tiny).status == STATUS_MEDIUM || (*tiny).status == STATUS_BIG)
        {
            Classified::plain((*tiny).status)
        } else {
            Classified::plain(0)
        }
    }

    // ------------------------------------------------------------------
    // Deallocation and size queries.

    /// Frees `p`, whichever live heap it came from.  Null and foreign
    /// pointers are no-ops.
    pub unsafe fn deallocate_ptr(p: *mut u8) {
        if p.is_null() {
            return;
        }

        let c = Self::classify(p);
        match c.status {
            STATUS_SMALL_BLOCK => {
                let mgr = &*c.mgr;
                let timer = if mgr.stats_enabled() {
                    Some((Instant::now(), Self::usable_size_ptr(p) as u64))
                } else {
                    None
                };
                TinyMemPool::deallocate(p, c.block);
                if let Some((t, bytes)) = timer {
                    mgr.mem_stats
                        .update_dealloc_time(t.elapsed().as_nanos() as u64);
                    mgr.mem_stats.deallocate_small(bytes);
                }
            }
            STATUS_MEDIUM => {
                let h = (p as *mut MediumHeader).sub(1);
                let run = MediumHeader::parent(h);
                let arena = (*run).arena as *mut Arena;
                let mgr = &*(*arena).manager();
                let timer = if mgr.stats_enabled() {
                    Some(Instant::now())
                } else {
                    None
                };
                let bytes = (*arena).tree().deallocate(p);
                if let Some(t) = timer {
                    mgr.mem_stats
                        .update_dealloc_time(t.elapsed().as_nanos() as u64);
                    mgr.mem_stats.deallocate_medium(bytes as u64);
                }
            }
            STATUS_BIG => {
                let h = (p as *mut BigHeader).sub(1);
                let run = (h as *mut u8).sub((*h).th.offset as usize) as *mut PageRun;
                let mgr = &*((*run).arena as *mut MemoryManager);
                let timer = if mgr.stats_enabled() {
                    Some((Instant::now(), Self::usable_size_ptr(p) as u64))
                } else {
                    None
                };
                mgr.deallocate_pages(run);
                if let Some((t, bytes)) = timer {
                    mgr.mem_stats
                        .update_dealloc_time(t.elapsed().as_nanos() as u64);
                    mgr.mem_stats.deallocate_big(bytes);
                }
            }
            _ => {
                // Foreign pointer: refuse to touch it.
            }
        }
    }

    /// Usable bytes behind `p`, or 0 for foreign pointers.
    pub unsafe fn usable_size_ptr(p: *mut u8) -> usize {
        if p.is_null() {
            return 0;
        }
        let c = Self::classify(p);
        match c.status {
            STATUS_SMALL_BLOCK => {
                tiny::class_to_size((*c.block).header.class_idx_plus_one as usize - 1) as usize
            }
            STATUS_MEDIUM => {
                let h = (p as *mut MediumHeader).sub(1);
                ((*h).elems as usize) << 4
            }
            STATUS_BIG => {
                let h = (p as *mut BigHeader).sub(1);
                let run = (h as *mut u8).sub((*h).th.offset as usize) as *mut PageRun;
                (*run).size_bytes as usize - (p as usize - run as usize)
            }
            _ => 0,
        }
    }

    // ------------------------------------------------------------------
    // Teardown.

    /// Releases every page run and resets the heap to its
    /// just-constructed state; parameters survive.
    pub fn clear(&self) {
        self.lock.lock();
        unsafe {
            if !self.arenas.load(Ordering::Relaxed).is_null() {
                self.used_pages.store(0, Ordering::Relaxed);
                self.used_spans.store(0, Ordering::Relaxed);
                self.free_page_count.store(0, Ordering::Relaxed);
                self.side_pages.store(0, Ordering::Relaxed);

                let end = self.end_ptr();
                let mut next = (*end).right;
                while next != end {
                    let run = next;
                    next = (*run).right;
                    let pages = ((*run).size_bytes >> self.os_psize_bits) as usize;
                    if let Some(base) = NonNull::new(run as *mut c_void) {
                        self.mapper.deallocate_pages(base, pages);
                    }
                }

                self.mapper.reset();
                self.page_map.reset();
                self.bump.reset();

                PageRun::init(self.end_ptr(), std::mem::size_of::<PageRun>() as u64);
                PageRun::init(self.end_free_ptr(), std::mem::size_of::<PageRun>() as u64);
                // Arenas lived in bump memory that just went away;
                // they are rebuilt on the next allocation.
                self.arenas.store(std::ptr::null_mut(), Ordering::Release);
            }
        }
        self.lock.unlock();
    }

    // ------------------------------------------------------------------
    // Statistics.

    pub fn dump_statistics(&self) -> HeapStats {
        let mut out = HeapStats::default();
        self.mem_stats.snapshot_into(&mut out);
        out.max_used_memory = (self.max_pages.load(Ordering::Relaxed) << self.os_psize_bits) as u64;
        out.current_used_memory = ((self.used_pages.load(Ordering::Relaxed)
            + self.free_page_count.load(Ordering::Relaxed))
            << self.os_psize_bits) as u64;
        out
    }

    pub fn reset_statistics(&self) {
        self.mem_stats.reset();
        self.last_bytes.store(0, Ordering::Relaxed);
    }

    fn init_internal(&self) {
        if self.init_done.swap(true, Ordering::Relaxed) {
            return;
        }
        let target = self.params.print_stats.as_str();
        if target.is_empty() {
            return;
        }
        let sink = match target {
            "stdout" => Some(StatsSink::Stdout),
            "stderr" => Some(StatsSink::Stderr),
            path => match std::fs::File::create(path) {
                Ok(f) => Some(StatsSink::File(f)),
                Err(e) => {
                    if self.params.log_level >= crate::params::LOG_WARNING {
                        log::warn!("unable to open stats file {}: {}", path, e);
                    }
                    None
                }
            },
        };
        *self.stats_out.lock().unwrap() = sink;
    }

    fn timestamp(&self) -> String {
        let pattern = match std::ffi::CString::new(self.params.log_date_format.as_str()) {
            Ok(p) => p,
            Err(_) => return String::new(),
        };
        unsafe {
            let mut now: libc::time_t = 0;
            libc::time(&mut now);
            let mut tm: libc::tm = std::mem::zeroed();
            libc::localtime_r(&now, &mut tm);
            let mut buf = [0u8; 128];
            let n = libc::strftime(
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                pattern.as_ptr(),
                &tm,
            );
            String::from_utf8_lossy(&buf[..n]).into_owned()
        }
    }

    /// Writes the human-readable statistics report.
    pub fn print_stats<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        fn avg(bytes: u64, count: u64) -> u64 {
            if count == 0 {
                0
            } else {
                bytes / count
            }
        }

        let s = self.dump_statistics();
        writeln!(
            out,
            "\nPages: max pages {}, current pages {}, current spans {}",
            self.max_pages.load(Ordering::Relaxed),
            self.used_pages.load(Ordering::Relaxed),
            self.used_spans.load(Ordering::Relaxed),
        )?;
        writeln!(
            out,
            "Global: max requested memory {} bytes, max used memory: {}, current used memory: {}",
            s.max_alloc_bytes, s.max_used_memory, s.current_used_memory,
        )?;

        let classes = [
            ("Total", {
                let mut t = crate::stats::TypeStatsSnapshot::default();
                for c in [&s.small, &s.medium, &s.big].iter() {
                    t.alloc_count += c.alloc_count;
                    t.alloc_bytes += c.alloc_bytes;
                    t.freed_count += c.freed_count;
                    t.freed_bytes += c.freed_bytes;
                    t.current_alloc_count += c.current_alloc_count;
                    t.current_alloc_bytes += c.current_alloc_bytes;
                }
                t
            }),
            ("Small", s.small),
            ("Medium", s.medium),
            ("Big", s.big),
        ];
        for (name, c) in classes.iter() {
            writeln!(
                out,
                "{} allocations:\t alloc {} ({} bytes, avg. {}/alloc),\t free {} ({} bytes),\t current {} ({} bytes, avg. {}/alloc)",
                name,
                c.alloc_count,
                c.alloc_bytes,
                avg(c.alloc_bytes, c.alloc_count),
                c.freed_count,
                c.freed_bytes,
                c.current_alloc_count,
                c.current_alloc_bytes,
                avg(c.current_alloc_bytes, c.current_alloc_count),
            )?;
        }
        if s.total_alloc_time_ns != 0 || s.total_dealloc_time_ns != 0 {
            writeln!(
                out,
                "Timer allocation (ns):\t total {}, max {}",
                s.total_alloc_time_ns,
                self.mem_stats.max_alloc_time_ns.load(Ordering::Relaxed),
            )?;
            writeln!(
                out,
                "Timer deallocation (ns):\t total {}, max {}",
                s.total_dealloc_time_ns,
                self.mem_stats.max_dealloc_time_ns.load(Ordering::Relaxed),
            )?;
        }
        Ok(())
    }

    /// Writes the CSV column header.
    pub fn print_stats_header<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(
            out,
            "DATE\tPEAK_PAGES\tCURRENT_PAGES\tCURRENT_SPANS\tPEAK_REQ_MEM\tPEAK_MEM\tCURRENT_MEM\t\
             ALLOCS\tALLOCS_B\tFREE\tFREE_B\tCURRENT\tCURRENT_B\t\
             S_ALLOCS\tS_ALLOCS_B\tS_FREE\tS_FREE_B\tS_CURRENT\tS_CURRENT_B\t\
             M_ALLOCS\tM_ALLOCS_B\tM_FREE\tM_FREE_B\tM_CURRENT\tM_CURRENT_B\t\
             B_ALLOCS\tB_ALLOCS_B\tB_FREE\tB_FREE_B\tB_CURRENT\tB_CURRENT_B"
        )
    }

    /// Writes one CSV row.
    pub fn print_stats_row<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let s = self.dump_statistics();
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp(),
            self.max_pages.load(Ordering::Relaxed),
            self.used_pages.load(Ordering::Relaxed),
            self.used_spans.load(Ordering::Relaxed),
            s.max_alloc_bytes,
            s.max_used_memory,
            s.current_used_memory,
            s.total_alloc_count(),
            s.small.alloc_bytes + s.medium.alloc_bytes + s.big.alloc_bytes,
            s.total_freed_count(),
            s.small.freed_bytes + s.medium.freed_bytes + s.big.freed_bytes,
            s.current_alloc_count(),
            s.total_alloc_bytes,
            s.small.alloc_count,
            s.small.alloc_bytes,
            s.small.freed_count,
            s.small.freed_bytes,
            s.small.current_alloc_count,
            s.small.current_alloc_bytes,
            s.medium.alloc_count,
            s.medium.alloc_bytes,
            s.medium.freed_count,
            s.medium.freed_bytes,
            s.medium.current_alloc_count,
            s.medium.current_alloc_bytes,
            s.big.alloc_count,
            s.big.alloc_bytes,
            s.big.freed_count,
            s.big.freed_bytes,
            s.big.current_alloc_count,
            s.big.current_alloc_bytes,
        )
    }

    /// Dumps statistics to the configured sink when a trigger fires.
    fn print_stats_if_necessary(&self, force: bool) {
        let trigger = self.params.print_stats_trigger;
        let mut print = force;

        if !print && trigger & STATS_ON_BYTES != 0 {
            let peak = self.mem_stats.max_alloc_bytes.load(Ordering::Relaxed);
            if peak.saturating_sub(self.last_bytes.load(Ordering::Relaxed))
                >= self.params.print_stats_bytes as u64
            {
                self.last_bytes.store(peak, Ordering::Relaxed);
                print = true;
            }
        }
        if !print && trigger & STATS_ON_TIME != 0 {
            let now_ms = self.start_time.elapsed().as_millis() as u64;
            if now_ms.saturating_sub(self.last_time_ms.load(Ordering::Relaxed))
                >= self.params.print_stats_ms as u64
            {
                self.last_time_ms.store(now_ms, Ordering::Relaxed);
                print = true;
            }
        }
        if !print {
            return;
        }

        let mut guard = self.stats_out.lock().unwrap();
        if let Some(sink) = guard.as_mut() {
            let mut text = Vec::new();
            if self.params.print_stats_csv {
                if !self.header_printed.swap(true, Ordering::Relaxed) {
                    let _ = self.print_stats_header(&mut text);
                }
                let _ = self.print_stats_row(&mut text);
            } else {
                let _ = self.print_stats(&mut text);
            }
            sink.write_all(&String::from_utf8_lossy(&text));
        }
    }

    fn perform_exit_operations(&self) {
        if self.exit_done.swap(true, Ordering::Relaxed) {
            return;
        }
        if self.params.print_stats_trigger != 0 {
            self.print_stats_if_necessary(true);
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.perform_exit_operations();
        if self.mapper.owns_pages() {
            self.clear();
        }
        let me = self.as_ptr() as usize;
        MANAGERS.lock().unwrap().retain(|&m| m != me);
        let _ = MAIN_MANAGER.compare_exchange(me, 0, Ordering::Relaxed, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_manager() -> Box<MemoryManager> {
        let mut params = Parameters::default();
        params.max_arenas = 2;
        // Counters are collected only while a stats trigger is
        // configured.
        params.print_stats_trigger = crate::params::STATS_ON_EXIT;
        MemoryManager::new_boxed(&params)
    }

    #[test]
    fn small_medium_big_round_trip() {
        let mgr = test_manager();

        unsafe {
            let small = mgr.allocate(48, 0);
            let medium = mgr.allocate(4096, 0);
            let big = mgr.allocate(2 * 1024 * 1024, 0);
            assert!(!small.is_null() && !medium.is_null() && !big.is_null());

            assert_eq!(MemoryManager::classify(small).status, STATUS_SMALL_BLOCK);
            assert_eq!(MemoryManager::classify(medium).status, STATUS_MEDIUM);
            assert_eq!(MemoryManager::classify(big).status, STATUS_BIG);

            assert!(MemoryManager::usable_size_ptr(small) >= 48);
            assert!(MemoryManager::usable_size_ptr(medium) >= 4096);
            assert!(MemoryManager::usable_size_ptr(big) >= 2 * 1024 * 1024);

            // Writable end to end.
            std::ptr::write_bytes(small, 0xa5, 48);
            std::ptr::write_bytes(medium, 0xa5, 4096);
            std::ptr::write_bytes(big, 0xa5, 2 * 1024 * 1024);

            MemoryManager::deallocate_ptr(small);
            MemoryManager::deallocate_ptr(medium);
            MemoryManager::deallocate_ptr(big);

            let stats = mgr.dump_statistics();
            assert_eq!(stats.current_alloc_count(), 0);
            assert_eq!(stats.total_alloc_count(), 3);
        }
        mgr.clear();
    }

    #[test]
    fn zero_byte_allocations_are_distinct() {
        let mgr = test_manager();

        unsafe {
            let a = mgr.allocate(0, 0);
            let b = mgr.allocate(0, 0);
            assert!(!a.is_null() && !b.is_null());
            assert_ne!(a, b);
            assert!(MemoryManager::usable_size_ptr(a) >= 1);
            MemoryManager::deallocate_ptr(a);
            MemoryManager::deallocate_ptr(b);
        }
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let _mgr = test_manager();

        let mut local = [0u8; 64];
        unsafe {
            let p = local.as_mut_ptr().add(32);
            assert_eq!(MemoryManager::classify(p).status, 0);
            assert_eq!(MemoryManager::usable_size_ptr(p), 0);
            // Must be a no-op, not a crash.
            MemoryManager::deallocate_ptr(p);
        }

        let boxed = Box::into_raw(Box::new([0u8; 256]));
        unsafe {
            assert_eq!(MemoryManager::classify(boxed as *mut u8).status, 0);
            drop(Box::from_raw(boxed));
        }
    }

    #[test]
    fn null_free_is_a_no_op() {
        unsafe { MemoryManager::deallocate_ptr(std::ptr::null_mut()) };
    }

    #[test]
    fn alignment_is_honoured() {
        let mgr = test_manager();

        unsafe {
            for &align in &[32u32, 64, 256, 1024, 4096, 65536] {
                let p = mgr.allocate(96, align);
                assert!(!p.is_null());
                assert_eq!(p as usize % align as usize, 0, "align {}", align);
                assert!(MemoryManager::usable_size_ptr(p) >= 96);
                MemoryManager::deallocate_ptr(p);
            }
        }
    }

    #[test]
    fn small_threshold_routes_paths() {
        let mgr = test_manager();
        let threshold = mgr.params().small_alloc_threshold as usize;

        unsafe {
            let small = mgr.allocate(threshold, 0);
            let medium = mgr.allocate(threshold + 1, 0);
            assert_eq!(MemoryManager::classify(small).status, STATUS_SMALL_BLOCK);
            assert_eq!(MemoryManager::classify(medium).status, STATUS_MEDIUM);
            MemoryManager::deallocate_ptr(small);
            MemoryManager::deallocate_ptr(medium);
        }
    }

    #[test]
    fn medium_boundary_routes_to_big() {
        let mgr = test_manager();

        unsafe {
            let edge = mgr.allocate(mgr.max_medium_size(), 0);
            assert_eq!(MemoryManager::classify(edge).status, STATUS_MEDIUM);
            let big = mgr.allocate(mgr.max_medium_size() + 1, 0);
            assert_eq!(MemoryManager::classify(big).status, STATUS_BIG);
            MemoryManager::deallocate_ptr(edge);
            MemoryManager::deallocate_ptr(big);
        }
    }

    #[test]
    fn memory_limit_returns_null() {
        let mut params = Parameters::default();
        params.max_arenas = 1;
        params.memory_limit = 8 * 1024 * 1024;
        let mgr = MemoryManager::new_boxed(&params);

        unsafe {
            let mut live = Vec::new();
            loop {
                let p = mgr.allocate(1024 * 1024, 0);
                if p.is_null() {
                    break;
                }
                live.push(p);
                assert!(live.len() < 64, "limit never engaged");
            }
            // About eight megabyte allocations fit under the limit.
            assert!(live.len() >= 4 && live.len() <= 8, "saw {}", live.len());
            for p in live {
                MemoryManager::deallocate_ptr(p);
            }
        }
    }

    #[test]
    fn classification_survives_cross_manager_lookup() {
        let a = test_manager();
        let b = test_manager();

        unsafe {
            let pa = a.allocate(100, 0);
            let pb = b.allocate(100, 0);

            let ca = MemoryManager::classify(pa);
            let cb = MemoryManager::classify(pb);
            assert_eq!(ca.status, STATUS_SMALL_BLOCK);
            assert_eq!(cb.status, STATUS_SMALL_BLOCK);
            assert_eq!(ca.mgr, a.as_ptr());
            assert_eq!(cb.mgr, b.as_ptr());

            assert_eq!(MemoryManager::find_from_ptr(pa), a.as_ptr());
            assert_eq!(MemoryManager::find_from_ptr(pb), b.as_ptr());

            // Frees find their owner regardless of the calling heap.
            MemoryManager::deallocate_ptr(pb);
            MemoryManager::deallocate_ptr(pa);
        }
    }

    #[test]
    fn freed_neighbours_coalesce_immediately() {
        let mut params = Parameters::default();
        params.max_arenas = 1;
        let mgr = MemoryManager::new_boxed(&params);

        unsafe {
            // Four adjacent medium chunks in one run; `d` pins the
            // run's tail so the run is never fully released.
            let a = mgr.allocate(10_000, 0);
            let b = mgr.allocate(10_000, 0);
            let c = mgr.allocate(10_000, 0);
            let d = mgr.allocate(10_000, 0);
            assert!(!a.is_null() && !b.is_null() && !c.is_null() && !d.is_null());

            MemoryManager::deallocate_ptr(a);
            MemoryManager::deallocate_ptr(c);
            // Freeing the middle chunk merges a, b and c into one
            // span.
            MemoryManager::deallocate_ptr(b);

            let pages_before = mgr.used_pages.load(Ordering::Relaxed);
            let merged = mgr.allocate(29_000, 0);
            assert!(!merged.is_null());
            assert_eq!(
                mgr.used_pages.load(Ordering::Relaxed),
                pages_before,
                "the merged span serves the large request without new pages"
            );

            MemoryManager::deallocate_ptr(merged);
            MemoryManager::deallocate_ptr(d);
        }
    }

    #[test]
    fn clear_releases_everything() {
        let mgr = test_manager();

        unsafe {
            let mut ptrs = Vec::new();
            for i in 0..1000 {
                ptrs.push(mgr.allocate(16 + (i % 50) * 16, 0));
            }
            let p = mgr.allocate(300 * 1024, 0);
            assert!(!p.is_null());
        }

        mgr.clear();
        assert_eq!(mgr.used_pages.load(Ordering::Relaxed), 0);
        assert_eq!(mgr.dump_statistics().current_used_memory, 0);

        // The heap is usable again after clear.
        unsafe {
            let p = mgr.allocate(64, 0);
            assert!(!p.is_null());
            MemoryManager::deallocate_ptr(p);
        }
    }
}
