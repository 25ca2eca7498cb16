//! Tiny pools: per-size-class caches of small objects inside
//! `ALIGNED_POOL`-aligned blocks carved from the radix tree.
//!
//! A block allocates with a hybrid of bump pointer and intrusive free
//! list, both counted in 16-byte units from the block base and small
//! enough to fit one byte each.  Blocks are aligned so a small
//! pointer finds its block header by masking low bits, with no
//! per-object header at all.
//!
//! Concurrency is per size class: one spinlock covers the class's
//! block list and every block header of that class, so different
//! classes allocate in parallel.
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use static_assertions::const_assert_eq;

use crate::headers::MediumHeader;
use crate::headers::PageRun;
use crate::headers::SmallBlockHeader;
use crate::headers::ALIGNED_POOL;
use crate::headers::STATUS_SMALL_BLOCK;
use crate::lock::SpinLock;
use crate::manager::MemoryManager;

/// Largest size served by the tiny pools; class granularity is 16
/// bytes.
pub const MAX_SMALL_THRESHOLD: u32 = 656;
pub const CLASS_COUNT: usize = (MAX_SMALL_THRESHOLD / 16) as usize;

/// Empty blocks are released to the radix tree only while at least
/// this many blocks exist heap-wide; below it they stay linked for
/// reuse.
pub const TINY_POOL_CACHE: usize = 2;

/// Size in bytes to size class index; `size` cannot be 0.
#[inline(always)]
pub fn size_to_class(size: u32) -> usize {
    ((size - 1) >> 4) as usize
}

/// Size class index to object size in bytes.
#[inline(always)]
pub fn class_to_size(idx: usize) -> u32 {
    ((idx + 1) << 4) as u32
}

/// One `ALIGNED_POOL`-aligned block of same-sized objects.  Lives at
/// the start of a radix-tree chunk; the chunk's header, 16 bytes
/// below, supplies the actual capacity, which may be less than a full
/// slot when the block reuses a run's first aligned slot.
#[repr(C)]
pub struct TinyBlockPool {
    pub header: SmallBlockHeader,
    pub left: *mut TinyBlockPool,
    pub right: *mut TinyBlockPool,
    pub parent: *mut TinyMemPool,
    _pad: [u8; 8],
}

const_assert_eq!(std::mem::size_of::<TinyBlockPool>(), 48);

/// Units reserved for the block struct itself; the first object slot.
const RESERVED_UNITS: u8 = (std::mem::size_of::<TinyBlockPool>() / 16) as u8;

impl TinyBlockPool {
    /// Stamps a block over the payload of a radix chunk.
    ///
    /// # Safety
    ///
    /// `this` must be the payload of a chunk owned by the caller,
    /// inside `run`, at an `ALIGNED_POOL` slot boundary (or the first
    /// slot's fixed offset).
    pub unsafe fn init(
        this: *mut TinyBlockPool,
        parent: *mut TinyMemPool,
        class_idx: usize,
        run: *mut PageRun,
    ) {
        let offset_slots = ((this as usize - run as usize) / ALIGNED_POOL) as u8;
        std::ptr::write(
            this,
            TinyBlockPool {
                header: SmallBlockHeader::new(class_idx as u32, offset_slots, RESERVED_UNITS),
                left: std::ptr::null_mut(),
                right: std::ptr::null_mut(),
                parent,
                _pad: [0; 8],
            },
        );
    }

    /// Capacity in 16-byte units, read from the radix chunk header.
    #[inline]
    unsafe fn chunk_units(this: *mut TinyBlockPool) -> u32 {
        (*(this as *mut MediumHeader).sub(1)).elems as u32
    }

    /// Object size in 16-byte units.
    #[inline]
    unsafe fn object_units(this: *mut TinyBlockPool) -> u32 {
        (*this).header.class_idx_plus_one as u32
    }

    /// Pops one slot, bump-extending the free list when it runs onto
    /// the tail.  Returns null when the block is full.  The class
    /// lock must be held.
    pub unsafe fn allocate(this: *mut TinyBlockPool) -> *mut u8 {
        let first_free = (*this).header.first_free;
        if first_free == 0 {
            return std::ptr::null_mut();
        }

        let res = (this as *mut u8).add(first_free as usize * 16);
        if first_free == (*this).header.tail {
            let mut new_tail = (*this).header.tail as u32 + Self::object_units(this);
            if new_tail > Self::chunk_units(this) - Self::object_units(this) {
                new_tail = 0;
            }
            (*this).header.tail = new_tail as u8;
            *res = new_tail as u8;
        }
        (*this).header.first_free = *res;
        (*this).header.objects += 1;
        res
    }

    /// Threads a freed slot back through itself.  Returns true when
    /// the block became empty.  The class lock must be held.
    pub unsafe fn deallocate(this: *mut TinyBlockPool, ptr: *mut u8) -> bool {
        let diff = ((ptr as usize - this as usize) / 16) as u8;
        debug_assert!(diff >= RESERVED_UNITS);
        debug_assert!((diff as u32) < Self::chunk_units(this));

        *ptr = (*this).header.first_free;
        (*this).header.first_free = diff;
        (*this).header.objects -= 1;
        (*this).header.objects == 0
    }

    #[inline]
    pub unsafe fn is_empty(this: *mut TinyBlockPool) -> bool {
        (*this).header.objects == 0
    }

    /// Whether `p` points into the block's slot area.
    pub unsafe fn is_inside(this: *mut TinyBlockPool, p: *const u8) -> bool {
        p > this as *const u8
            && (p as usize) < this as usize + (Self::chunk_units(this) as usize) * 16
    }

    /// The run holding this block, via the radix chunk header just
    /// below it.  `offset_slots` cannot be used here: a block in the
    /// run's first slot sits 96 bytes past the run base, which the
    /// slot-granular offset encodes as zero.
    pub unsafe fn parent_run(this: *mut TinyBlockPool) -> *mut PageRun {
        MediumHeader::parent((this as *mut MediumHeader).sub(1))
    }

    // Class list linkage.  An unlinked block has null links; the
    // allocation path unlinks blocks that report full and the free
    // path links them back.

    pub unsafe fn insert(this: *mut TinyBlockPool, l: *mut TinyBlockPool, r: *mut TinyBlockPool) {
        (*this).left = l;
        (*this).right = r;
        (*l).right = this;
        (*r).left = this;
    }

    pub unsafe fn remove(this: *mut TinyBlockPool) {
        debug_assert!(!(*this).left.is_null());
        (*(*this).left).right = (*this).right;
        (*(*this).right).left = (*this).left;
        (*this).left = std::ptr::null_mut();
        (*this).right = std::ptr::null_mut();
    }
}

/// Per-class state: a sentinel list head posing as a block, plus the
/// class spinlock.  The sentinel's `first_free` is permanently 0, so
/// the allocation fast path can call `TinyBlockPool::allocate` on
/// whatever `right` points to without an emptiness check.
#[repr(C)]
struct ClassEntry {
    it: TinyBlockPool,
    lock: SpinLock,
}

/// The per-arena small-object pool.
#[repr(C)]
pub struct TinyMemPool {
    mgr: *mut MemoryManager,
    classes: [ClassEntry; CLASS_COUNT],
    pool_count: AtomicUsize,
}

impl TinyMemPool {
    /// Builds a pool in place over raw bump-pool memory.
    ///
    /// # Safety
    ///
    /// `this` must point to writable storage of the right size, and
    /// `mgr` must outlive it.
    pub unsafe fn init(this: *mut TinyMemPool, mgr: *mut MemoryManager) {
        std::ptr::write_bytes(this as *mut u8, 0, std::mem::size_of::<TinyMemPool>());
        std::ptr::addr_of_mut!((*this).mgr).write(mgr);
        for idx in 0..CLASS_COUNT {
            let sentinel = Self::sentinel(this, idx);
            (*sentinel).left = sentinel;
            (*sentinel).right = sentinel;
        }
    }

    #[inline]
    unsafe fn sentinel(this: *mut TinyMemPool, idx: usize) -> *mut TinyBlockPool {
        std::ptr::addr_of_mut!((*this).classes[idx].it)
    }

    /// The owning heap, re-derived by the classifier.
    pub unsafe fn manager(this: *mut TinyMemPool) -> *mut MemoryManager {
        (*this).mgr
    }

    /// Carves a new block for class `idx` from the heap.  When the
    /// radix tree is too fragmented for a whole block but can still
    /// serve one object, that object comes back through `direct`.
    unsafe fn add(
        this: *mut TinyMemPool,
        size: u32,
        idx: usize,
        direct: &mut *mut u8,
    ) -> *mut TinyBlockPool {
        let objects = (ALIGNED_POOL - 16 - std::mem::size_of::<TinyBlockPool>()) / size as usize;
        let to_alloc = (std::mem::size_of::<TinyBlockPool>() + objects * size as usize) as u32;
        let mgr = (*this).mgr;
        let request_obj_size = if (*mgr).params().allow_small_from_radix {
            size
        } else {
            0
        };

        let mut is_small = false;
        let raw = (*mgr).allocate_no_tiny_pool(
            to_alloc as usize,
            request_obj_size,
            ALIGNED_POOL as u32,
            &mut is_small,
        );
        if raw.is_null() {
            return std::ptr::null_mut();
        }
        if is_small {
            *direct = raw;
            return std::ptr::null_mut();
        }

        let h = (raw as *mut MediumHeader).sub(1);
        let run = MediumHeader::parent(h);
        // A block in the run's first slot is found through the run
        // header itself; flag it.
        if MediumHeader::offset_prev(h) == 0 {
            (*run).header.status = STATUS_SMALL_BLOCK;
        }

        let block = raw as *mut TinyBlockPool;
        TinyBlockPool::init(block, this, idx, run);
        block
    }

    /// Refills class `idx` from a fresh block.  Enters and leaves
    /// with the class lock held, but drops it around the carve so
    /// frees stay unblocked.
    unsafe fn allocate_from_new_block(this: *mut TinyMemPool, size: u32, idx: usize) -> *mut u8 {
        (*this).classes[idx].lock.unlock();

        let mut direct = std::ptr::null_mut();
        let block = Self::add(this, size, idx, &mut direct);
        if block.is_null() {
            (*this).classes[idx].lock.lock();
            return direct;
        }
        (*this).pool_count.fetch_add(1, Ordering::Relaxed);

        (*this).classes[idx].lock.lock();
        let sentinel = Self::sentinel(this, idx);
        TinyBlockPool::insert(block, sentinel, (*sentinel).right);
        PageRun::set_pool(TinyBlockPool::parent_run(block), block as *mut u8);

        TinyBlockPool::allocate(block)
    }

    /// Rotates through the class list until a block yields a slot;
    /// blocks that report full are unlinked.  The class lock must be
    /// held.
    unsafe fn allocate_from_pool_list(this: *mut TinyMemPool, idx: usize) -> *mut u8 {
        let sentinel = Self::sentinel(this, idx);

        // The head block just failed the fast path; drop it from the
        // rotation.
        let mut block = (*sentinel).right;
        if block != sentinel {
            TinyBlockPool::remove(block);
            block = (*sentinel).right;
        }
        while block != sentinel {
            let res = TinyBlockPool::allocate(block);
            if !res.is_null() {
                return res;
            }
            let next = (*block).right;
            TinyBlockPool::remove(block);
            block = next;
        }
        std::ptr::null_mut()
    }

    /// Allocates one object of `size` bytes (1 ..= threshold).  With
    /// `force`, carves a new block when every listed block is full;
    /// without it, only existing blocks are tried.
    pub unsafe fn allocate(this: *mut TinyMemPool, size: u32, force: bool) -> *mut u8 {
        debug_assert!(size > 0);
        let idx = size_to_class(size);
        debug_assert!(idx < CLASS_COUNT);

        (*this).classes[idx].lock.lock();
        let mut res = TinyBlockPool::allocate((*Self::sentinel(this, idx)).right);
        if res.is_null() {
            res = Self::allocate_from_pool_list(this, idx);
            if res.is_null() && force {
                res = Self::allocate_from_new_block(this, class_to_size(idx), idx);
            }
        }
        (*this).classes[idx].lock.unlock();
        debug_assert!(res.is_null() || res as usize % 16 == 0);
        res
    }

    /// Returns `ptr` to `block`.  Any thread may free into any
    /// block: the owning pool and class lock are re-derived from the
    /// block header.
    pub unsafe fn deallocate(ptr: *mut u8, block: *mut TinyBlockPool) {
        let idx = (*block).header.class_idx_plus_one as usize - 1;
        debug_assert!(idx < CLASS_COUNT);
        let parent = (*block).parent;

        (*parent).classes[idx].lock.lock();
        let was_linked = !(*block).left.is_null();
        let empty = TinyBlockPool::deallocate(block, ptr);
        if empty || !was_linked {
            Self::handle_deallocate(parent, block, idx);
        } else {
            (*parent).classes[idx].lock.unlock();
        }
    }

    /// Slow-path free: retire an empty block past the cache
    /// watermark, or relink a block that was unlinked as full.
    /// Enters with the class lock held, leaves with it released.
    #[cold]
    unsafe fn handle_deallocate(parent: *mut TinyMemPool, block: *mut TinyBlockPool, idx: usize) {
        if TinyBlockPool::is_empty(block)
            && (*parent).pool_count.load(Ordering::Relaxed) >= TINY_POOL_CACHE
        {
            PageRun::unset_pool(TinyBlockPool::parent_run(block), block as *mut u8);
            TinyBlockPool::remove(block);
            (*parent).classes[idx].lock.unlock();
            (*parent).pool_count.fetch_sub(1, Ordering::Relaxed);

            let h = (block as *mut MediumHeader).sub(1);
            if MediumHeader::offset_prev(h) == 0 {
                (*MediumHeader::parent(h)).header.status = 0;
            }

            // Scrub the header: a stale guard here would keep
            // fooling the pointer classifier after the chunk goes
            // back to the radix tree.
            std::ptr::write_bytes(block as *mut u8, 0, std::mem::size_of::<TinyBlockPool>());

            (*(*parent).mgr).deallocate_no_tiny_pool(block as *mut u8);
            return;
        }

        if (*block).left.is_null() {
            let sentinel = Self::sentinel(parent, idx);
            TinyBlockPool::insert(block, sentinel, (*sentinel).right);
        }
        (*parent).classes[idx].lock.unlock();
    }
}
