//! On-page header layouts shared by every allocation path, plus the
//! intrusive lists threaded through them.
//!
//! Everything here is addressed through raw pointers: headers live
//! inside pages obtained from the provider, are concurrently mutated
//! under their own locks, and never exist as owned Rust values.
//! Parent links are offsets, not pointers, so a chunk header stays
//! valid wherever the run lands in the address space.
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

use crate::lock::SharedSpinLock;
use crate::lock::SpinLock;

/// Granule of the medium allocator: chunk sizes and offsets are
/// counted in 16-byte units.
pub const ELEM_SHIFT: u32 = 4;
pub const ELEM_BYTES: usize = 1 << ELEM_SHIFT;
pub const HEADER_BYTES: usize = 16;

/// Minimum alignment of every returned pointer.
pub const MIN_ALIGN: usize = 16;

/// Size of a medium page run.  The maximum medium allocation is this
/// minus the run and chunk headers.
pub const BLOCK_SIZE: usize = 512 * 1024;

/// Alignment (and size) of a tiny-pool block.  Masking the low bits
/// of any small allocation yields its block header.
pub const ALIGNED_POOL: usize = 4096;

/// Number of `ALIGNED_POOL` slots in a medium run.
pub const POOL_SLOTS: usize = BLOCK_SIZE / ALIGNED_POOL;
const POOL_BITS_WORDS: usize = POOL_SLOTS / 64;

// Header guard and status values.  The guard doubles as a cheap
// validity probe on deallocation; a mismatch classifies the pointer
// as foreign.
pub const GUARD: u16 = 64171;
pub const STATUS_MEDIUM: u16 = 62761;
pub const STATUS_BIG: u16 = 62897;
pub const STATUS_FREE: u16 = 64063;
pub const STATUS_SMALL_BLOCK: u16 = 97;

/// Trailing half of every 16-byte allocation header.  Sits at
/// `ptr - 8` for medium and big allocations, and leads the page-run
/// header, which is how the classifier probes candidate pointers.
#[repr(C)]
pub struct ChunkHeader {
    pub guard: u16,
    pub status: u16,
    /// Distance to the parent `PageRun`, in 16-byte units for medium
    /// chunks and in raw bytes for big chunks.
    pub offset: u32,
}

const_assert_eq!(std::mem::size_of::<ChunkHeader>(), 8);

/// Free-list linkage of a FREE medium chunk, stored in the first 16
/// bytes of its payload.
#[repr(C)]
pub struct ChunkLinks {
    pub prev: *mut MediumHeader,
    pub next: *mut MediumHeader,
}

/// 16-byte header of a medium chunk.
///
/// `offset_prev` is the distance in 16-byte units to the previous
/// chunk's header (0 for the first chunk of a run), which gives the
/// coalescer its left neighbour without any per-run index.  For every
/// chunk C with successor N inside the same run,
/// `N.offset_prev == N - C` in units.  The field is atomic because a
/// coalescer rewrites its successor's `offset_prev` without holding
/// the successor's lock; all accesses are relaxed.
#[repr(C)]
pub struct MediumHeader {
    pub offset_prev: AtomicU32,
    pub lock: SpinLock,
    _pad: u8,
    /// Chunk payload length in 16-byte units, header excluded.
    pub elems: u16,
    pub th: ChunkHeader,
}

const_assert_eq!(std::mem::size_of::<MediumHeader>(), HEADER_BYTES);

impl MediumHeader {
    /// Stamps a chunk header over raw memory.
    ///
    /// # Safety
    ///
    /// `this` must point to 16 writable bytes inside a page run.
    pub unsafe fn init(
        this: *mut MediumHeader,
        offset_prev: u32,
        elems: u32,
        status: u16,
        offset_units: u32,
    ) {
        std::ptr::write(
            this,
            MediumHeader {
                offset_prev: AtomicU32::new(offset_prev),
                lock: SpinLock::new(),
                _pad: 0,
                elems: elems as u16,
                th: ChunkHeader {
                    guard: GUARD,
                    status,
                    offset: offset_units,
                },
            },
        );
    }

    /// The parent run, recovered by subtracting `th.offset` units.
    pub unsafe fn parent(this: *mut MediumHeader) -> *mut PageRun {
        this.sub((*this).th.offset as usize) as *mut PageRun
    }

    pub unsafe fn offset_prev(this: *mut MediumHeader) -> u32 {
        (*this).offset_prev.load(Ordering::Relaxed)
    }

    pub unsafe fn set_offset_prev(this: *mut MediumHeader, units: u32) {
        (*this).offset_prev.store(units, Ordering::Relaxed);
    }

    /// First byte of the payload.
    pub unsafe fn data(this: *mut MediumHeader) -> *mut u8 {
        this.add(1) as *mut u8
    }

    /// Header of the physically next chunk (may be past the end of
    /// the run; the caller checks).
    pub unsafe fn next_chunk(this: *mut MediumHeader) -> *mut MediumHeader {
        this.add(1 + (*this).elems as usize)
    }

    /// Header of the physically previous chunk, or null for the first.
    pub unsafe fn prev_chunk(this: *mut MediumHeader) -> *mut MediumHeader {
        let units = Self::offset_prev(this);
        if units == 0 {
            std::ptr::null_mut()
        } else {
            this.sub(units as usize)
        }
    }

    /// Header plus payload, in bytes.
    pub unsafe fn block_bytes(this: *mut MediumHeader) -> usize {
        ((*this).elems as usize + 1) << ELEM_SHIFT
    }

    unsafe fn links(this: *mut MediumHeader) -> *mut ChunkLinks {
        this.add(1) as *mut ChunkLinks
    }

    pub unsafe fn free_prev(this: *mut MediumHeader) -> *mut MediumHeader {
        (*Self::links(this)).prev
    }

    pub unsafe fn free_next(this: *mut MediumHeader) -> *mut MediumHeader {
        (*Self::links(this)).next
    }

    pub unsafe fn set_free_prev(this: *mut MediumHeader, prev: *mut MediumHeader) {
        (*Self::links(this)).prev = prev;
    }

    pub unsafe fn set_free_next(this: *mut MediumHeader, next: *mut MediumHeader) {
        (*Self::links(this)).next = next;
    }
}

/// 16-byte header of a big allocation, immediately before the user
/// pointer.  `th.offset` is the byte distance to the run base.
#[repr(C)]
pub struct BigHeader {
    /// Exact requested size in bytes.
    pub size: u64,
    pub th: ChunkHeader,
}

const_assert_eq!(std::mem::size_of::<BigHeader>(), HEADER_BYTES);

/// Header of a page run: a contiguous span of provider pages.
///
/// The leading `ChunkHeader` makes the run base probeable by the
/// pointer classifier; its status is flipped to `STATUS_SMALL_BLOCK`
/// while the run's first `ALIGNED_POOL` slot hosts a tiny-pool block.
/// The run address is always a multiple of the provider's allocation
/// granularity, so every sub-chunk can find it by offset arithmetic.
#[repr(C, align(16))]
pub struct PageRun {
    pub header: ChunkHeader,
    /// Owning `Arena` for medium runs, owning manager for big and
    /// bookkeeping runs.
    pub arena: *mut (),
    pub left_free: *mut PageRun,
    pub right_free: *mut PageRun,
    /// Full size of the run in bytes, header included.
    pub size_bytes: u64,
    pub left: *mut PageRun,
    pub right: *mut PageRun,
    /// Run latch; only the slot bitmap and first-chunk handoff use it
    /// under the chunk-level locking discipline.
    pub lock: SharedSpinLock,
    /// One bit per `ALIGNED_POOL` slot currently hosting a tiny-pool
    /// block.  The classifier checks it to reject aliased headers.
    pub pool_bits: [AtomicU64; POOL_BITS_WORDS],
}

const_assert_eq!(std::mem::size_of::<PageRun>() % HEADER_BYTES, 0);
const_assert!(std::mem::size_of::<PageRun>() <= 96);

/// Payload units of a free chunk that exactly fills a run's first
/// `ALIGNED_POOL` slot: the slot minus the run header, the chunk
/// header and the next chunk's header.
pub const FIRST_SLOT_ELEMS: u32 =
    ((ALIGNED_POOL - std::mem::size_of::<PageRun>() - 2 * HEADER_BYTES) / ELEM_BYTES) as u32;

impl PageRun {
    /// A detached header value, used for the heap's list sentinels.
    /// The links are fixed up in place once the value has an address.
    pub fn sentinel() -> PageRun {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        PageRun {
            header: ChunkHeader {
                guard: GUARD,
                status: 0,
                offset: 0,
            },
            arena: std::ptr::null_mut(),
            left_free: std::ptr::null_mut(),
            right_free: std::ptr::null_mut(),
            size_bytes: 0,
            left: std::ptr::null_mut(),
            right: std::ptr::null_mut(),
            lock: SharedSpinLock::new(),
            pool_bits: [ZERO; POOL_BITS_WORDS],
        }
    }

    /// Initialises a fresh run header over raw pages.
    ///
    /// # Safety
    ///
    /// `this` must point to at least `size_bytes` writable bytes.
    pub unsafe fn init(this: *mut PageRun, size_bytes: u64) {
        std::ptr::write_bytes(this as *mut u8, 0, std::mem::size_of::<PageRun>());
        (*this).header.guard = GUARD;
        (*this).size_bytes = size_bytes;
        (*this).left = this;
        (*this).right = this;
        (*this).left_free = this;
        (*this).right_free = this;
    }

    /// First usable byte, just past the header.
    pub unsafe fn start(this: *mut PageRun) -> *mut u8 {
        this.add(1) as *mut u8
    }

    /// Past-the-end pointer.
    pub unsafe fn end(this: *mut PageRun) -> *mut u8 {
        (this as *mut u8).add((*this).size_bytes as usize)
    }

    unsafe fn pool_idx(this: *mut PageRun, pool: *mut u8) -> usize {
        (pool as usize - this as usize) / ALIGNED_POOL
    }

    pub unsafe fn set_pool(this: *mut PageRun, pool: *mut u8) {
        let idx = Self::pool_idx(this, pool);
        (*this).pool_bits[idx / 64].fetch_or(1u64 << (idx & 63), Ordering::Relaxed);
    }

    pub unsafe fn unset_pool(this: *mut PageRun, pool: *mut u8) {
        let idx = Self::pool_idx(this, pool);
        (*this).pool_bits[idx / 64].fetch_and(!(1u64 << (idx & 63)), Ordering::Relaxed);
    }

    pub unsafe fn test_pool(this: *mut PageRun, pool: *mut u8) -> bool {
        let idx = Self::pool_idx(this, pool);
        idx < POOL_SLOTS && (*this).pool_bits[idx / 64].load(Ordering::Relaxed) & (1u64 << (idx & 63)) != 0
    }

    // All-runs list.

    pub unsafe fn insert(this: *mut PageRun, after: *mut PageRun) {
        (*this).right = after;
        (*this).left = (*after).left;
        (*(*this).left).right = this;
        (*(*this).right).left = this;
    }

    pub unsafe fn remove(this: *mut PageRun) {
        (*(*this).right).left = (*this).left;
        (*(*this).left).right = (*this).right;
        (*this).right = this;
        (*this).left = this;
    }

    // Free-runs list.

    pub unsafe fn insert_free(this: *mut PageRun, after: *mut PageRun) {
        (*this).right_free = after;
        (*this).left_free = (*after).left_free;
        (*(*this).left_free).right_free = this;
        (*(*this).right_free).left_free = this;
    }

    pub unsafe fn remove_free(this: *mut PageRun) {
        (*(*this).right_free).left_free = (*this).left_free;
        (*(*this).left_free).right_free = (*this).right_free;
        (*this).right_free = this;
        (*this).left_free = this;
    }
}

/// 16-byte header of a tiny-pool block.  Field-compatible with
/// `ChunkHeader` on `guard` and `status`, so the classifier's masked
/// probe reads either a block header or a run header (first-slot
/// blocks) with one layout.
#[repr(C)]
pub struct SmallBlockHeader {
    pub guard: u16,
    pub status: u16,
    /// Size-class index plus one; zero never occurs in a real block,
    /// which is how the run-base alias is told apart.
    pub class_idx_plus_one: u8,
    /// Distance to the parent run in `ALIGNED_POOL` units.
    pub offset_slots: u8,
    /// Bump tail in 16-byte units from the block base; 0 once the
    /// block is exhausted.
    pub tail: u8,
    /// Head of the intrusive free-slot list, in 16-byte units from
    /// the block base; 0 means no freed slot.
    pub first_free: u8,
    /// Live object count.
    pub objects: u8,
    _pad: [u8; 7],
}

const_assert_eq!(std::mem::size_of::<SmallBlockHeader>(), HEADER_BYTES);

impl SmallBlockHeader {
    pub fn new(class_idx: u32, offset_slots: u8, tail: u8) -> SmallBlockHeader {
        SmallBlockHeader {
            guard: GUARD,
            status: STATUS_SMALL_BLOCK,
            class_idx_plus_one: class_idx as u8 + 1,
            offset_slots,
            tail,
            first_free: tail,
            objects: 0,
            _pad: [0; 7],
        }
    }

    pub unsafe fn parent(this: *mut SmallBlockHeader) -> *mut PageRun {
        (this as *mut u8).sub((*this).offset_slots as usize * ALIGNED_POOL) as *mut PageRun
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layouts() {
        assert_eq!(std::mem::size_of::<MediumHeader>(), 16);
        assert_eq!(std::mem::size_of::<BigHeader>(), 16);
        assert_eq!(std::mem::size_of::<SmallBlockHeader>(), 16);
        assert_eq!(std::mem::align_of::<PageRun>(), 16);

        // The classifier probes `guard` and `status` through either
        // view; the fields must coincide.
        assert_eq!(memoffset_of_guard_chunk(), memoffset_of_guard_small());
    }

    fn memoffset_of_guard_chunk() -> usize {
        let h = ChunkHeader {
            guard: 0,
            status: 0,
            offset: 0,
        };
        (&h.status as *const _ as usize) - (&h as *const _ as usize)
    }

    fn memoffset_of_guard_small() -> usize {
        let h = SmallBlockHeader {
            guard: 0,
            status: 0,
            class_idx_plus_one: 0,
            offset_slots: 0,
            tail: 0,
            first_free: 0,
            objects: 0,
            _pad: [0; 7],
        };
        (&h.status as *const _ as usize) - (&h as *const _ as usize)
    }

    #[test]
    fn chunk_arithmetic() {
        // Build a miniature run in an aligned buffer and walk it.
        #[repr(align(4096))]
        struct Buf([u8; 8192]);
        let mut buf = Buf([0; 8192]);
        let run = buf.0.as_mut_ptr() as *mut PageRun;

        unsafe {
            PageRun::init(run, 8192);
            assert_eq!(PageRun::start(run), (run as *mut u8).add(std::mem::size_of::<PageRun>()));
            assert_eq!(PageRun::end(run), (run as *mut u8).add(8192));

            let first = PageRun::start(run) as *mut MediumHeader;
            let offset = (first as usize - run as usize) / ELEM_BYTES;
            MediumHeader::init(first, 0, 10, STATUS_FREE, offset as u32);

            assert_eq!(MediumHeader::parent(first), run);
            assert_eq!(MediumHeader::block_bytes(first), 11 * 16);
            assert_eq!(MediumHeader::data(first), (first as *mut u8).add(16));

            let next = MediumHeader::next_chunk(first);
            assert_eq!(next as usize, first as usize + 11 * 16);

            MediumHeader::init(next, 11, 4, STATUS_FREE, offset as u32 + 11);
            assert_eq!(MediumHeader::prev_chunk(next), first);
            assert_eq!(MediumHeader::parent(next), run);
            assert!(MediumHeader::prev_chunk(first).is_null());
        }
    }

    #[test]
    fn run_lists() {
        #[repr(align(16))]
        struct Aligned([u8; 96]);
        let mut end = Aligned([0; 96]);
        let mut a = Aligned([0; 96]);
        let mut b = Aligned([0; 96]);
        let end = end.0.as_mut_ptr() as *mut PageRun;
        let a = a.0.as_mut_ptr() as *mut PageRun;
        let b = b.0.as_mut_ptr() as *mut PageRun;

        unsafe {
            PageRun::init(end, 96);
            PageRun::init(a, 96);
            PageRun::init(b, 96);

            PageRun::insert(a, end);
            PageRun::insert(b, end);
            // end -> a -> b -> end
            assert_eq!((*end).right, a);
            assert_eq!((*a).right, b);
            assert_eq!((*b).right, end);

            PageRun::remove(a);
            assert_eq!((*end).right, b);
            assert_eq!((*b).left, end);
            assert_eq!((*a).right, a);
        }
    }

    #[test]
    fn pool_bits() {
        #[repr(align(4096))]
        struct Buf([u8; 16384]);
        let mut buf = Buf([0; 16384]);
        let run = buf.0.as_mut_ptr() as *mut PageRun;

        unsafe {
            PageRun::init(run, 16384);
            let slot1 = (run as *mut u8).add(ALIGNED_POOL);
            let slot3 = (run as *mut u8).add(3 * ALIGNED_POOL);

            assert!(!PageRun::test_pool(run, slot1));
            PageRun::set_pool(run, slot1);
            PageRun::set_pool(run, slot3);
            assert!(PageRun::test_pool(run, slot1));
            assert!(PageRun::test_pool(run, slot3));
            PageRun::unset_pool(run, slot1);
            assert!(!PageRun::test_pool(run, slot1));
            assert!(PageRun::test_pool(run, slot3));
        }
    }
}
