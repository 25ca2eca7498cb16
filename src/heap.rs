//! The public heap handle.  A `Heap` owns one `MemoryManager`; all
//! methods are thread safe, and pointers may be freed through any
//! heap (the classifier re-derives the owner).
use std::io::Write;

use crate::manager;
use crate::manager::MemoryManager;
use crate::params::Parameters;
use crate::stats::HeapStats;
use crate::tiny;

pub struct Heap {
    mgr: Box<MemoryManager>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// A heap configured from the `MICRO_` environment variables.
    pub fn new() -> Heap {
        Self::with_parameters(&Parameters::from_env())
    }

    /// A heap with explicit parameters (validated, with warnings for
    /// clamped values).
    pub fn with_parameters(params: &Parameters) -> Heap {
        Heap {
            mgr: MemoryManager::new_boxed(params),
        }
    }

    pub fn parameters(&self) -> &Parameters {
        self.mgr.params()
    }

    /// Largest request served in place by the medium allocator.
    pub fn max_medium_size(&self) -> usize {
        self.mgr.max_medium_size()
    }

    /// Allocates `bytes` (zero is promoted to one byte) with the
    /// default 16-byte alignment.  Null on exhaustion.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        self.mgr.allocate(bytes, 0)
    }

    /// Allocates with an explicit power-of-two alignment.
    pub fn allocate_aligned(&self, bytes: usize, align: usize) -> *mut u8 {
        if align != 0 && (!align.is_power_of_two() || align > 1 << 30) {
            return std::ptr::null_mut();
        }
        self.mgr.allocate(bytes, align as u32)
    }

    /// `count * size` zero-filled bytes; null on overflow or
    /// exhaustion.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let bytes = match count.checked_mul(size) {
            Some(bytes) => bytes,
            None => return std::ptr::null_mut(),
        };
        let p = self.mgr.allocate(bytes, 0);
        if !p.is_null() {
            unsafe { std::ptr::write_bytes(p, 0, bytes.max(1)) };
        }
        p
    }

    /// POSIX realloc semantics, minus the in-place growth: a pointer
    /// whose current chunk already fits `new_size` is returned
    /// unchanged with no copy.  Foreign pointers yield null and stay
    /// untouched, as does the original allocation when the new one
    /// cannot be made.
    pub fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.deallocate(ptr);
            return std::ptr::null_mut();
        }

        let usable = unsafe { MemoryManager::usable_size_ptr(ptr) };
        if usable == 0 {
            return std::ptr::null_mut();
        }
        if new_size <= usable {
            return ptr;
        }

        let fresh = self.allocate(new_size);
        if fresh.is_null() {
            return std::ptr::null_mut();
        }
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, fresh, usable);
            MemoryManager::deallocate_ptr(ptr);
        }
        fresh
    }

    /// Frees `ptr`.  Null is a no-op; so is a pointer this allocator
    /// never issued.  The pointer may come from any live heap, not
    /// just this one.
    pub fn deallocate(&self, ptr: *mut u8) {
        unsafe { MemoryManager::deallocate_ptr(ptr) };
    }

    /// Usable bytes behind `ptr`; 0 for null or foreign pointers.
    pub fn usable_size(&self, ptr: *mut u8) -> usize {
        unsafe { MemoryManager::usable_size_ptr(ptr) }
    }

    /// The size actually reserved for a request of `bytes`.
    pub fn good_size(&self, bytes: usize) -> usize {
        let bytes = bytes.max(1);
        if bytes <= self.parameters().small_alloc_threshold as usize {
            tiny::class_to_size(tiny::size_to_class(bytes as u32)) as usize
        } else if bytes <= self.mgr.max_medium_size() {
            (bytes + 15) & !15
        } else {
            let page = self.mgr.page_size();
            (bytes + page - 1) & !(page - 1)
        }
    }

    /// Releases every page run back to the provider and resets the
    /// heap; parameters are preserved.
    pub fn clear(&self) {
        self.mgr.clear();
    }

    /// Atomic snapshot of the statistics counters.  Per-class
    /// counters are collected while a statistics trigger is
    /// configured.
    pub fn dump_stats(&self) -> HeapStats {
        self.mgr.dump_statistics()
    }

    pub fn reset_statistics(&self) {
        self.mgr.reset_statistics();
    }

    /// Writes the human-readable statistics report to `out`.
    pub fn print_stats<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        self.mgr.print_stats(out)
    }
}

/// Returns the process-wide default heap, created on first use from
/// the `MICRO_` environment.  Its backing manager is also the one
/// covered by recursion detection.
pub fn process_heap() -> &'static Heap {
    lazy_static::lazy_static! {
        static ref PROCESS_HEAP: Heap = {
            let heap = Heap::new();
            manager::set_main_manager(heap.mgr.as_ptr());
            heap
        };
    }
    &PROCESS_HEAP
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::STATS_ON_EXIT;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn test_heap() -> Heap {
        let mut params = Parameters::default();
        params.max_arenas = 4;
        params.print_stats_trigger = STATS_ON_EXIT;
        Heap::with_parameters(&params)
    }

    #[test]
    fn smoke_test() {
        let heap = test_heap();

        let p0 = heap.allocate(24);
        let p1 = heap.allocate(24);
        assert!(!p0.is_null() && !p1.is_null());
        assert_ne!(p0, p1);

        heap.deallocate(p0);
        let p2 = heap.allocate(24);
        heap.deallocate(p2);
        heap.deallocate(p1);
    }

    #[test]
    fn usable_size_covers_request() {
        let heap = test_heap();

        for size in [1usize, 15, 16, 17, 100, 656, 657, 4096, 100_000, 600_000].iter() {
            let p = heap.allocate(*size);
            assert!(!p.is_null());
            assert!(heap.usable_size(p) >= *size, "size {}", size);
            assert!(heap.good_size(*size) >= *size);
            unsafe { std::ptr::write_bytes(p, 0x5a, *size) };
            heap.deallocate(p);
        }
    }

    #[test]
    fn lifo_batch_reuse_stays_bounded() {
        // Allocate a batch, free in reverse, allocate a batch of a
        // different class: the peak must not keep growing.
        let heap = test_heap();

        let mut ptrs = Vec::new();
        for _ in 0..1000 {
            ptrs.push(heap.allocate(48));
        }
        let peak_after_first = heap.dump_stats().max_used_memory;
        for p in ptrs.drain(..).rev() {
            heap.deallocate(p);
        }

        for _ in 0..1000 {
            ptrs.push(heap.allocate(64));
        }
        for p in ptrs.drain(..) {
            heap.deallocate(p);
        }

        let stats = heap.dump_stats();
        assert_eq!(stats.current_alloc_count(), 0);
        assert!(
            stats.max_used_memory <= peak_after_first + 2 * crate::headers::BLOCK_SIZE as u64,
            "peak grew from {} to {}",
            peak_after_first,
            stats.max_used_memory
        );

        heap.clear();
        assert_eq!(heap.dump_stats().current_used_memory, 0);
    }

    #[test]
    fn allocate_then_free_is_stable() {
        // Repeated allocate/free of one size must not accumulate
        // memory past the first peak plus one block of bookkeeping.
        let heap = test_heap();

        let p = heap.allocate(2048);
        heap.deallocate(p);
        let peak = heap.dump_stats().max_used_memory;

        for _ in 0..10_000 {
            let p = heap.allocate(2048);
            assert!(!p.is_null());
            heap.deallocate(p);
        }
        assert!(heap.dump_stats().max_used_memory <= peak + crate::headers::BLOCK_SIZE as u64);
    }

    #[test]
    fn realloc_in_place_and_growth() {
        let heap = test_heap();

        let p = heap.allocate(100);
        let usable = heap.usable_size(p);
        unsafe { std::ptr::write_bytes(p, 0xab, 100) };

        // Fits in the current chunk: same pointer, no copy.
        assert_eq!(heap.reallocate(p, usable), p);
        assert_eq!(heap.reallocate(p, 10), p);

        // Growth preserves content.
        let grown = heap.reallocate(p, 50_000);
        assert!(!grown.is_null());
        unsafe {
            for i in 0..100 {
                assert_eq!(std::ptr::read(grown.add(i)), 0xab);
            }
        }
        heap.deallocate(grown);

        // Null realloc allocates, zero realloc frees.
        let fresh = heap.reallocate(std::ptr::null_mut(), 64);
        assert!(!fresh.is_null());
        assert!(heap.reallocate(fresh, 0).is_null());
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let heap = test_heap();

        let p = heap.allocate_zeroed(100, 7);
        assert!(!p.is_null());
        unsafe {
            for i in 0..700 {
                assert_eq!(std::ptr::read(p.add(i)), 0);
            }
            // Dirty it so a recycled chunk would be caught.
            std::ptr::write_bytes(p, 0xff, 700);
        }
        heap.deallocate(p);

        let q = heap.allocate_zeroed(100, 7);
        unsafe {
            for i in 0..700 {
                assert_eq!(std::ptr::read(q.add(i)), 0);
            }
        }
        heap.deallocate(q);

        assert!(heap.allocate_zeroed(usize::MAX, 2).is_null());
    }

    #[test]
    fn big_region_is_reused_or_replaced_exactly() {
        let heap = test_heap();

        let a = heap.allocate(64);
        let b = heap.allocate(1024 * 1024);
        let c = heap.allocate(64);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        let used_with_b = heap.dump_stats().current_used_memory;
        heap.deallocate(b);
        let d = heap.allocate(1024 * 1024);
        assert!(!d.is_null());
        assert!(heap.usable_size(d) >= 1024 * 1024);

        // One big region at a time: the footprint with D matches the
        // footprint with B, so B's region was replaced, not leaked
        // next to a second one.
        assert_eq!(heap.dump_stats().current_used_memory, used_with_b);
        assert_eq!(heap.dump_stats().big.current_alloc_count, 1);

        heap.deallocate(a);
        heap.deallocate(c);
        heap.deallocate(d);
    }

    #[test]
    fn aligned_allocation_lands_and_frees() {
        let heap = test_heap();

        // Medium-path alignment: carved out of a radix chunk.
        let p = heap.allocate_aligned(96, 1024);
        assert!(!p.is_null());
        assert_eq!(p as usize % 1024, 0);
        assert!(heap.usable_size(p) >= 96);
        heap.deallocate(p);

        // Page alignment routes through the big path.
        let q = heap.allocate_aligned(96, 4096);
        assert!(!q.is_null());
        assert_eq!(q as usize % 4096, 0);
        assert!(heap.usable_size(q) >= 96);
        heap.deallocate(q);

        // Non-power-of-two alignment is invalid, not fatal.
        assert!(heap.allocate_aligned(96, 48).is_null());
    }

    #[test]
    fn cross_thread_free_hands_over_cleanly() {
        let heap = std::sync::Arc::new(test_heap());

        struct Ptrs(Vec<usize>);
        unsafe impl Send for Ptrs {}

        let mut ptrs = Vec::new();
        for i in 0..1000 {
            let p = heap.allocate(16 + (i % 100) * 8);
            assert!(!p.is_null());
            ptrs.push(p as usize);
        }

        let batch = Ptrs(ptrs);
        let remote = heap.clone();
        std::thread::spawn(move || {
            for p in batch.0 {
                remote.deallocate(p as *mut u8);
            }
        })
        .join()
        .unwrap();

        assert_eq!(heap.dump_stats().current_alloc_count(), 0);
    }

    #[test]
    fn concurrent_mixed_workload() {
        let heap = std::sync::Arc::new(test_heap());
        let mut handles = Vec::new();

        for t in 0..8u64 {
            let heap = heap.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = t.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
                let mut next = move || {
                    rng ^= rng << 13;
                    rng ^= rng >> 7;
                    rng ^= rng << 17;
                    rng
                };

                let mut live: Vec<(usize, usize)> = Vec::new();
                for _ in 0..10_000 {
                    let size = 16 + (next() % 4081) as usize;
                    let p = heap.allocate(size);
                    assert!(!p.is_null());
                    unsafe { std::ptr::write_bytes(p, 0xcd, size.min(32)) };
                    live.push((p as usize, size));

                    if live.len() > 64 {
                        let idx = (next() as usize) % live.len();
                        let (victim, vsize) = live.swap_remove(idx);
                        assert!(heap.usable_size(victim as *mut u8) >= vsize);
                        heap.deallocate(victim as *mut u8);
                    }
                }
                for (p, size) in live {
                    assert!(heap.usable_size(p as *mut u8) >= size);
                    heap.deallocate(p as *mut u8);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = heap.dump_stats();
        assert_eq!(stats.current_alloc_count(), 0, "all allocations returned");
    }

    #[test]
    fn process_heap_is_usable() {
        let heap = process_heap();
        let p = heap.allocate(32);
        assert!(!p.is_null());
        heap.deallocate(p);
    }

    proptest! {
        // Bulk allocate, then deallocate and re-allocate in
        // random-ish order, checking for overlap.
        #[test]
        fn random_order(indices in vec((0..20usize, 1..2000usize), 1..60)) {
            let heap = test_heap();
            let mut slots: Vec<Option<(usize, usize)>> = vec![None; 20];

            for (index, size) in indices.iter().cloned() {
                if let Some((p, size)) = slots[index].take() {
                    prop_assert!(heap.usable_size(p as *mut u8) >= size);
                    heap.deallocate(p as *mut u8);
                } else {
                    let p = heap.allocate(size);
                    prop_assert!(!p.is_null());
                    prop_assert!(heap.usable_size(p) >= size);

                    // No live allocation may overlap the new one.
                    let lo = p as usize;
                    let hi = lo + heap.usable_size(p);
                    for slot in slots.iter().flatten() {
                        let (q, qsize) = *slot;
                        let qhi = q + heap.usable_size(q as *mut u8).max(qsize);
                        prop_assert!(hi <= q || qhi <= lo, "overlap");
                    }
                    slots[index] = Some((lo, size));
                }
            }

            for slot in slots.iter_mut() {
                if let Some((p, _)) = slot.take() {
                    heap.deallocate(p as *mut u8);
                }
            }
            prop_assert_eq!(heap.dump_stats().current_alloc_count(), 0);
        }

        // Aligned allocations never miss their alignment.
        #[test]
        fn alignment_law(sizes in vec((1..100_000usize, 4..13u32), 1..20)) {
            let heap = test_heap();
            let mut live = Vec::new();

            for (size, shift) in sizes.iter().cloned() {
                let align = 1usize << shift;
                let p = heap.allocate_aligned(size, align);
                prop_assert!(!p.is_null());
                prop_assert_eq!(p as usize % align, 0);
                prop_assert!(heap.usable_size(p) >= size);
                live.push(p as usize);
            }
            for p in live {
                heap.deallocate(p as *mut u8);
            }
        }
    }
}
