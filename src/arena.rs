//! An arena bundles one radix tree and one tiny pool.  Threads map to
//! arenas by their recycled id; the depletion counter lets sibling
//! arenas skip an arena that is itself out of memory.
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::manager::MemoryManager;
use crate::radix::RadixTree;
use crate::tiny::TinyMemPool;

/// Sentinel for an arena that never received a page run; depletion
/// scans skip it for medium requests.
const NEVER_USED: u32 = u32::MAX;

#[repr(C)]
pub struct Arena {
    mgr: *mut MemoryManager,
    tree: RadixTree,
    pool: TinyMemPool,
    /// `NEVER_USED`, or the number of in-flight depletion scans
    /// started by this arena.
    depleted: AtomicU32,
}

impl Arena {
    /// Builds an arena in place over raw bump-pool memory.
    ///
    /// # Safety
    ///
    /// `this` must point to writable storage of the right size, and
    /// `mgr` must outlive it.
    pub unsafe fn init(this: *mut Arena, mgr: *mut MemoryManager) {
        std::ptr::addr_of_mut!((*this).mgr).write(mgr);
        std::ptr::addr_of_mut!((*this).depleted).write(AtomicU32::new(NEVER_USED));
        TinyMemPool::init(std::ptr::addr_of_mut!((*this).pool), mgr);
        RadixTree::init(std::ptr::addr_of_mut!((*this).tree), this);
    }

    pub fn manager(&self) -> *mut MemoryManager {
        self.mgr
    }

    pub fn tree(&self) -> &RadixTree {
        &self.tree
    }

    pub fn tiny_pool(&self) -> *mut TinyMemPool {
        &self.pool as *const TinyMemPool as *mut TinyMemPool
    }

    /// First page run attached: the arena becomes visible to
    /// depletion scans.
    pub unsafe fn mark_active(this: *mut Arena) {
        let _ = (*this).depleted.compare_exchange(
            NEVER_USED,
            0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Non-zero while the arena is scanning its siblings (or has
    /// never held memory); such arenas are skipped for medium
    /// depletion to avoid cycles.
    pub fn is_depleted(&self) -> bool {
        self.depleted.load(Ordering::Relaxed) != 0
    }

    pub fn begin_depletion(&self) {
        // An untouched arena wraps NEVER_USED to 0 here; it reverts
        // on `end_depletion`.
        self.depleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_depletion(&self) {
        self.depleted.fetch_sub(1, Ordering::Relaxed);
    }
}
