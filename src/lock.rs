//! Raw spinlocks used throughout the heap.  They are deliberately not
//! data-carrying: most of them live inside packed chunk headers or
//! guard intrusive structures whose lock and data cannot be a single
//! Rust object.  Contended paths yield to the scheduler instead of
//! burning cycles.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// A one-byte test-and-set spinlock.
///
/// Zero-filled memory is a valid, unlocked `SpinLock`; chunk headers
/// rely on this when they are created over raw pages.
#[repr(transparent)]
#[derive(Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn lock(&self) {
        loop {
            // Optimistically assume the lock is free on the first try.
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }

            // Wait for the release without generating cache misses.
            while self.locked.load(Ordering::Relaxed) {
                std::thread::yield_now();
            }
        }
    }

    #[inline(always)]
    pub fn try_lock(&self) -> bool {
        // A relaxed load first prevents unnecessary cache line
        // invalidation when the caller loops on `try_lock`.
        !self.locked.load(Ordering::Relaxed) && !self.locked.swap(true, Ordering::Acquire)
    }

    /// Single-attempt acquire without the preliminary load.
    #[inline(always)]
    pub fn try_lock_fast(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline(always)]
    pub fn unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Runs `f` with the lock held.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let ret = f();
        self.unlock();
        ret
    }
}

/// An unfair read-write spinlock packed in one 32-bit word: bit 0 is
/// the writer bit, the remaining bits count readers.
#[repr(transparent)]
#[derive(Default)]
pub struct SharedSpinLock {
    state: AtomicU32,
}

const WRITE: u32 = 1;
const READ: u32 = 2;

impl SharedSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, WRITE, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    pub fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            while self.state.load(Ordering::Relaxed) != 0 {
                std::thread::yield_now();
            }
        }
    }

    #[inline(always)]
    pub fn unlock(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) & WRITE != 0);
        self.state.store(0, Ordering::Release);
    }

    #[inline(always)]
    pub fn try_lock_shared(&self) -> bool {
        // compare_exchange beats a fetch_add/fetch_sub pair when a
        // writer holds the lock.
        let cur = self.state.load(Ordering::Relaxed);
        cur & WRITE == 0
            && self
                .state
                .compare_exchange(cur, cur + READ, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    #[inline(always)]
    pub fn lock_shared(&self) {
        while !self.try_lock_shared() {
            std::thread::yield_now();
        }
    }

    #[inline(always)]
    pub fn unlock_shared(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) >= READ);
        self.state.fetch_sub(READ, Ordering::Release);
    }

    /// Runs `f` with the write lock held.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let ret = f();
        self.unlock();
        ret
    }

    /// Runs `f` with a read lock held.
    #[inline]
    pub fn with_shared<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock_shared();
        let ret = f();
        self.unlock_shared();
        ret
    }
}

/// Straightforward recursive spinlock, keyed by the recycled thread
/// id.  The heap's structural lock must be recursive because clearing
/// the heap can re-enter page allocation through the bump pool.
#[derive(Default)]
pub struct RecursiveSpinLock {
    lock: SpinLock,
    count: AtomicU32,
    owner: AtomicU32,
}

const NO_OWNER: u32 = u32::MAX;

impl RecursiveSpinLock {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            count: AtomicU32::new(0),
            owner: AtomicU32::new(NO_OWNER),
        }
    }

    fn try_lock_as(&self, id: u32) -> bool {
        self.lock.lock();
        let ret = if self.count.load(Ordering::Relaxed) == 0 {
            self.owner.store(id, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            true
        } else if self.owner.load(Ordering::Relaxed) == id {
            self.count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };
        self.lock.unlock();
        ret
    }

    pub fn lock(&self) {
        let id = crate::thread_id::current_thread_id();
        while !self.try_lock_as(id) {
            std::thread::yield_now();
        }
    }

    pub fn unlock(&self) {
        self.lock.lock();
        debug_assert!(self.count.load(Ordering::Relaxed) > 0);
        if self.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
        }
        self.lock.unlock();
    }

    /// Runs `f` with the lock held.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let ret = f();
        self.unlock();
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn spin_lock_smoke() {
        let lock = SpinLock::new();

        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn shared_lock_smoke() {
        let lock = SharedSpinLock::new();

        lock.lock_shared();
        assert!(lock.try_lock_shared());
        assert!(!lock.try_lock());
        lock.unlock_shared();
        lock.unlock_shared();

        lock.lock();
        assert!(!lock.try_lock_shared());
        lock.unlock();
    }

    #[test]
    fn recursive_lock_reenters() {
        let lock = RecursiveSpinLock::new();

        lock.lock();
        lock.lock();
        lock.unlock();
        lock.unlock();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn spin_lock_counts_across_threads() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::cell::UnsafeCell::new(0usize));

        struct Shared(Arc<std::cell::UnsafeCell<usize>>);
        unsafe impl Send for Shared {}

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let shared = Shared(counter.clone());
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    lock.with(|| unsafe { *shared.0.get() += 1 });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *counter.get() }, 40_000);
    }
}
