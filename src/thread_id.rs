//! Stable, recycled per-process thread ids.
//!
//! Arena selection hashes the thread id, so ids must stay dense:
//! letting them grow monotonically would slowly spread a thread-churny
//! process over every arena.  Ids are recycled through a bitmap, and
//! reclaimed with a pthread key destructor rather than Rust TLS
//! destructors alone, because language-level TLS teardown may itself
//! allocate.
use std::cell::Cell;
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Once;

use crate::lock::SpinLock;

const SLOTS: usize = 16;
/// Ids below this bound are recycled; overflow ids grow monotonically.
pub const MAX_RECYCLED_THREADS: usize = SLOTS * 64;

struct Registry {
    threads: [u64; SLOTS], // one bit per live recycled id
    count: u32,            // live thread count
    max_count: u32,        // high watermark
    mask: u32,             // power-of-two-minus-one cover of count
    max_mask: u32,
}

struct Global {
    lock: SpinLock,
    registry: UnsafeCell<Registry>,
    overflow: AtomicU32,
}

// The registry is only touched under `lock`.
unsafe impl Sync for Global {}

static GLOBAL: Global = Global {
    lock: SpinLock::new(),
    registry: UnsafeCell::new(Registry {
        threads: [0; SLOTS],
        count: 0,
        max_count: 0,
        mask: 0,
        max_mask: 0,
    }),
    overflow: AtomicU32::new(MAX_RECYCLED_THREADS as u32),
};

/// Cover `count` threads with the next power of two minus one.  The
/// doubled range spreads threads over more arenas than strictly
/// necessary, which reduces contention for workloads that park and
/// respawn workers.
fn mask_from_count(count: u32) -> u32 {
    if count == 0 {
        return 0;
    }
    let floor = 1u32 << (31 - count.leading_zeros());
    (floor - 1) * 2 + 1
}

fn acquire_id() -> u32 {
    GLOBAL.lock.lock();
    let registry = unsafe { &mut *GLOBAL.registry.get() };

    registry.count += 1;
    registry.mask = mask_from_count(registry.count);
    if registry.count > registry.max_count {
        registry.max_count = registry.count;
        registry.max_mask = mask_from_count(registry.max_count);
    }

    for (i, word) in registry.threads.iter_mut().enumerate() {
        let free = !*word;
        if free != 0 {
            let bit = free.trailing_zeros();
            *word |= 1u64 << bit;
            GLOBAL.lock.unlock();
            return i as u32 * 64 + bit;
        }
    }
    GLOBAL.lock.unlock();

    // No slot left to recycle.
    GLOBAL.overflow.fetch_add(1, Ordering::Relaxed)
}

fn release_id(id: u32) {
    GLOBAL.lock.lock();
    let registry = unsafe { &mut *GLOBAL.registry.get() };

    registry.count = registry.count.saturating_sub(1);
    registry.mask = mask_from_count(registry.count);
    if (id as usize) < MAX_RECYCLED_THREADS {
        registry.threads[id as usize / 64] &= !(1u64 << (id & 63));
    }
    GLOBAL.lock.unlock();
}

static KEY_ONCE: Once = Once::new();
static mut KEY: libc::pthread_key_t = 0;

unsafe extern "C" fn release_slot(value: *mut libc::c_void) {
    // The stored value is id + 1 so that a registered id is never the
    // NULL pthread value.
    release_id(value as usize as u32 - 1);
}

fn destructor_key() -> libc::pthread_key_t {
    KEY_ONCE.call_once(|| unsafe {
        libc::pthread_key_create(std::ptr::addr_of_mut!(KEY), Some(release_slot));
    });
    unsafe { KEY }
}

thread_local! {
    static CACHED_ID: Cell<u32> = Cell::new(u32::MAX);
}

#[cold]
fn register_thread() -> u32 {
    let id = acquire_id();
    unsafe {
        libc::pthread_setspecific(destructor_key(), (id as usize + 1) as *mut libc::c_void);
    }
    id
}

/// Returns this thread's recycled id.
#[inline]
pub fn current_thread_id() -> u32 {
    CACHED_ID
        .try_with(|cell| {
            let mut id = cell.get();
            if id == u32::MAX {
                id = register_thread();
                cell.set(id);
            }
            id
        })
        // TLS already torn down: derive a throwaway id without
        // touching the registry.
        .unwrap_or_else(|_| unsafe { libc::pthread_self() as u32 })
}

/// Thread id variant used for arena selection.  With a single live
/// thread the id flickers between two values, spreading one thread
/// over two arenas; this keeps the memory footprint of mono-threaded
/// processes down because both arenas stay small.
#[inline]
pub fn current_thread_id_for_arena() -> u32 {
    static FLICKER: AtomicBool = AtomicBool::new(false);

    let id = current_thread_id();
    if max_thread_count() == 1 {
        let bit = FLICKER.fetch_xor(true, Ordering::Relaxed);
        id + bit as u32
    } else {
        id
    }
}

#[inline]
pub fn thread_mask() -> u32 {
    GLOBAL.lock.with(|| unsafe { (*GLOBAL.registry.get()).mask })
}

#[inline]
pub fn max_thread_count() -> u32 {
    GLOBAL.lock.with(|| unsafe { (*GLOBAL.registry.get()).max_count })
}

/// Finalizer from the 64-bit mix in Murmur-style hashes; used to key
/// the recursion-detection table.
#[inline]
pub fn current_thread_id_hash() -> u32 {
    let mut h = current_thread_id() as u64;
    h ^= h >> 23;
    h = h.wrapping_mul(0x2127599bf4325c37);
    h ^= h >> 47;
    h as u32
}

/// Cheap xorshift, good enough to pick a random arena to deplete.
pub fn random_u32() -> u32 {
    static STATE: AtomicU32 = AtomicU32::new(0x9e3779b9);

    let mut x = STATE.load(Ordering::Relaxed).wrapping_add(current_thread_id() | 1);
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    STATE.store(x, Ordering::Relaxed);
    x
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_is_stable_within_a_thread() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
        assert!((a as usize) < MAX_RECYCLED_THREADS);
    }

    #[test]
    fn ids_differ_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn ids_are_recycled() {
        // Exited threads return their id to the bitmap, so spawning
        // many short-lived threads in sequence must not consume a
        // fresh id each time, even with other tests running.
        let mut max = 0;
        for _ in 0..64 {
            let id = std::thread::spawn(current_thread_id).join().unwrap();
            max = max.max(id);
        }
        assert!((max as usize) < MAX_RECYCLED_THREADS / 2);
    }

    #[test]
    fn mask_covers_count() {
        assert_eq!(mask_from_count(0), 0);
        assert_eq!(mask_from_count(1), 1);
        assert_eq!(mask_from_count(2), 3);
        assert_eq!(mask_from_count(3), 3);
        assert_eq!(mask_from_count(4), 7);
        assert_eq!(mask_from_count(5), 7);
        assert_eq!(mask_from_count(8), 15);
    }

    #[test]
    fn hash_mixes() {
        assert_ne!(current_thread_id_hash(), current_thread_id());
    }
}
