//! Recursion detection for the process-wide default heap.
//!
//! When this allocator stands in for malloc, internal work that logs,
//! formats, or touches thread-local storage can call straight back
//! into the allocator.  A fixed hash table of per-thread busy flags
//! catches the re-entry so it can be served by a side path.  There is
//! no probing: a colliding thread is a false positive, and the side
//! path is still correct, merely slower.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

const TABLE_SIZE: usize = 1024;

static TABLE: [AtomicBool; TABLE_SIZE] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const CLEAR: AtomicBool = AtomicBool::new(false);
    [CLEAR; TABLE_SIZE]
};

/// Scope guard for one thread's busy flag; the slot clears on drop,
/// panics included.
pub struct RecursionToken {
    slot: &'static AtomicBool,
}

impl Drop for RecursionToken {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Relaxed);
    }
}

/// Marks the calling thread busy.  `None` means the thread is
/// already inside the allocator (or collides with one that is) and
/// must take the side path.
#[inline]
pub fn enter(hash: u32) -> Option<RecursionToken> {
    let slot = &TABLE[hash as usize & (TABLE_SIZE - 1)];
    if !slot.load(Ordering::Relaxed) && !slot.swap(true, Ordering::Acquire) {
        Some(RecursionToken { slot })
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reentry_is_detected() {
        let token = enter(42).expect("first entry succeeds");
        assert!(enter(42).is_none(), "same slot is busy");
        // A different slot is unaffected.
        let other = enter(43).expect("distinct slot succeeds");
        drop(other);
        drop(token);
        assert!(enter(42).is_some(), "slot clears on drop");
    }

    #[test]
    fn collisions_only_produce_false_positives() {
        let token = enter(7).expect("entry succeeds");
        // A colliding hash maps to the same slot and is turned away;
        // that is allowed by design.
        assert!(enter(7 + TABLE_SIZE as u32).is_none());
        drop(token);
    }
}
