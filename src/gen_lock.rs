//! Generation lock for variable-length values.
//!
//! A value that can change length under concurrent update carries one of
//! these words in its header: a 62-bit generation counter, a lock bit and a
//! replaced bit. Writers take the lock around a mutation and bump the
//! generation on release; readers snapshot the word before and after reading
//! the buffer and retry until both snapshots carry the same generation, which
//! rules out torn reads. Once a record is marked replaced, every later
//! locker is refused and must restart on the record that superseded it.

use std::sync::atomic::{AtomicU64, Ordering};

const GEN_MASK: u64 = (1 << 62) - 1;
const LOCKED_BIT: u64 = 1 << 62;
const REPLACED_BIT: u64 = 1 << 63;

/// A snapshot of a generation-lock word.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct GenLock(u64);

impl GenLock {
    pub fn generation(self) -> u64 {
        self.0 & GEN_MASK
    }

    pub fn is_locked(self) -> bool {
        self.0 & LOCKED_BIT != 0
    }

    pub fn is_replaced(self) -> bool {
        self.0 & REPLACED_BIT != 0
    }
}

/// Outcome of a [`AtomicGenLock::try_lock`] attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TryLock {
    /// The lock was taken; the caller must release it with `unlock`.
    Acquired,
    /// Another thread holds the lock. Spin and retry.
    Busy,
    /// The record has been superseded; restart on its replacement.
    Replaced,
}

/// The shared generation-lock word.
#[derive(Debug, Default)]
pub struct AtomicGenLock(AtomicU64);

impl AtomicGenLock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> GenLock {
        GenLock(self.0.load(Ordering::Acquire))
    }

    /// Reset to generation zero, unlocked. Only valid on storage no other
    /// thread can reach yet (a freshly allocated record).
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Try to take the lock. Fails if it is held or the record has been
    /// marked replaced.
    pub fn try_lock(&self) -> TryLock {
        let expected = self.0.load(Ordering::Acquire) & !(LOCKED_BIT | REPLACED_BIT);
        match self.0.compare_exchange(
            expected,
            expected | LOCKED_BIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => TryLock::Acquired,
            Err(actual) if actual & REPLACED_BIT != 0 => TryLock::Replaced,
            Err(_) => TryLock::Busy,
        }
    }

    /// Release the lock and advance the generation.
    ///
    /// With `mark_replaced` the record is additionally flagged as
    /// superseded, refusing every later `try_lock`. A writer that mutated
    /// the value in place passes `true` when the record is about to be (or
    /// may be) copied forward; a writer that is abandoning the record to
    /// append a replacement itself passes `false` and lets the index CAS
    /// arbitrate.
    pub fn unlock(&self, mark_replaced: bool) {
        if mark_replaced {
            // Clear locked, set replaced, generation += 1.
            self.0
                .fetch_add(REPLACED_BIT - LOCKED_BIT + 1, Ordering::AcqRel);
        } else {
            // Clear locked, generation += 1.
            self.0.fetch_sub(LOCKED_BIT - 1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicGenLock, TryLock};

    #[test]
    fn lock_cycle_bumps_generation() {
        let lock = AtomicGenLock::new();
        assert_eq!(lock.try_lock(), TryLock::Acquired);
        assert!(lock.load().is_locked());
        assert_eq!(lock.try_lock(), TryLock::Busy);

        lock.unlock(false);
        let after = lock.load();
        assert!(!after.is_locked());
        assert!(!after.is_replaced());
        assert_eq!(after.generation(), 1);
    }

    #[test]
    fn replaced_refuses_later_lockers() {
        let lock = AtomicGenLock::new();
        assert_eq!(lock.try_lock(), TryLock::Acquired);
        lock.unlock(true);

        let snap = lock.load();
        assert!(snap.is_replaced());
        assert!(!snap.is_locked());
        assert_eq!(snap.generation(), 1);
        assert_eq!(lock.try_lock(), TryLock::Replaced);
    }
}
