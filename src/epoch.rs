//! The epoch manager: a process-wide epoch counter, per-thread epoch
//! reservations, and a deferred-action queue.
//!
//! Every session reserves the current epoch while it runs operations and
//! re-reserves it on a refresh cadence. Structural changes (releasing a
//! replaced hash table, advancing the log's region boundaries) are deferred
//! with a trigger epoch and executed by whichever thread next observes that
//! every reservation has moved past the trigger. This is what makes it safe
//! to reclaim memory that lock-free readers may still be traversing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Capacity of the reservation table; one slot per concurrently active
/// session.
pub(crate) const MAX_THREADS: usize = 128;

const UNRESERVED: u64 = 0;

type Action = Box<dyn FnOnce() + Send>;

/// A reserved slot in the epoch table. Obtained from [`Epoch::acquire`] and
/// returned through [`Epoch::release`]; sessions hold exactly one.
#[derive(Debug)]
pub(crate) struct EpochHandle {
    slot: usize,
}

pub(crate) struct Epoch {
    /// The monotonically increasing global epoch. Starts at 1 so that
    /// `UNRESERVED` can never collide with a real reservation.
    current: CachePadded<AtomicU64>,
    /// Per-thread reservations; `UNRESERVED` marks a free slot.
    table: Box<[CachePadded<AtomicU64>]>,
    /// Actions waiting for their trigger epoch to retire, with a length
    /// hint so the hot path can skip taking the lock.
    drain_list: Mutex<Vec<(u64, Action)>>,
    drain_len: AtomicUsize,
}

impl Epoch {
    pub(crate) fn new() -> Self {
        let table = (0..MAX_THREADS)
            .map(|_| CachePadded::new(AtomicU64::new(UNRESERVED)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            current: CachePadded::new(AtomicU64::new(1)),
            table,
            drain_list: Mutex::new(Vec::new()),
            drain_len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Reserve the current epoch in a free slot. Returns `None` when every
    /// slot is taken.
    pub(crate) fn acquire(&self) -> Option<EpochHandle> {
        let epoch = self.current();
        for (slot, entry) in self.table.iter().enumerate() {
            if entry.load(Ordering::Relaxed) == UNRESERVED
                && entry
                    .compare_exchange(UNRESERVED, epoch, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(EpochHandle { slot });
            }
        }
        None
    }

    /// Give the slot back and run any actions that became safe.
    pub(crate) fn release(&self, handle: EpochHandle) {
        self.table[handle.slot].store(UNRESERVED, Ordering::Release);
        self.drain();
    }

    /// Re-reserve the current epoch and run any actions that became safe.
    pub(crate) fn refresh(&self, handle: &EpochHandle) {
        let epoch = self.current();
        self.table[handle.slot].store(epoch, Ordering::Release);
        self.drain();
    }

    /// Atomically advance the global epoch, returning the new value.
    pub(crate) fn bump(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Enqueue `action` to run once `safe_epoch() > trigger`.
    pub(crate) fn defer(&self, trigger: u64, action: Action) {
        {
            let mut list = self.drain_list.lock();
            list.push((trigger, action));
            self.drain_len.store(list.len(), Ordering::Release);
        }
        // The trigger may already be safe (no reservations at all).
        self.drain();
    }

    /// Advance the epoch and schedule `action` for when every thread has
    /// observed the advance.
    pub(crate) fn bump_and_defer(&self, action: Action) -> u64 {
        let next = self.bump();
        self.defer(next - 1, action);
        next
    }

    /// The minimum reserved epoch, or the current epoch when nothing is
    /// reserved. Monotonic non-decreasing.
    pub(crate) fn safe_epoch(&self) -> u64 {
        let mut safe = u64::MAX;
        for entry in self.table.iter() {
            let reserved = entry.load(Ordering::Acquire);
            if reserved != UNRESERVED && reserved < safe {
                safe = reserved;
            }
        }
        if safe == u64::MAX {
            self.current()
        } else {
            safe
        }
    }

    /// Run every deferred action whose trigger epoch has retired. Actions
    /// execute outside the list lock so they may themselves defer.
    fn drain(&self) {
        if self.drain_len.load(Ordering::Acquire) == 0 {
            return;
        }
        let safe = self.safe_epoch();
        let mut ready = Vec::new();
        {
            let mut list = self.drain_list.lock();
            let mut index = 0;
            while index < list.len() {
                if list[index].0 < safe {
                    ready.push(list.swap_remove(index).1);
                } else {
                    index += 1;
                }
            }
            self.drain_len.store(list.len(), Ordering::Release);
        }
        for action in ready {
            action();
        }
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // No sessions can exist any more; run whatever is still queued so
        // deferred releases are never leaked.
        let actions = std::mem::take(&mut *self.drain_list.lock());
        for (_, action) in actions {
            action();
        }
    }
}

impl std::fmt::Debug for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoch")
            .field("current", &self.current())
            .field("pending_actions", &self.drain_len.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Epoch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn safe_epoch_tracks_minimum_reservation() {
        let epoch = Epoch::new();
        let first = epoch.acquire().unwrap();
        let initial = epoch.current();
        assert_eq!(epoch.safe_epoch(), initial);

        epoch.bump();
        let second = epoch.acquire().unwrap();
        // The first handle still pins the old epoch.
        assert_eq!(epoch.safe_epoch(), initial);

        epoch.refresh(&first);
        assert_eq!(epoch.safe_epoch(), initial + 1);

        epoch.release(first);
        epoch.release(second);
    }

    #[test]
    fn deferred_action_waits_for_reservations() {
        let epoch = Epoch::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let handle = epoch.acquire().unwrap();
        let counter = Arc::clone(&ran);
        epoch.bump_and_defer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // The handle still reserves the pre-bump epoch.
        epoch.refresh(&handle);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        epoch.release(handle);
    }

    #[test]
    fn actions_run_exactly_once() {
        let epoch = Epoch::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&ran);
            epoch.bump_and_defer(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // No reservations: every action drains immediately.
        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn slot_exhaustion_is_reported() {
        let epoch = Epoch::new();
        let mut handles = Vec::new();
        while let Some(handle) = epoch.acquire() {
            handles.push(handle);
        }
        assert_eq!(handles.len(), super::MAX_THREADS);
        assert!(epoch.acquire().is_none());

        let handle = handles.pop().unwrap();
        epoch.release(handle);
        assert!(epoch.acquire().is_some());
        for handle in handles {
            epoch.release(handle);
        }
    }
}
