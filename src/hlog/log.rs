//! The append-only log proper: bump-the-pointer allocation over a ring of
//! fixed-size pages, and the three moving boundaries that partition the
//! address space into unreachable, read-only and mutable regions.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::hlog::address::{Address, PAGE_BITS, PAGE_SIZE};
use crate::status::Status;

/// Marks a page slot that has never been claimed.
const NO_PAGE: u64 = u64::MAX;

/// One ring slot: the backing frame plus the logical page it currently
/// holds. `owner` is claimed by CAS; `ready` is published once the frame
/// is zeroed and safe to write records into.
struct PageSlot {
    frame: AtomicPtr<u8>,
    owner: AtomicU64,
    ready: AtomicU64,
}

pub(crate) struct HybridLog {
    slots: Box<[PageSlot]>,
    capacity: u64,
    head_slack: u64,
    alignment: usize,
    head: CachePadded<AtomicU64>,
    safe_read_only: CachePadded<AtomicU64>,
    read_only: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

impl HybridLog {
    /// `capacity` must be a power of two holding at least two pages;
    /// `alignment` is the device's page alignment. Both are validated by
    /// the store constructor.
    pub(crate) fn new(capacity: u64, alignment: usize, head_slack: u64) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(capacity >= 2 * PAGE_SIZE);
        let num_slots = (capacity >> PAGE_BITS) as usize;
        let slots = (0..num_slots)
            .map(|_| PageSlot {
                frame: AtomicPtr::new(ptr::null_mut()),
                owner: AtomicU64::new(NO_PAGE),
                ready: AtomicU64::new(NO_PAGE),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let begin = Address::FIRST_VALID.control();
        Self {
            slots,
            capacity,
            head_slack,
            alignment,
            head: CachePadded::new(AtomicU64::new(begin)),
            safe_read_only: CachePadded::new(AtomicU64::new(begin)),
            read_only: CachePadded::new(AtomicU64::new(begin)),
            tail: CachePadded::new(AtomicU64::new(begin)),
        }
    }

    pub(crate) fn head_address(&self) -> Address {
        Address::new(self.head.load(Ordering::Acquire))
    }

    pub(crate) fn safe_read_only_address(&self) -> Address {
        Address::new(self.safe_read_only.load(Ordering::Acquire))
    }

    pub(crate) fn read_only_address(&self) -> Address {
        Address::new(self.read_only.load(Ordering::Acquire))
    }

    pub(crate) fn tail_address(&self) -> Address {
        Address::new(self.tail.load(Ordering::Acquire))
    }

    /// Reserve `size` bytes, padding out the current page when the record
    /// would straddle a boundary. Returns `None` when the ring is out of
    /// space (the caller surfaces `OutOfMemory`).
    pub(crate) fn allocate(&self, size: u32) -> Option<Address> {
        let size = u64::from(size);
        debug_assert!(size > 0 && size <= PAGE_SIZE);
        let backoff = Backoff::new();
        loop {
            let current = self.tail.load(Ordering::Acquire);
            let (start, new_tail) = if current >> PAGE_BITS == (current + size - 1) >> PAGE_BITS {
                (current, current + size)
            } else {
                // Pad to the next page; the skipped bytes stay zero and are
                // never addressed.
                let next_page = ((current >> PAGE_BITS) + 1) << PAGE_BITS;
                (next_page, next_page + size)
            };

            if new_tail - self.head.load(Ordering::Acquire) > self.capacity {
                return None;
            }
            if !self.ensure_page(start >> PAGE_BITS) {
                return None;
            }

            if self
                .tail
                .compare_exchange_weak(current, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Address::new(start));
            }
            backoff.spin();
        }
    }

    /// Make sure `page` has a zeroed frame behind it. Fails when the frame
    /// still holds a page the head has not fully passed.
    fn ensure_page(&self, page: u64) -> bool {
        let slot = &self.slots[(page % self.slots.len() as u64) as usize];
        let backoff = Backoff::new();
        loop {
            let owner = slot.owner.load(Ordering::Acquire);
            if owner == page {
                // Claimed; wait for the frame to become writable.
                while slot.ready.load(Ordering::Acquire) != page {
                    backoff.snooze();
                }
                return true;
            }
            if owner != NO_PAGE {
                if owner > page {
                    // The ring lapped our tail snapshot; the pending tail
                    // CAS is guaranteed to fail and retry with fresh state.
                    return true;
                }
                // The previous lap of the ring must be wholly unreachable
                // before the frame can be recycled.
                if self.head.load(Ordering::Acquire) < (owner + 1) << PAGE_BITS {
                    return false;
                }
            }
            if slot
                .owner
                .compare_exchange(owner, page, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                backoff.spin();
                continue;
            }
            // We own the transition: back the slot with zeroed memory.
            unsafe {
                let frame = slot.frame.load(Ordering::Acquire);
                if frame.is_null() {
                    let layout = self.page_layout();
                    let fresh = alloc_zeroed(layout);
                    assert!(!fresh.is_null(), "log page allocation failed");
                    slot.frame.store(fresh, Ordering::Release);
                } else {
                    ptr::write_bytes(frame, 0, PAGE_SIZE as usize);
                }
            }
            slot.ready.store(page, Ordering::Release);
            return true;
        }
    }

    /// Translate a logical address into the page ring. Fails below `head`,
    /// where records are unreachable and their frames may be recycled.
    pub(crate) fn at(&self, address: Address) -> Result<*mut u8, Status> {
        if address.control() < self.head.load(Ordering::Acquire) {
            return Err(Status::NotInMemory);
        }
        Ok(self.at_unchecked(address))
    }

    /// Translate an address already known to be at or above `head`.
    pub(crate) fn at_unchecked(&self, address: Address) -> *mut u8 {
        let slot = &self.slots[(address.page() % self.slots.len() as u64) as usize];
        debug_assert_eq!(slot.ready.load(Ordering::Acquire), address.page());
        let frame = slot.frame.load(Ordering::Acquire);
        debug_assert!(!frame.is_null());
        // SAFETY: the offset is below PAGE_SIZE by construction and the
        // frame spans a full page.
        unsafe { frame.add(address.offset() as usize) }
    }

    /// Advance the read-only boundary. Returns whether it moved. The
    /// matching `safe_read_only` and `head` shifts are driven through the
    /// epoch manager by the store.
    pub(crate) fn try_shift_read_only(&self, to: Address) -> bool {
        let clamped = to.min(self.tail_address());
        advance(&self.read_only, clamped.control())
    }

    /// Certify the read-only region up to `to`; called once an epoch has
    /// retired after the matching `read_only` shift.
    pub(crate) fn shift_safe_read_only(&self, to: Address) {
        let clamped = to.min(self.read_only_address());
        advance(&self.safe_read_only, clamped.control());
    }

    /// Advance `head`, bounded by what the device reports flushed and by
    /// the configured slack behind `safe_read_only`.
    pub(crate) fn shift_head(&self, flushed: Address) {
        let safe = self.safe_read_only_address().control();
        let target = flushed
            .control()
            .min(safe.saturating_sub(self.head_slack))
            .max(Address::FIRST_VALID.control());
        advance(&self.head, target);
    }

    fn page_layout(&self) -> Layout {
        // PAGE_SIZE is a power of two and alignment is validated at store
        // construction, so this cannot fail.
        Layout::from_size_align(PAGE_SIZE as usize, self.alignment).unwrap()
    }
}

/// CAS-max: move `cell` forward to `to`, never backward.
fn advance(cell: &AtomicU64, to: u64) -> bool {
    let mut current = cell.load(Ordering::Acquire);
    loop {
        if to <= current {
            return false;
        }
        match cell.compare_exchange_weak(current, to, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

impl Drop for HybridLog {
    fn drop(&mut self) {
        let layout = self.page_layout();
        for slot in self.slots.iter() {
            let frame = slot.frame.load(Ordering::Acquire);
            if !frame.is_null() {
                // SAFETY: the frame was allocated with this layout and is
                // not referenced any more.
                unsafe { dealloc(frame, layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlog::address::PAGE_SIZE;

    fn small_log() -> HybridLog {
        HybridLog::new(2 * PAGE_SIZE, 64, PAGE_SIZE)
    }

    #[test]
    fn allocations_are_contiguous_within_a_page() {
        let log = small_log();
        let first = log.allocate(64).unwrap();
        let second = log.allocate(64).unwrap();
        assert_eq!(first, Address::FIRST_VALID);
        assert_eq!(second.control(), first.control() + 64);
        assert_eq!(log.tail_address().control(), second.control() + 64);
    }

    #[test]
    fn straddling_allocation_pads_to_the_next_page() {
        let log = small_log();
        let chunk = (PAGE_SIZE / 2) as u32;
        let _ = log.allocate(chunk).unwrap();
        let _ = log.allocate(chunk - 128).unwrap();
        // Less than `chunk` bytes remain in page zero.
        let spill = log.allocate(chunk).unwrap();
        assert_eq!(spill.page(), 1);
        assert_eq!(spill.offset(), 0);
    }

    #[test]
    fn exhausting_the_ring_reports_out_of_memory() {
        let log = small_log();
        let chunk = (PAGE_SIZE / 4) as u32;
        let mut allocations = 0;
        while log.allocate(chunk).is_some() {
            allocations += 1;
        }
        // Two pages minus the reserved first 64 bytes.
        assert_eq!(allocations, 7);
    }

    #[test]
    fn boundaries_stay_ordered_and_monotonic() {
        let log = small_log();
        for _ in 0..32 {
            let _ = log.allocate(4096).unwrap();
        }
        let tail = log.tail_address();
        assert!(log.try_shift_read_only(tail));
        // A second shift to the same target is a no-op.
        assert!(!log.try_shift_read_only(tail));
        log.shift_safe_read_only(tail);
        log.shift_head(tail);

        let head = log.head_address();
        let safe = log.safe_read_only_address();
        let read_only = log.read_only_address();
        assert!(head <= safe && safe <= read_only && read_only <= tail);
        // Head honours the slack even though the device reported the whole
        // log flushed.
        assert_eq!(head, Address::FIRST_VALID);
    }

    #[test]
    fn addresses_below_head_are_not_in_memory() {
        let log = small_log();
        let addr = log.allocate(128).unwrap();
        assert!(log.at(addr).is_ok());
        assert_eq!(log.at(Address::new(8)).unwrap_err(), Status::NotInMemory);
    }
}
