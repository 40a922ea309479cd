//! The resize coordinator: helped doubling and halving of the hash table.
//!
//! One initiator claims the resize, publishes the `(old, new)` table pair
//! and bumps an odd/even sequence word. From then on every operation first
//! discharges the split (or merge) of the bucket its own hash maps to,
//! helps one more bucket along, and works exclusively against the new
//! table. Relocation CASes each source slot to the sentinel so that racing
//! installs on the old table fail instead of vanishing. The thread that
//! relocates the last bucket flips the active version, runs the caller's
//! callback, and hands the old table (plus the right to start the next
//! resize) to the epoch queue.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;

use crate::hlog::Address;
use crate::status::Status;

use super::bucket::{AtomicBucketEntry, BucketChain, BucketEntry, HashBucket, HashTable};
use super::{HashIndex, IndexHost};

/// Source buckets a helper relocates per visit.
pub(crate) const HELP_CHUNK: u64 = 16;

pub(crate) type ResizeCallback = Box<dyn FnOnce(u64) + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ResizeDirection {
    Grow,
    Shrink,
}

pub(crate) struct ResizeState {
    /// Odd while a resize is live. Bumped once at start and once at
    /// finish, so a stable odd value certifies the fields below.
    sequence: AtomicU64,
    /// Held from initiation until the epoch retires the old table; blocks
    /// back-to-back resizes from overlapping with stale helpers.
    claim: AtomicBool,
    direction: AtomicU8,
    old_version: AtomicU8,
    old_size: AtomicU64,
    new_size: AtomicU64,
    cursor: AtomicU64,
    completed: AtomicU64,
    callback: Mutex<Option<ResizeCallback>>,
}

/// A validated copy of the live resize's parameters.
pub(crate) struct ResizeSnapshot {
    pub(crate) sequence: u64,
    pub(crate) direction: ResizeDirection,
    pub(crate) old_version: u8,
    pub(crate) old_size: u64,
    pub(crate) new_size: u64,
}

impl ResizeState {
    pub(crate) fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            claim: AtomicBool::new(false),
            direction: AtomicU8::new(0),
            old_version: AtomicU8::new(0),
            old_size: AtomicU64::new(0),
            new_size: AtomicU64::new(0),
            cursor: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Read the resize parameters, re-validating that `sequence` is still
    /// the live one. `None` means the resize moved on mid-read.
    pub(crate) fn snapshot(&self, sequence: u64) -> Option<ResizeSnapshot> {
        let snapshot = ResizeSnapshot {
            sequence,
            direction: if self.direction.load(Ordering::Acquire) == 0 {
                ResizeDirection::Grow
            } else {
                ResizeDirection::Shrink
            },
            old_version: self.old_version.load(Ordering::Acquire),
            old_size: self.old_size.load(Ordering::Acquire),
            new_size: self.new_size.load(Ordering::Acquire),
        };
        (self.sequence() == sequence).then_some(snapshot)
    }
}

/// Owner of a retired table pointer plus the coordination cells the
/// deferred release needs to touch. The cells live inside the store, which
/// outlives every queued epoch action.
struct RetiredTable {
    table: *mut HashTable,
    slot: *const AtomicPtr<HashTable>,
    claim: *const AtomicBool,
}

// SAFETY: the pointers are only dereferenced by the single epoch action
// that owns this value.
unsafe impl Send for RetiredTable {}

impl RetiredTable {
    fn release(self) {
        // SAFETY: the epoch certified that no operation can still probe
        // the retired table, and the store (holding slot and claim) is
        // alive for as long as the epoch queue is.
        unsafe {
            let _ = (*self.slot).compare_exchange(
                self.table,
                std::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            drop(Box::from_raw(self.table));
            (*self.claim).store(false, Ordering::Release);
        }
    }
}

impl HashIndex {
    /// Begin a doubling or halving of the table. `Aborted` means a resize
    /// is already in flight (or still retiring), or the table cannot
    /// shrink further.
    pub(crate) fn start_resize<H: IndexHost>(
        &self,
        direction: ResizeDirection,
        callback: ResizeCallback,
        host: &H,
    ) -> Status {
        if self.resize.claim.swap(true, Ordering::AcqRel) {
            return Status::Aborted;
        }
        let old_version = self.active_version();
        let old_size = self.table(old_version).size();
        let new_size = match direction {
            ResizeDirection::Grow => old_size << 1,
            ResizeDirection::Shrink => {
                if old_size <= 1 {
                    self.resize.claim.store(false, Ordering::Release);
                    return Status::Aborted;
                }
                old_size >> 1
            }
        };

        let fresh = Box::into_raw(Box::new(HashTable::new(new_size)));
        // The previous occupant of this slot (if any) is owned by the
        // deferred release that retired it; overwriting the slot is safe.
        self.tables[1 - old_version as usize].store(fresh, Ordering::Release);

        self.resize.direction.store(
            match direction {
                ResizeDirection::Grow => 0,
                ResizeDirection::Shrink => 1,
            },
            Ordering::Release,
        );
        self.resize.old_version.store(old_version, Ordering::Release);
        self.resize.old_size.store(old_size, Ordering::Release);
        self.resize.new_size.store(new_size, Ordering::Release);
        self.resize.cursor.store(0, Ordering::Release);
        self.resize.completed.store(0, Ordering::Release);
        *self.resize.callback.lock() = Some(callback);

        // Publish: operations now participate before touching the index.
        self.resize.sequence.fetch_add(1, Ordering::AcqRel);
        self.help(host, HELP_CHUNK);
        Status::Ok
    }

    /// Relocate up to `quota` source buckets of the live resize. A no-op
    /// when the table is stable.
    pub(crate) fn help<H: IndexHost>(&self, host: &H, quota: u64) {
        let sequence = self.resize.sequence();
        if sequence % 2 == 0 {
            return;
        }
        let Some(snapshot) = self.resize.snapshot(sequence) else {
            return;
        };
        let total = match snapshot.direction {
            ResizeDirection::Grow => snapshot.old_size,
            ResizeDirection::Shrink => snapshot.new_size,
        };
        for _ in 0..quota {
            let next = self.resize.cursor.fetch_add(1, Ordering::AcqRel);
            if next >= total {
                break;
            }
            match snapshot.direction {
                ResizeDirection::Grow => self.ensure_split(next, &snapshot, host),
                ResizeDirection::Shrink => self.ensure_merged(next, &snapshot, host),
            }
        }
    }

    /// Block until old-table bucket `source` has been split into the new
    /// table, splitting it ourselves if nobody else is.
    pub(crate) fn ensure_split<H: IndexHost>(
        &self,
        source: u64,
        snapshot: &ResizeSnapshot,
        host: &H,
    ) {
        let bucket = self.table(snapshot.old_version).bucket(source);
        let backoff = Backoff::new();
        loop {
            if bucket.is_split_done() {
                return;
            }
            if self.resize.sequence() != snapshot.sequence {
                return;
            }
            if bucket.try_lock_split() {
                self.split_bucket(source, snapshot, host);
                return;
            }
            backoff.snooze();
        }
    }

    /// Block until new-table bucket `target` has absorbed both of its old
    /// buckets. The lower source bucket's header carries the lock state
    /// for the pair.
    pub(crate) fn ensure_merged<H: IndexHost>(
        &self,
        target: u64,
        snapshot: &ResizeSnapshot,
        host: &H,
    ) {
        let lower = self.table(snapshot.old_version).bucket(target);
        let backoff = Backoff::new();
        loop {
            if lower.is_split_done() {
                return;
            }
            if self.resize.sequence() != snapshot.sequence {
                return;
            }
            if lower.try_lock_split() {
                self.merge_pair(target, snapshot, host);
                return;
            }
            backoff.snooze();
        }
    }

    fn split_bucket<H: IndexHost>(&self, source: u64, snapshot: &ResizeSnapshot, host: &H) {
        let old_table = self.table(snapshot.old_version);
        let new_table = self.table(1 - snapshot.old_version);
        let low = new_table.bucket(source);
        let high = new_table.bucket(source + snapshot.old_size);
        let head = host.log_head();

        for bucket in BucketChain::new(old_table.bucket(source)) {
            for slot in bucket.entries.iter() {
                let captured = capture(slot);
                if captured.is_unused()
                    || captured.is_tentative()
                    || !captured.address().is_valid()
                {
                    continue;
                }

                // Walk the chain for the newest record on each side of the
                // doubling bit. The chains share their suffix; key
                // comparison filters the other side's records on lookup.
                let mut low_head = Address::INVALID;
                let mut high_head = Address::INVALID;
                let mut address = captured.address();
                while address.is_valid() {
                    if address < head {
                        // The rest of the chain cannot be inspected; keep
                        // it reachable from both halves.
                        if !low_head.is_valid() {
                            low_head = address;
                        }
                        if !high_head.is_valid() {
                            high_head = address;
                        }
                        break;
                    }
                    if host.record_hash(address).split_side(snapshot.old_size) {
                        if !high_head.is_valid() {
                            high_head = address;
                        }
                    } else if !low_head.is_valid() {
                        low_head = address;
                    }
                    if low_head.is_valid() && high_head.is_valid() {
                        break;
                    }
                    address = host.record_previous(address);
                }

                if low_head.is_valid() {
                    install_relocated(low, captured.tag(), low_head);
                }
                if high_head.is_valid() {
                    install_relocated(high, captured.tag(), high_head);
                }
            }
        }

        old_table.bucket(source).mark_split_done();
        self.finish_one(snapshot, host);
    }

    fn merge_pair<H: IndexHost>(&self, target: u64, snapshot: &ResizeSnapshot, host: &H) {
        let old_table = self.table(snapshot.old_version);
        let new_table = self.table(1 - snapshot.old_version);
        let dest = new_table.bucket(target);

        for source in [target, target + snapshot.new_size] {
            for bucket in BucketChain::new(old_table.bucket(source)) {
                for slot in bucket.entries.iter() {
                    let captured = capture(slot);
                    if captured.is_unused()
                        || captured.is_tentative()
                        || !captured.address().is_valid()
                    {
                        continue;
                    }
                    // Two sources may both carry the tag; duplicate
                    // entries are legal and probing walks them all.
                    install_relocated(dest, captured.tag(), captured.address());
                }
            }
        }

        old_table.bucket(target).mark_split_done();
        self.finish_one(snapshot, host);
    }

    fn finish_one<H: IndexHost>(&self, snapshot: &ResizeSnapshot, host: &H) {
        let total = match snapshot.direction {
            ResizeDirection::Grow => snapshot.old_size,
            ResizeDirection::Shrink => snapshot.new_size,
        };
        if self.resize.completed.fetch_add(1, Ordering::AcqRel) + 1 == total {
            self.finish_resize(snapshot, host);
        }
    }

    fn finish_resize<H: IndexHost>(&self, snapshot: &ResizeSnapshot, host: &H) {
        let new_version = 1 - snapshot.old_version;
        self.version.store(new_version, Ordering::Release);
        self.resize.sequence.fetch_add(1, Ordering::AcqRel);

        let callback = self.resize.callback.lock().take();
        if let Some(callback) = callback {
            callback(snapshot.new_size);
        }

        // Straggling operations may still be probing the old table; its
        // release (and the right to start another resize) waits for every
        // session to move past this epoch.
        let retired = RetiredTable {
            table: self.tables[snapshot.old_version as usize].load(Ordering::Acquire),
            slot: &self.tables[snapshot.old_version as usize] as *const AtomicPtr<HashTable>,
            claim: &self.resize.claim as *const AtomicBool,
        };
        host.epoch()
            .bump_and_defer(Box::new(move || retired.release()));
    }
}

/// Take a source slot out of service, returning what it held.
fn capture(slot: &AtomicBucketEntry) -> BucketEntry {
    loop {
        let entry = slot.load(Ordering::Acquire);
        debug_assert!(!entry.is_sentinel());
        if slot.compare_exchange(entry, BucketEntry::SENTINEL).is_ok() {
            return entry;
        }
    }
}

/// Install a relocated `(tag, address)` pair into the target bucket,
/// growing its overflow chain if need be. The target is private to the
/// relocating thread until the bucket's done bit publishes it.
fn install_relocated(dest: &HashBucket, tag: u16, address: Address) {
    let entry = BucketEntry::new(address, tag, false);
    let mut bucket = dest;
    loop {
        for slot in bucket.entries.iter() {
            if slot.load(Ordering::Acquire).is_unused()
                && slot.compare_exchange(BucketEntry::INVALID, entry).is_ok()
            {
                return;
            }
        }
        match bucket.overflow_bucket() {
            Some(next) => bucket = next,
            None => {
                if let Ok(published) = bucket.try_push_overflow(Box::new(HashBucket::new())) {
                    published.entries[0]
                        .compare_exchange(BucketEntry::INVALID, entry)
                        .expect("fresh overflow bucket entry");
                    return;
                }
                // Lost the push; re-read the overflow pointer and continue.
            }
        }
    }
}
