//! The two-level hash index: a power-of-two table of cache-line buckets
//! mapping key hashes to record-chain heads in the log.
//!
//! Lookups filter on a 14-bit tag before ever touching the log. Inserts use
//! a two-phase tentative protocol so that two threads racing to create an
//! entry for the same tag cannot both succeed. Every entry mutation is a
//! CAS: during a resize, relocated slots are swung to a sentinel value that
//! no CAS expectation can match, so an in-flight update on a stale slot
//! fails and re-routes to the new table instead of being lost.

pub(crate) mod bucket;
pub(crate) mod grow;

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crossbeam_utils::Backoff;
use smallvec::SmallVec;

use crate::context::KeyHash;
use crate::epoch::Epoch;
use crate::hlog::Address;

use self::bucket::{AtomicBucketEntry, BucketChain, BucketEntry, HashBucket, HashTable};
use self::grow::{ResizeDirection, ResizeState};

/// What the index needs from its surroundings: record introspection for
/// chain splitting, and the epoch manager for deferred reclamation.
pub(crate) trait IndexHost {
    fn record_hash(&self, address: Address) -> KeyHash;
    fn record_previous(&self, address: Address) -> Address;
    fn log_head(&self) -> Address;
    fn epoch(&self) -> &Epoch;
}

/// A located bucket entry: the value observed and the slot it lives in,
/// for a later CAS against exactly that observation.
pub(crate) struct FindResult {
    pub(crate) entry: BucketEntry,
    slot: *const AtomicBucketEntry,
}

impl FindResult {
    fn new(entry: BucketEntry, slot: &AtomicBucketEntry) -> Self {
        Self {
            entry,
            slot: slot as *const AtomicBucketEntry,
        }
    }
}

/// Matching entries for one hash. More than one only occurs after a table
/// halving merged two buckets that both carried the tag.
pub(crate) type Candidates = SmallVec<[FindResult; 2]>;

/// Signal that a probe ran into a relocated (sentinel) slot and must be
/// retried against the current table.
struct Relocated;

pub(crate) struct HashIndex {
    /// The resize coordinator flips between these two table slots; the
    /// retired table is released through the epoch queue.
    tables: [AtomicPtr<HashTable>; 2],
    version: AtomicU8,
    pub(crate) resize: ResizeState,
}

impl HashIndex {
    pub(crate) fn new(table_size: u64) -> Self {
        let initial = Box::into_raw(Box::new(HashTable::new(table_size)));
        Self {
            tables: [AtomicPtr::new(initial), AtomicPtr::new(ptr::null_mut())],
            version: AtomicU8::new(0),
            resize: ResizeState::new(),
        }
    }

    pub(crate) fn table(&self, version: u8) -> &HashTable {
        let ptr = self.tables[version as usize].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        // SAFETY: an installed table stays live until the epoch certifies
        // that no operation can still reach it.
        unsafe { &*ptr }
    }

    pub(crate) fn active_version(&self) -> u8 {
        self.version.load(Ordering::Acquire)
    }

    /// Bucket count of the live table.
    pub(crate) fn size(&self) -> u64 {
        self.table(self.active_version()).size()
    }

    /// The table this operation must use, after discharging any resize
    /// obligation for the bucket `hash` maps to.
    fn resolve<H: IndexHost>(&self, hash: KeyHash, host: &H) -> &HashTable {
        loop {
            let sequence = self.resize.sequence();
            if sequence % 2 == 0 {
                return self.table(self.active_version());
            }
            let Some(snapshot) = self.resize.snapshot(sequence) else {
                continue;
            };
            match snapshot.direction {
                ResizeDirection::Grow => {
                    self.ensure_split(hash.bucket_index(snapshot.old_size), &snapshot, host);
                }
                ResizeDirection::Shrink => {
                    self.ensure_merged(hash.bucket_index(snapshot.new_size), &snapshot, host);
                }
            }
            self.help(host, 1);
            if self.resize.sequence() != sequence {
                continue;
            }
            return self.table(1 - snapshot.old_version);
        }
    }

    /// Collect every live entry matching the hash's tag. Empty means the
    /// key cannot be in the store.
    pub(crate) fn find_entry<H: IndexHost>(&self, hash: KeyHash, host: &H) -> Candidates {
        loop {
            let table = self.resolve(hash, host);
            if let Ok(candidates) = Self::scan_matches(table, hash) {
                return candidates;
            }
        }
    }

    /// Like [`find_entry`](Self::find_entry), but guarantees at least one
    /// entry for the tag on return, creating an address-less one if none
    /// existed. The first candidate is where a new record for this hash
    /// gets installed.
    pub(crate) fn find_or_create_entry<H: IndexHost>(
        &self,
        hash: KeyHash,
        host: &H,
    ) -> Candidates {
        let backoff = Backoff::new();
        loop {
            let table = self.resolve(hash, host);
            match self.scan_or_install(table, hash) {
                Ok(candidates) => return candidates,
                Err(Relocated) => backoff.spin(),
            }
        }
    }

    /// Swing `target`'s slot from the observed entry to `new_address`. An
    /// invalid address elides the entry entirely. Failure means the slot
    /// changed underneath the operation, which must re-run its probe.
    pub(crate) fn try_update_entry(
        &self,
        target: &FindResult,
        tag: u16,
        new_address: Address,
    ) -> bool {
        let new_entry = if new_address.is_valid() {
            BucketEntry::new(new_address, tag, false)
        } else {
            BucketEntry::INVALID
        };
        // SAFETY: the slot belongs to a table the current epoch reservation
        // keeps alive.
        let slot = unsafe { &*target.slot };
        slot.compare_exchange(target.entry, new_entry).is_ok()
    }

    fn scan_matches(table: &HashTable, hash: KeyHash) -> Result<Candidates, Relocated> {
        let tag = hash.tag();
        let mut candidates = Candidates::new();
        for bucket in BucketChain::new(table.bucket(hash.bucket_index(table.size()))) {
            for slot in bucket.entries.iter() {
                let entry = slot.load(Ordering::Acquire);
                if entry.is_sentinel() {
                    return Err(Relocated);
                }
                if entry.is_unused() || entry.is_tentative() {
                    continue;
                }
                if entry.tag() == tag {
                    candidates.push(FindResult::new(entry, slot));
                }
            }
        }
        Ok(candidates)
    }

    fn scan_or_install(&self, table: &HashTable, hash: KeyHash) -> Result<Candidates, Relocated> {
        let tag = hash.tag();
        let index = hash.bucket_index(table.size());
        let mut candidates = Candidates::new();
        let mut free: Option<&AtomicBucketEntry> = None;
        let mut last = table.bucket(index);
        for bucket in BucketChain::new(table.bucket(index)) {
            for slot in bucket.entries.iter() {
                let entry = slot.load(Ordering::Acquire);
                if entry.is_sentinel() {
                    return Err(Relocated);
                }
                if entry.is_unused() {
                    if free.is_none() {
                        free = Some(slot);
                    }
                    continue;
                }
                if entry.is_tentative() {
                    continue;
                }
                if entry.tag() == tag {
                    candidates.push(FindResult::new(entry, slot));
                }
            }
            last = bucket;
        }
        if !candidates.is_empty() {
            return Ok(candidates);
        }

        // Phase one: claim a slot tentatively.
        let tentative = BucketEntry::new(Address::INVALID, tag, true);
        let slot: &AtomicBucketEntry = match free {
            Some(slot) => {
                if slot.compare_exchange(BucketEntry::INVALID, tentative).is_err() {
                    return Err(Relocated);
                }
                slot
            }
            None => {
                // The chain is full. A fresh overflow bucket is private
                // until the push publishes it, so its first entry can be
                // claimed without a race.
                let bucket = Box::new(HashBucket::new());
                bucket.entries[0]
                    .compare_exchange(BucketEntry::INVALID, tentative)
                    .expect("fresh overflow bucket entry");
                match last.try_push_overflow(bucket) {
                    Ok(published) => &published.entries[0],
                    Err(_) => return Err(Relocated),
                }
            }
        };

        // Phase two: back off if any other slot claims the same tag,
        // tentatively or not; the retry will either adopt the winner's
        // entry or race again.
        match Self::tag_conflicts(table, index, tag, slot) {
            Ok(false) => {}
            Ok(true) | Err(Relocated) => {
                let _ = slot.compare_exchange(tentative, BucketEntry::INVALID);
                return Err(Relocated);
            }
        }

        let finalized = BucketEntry::new(Address::INVALID, tag, false);
        if slot.compare_exchange(tentative, finalized).is_err() {
            // The bucket was relocated mid-install.
            return Err(Relocated);
        }
        let mut candidates = Candidates::new();
        candidates.push(FindResult::new(finalized, slot));
        Ok(candidates)
    }

    fn tag_conflicts(
        table: &HashTable,
        index: u64,
        tag: u16,
        ours: &AtomicBucketEntry,
    ) -> Result<bool, Relocated> {
        for bucket in BucketChain::new(table.bucket(index)) {
            for slot in bucket.entries.iter() {
                if ptr::eq(slot, ours) {
                    continue;
                }
                let entry = slot.load(Ordering::Acquire);
                if entry.is_sentinel() {
                    return Err(Relocated);
                }
                if !entry.is_unused() && entry.tag() == tag {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl Drop for HashIndex {
    fn drop(&mut self) {
        // Deferred releases have already run (the epoch manager drops
        // first); whatever is still installed belongs to this index.
        for slot in self.tables.iter() {
            let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: no sessions remain; the table is unreachable.
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHost {
        epoch: Epoch,
    }

    impl TestHost {
        fn new() -> Self {
            Self {
                epoch: Epoch::new(),
            }
        }
    }

    impl IndexHost for TestHost {
        fn record_hash(&self, _address: Address) -> KeyHash {
            unreachable!("no resize in these tests")
        }

        fn record_previous(&self, _address: Address) -> Address {
            unreachable!("no resize in these tests")
        }

        fn log_head(&self) -> Address {
            Address::FIRST_VALID
        }

        fn epoch(&self) -> &Epoch {
            &self.epoch
        }
    }

    #[test]
    fn missing_tag_finds_nothing() {
        let host = TestHost::new();
        let index = HashIndex::new(64);
        assert!(index.find_entry(KeyHash::new(0xABCD), &host).is_empty());
    }

    #[test]
    fn created_entry_is_findable_and_updatable() {
        let host = TestHost::new();
        let index = HashIndex::new(64);
        let hash = KeyHash::new(0x7777_0000_0000_0042);

        let created = index.find_or_create_entry(hash, &host);
        assert_eq!(created.len(), 1);
        assert!(!created[0].entry.address().is_valid());

        let address = Address::new(4096);
        assert!(index.try_update_entry(&created[0], hash.tag(), address));
        // A stale expectation no longer matches.
        assert!(!index.try_update_entry(&created[0], hash.tag(), Address::new(8192)));

        let found = index.find_entry(hash, &host);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entry.address(), address);
        assert_eq!(found[0].entry.tag(), hash.tag());
    }

    #[test]
    fn same_bucket_different_tags_coexist() {
        let host = TestHost::new();
        let index = HashIndex::new(1);
        // All hashes land in bucket zero of a one-bucket table; ten
        // distinct tags force an overflow bucket.
        for tag in 0..10u64 {
            let hash = KeyHash::new(tag << 48);
            let created = index.find_or_create_entry(hash, &host);
            assert!(index.try_update_entry(&created[0], hash.tag(), Address::new(64 + tag)));
        }
        for tag in 0..10u64 {
            let hash = KeyHash::new(tag << 48);
            let found = index.find_entry(hash, &host);
            assert_eq!(found.len(), 1, "tag {tag}");
            assert_eq!(found[0].entry.address(), Address::new(64 + tag));
        }
    }

    #[test]
    fn elided_entry_disappears() {
        let host = TestHost::new();
        let index = HashIndex::new(16);
        let hash = KeyHash::new(5);
        let created = index.find_or_create_entry(hash, &host);
        assert!(index.try_update_entry(&created[0], hash.tag(), Address::new(128)));

        let found = index.find_entry(hash, &host);
        assert!(index.try_update_entry(&found[0], hash.tag(), Address::INVALID));
        assert!(index.find_entry(hash, &host).is_empty());
    }
}
