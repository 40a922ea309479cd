//! In-log record layout: a packed atomic header followed by the inline key
//! and value.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::{Key, Value};
use crate::hlog::address::{Address, MAX_ADDRESS};

const VERSION_SHIFT: u32 = 48;
const VERSION_MASK: u64 = (1 << 13) - 1;
const INVALID_BIT: u64 = 1 << 61;
const TOMBSTONE_BIT: u64 = 1 << 62;

/// A record header packed into one word: the previous address of the hash
/// chain (48 bits), the checkpoint version the record was written under
/// (13 bits), and the invalid and tombstone bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct RecordInfo(u64);

impl RecordInfo {
    pub(crate) fn new(previous: Address, version: u32, tombstone: bool) -> Self {
        let mut control = previous.control() & MAX_ADDRESS;
        control |= (u64::from(version) & VERSION_MASK) << VERSION_SHIFT;
        if tombstone {
            control |= TOMBSTONE_BIT;
        }
        RecordInfo(control)
    }

    pub(crate) fn previous_address(self) -> Address {
        Address::new(self.0 & MAX_ADDRESS)
    }

    pub(crate) fn checkpoint_version(self) -> u32 {
        ((self.0 >> VERSION_SHIFT) & VERSION_MASK) as u32
    }

    pub(crate) fn is_invalid(self) -> bool {
        self.0 & INVALID_BIT != 0
    }

    pub(crate) fn is_tombstone(self) -> bool {
        self.0 & TOMBSTONE_BIT != 0
    }
}

/// The shared, atomically updated form of [`RecordInfo`].
#[repr(transparent)]
pub(crate) struct AtomicRecordInfo(AtomicU64);

impl AtomicRecordInfo {
    pub(crate) fn load(&self, order: Ordering) -> RecordInfo {
        RecordInfo(self.0.load(order))
    }

    /// Initialise the header of a record no other thread can reach yet.
    pub(crate) fn initialize(&self, info: RecordInfo) {
        self.0.store(info.0, Ordering::Release);
    }

    /// Mark a record dead after a lost install race. The record stays in
    /// the log but chain walks skip it.
    pub(crate) fn set_invalid(&self) {
        self.0.fetch_or(INVALID_BIT, Ordering::AcqRel);
    }

    /// Turn a live record into a tombstone in place.
    pub(crate) fn set_tombstone(&self) {
        self.0.fetch_or(TOMBSTONE_BIT, Ordering::AcqRel);
    }
}

/// The unit of log occupancy: header, inline key, inline value. A
/// variable-length value's trailing bytes sit immediately after `value`,
/// inside the same allocation.
#[repr(C)]
pub(crate) struct Record<K, V> {
    pub(crate) info: AtomicRecordInfo,
    pub(crate) key: K,
    pub(crate) value: V,
}

impl<K: Key, V: Value> Record<K, V> {
    /// Byte offset of the value within the record.
    pub(crate) fn value_offset() -> u32 {
        mem::offset_of!(Record<K, V>, value) as u32
    }

    /// Alignment every record of this schema needs. The allocator hands
    /// out addresses aligned to this because all allocation sizes are
    /// multiples of it.
    pub(crate) fn alignment() -> usize {
        mem::align_of::<Record<K, V>>()
    }

    /// Total allocation size for a record holding `value_size` bytes of
    /// value (header included), rounded so that consecutive records stay
    /// aligned.
    pub(crate) fn alloc_size(value_size: u32) -> u32 {
        let end = Self::value_offset() + value_size.max(mem::size_of::<V>() as u32);
        let align = Self::alignment() as u32;
        (end + align - 1) & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::KeyHash;

    #[derive(Clone, Copy, PartialEq, Eq)]
    struct K8(u64);

    impl Key for K8 {
        fn key_hash(&self) -> KeyHash {
            KeyHash::new(self.0)
        }
    }

    #[repr(C, align(16))]
    struct V16 {
        _len: u32,
    }

    unsafe impl Value for V16 {}

    #[test]
    fn header_packs_and_unpacks() {
        let info = RecordInfo::new(Address::new(0x1234_5678), 7, false);
        assert_eq!(info.previous_address(), Address::new(0x1234_5678));
        assert_eq!(info.checkpoint_version(), 7);
        assert!(!info.is_tombstone());
        assert!(!info.is_invalid());

        let tomb = RecordInfo::new(Address::INVALID, 0, true);
        assert!(tomb.is_tombstone());
        assert_eq!(tomb.previous_address(), Address::INVALID);
    }

    #[test]
    fn invalid_bit_survives_header_updates() {
        let atomic = AtomicRecordInfo(AtomicU64::new(0));
        atomic.initialize(RecordInfo::new(Address::new(64), 1, false));
        atomic.set_invalid();
        let info = atomic.load(Ordering::Acquire);
        assert!(info.is_invalid());
        assert_eq!(info.previous_address(), Address::new(64));
    }

    #[test]
    fn value_respects_declared_alignment() {
        // Header (8) + key (8) already leaves the value 16-aligned.
        assert_eq!(Record::<K8, V16>::value_offset(), 16);
        assert_eq!(Record::<K8, V16>::alignment(), 16);
        // A 5-byte trailing buffer rounds the allocation to the next
        // 16-byte boundary.
        let size = Record::<K8, V16>::alloc_size(mem::size_of::<V16>() as u32 + 5);
        assert_eq!(size % 16, 0);
        assert!(size >= 16 + 4 + 5);
    }
}
