//! Caller-provided schema: key and value types plus the per-operation
//! contexts that carry a key, any operation arguments, and output fields.
//!
//! The store never interprets key or value bytes. It requires a stable
//! 64-bit hash and equality of keys, and a size of values; everything else
//! is expressed through the context hooks below. The hook contract is:
//!
//! * `*_atomic` hooks are only ever invoked on records in the mutable
//!   region, where other threads may be calling the same hook on the same
//!   value concurrently. Such values must synchronise internally (atomics
//!   or a [`AtomicGenLock`](crate::gen_lock::AtomicGenLock)).
//! * Non-atomic hooks (`put`, `rmw_initial`, `rmw_copy`, `get`) are only
//!   invoked on storage no other thread can reach: freshly allocated
//!   records, or records past the safe read-only boundary.

use std::mem;

/// A key's 64-bit hash, with accessors for the pieces the index consumes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KeyHash(u64);

impl KeyHash {
    pub fn new(hash: u64) -> Self {
        Self(hash)
    }

    pub fn control(self) -> u64 {
        self.0
    }

    /// Index of the bucket in a table of `table_size` buckets.
    /// `table_size` must be a power of two.
    pub(crate) fn bucket_index(self, table_size: u64) -> u64 {
        self.0 & (table_size - 1)
    }

    /// The 14 tag bits stored alongside an address in a bucket entry.
    pub(crate) fn tag(self) -> u16 {
        ((self.0 >> 48) & ((1 << 14) - 1)) as u16
    }

    /// The hash bit that decides which half of a doubled table this key
    /// belongs to. `old_size` must be a power of two.
    pub(crate) fn split_side(self, old_size: u64) -> bool {
        self.0 & old_size != 0
    }
}

/// A key stored inline in the record log.
///
/// Keys are copied into log memory and compared in place, so they must be
/// `Copy` (no heap indirection, no destructor) and carry a stable hash.
pub trait Key: Copy + Eq + Send + Sync + 'static {
    fn key_hash(&self) -> KeyHash;
}

/// A value stored inline in the record log.
///
/// # Safety
///
/// Implementations must uphold two contracts the store cannot check:
///
/// * The all-zero bit pattern must be a valid `Self`. Non-atomic hooks
///   receive `&mut Self` over freshly allocated, zero-backed log memory.
/// * `Self` must not implement `Drop` (log memory is reclaimed without
///   running destructors), and must not own memory outside the record.
///
/// Variable-length values place their trailing bytes immediately after
/// `Self` in the record; `size` reports the full length including them.
pub unsafe trait Value: Sized + Send + Sync + 'static {
    /// Size of this value in bytes, including any trailing buffer.
    fn size(&self) -> u32 {
        mem::size_of::<Self>() as u32
    }
}

/// Context for a point lookup.
pub trait ReadContext: Clone + Send + 'static {
    type Key: Key;
    type Value: Value;

    fn key(&self) -> &Self::Key;

    /// Read a record no concurrent writer can touch (immutable region).
    fn get(&mut self, value: &Self::Value);

    /// Read a record that concurrent writers may be updating in place.
    fn get_atomic(&mut self, value: &Self::Value);
}

/// Context for a blind write.
pub trait UpsertContext: Clone + Send + 'static {
    type Key: Key;
    type Value: Value;

    fn key(&self) -> &Self::Key;

    /// Size of the value this upsert writes, including trailing bytes.
    fn value_size(&self) -> u32;

    /// Write into a freshly allocated record no other thread can reach.
    fn put(&mut self, value: &mut Self::Value);

    /// Write into a live mutable record. Return `false` to demand a
    /// replacement record instead (the value grew, or the record has been
    /// superseded); the store then takes the append path.
    fn put_atomic(&mut self, value: &Self::Value) -> bool;
}

/// Context for a read-modify-write.
pub trait RmwContext: Clone + Send + 'static {
    type Key: Key;
    type Value: Value;

    fn key(&self) -> &Self::Key;

    /// Size of the value an initial insert or a copy-update produces.
    fn value_size(&self) -> u32;

    /// Produce the initial value when the key is absent.
    fn rmw_initial(&mut self, value: &mut Self::Value);

    /// Read-copy-update: derive the new value from the old record.
    fn rmw_copy(&mut self, old_value: &Self::Value, value: &mut Self::Value);

    /// Modify a live mutable record in place. Return `false` to demand
    /// the copy-update path instead.
    fn rmw_atomic(&mut self, value: &Self::Value) -> bool;
}

/// Context for a delete.
pub trait DeleteContext: Clone + Send + 'static {
    type Key: Key;
    type Value: Value;

    fn key(&self) -> &Self::Key;

    /// Size of the tombstone record's value region. The default reserves
    /// space for the value header only.
    fn value_size(&self) -> u32 {
        mem::size_of::<Self::Value>() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::KeyHash;

    #[test]
    fn tag_takes_high_bits() {
        let hash = KeyHash::new(0x2ABC_0000_0000_1234);
        assert_eq!(hash.bucket_index(1 << 8), 0x34);
        assert_eq!(hash.tag(), 0x2ABC);
    }

    #[test]
    fn split_side_selects_doubling_bit() {
        let old_size = 1 << 8;
        assert!(!KeyHash::new(0x0FF).split_side(old_size));
        assert!(KeyHash::new(0x1FF).split_side(old_size));
    }
}
