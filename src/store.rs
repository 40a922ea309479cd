//! The store: construction, the operation state machine, and the log
//! boundary maintenance that everything else hangs off.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::context::{DeleteContext, Key, KeyHash, ReadContext, RmwContext, UpsertContext, Value};
use crate::device::{Device, MemoryDevice};
use crate::epoch::{Epoch, MAX_THREADS};
use crate::error::ConfigError;
use crate::hlog::log::HybridLog;
use crate::hlog::record::{Record, RecordInfo};
use crate::hlog::{Address, PAGE_SIZE};
use crate::index::{Candidates, FindResult, HashIndex, IndexHost};
use crate::session::Session;
use crate::status::Status;

/// CAS retries an operation may burn before giving up with `Aborted`.
/// Generous enough that reaching it means livelock, not contention.
pub(crate) const RETRY_BUDGET: u32 = 100_000;

/// A concurrent, latch-free, in-memory key-value store.
///
/// The store is shared by reference (or by cheap clone) across client
/// threads; each thread interacts with it through its own
/// [`Session`](crate::Session).
pub struct Store<K: Key, V: Value, D: Device = MemoryDevice> {
    inner: Arc<StoreInner<K, V, D>>,
}

impl<K: Key, V: Value> Store<K, V, MemoryDevice> {
    /// Build an in-memory store. `table_size` is rounded up to the next
    /// power of two; `log_size_bytes` must be a power of two holding at
    /// least two pages. `base_path` is accepted for interface parity with
    /// durable devices and may be empty.
    pub fn new(
        table_size: u64,
        log_size_bytes: u64,
        base_path: &str,
    ) -> Result<Self, ConfigError> {
        Self::with_device(table_size, log_size_bytes, MemoryDevice::new(base_path))
    }
}

impl<K: Key, V: Value, D: Device> Store<K, V, D> {
    /// Build a store on a caller-supplied device.
    pub fn with_device(
        table_size: u64,
        log_size_bytes: u64,
        device: D,
    ) -> Result<Self, ConfigError> {
        if table_size == 0 {
            return Err(ConfigError::TableSize(table_size));
        }
        if !log_size_bytes.is_power_of_two() || log_size_bytes < 2 * PAGE_SIZE {
            return Err(ConfigError::LogSize(log_size_bytes));
        }
        if log_size_bytes > 1 << 48 {
            return Err(ConfigError::AddressSpace(log_size_bytes));
        }
        if Record::<K, V>::alignment() > device.alignment() {
            return Err(ConfigError::RecordAlignment(Record::<K, V>::alignment()));
        }

        let log = HybridLog::new(log_size_bytes, device.alignment(), PAGE_SIZE);
        let inner = StoreInner {
            epoch: Epoch::new(),
            index: HashIndex::new(table_size.next_power_of_two()),
            log,
            device,
            version: AtomicU32::new(0),
            _schema: PhantomData,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Reserve an epoch slot and begin a session. The epoch table bounds
    /// how many sessions can be active at once.
    pub fn start_session(&self) -> Result<Session<K, V, D>, Status> {
        match self.inner.epoch.acquire() {
            Some(handle) => Ok(Session::new(Arc::clone(&self.inner), handle)),
            None => {
                log::error!("session limit reached: all {MAX_THREADS} epoch slots are reserved");
                Err(Status::TooManyThreads)
            }
        }
    }

    /// Current bucket count of the hash index.
    pub fn index_size(&self) -> u64 {
        self.inner.index.size()
    }

    /// The log offset below which records are unreachable.
    pub fn head_address(&self) -> Address {
        self.inner.log.head_address()
    }

    /// The certified read-only boundary.
    pub fn safe_read_only_address(&self) -> Address {
        self.inner.log.safe_read_only_address()
    }

    /// The boundary above which records are updated in place.
    pub fn read_only_address(&self) -> Address {
        self.inner.log.read_only_address()
    }

    /// The next log offset to be allocated.
    pub fn tail_address(&self) -> Address {
        self.inner.log.tail_address()
    }

    /// Seal the log up to the current tail: everything allocated so far
    /// becomes immutable once every session has observed the shift (the
    /// `safe_read_only` bump and the trailing `head` advance ride the
    /// epoch queue). Returns the sealed offset.
    pub fn shift_read_only_to_tail(&self) -> Address {
        let tail = self.inner.log.tail_address();
        if self.inner.log.try_shift_read_only(tail) {
            let weak = Arc::downgrade(&self.inner);
            self.inner.epoch.bump_and_defer(Box::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                inner.log.shift_safe_read_only(tail);
                let flushed = inner.device.flushed_until(tail);
                let weak = Arc::downgrade(&inner);
                inner.epoch.bump_and_defer(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.log.shift_head(flushed);
                    }
                }));
            }));
        }
        tail
    }
}

impl<K: Key, V: Value, D: Device> Clone for Store<K, V, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key, V: Value, D: Device> std::fmt::Debug for Store<K, V, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("index_size", &self.index_size())
            .field("tail", &self.tail_address())
            .finish_non_exhaustive()
    }
}

/// Everything sessions share. Field order matters for drop: the epoch
/// manager goes first so its queued releases run while the index and log
/// are still alive.
pub(crate) struct StoreInner<K: Key, V: Value, D: Device> {
    pub(crate) epoch: Epoch,
    pub(crate) index: HashIndex,
    pub(crate) log: HybridLog,
    pub(crate) device: D,
    version: AtomicU32,
    _schema: PhantomData<fn() -> (K, V)>,
}

/// Result of Phase A: where the key lives, if anywhere reachable.
enum Locate<'a> {
    /// The key's newest record, and the entry whose CAS linearises any
    /// replacement of it.
    Found {
        target: &'a FindResult,
        address: Address,
        tombstone: bool,
    },
    /// No record for the key above the log head.
    Missing,
    /// The chain descended below the head before the key was ruled out.
    BelowHead,
}

enum Install {
    Installed,
    Retry,
    Full,
}

impl<K: Key, V: Value, D: Device> StoreInner<K, V, D> {
    fn checkpoint_version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// SAFETY: `address` must be at or above `head` for the duration of
    /// the caller's epoch reservation.
    unsafe fn record_at(&self, address: Address) -> &Record<K, V> {
        &*(self.log.at_unchecked(address) as *const Record<K, V>)
    }

    /// Phase A: walk each candidate chain for the newest record carrying
    /// `key`.
    fn locate<'a>(&self, key: &K, candidates: &'a Candidates) -> Locate<'a> {
        for candidate in candidates {
            let mut address = candidate.entry.address();
            while address.is_valid() {
                let Ok(ptr) = self.log.at(address) else {
                    return Locate::BelowHead;
                };
                // SAFETY: `at` verified the address is still reachable
                // under our epoch reservation.
                let record = unsafe { &*(ptr as *const Record<K, V>) };
                let info = record.info.load(Ordering::Acquire);
                if !info.is_invalid() && record.key == *key {
                    return Locate::Found {
                        target: candidate,
                        address,
                        tombstone: info.is_tombstone(),
                    };
                }
                address = info.previous_address();
            }
        }
        Locate::Missing
    }

    /// Phase C: append a record over `target`'s chain and CAS it in.
    fn install_record(
        &self,
        key: &K,
        hash: KeyHash,
        value_size: u32,
        target: &FindResult,
        tombstone: bool,
        fill: impl FnOnce(&mut V),
    ) -> Install {
        let size = Record::<K, V>::alloc_size(value_size);
        let Some(address) = self.log.allocate(size) else {
            return Install::Full;
        };
        let record = self.log.at_unchecked(address) as *mut Record<K, V>;
        // SAFETY: freshly reserved, zero-backed log memory that no other
        // thread can reach until the index CAS below publishes it.
        unsafe {
            (*record).info.initialize(RecordInfo::new(
                target.entry.address(),
                self.checkpoint_version(),
                tombstone,
            ));
            ptr::addr_of_mut!((*record).key).write(*key);
            fill(&mut (*record).value);
        }
        if self.index.try_update_entry(target, hash.tag(), address) {
            Install::Installed
        } else {
            // Lost the publish race; the record stays dead in the log.
            // SAFETY: the record is still private to this thread.
            unsafe { (*record).info.set_invalid() };
            Install::Retry
        }
    }

    pub(crate) fn internal_read<C>(&self, context: &mut C) -> Status
    where
        C: ReadContext<Key = K, Value = V>,
    {
        let hash = context.key().key_hash();
        let candidates = self.index.find_entry(hash, self);
        if candidates.is_empty() {
            return Status::NotFound;
        }
        match self.locate(context.key(), &candidates) {
            Locate::Found { tombstone: true, .. } => Status::NotFound,
            Locate::Found { address, .. } => {
                let safe_read_only = self.log.safe_read_only_address();
                // SAFETY: located at or above head under our epoch.
                let record = unsafe { self.record_at(address) };
                if address >= safe_read_only {
                    // The record may still move under a concurrent
                    // in-place update.
                    context.get_atomic(&record.value);
                } else {
                    context.get(&record.value);
                }
                Status::Ok
            }
            Locate::Missing => Status::NotFound,
            Locate::BelowHead => Status::NotInMemory,
        }
    }

    pub(crate) fn internal_upsert<C>(&self, context: &mut C) -> Status
    where
        C: UpsertContext<Key = K, Value = V>,
    {
        let key = *context.key();
        let hash = key.key_hash();
        let mut budget = RETRY_BUDGET;
        loop {
            if budget == 0 {
                return Status::Aborted;
            }
            budget -= 1;

            let candidates = self.index.find_or_create_entry(hash, self);
            let read_only = self.log.read_only_address();
            let outcome = match self.locate(&key, &candidates) {
                Locate::Found {
                    target,
                    address,
                    tombstone: false,
                } if address >= read_only => {
                    // SAFETY: mutable-region record under our epoch.
                    let record = unsafe { self.record_at(address) };
                    if context.put_atomic(&record.value) {
                        return Status::Ok;
                    }
                    // The value outgrew the record (or the record was
                    // superseded); fall through to the append path.
                    self.install_record(&key, hash, context.value_size(), target, false, |value| {
                        context.put(value)
                    })
                }
                Locate::Found { target, .. } => {
                    // Read-only region or tombstone: blind-write a fresh
                    // record over the chain.
                    self.install_record(&key, hash, context.value_size(), target, false, |value| {
                        context.put(value)
                    })
                }
                // An upsert needs nothing from the old value, so a chain
                // that descends below head is the same as a miss.
                Locate::Missing | Locate::BelowHead => {
                    let target = &candidates[0];
                    self.install_record(&key, hash, context.value_size(), target, false, |value| {
                        context.put(value)
                    })
                }
            };
            match outcome {
                Install::Installed => return Status::Ok,
                Install::Retry => continue,
                Install::Full => return Status::OutOfMemory,
            }
        }
    }

    pub(crate) fn internal_rmw<C>(&self, context: &mut C) -> Status
    where
        C: RmwContext<Key = K, Value = V>,
    {
        let key = *context.key();
        let hash = key.key_hash();
        let mut budget = RETRY_BUDGET;
        loop {
            if budget == 0 {
                return Status::Aborted;
            }
            budget -= 1;

            let candidates = self.index.find_or_create_entry(hash, self);
            let read_only = self.log.read_only_address();
            let outcome = match self.locate(&key, &candidates) {
                Locate::Found {
                    target,
                    address,
                    tombstone: false,
                } => {
                    // SAFETY: located at or above head under our epoch.
                    let record = unsafe { self.record_at(address) };
                    if address >= read_only {
                        if context.rmw_atomic(&record.value) {
                            return Status::Ok;
                        }
                        // Demanded a replacement: fall through.
                    }
                    // Below the read-only boundary (or refused in place):
                    // read-copy-update onto a fresh record.
                    let old_value = &record.value;
                    self.install_record(&key, hash, context.value_size(), target, false, |value| {
                        context.rmw_copy(old_value, value)
                    })
                }
                Locate::Found {
                    target,
                    tombstone: true,
                    ..
                } => {
                    // The key was deleted; restart from the initial value.
                    self.install_record(&key, hash, context.value_size(), target, false, |value| {
                        context.rmw_initial(value)
                    })
                }
                Locate::Missing => {
                    let target = &candidates[0];
                    self.install_record(&key, hash, context.value_size(), target, false, |value| {
                        context.rmw_initial(value)
                    })
                }
                // The old value may only exist below head; without the
                // device the modification cannot proceed.
                Locate::BelowHead => return Status::NotInMemory,
            };
            match outcome {
                Install::Installed => return Status::Ok,
                Install::Retry => continue,
                Install::Full => return Status::OutOfMemory,
            }
        }
    }

    pub(crate) fn internal_delete<C>(&self, context: &mut C) -> Status
    where
        C: DeleteContext<Key = K, Value = V>,
    {
        let key = *context.key();
        let hash = key.key_hash();
        let mut budget = RETRY_BUDGET;
        loop {
            if budget == 0 {
                return Status::Aborted;
            }
            budget -= 1;

            let candidates = self.index.find_entry(hash, self);
            if candidates.is_empty() {
                return Status::NotFound;
            }
            let read_only = self.log.read_only_address();
            let outcome = match self.locate(&key, &candidates) {
                Locate::Found {
                    tombstone: true, ..
                } => return Status::NotFound,
                Locate::Found { target, address, .. } if address >= read_only => {
                    // SAFETY: mutable-region record under our epoch.
                    let record = unsafe { self.record_at(address) };
                    record.info.set_tombstone();
                    // Elide the entry when this record is the whole chain.
                    if target.entry.address() == address
                        && !record
                            .info
                            .load(Ordering::Acquire)
                            .previous_address()
                            .is_valid()
                    {
                        let _ = self.index.try_update_entry(target, hash.tag(), Address::INVALID);
                    }
                    return Status::Ok;
                }
                Locate::Found { target, .. } => {
                    // Read-only region: mask the chain with a tombstone
                    // record.
                    self.install_record(&key, hash, context.value_size(), target, true, |_| {})
                }
                Locate::Missing => return Status::NotFound,
                Locate::BelowHead => return Status::NotInMemory,
            };
            match outcome {
                Install::Installed => return Status::Ok,
                Install::Retry => continue,
                Install::Full => return Status::OutOfMemory,
            }
        }
    }
}

impl<K: Key, V: Value, D: Device> IndexHost for StoreInner<K, V, D> {
    fn record_hash(&self, address: Address) -> KeyHash {
        // SAFETY: resize walks only visit addresses at or above head.
        let record = unsafe { self.record_at(address) };
        record.key.key_hash()
    }

    fn record_previous(&self, address: Address) -> Address {
        // SAFETY: as above.
        let record = unsafe { self.record_at(address) };
        record.info.load(Ordering::Acquire).previous_address()
    }

    fn log_head(&self) -> Address {
        self.log.head_address()
    }

    fn epoch(&self) -> &Epoch {
        &self.epoch
    }
}
