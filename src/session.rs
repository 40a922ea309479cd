//! Per-thread sessions: operation dispatch, the epoch refresh cadence, and
//! the pending-operation queue.

use std::sync::Arc;

use smallvec::SmallVec;
use uuid::Uuid;

use crate::context::{DeleteContext, Key, ReadContext, RmwContext, UpsertContext, Value};
use crate::device::{Device, MemoryDevice};
use crate::epoch::EpochHandle;
use crate::index::grow::{ResizeDirection, HELP_CHUNK};
use crate::status::Status;
use crate::store::StoreInner;

/// Operations between automatic epoch refreshes.
const REFRESH_INTERVAL: u32 = 64;

/// Callback invoked when an operation that went pending completes. The
/// in-memory device completes everything synchronously, so it never fires
/// there.
pub type OpCallback<C> = fn(Box<C>, Status);

/// A per-thread handle onto the store.
///
/// A session owns an epoch reservation, a serial-number sequence, and a
/// queue of parked operations. It belongs to exactly one thread at a time;
/// two threads operating concurrently need two sessions. Dropping the
/// session (or calling [`stop`](Session::stop)) drains the queue and
/// releases the reservation.
pub struct Session<K: Key, V: Value, D: Device = MemoryDevice> {
    inner: Arc<StoreInner<K, V, D>>,
    handle: Option<EpochHandle>,
    guid: Uuid,
    serial: u64,
    version: u32,
    ops_since_refresh: u32,
    pending: SmallVec<[Box<dyn PendingOp<K, V, D>>; 4]>,
}

impl<K: Key, V: Value, D: Device> Session<K, V, D> {
    pub(crate) fn new(inner: Arc<StoreInner<K, V, D>>, handle: EpochHandle) -> Self {
        Self {
            inner,
            handle: Some(handle),
            guid: Uuid::new_v4(),
            serial: 0,
            version: 0,
            ops_since_refresh: 0,
            pending: SmallVec::new(),
        }
    }

    /// Unique identifier of this session.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// The serial number of the most recent operation.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The checkpoint version this session is operating under.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether any operation is parked on this session.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Re-reserve the current epoch, run any deferred work that became
    /// safe, help an in-flight index resize along, and retry parked
    /// operations.
    pub fn refresh(&mut self) {
        self.ops_since_refresh = 0;
        if let Some(handle) = &self.handle {
            self.inner.epoch.refresh(handle);
        }
        self.inner.index.help(&*self.inner, HELP_CHUNK);
        self.retry_pending();
    }

    /// Point lookup. `callback` fires only if the operation goes pending.
    pub fn read<C>(&mut self, context: &mut C, callback: OpCallback<C>, serial: u64) -> Status
    where
        C: ReadContext<Key = K, Value = V>,
    {
        self.tick(serial);
        let status = self.inner.internal_read(context);
        if status == Status::Pending {
            self.park(PendingRead {
                context: Box::new(context.clone()),
                callback,
            });
        }
        status
    }

    /// Blind write.
    pub fn upsert<C>(&mut self, context: &mut C, callback: OpCallback<C>, serial: u64) -> Status
    where
        C: UpsertContext<Key = K, Value = V>,
    {
        self.tick(serial);
        let status = self.inner.internal_upsert(context);
        if status == Status::Pending {
            self.park(PendingUpsert {
                context: Box::new(context.clone()),
                callback,
            });
        }
        status
    }

    /// Read-modify-write. Inserts the initial value when the key is
    /// absent, so it never reports `NotFound`.
    pub fn rmw<C>(&mut self, context: &mut C, callback: OpCallback<C>, serial: u64) -> Status
    where
        C: RmwContext<Key = K, Value = V>,
    {
        self.tick(serial);
        let status = self.inner.internal_rmw(context);
        if status == Status::Pending {
            self.park(PendingRmw {
                context: Box::new(context.clone()),
                callback,
            });
        }
        status
    }

    /// Delete. Mutable records are tombstoned in place; older records are
    /// masked by an appended tombstone.
    pub fn delete<C>(&mut self, context: &mut C, callback: OpCallback<C>, serial: u64) -> Status
    where
        C: DeleteContext<Key = K, Value = V>,
    {
        self.tick(serial);
        let status = self.inner.internal_delete(context);
        if status == Status::Pending {
            self.park(PendingDelete {
                context: Box::new(context.clone()),
                callback,
            });
        }
        status
    }

    /// Double the hash table. `callback` receives the new bucket count
    /// once every bucket has been split. `Aborted` means a resize is
    /// already in flight.
    pub fn grow_index(&mut self, callback: impl FnOnce(u64) + Send + 'static) -> Status {
        self.inner
            .index
            .start_resize(ResizeDirection::Grow, Box::new(callback), &*self.inner)
    }

    /// Halve the hash table; the mirror image of
    /// [`grow_index`](Session::grow_index).
    pub fn shrink_index(&mut self, callback: impl FnOnce(u64) + Send + 'static) -> Status {
        self.inner
            .index
            .start_resize(ResizeDirection::Shrink, Box::new(callback), &*self.inner)
    }

    /// Drain device completions and retry parked operations. Returns
    /// whether the pending queue is empty afterwards. With `wait` the
    /// session keeps refreshing until it is.
    pub fn try_complete_pending(&mut self, wait: bool) -> bool {
        loop {
            self.inner.device.try_complete();
            self.retry_pending();
            if self.pending.is_empty() {
                return true;
            }
            if !wait {
                return false;
            }
            self.refresh();
        }
    }

    /// Drain pending work and release the epoch reservation.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn tick(&mut self, serial: u64) {
        self.serial = serial;
        self.ops_since_refresh += 1;
        if self.ops_since_refresh >= REFRESH_INTERVAL {
            self.refresh();
        }
    }

    fn park<P>(&mut self, op: P)
    where
        P: PendingOp<K, V, D> + 'static,
    {
        self.pending.push(Box::new(op));
    }

    fn retry_pending(&mut self) {
        let mut index = 0;
        while index < self.pending.len() {
            let status = self.pending[index].retry(&self.inner);
            if status.is_complete() {
                let op = self.pending.swap_remove(index);
                op.complete(status);
            } else {
                index += 1;
            }
        }
    }

    fn shutdown(&mut self) {
        if self.handle.is_none() {
            return;
        }
        let _ = self.try_complete_pending(true);
        if let Some(handle) = self.handle.take() {
            self.inner.epoch.release(handle);
        }
    }
}

impl<K: Key, V: Value, D: Device> Drop for Session<K, V, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<K: Key, V: Value, D: Device> std::fmt::Debug for Session<K, V, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("guid", &self.guid)
            .field("serial", &self.serial)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// A parked operation: the deep-copied caller context plus its completion
/// callback. The copy into engine-owned storage happens exactly once, at
/// the moment the operation parks.
trait PendingOp<K: Key, V: Value, D: Device>: Send {
    fn retry(&mut self, store: &StoreInner<K, V, D>) -> Status;
    fn complete(self: Box<Self>, status: Status);
}

struct PendingRead<C: ReadContext> {
    context: Box<C>,
    callback: OpCallback<C>,
}

impl<K, V, D, C> PendingOp<K, V, D> for PendingRead<C>
where
    K: Key,
    V: Value,
    D: Device,
    C: ReadContext<Key = K, Value = V>,
{
    fn retry(&mut self, store: &StoreInner<K, V, D>) -> Status {
        store.internal_read(&mut *self.context)
    }

    fn complete(self: Box<Self>, status: Status) {
        (self.callback)(self.context, status);
    }
}

struct PendingUpsert<C: UpsertContext> {
    context: Box<C>,
    callback: OpCallback<C>,
}

impl<K, V, D, C> PendingOp<K, V, D> for PendingUpsert<C>
where
    K: Key,
    V: Value,
    D: Device,
    C: UpsertContext<Key = K, Value = V>,
{
    fn retry(&mut self, store: &StoreInner<K, V, D>) -> Status {
        store.internal_upsert(&mut *self.context)
    }

    fn complete(self: Box<Self>, status: Status) {
        (self.callback)(self.context, status);
    }
}

struct PendingRmw<C: RmwContext> {
    context: Box<C>,
    callback: OpCallback<C>,
}

impl<K, V, D, C> PendingOp<K, V, D> for PendingRmw<C>
where
    K: Key,
    V: Value,
    D: Device,
    C: RmwContext<Key = K, Value = V>,
{
    fn retry(&mut self, store: &StoreInner<K, V, D>) -> Status {
        store.internal_rmw(&mut *self.context)
    }

    fn complete(self: Box<Self>, status: Status) {
        (self.callback)(self.context, status);
    }
}

struct PendingDelete<C: DeleteContext> {
    context: Box<C>,
    callback: OpCallback<C>,
}

impl<K, V, D, C> PendingOp<K, V, D> for PendingDelete<C>
where
    K: Key,
    V: Value,
    D: Device,
    C: DeleteContext<Key = K, Value = V>,
{
    fn retry(&mut self, store: &StoreInner<K, V, D>) -> Status {
        store.internal_delete(&mut *self.context)
    }

    fn complete(self: Box<Self>, status: Status) {
        (self.callback)(self.context, status);
    }
}
