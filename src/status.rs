/// Outcome of a store operation.
///
/// Every public operation returns one of these; none of them unwinds for a
/// condition the caller can act on. `Ok`, `NotFound` and `Pending` are
/// ordinary outcomes, the rest report why an operation could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use]
pub enum Status {
    /// The operation linearised.
    Ok,
    /// A read or delete exhausted the record chain without a key match.
    NotFound,
    /// The operation was parked on the session and will complete through its
    /// callback. Never produced by the in-memory device.
    Pending,
    /// The log tail would exceed the configured capacity.
    OutOfMemory,
    /// A bounded retry budget was exhausted under contention.
    Aborted,
    /// The record chain descended below the log head. Unreachable with the
    /// in-memory device.
    NotInMemory,
    /// All epoch slots are reserved; no further session can start.
    TooManyThreads,
}

impl Status {
    /// Whether the operation reached a final outcome (anything but `Pending`).
    pub fn is_complete(self) -> bool {
        !matches!(self, Status::Pending)
    }
}
