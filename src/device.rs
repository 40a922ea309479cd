//! The device seam the log flushes through.
//!
//! The store only consumes the interface below; the in-memory device that
//! completes every request synchronously is the reference backend. A
//! durable implementation would queue real I/O and report completions
//! through [`Device::try_complete`].

use std::path::PathBuf;

use crate::hlog::Address;
use crate::status::Status;

/// Completion callback for an asynchronous device request: the outcome and
/// the number of bytes transferred.
pub type IoCompletion = Box<dyn FnOnce(Status, usize) + Send>;

pub trait Device: Send + Sync + 'static {
    /// Alignment of log page backing memory.
    fn alignment(&self) -> usize;

    /// The minimum write quantum.
    fn sector_size(&self) -> usize;

    /// Read `dest.len()` bytes from device offset `source`.
    fn read_async(&self, source: u64, dest: &mut [u8], completion: IoCompletion) -> Status;

    /// Write `source` to device offset `dest`.
    fn write_async(&self, source: &[u8], dest: u64, completion: IoCompletion) -> Status;

    /// Drain any finished I/O. Returns whether any completion ran.
    fn try_complete(&self) -> bool;

    /// The log offset the device guarantees is durable. The log never
    /// advances `head` past this.
    fn flushed_until(&self, requested: Address) -> Address;

    /// Where a checkpoint of `version` would live. Only meaningful for
    /// durable devices.
    fn checkpoint_path(&self, version: u32) -> PathBuf;
}

/// The in-memory device: every request succeeds synchronously, nothing is
/// ever pending, and checkpointing is unsupported.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    _base_path: String,
}

impl MemoryDevice {
    /// `base_path` is accepted for interface parity and ignored; pass an
    /// empty string.
    pub fn new(base_path: &str) -> Self {
        Self {
            _base_path: base_path.to_owned(),
        }
    }
}

impl Device for MemoryDevice {
    fn alignment(&self) -> usize {
        64
    }

    fn sector_size(&self) -> usize {
        64
    }

    fn read_async(&self, _source: u64, dest: &mut [u8], completion: IoCompletion) -> Status {
        completion(Status::Ok, dest.len());
        Status::Ok
    }

    fn write_async(&self, source: &[u8], _dest: u64, completion: IoCompletion) -> Status {
        completion(Status::Ok, source.len());
        Status::Ok
    }

    fn try_complete(&self) -> bool {
        false
    }

    fn flushed_until(&self, requested: Address) -> Address {
        requested
    }

    fn checkpoint_path(&self, version: u32) -> PathBuf {
        log::error!("checkpoint path requested (version {version}) on the in-memory device");
        panic!("the in-memory device does not support checkpoints");
    }
}

#[cfg(test)]
mod tests {
    use super::{Device, MemoryDevice};
    use crate::status::Status;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn requests_complete_synchronously() {
        let device = MemoryDevice::new("");
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        let mut buffer = [0u8; 64];
        let status = device.read_async(
            0,
            &mut buffer,
            Box::new(move |status, len| {
                assert_eq!(status, Status::Ok);
                assert_eq!(len, 64);
                flag.store(true, Ordering::SeqCst);
            }),
        );
        assert_eq!(status, Status::Ok);
        assert!(fired.load(Ordering::SeqCst));
        assert!(!device.try_complete());
    }
}
