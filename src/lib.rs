#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Siphon is a concurrent, latch-free, in-memory key-value store.
//!
//! Records live in an append-only hybrid log addressed by 48-bit logical
//! offsets; a two-level hash index maps key hashes to per-key record
//! chains. Records above the log's read-only boundary are updated in
//! place through caller-supplied atomic hooks; older records are updated
//! by append-then-relink. Sessions coordinate reclamation and structural
//! changes (such as hash-table resizing) through an epoch protocol, so no
//! operation ever takes a lock.
//!
//! Keys and values are caller-defined: implement [`Key`] and [`Value`]
//! for the stored types and the per-operation context traits
//! ([`ReadContext`], [`UpsertContext`], [`RmwContext`], [`DeleteContext`])
//! for the schema's access hooks. The store never interprets key or value
//! bytes.
//!
//! ```
//! use siphon::{Key, KeyHash, ReadContext, Status, Store, UpsertContext, Value};
//! use std::hash::{DefaultHasher, Hash, Hasher};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Clone, Copy, PartialEq, Eq)]
//! struct Id(u64);
//!
//! impl Key for Id {
//!     fn key_hash(&self) -> KeyHash {
//!         let mut hasher = DefaultHasher::new();
//!         self.0.hash(&mut hasher);
//!         KeyHash::new(hasher.finish())
//!     }
//! }
//!
//! #[repr(transparent)]
//! struct Counter(AtomicU64);
//!
//! // SAFETY: zero-initialisable, no destructor, fixed size.
//! unsafe impl Value for Counter {}
//!
//! #[derive(Clone)]
//! struct Set(Id, u64);
//!
//! impl UpsertContext for Set {
//!     type Key = Id;
//!     type Value = Counter;
//!
//!     fn key(&self) -> &Id {
//!         &self.0
//!     }
//!
//!     fn value_size(&self) -> u32 {
//!         std::mem::size_of::<Counter>() as u32
//!     }
//!
//!     fn put(&mut self, value: &mut Counter) {
//!         *value.0.get_mut() = self.1;
//!     }
//!
//!     fn put_atomic(&mut self, value: &Counter) -> bool {
//!         value.0.store(self.1, Ordering::Relaxed);
//!         true
//!     }
//! }
//!
//! #[derive(Clone)]
//! struct Get(Id, u64);
//!
//! impl ReadContext for Get {
//!     type Key = Id;
//!     type Value = Counter;
//!
//!     fn key(&self) -> &Id {
//!         &self.0
//!     }
//!
//!     fn get(&mut self, value: &Counter) {
//!         self.1 = value.0.load(Ordering::Relaxed);
//!     }
//!
//!     fn get_atomic(&mut self, value: &Counter) {
//!         self.1 = value.0.load(Ordering::Relaxed);
//!     }
//! }
//!
//! let store = Store::<Id, Counter>::new(128, 1 << 26, "").unwrap();
//! let mut session = store.start_session().unwrap();
//!
//! let mut set = Set(Id(7), 23);
//! assert_eq!(session.upsert(&mut set, |_, _| (), 1), Status::Ok);
//!
//! let mut get = Get(Id(7), 0);
//! assert_eq!(session.read(&mut get, |_, _| (), 2), Status::Ok);
//! assert_eq!(get.1, 23);
//! ```

mod context;
mod device;
mod epoch;
mod error;
mod hlog;
mod index;
mod session;
mod status;
mod store;

pub mod gen_lock;

pub use context::{DeleteContext, Key, KeyHash, ReadContext, RmwContext, UpsertContext, Value};
pub use device::{Device, IoCompletion, MemoryDevice};
pub use error::ConfigError;
pub use hlog::Address;
pub use session::{OpCallback, Session};
pub use status::Status;
pub use store::Store;
