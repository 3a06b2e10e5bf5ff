//! Named shared memory segments, shared between unrelated processes, with a paired system
//! semaphore for mutual exclusion.
//!
//! A [`SharedMemory`] is identified by a logical key. Processes agree on the key out of band;
//! one of them [`create`](SharedMemory::create)s the segment, the others
//! [`attach`](SharedMemory::attach) to it. Every window of access to the bytes is wrapped in the
//! segment's lock, most easily with a [`SharedMemoryLocker`].
//!
//! ```no_run
//! use shm_segment::{AccessMode, SharedMemory};
//!
//! let mut memory = SharedMemory::with_key("demo");
//! memory.create(64, AccessMode::ReadWrite)?;
//!
//! {
//!     let mut guard = memory.locked()?;
//!     guard.as_mut_slice().unwrap().fill(0xaa);
//! }
//!
//! // Removes the segment again, since we created it.
//! memory.detach()?;
//! # Ok::<(), shm_segment::Error>(())
//! ```
//!
//! The segment is a `shm_open` object mapped with `MAP_SHARED`, the lock a named POSIX semaphore
//! holding a single token. Both live in a machine-wide namespace under names derived from the
//! key, see [`NativeKey`].
#![cfg(unix)]
#![cfg_attr(docsrs, feature(doc_cfg))]
mod error;
mod key;
mod locker;
mod segment;
mod semaphore;
mod sys;

#[cfg(test)]
mod tests;

pub use error::{Error, ErrorKind, Result};
pub use key::NativeKey;
pub use locker::SharedMemoryLocker;
pub use segment::{AccessMode, SharedMemory, DEFAULT_PERMISSIONS};
pub use semaphore::SystemSemaphore;
pub use sys::VTable;
