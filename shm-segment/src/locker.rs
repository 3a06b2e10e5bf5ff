//! Scoped acquisition of a segment's lock.
use crate::{AccessMode, Result, SharedMemory};

/// Holds the lock of a [`SharedMemory`] until dropped.
///
/// The guard borrows the segment mutably, so the guarded code can not detach the segment while
/// the lock is held. The lock is released on every path out of the scope, including early returns
/// and unwinding.
pub struct SharedMemoryLocker<'lt> {
    memory: &'lt mut SharedMemory,
    /// The lock was held before the guard took it, and stays held after.
    nested: bool,
}

impl<'lt> SharedMemoryLocker<'lt> {
    /// Block until the segment is locked.
    ///
    /// If the segment is already locked through [`SharedMemory::lock`], the guard does not wait
    /// and leaves that outer lock held when dropped.
    pub fn new(memory: &'lt mut SharedMemory) -> Result<Self> {
        let nested = memory.is_locked();
        memory.lock()?;
        Ok(SharedMemoryLocker { memory, nested })
    }

    pub fn segment(&self) -> &SharedMemory {
        &*self.memory
    }

    pub fn len(&self) -> usize {
        self.memory.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The contents of the segment.
    ///
    /// Other processes only leave these bytes alone as long as they follow the locking protocol.
    pub fn as_slice(&self) -> &[u8] {
        let ptr = self.memory.const_data();
        if ptr.is_null() {
            return &[];
        }

        // Safety: the mapping is valid for `size` bytes while attached, and the segment can not
        // be detached while we borrow it.
        unsafe { core::slice::from_raw_parts(ptr, self.memory.size()) }
    }

    /// The contents of the segment, `None` for a read-only mapping.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.memory.access_mode() != Some(AccessMode::ReadWrite) {
            return None;
        }

        let ptr = self.memory.data();
        // Safety: as in `as_slice`, and the mapping is writable. We hold `&mut self` so this is
        // the only reference handed out by this process through the guard.
        Some(unsafe { core::slice::from_raw_parts_mut(ptr, self.memory.size()) })
    }
}

impl Drop for SharedMemoryLocker<'_> {
    fn drop(&mut self) {
        if self.nested {
            return;
        }

        if let Err(err) = self.memory.unlock() {
            tracing::warn!(%err, "failed to release segment lock");
        }
    }
}
