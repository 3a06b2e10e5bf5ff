use core::ptr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use libc::{mode_t, off_t};
use memmap2::{MmapOptions, MmapRaw};

use crate::error::LastError;
use crate::{Error, ErrorKind, NativeKey, Result, SharedMemoryLocker, SystemSemaphore, VTable};

/// Permissions of newly created objects, for the segment and its semaphore alike.
pub const DEFAULT_PERMISSIONS: mode_t = 0o600;

/// How a segment is mapped into this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// A named shared memory segment, paired with a system semaphore for locking.
///
/// The segment is either detached, or fully attached with a mapping, a descriptor and an open
/// semaphore. Processes that use the same key observe the same memory. All coordination of the
/// bytes goes through [`lock`](Self::lock) and [`unlock`](Self::unlock), or more conveniently
/// [`SharedMemoryLocker`].
///
/// Every operation returns its outcome and also records a failure, available from
/// [`error`](Self::error) and [`error_string`](Self::error_string) until the next operation.
/// Dropping the segment detaches it.
pub struct SharedMemory {
    key: Option<String>,
    native: Option<NativeKey>,
    permissions: mode_t,
    attached: Option<Attached>,
    locked_by_me: bool,
    error: LastError,
    vtable: VTable,
}

/// Everything owned while attached. Fields drop in order, the mapping before its descriptor.
struct Attached {
    map: MmapRaw,
    fd: OwnedFd,
    size: usize,
    mode: AccessMode,
    created_by_me: bool,
    semaphore: SystemSemaphore,
    native: NativeKey,
}

impl SharedMemory {
    /// A detached segment without a key.
    pub fn new() -> Self {
        // Safety: the libc table implements the functions as specified.
        unsafe { Self::with_vtable(VTable::new_libc()) }
    }

    /// A detached segment with a key.
    ///
    /// An invalid key is recorded in the error state, leaving the segment without a key. Use
    /// [`try_with_key`](Self::try_with_key) to get the failure returned instead.
    pub fn with_key(key: &str) -> Self {
        let mut this = Self::new();
        if let Err(err) = this.set_key(key) {
            tracing::debug!(%err, "segment constructed without a key");
        }
        this
    }

    /// A detached segment with a key, failing if the key is invalid.
    pub fn try_with_key(key: &str) -> Result<Self> {
        let mut this = Self::new();
        this.set_key(key)?;
        Ok(this)
    }

    /// Create a segment from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain functions that implement the `shm_*`, `sem_*` and `fstat`
    /// interfaces. In particular `shm_open` must return a descriptor that is owned by the caller
    /// and can be mapped.
    pub unsafe fn with_vtable(vtable: VTable) -> Self {
        SharedMemory {
            key: None,
            native: None,
            permissions: DEFAULT_PERMISSIONS,
            attached: None,
            locked_by_me: false,
            error: LastError::default(),
            vtable,
        }
    }

    /// Change the logical key. An empty key clears it.
    ///
    /// Fails with [`ErrorKind::InvalidState`] while attached and with [`ErrorKind::KeyError`] if
    /// the key has no representation in the OS namespace, keeping the previous key.
    pub fn set_key(&mut self, key: &str) -> Result<()> {
        self.error.clear();
        let result = self.set_key_inner(key);
        self.error.track(result)
    }

    fn set_key_inner(&mut self, key: &str) -> Result<()> {
        if self.attached.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "set_key",
                "can not change the key of an attached segment",
            ));
        }

        if key.is_empty() {
            self.key = None;
            self.native = None;
            return Ok(());
        }

        let native = NativeKey::derive(key)?;
        self.key = Some(key.to_owned());
        self.native = Some(native);
        Ok(())
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn native_key(&self) -> Option<&NativeKey> {
        self.native.as_ref()
    }

    /// Set the permission bits used when creating the segment and its semaphore.
    pub fn set_permissions(&mut self, permissions: mode_t) -> Result<()> {
        self.error.clear();
        let result = if self.attached.is_some() {
            Err(Error::new(
                ErrorKind::InvalidState,
                "set_permissions",
                "can not change permissions of an attached segment",
            ))
        } else {
            self.permissions = permissions & 0o777;
            Ok(())
        };
        self.error.track(result)
    }

    pub fn permissions(&self) -> mode_t {
        self.permissions
    }

    /// Create a new segment of `size` bytes under the key and attach to it.
    ///
    /// Creation is exclusive, an existing object under the same key fails with
    /// [`ErrorKind::AlreadyExists`]. The contents of a fresh segment are zero, as the OS provides
    /// them. The segment is removed again when this instance detaches.
    pub fn create(&mut self, size: usize, mode: AccessMode) -> Result<()> {
        self.error.clear();
        let result = self.create_inner(size, mode);
        self.error.track(result)
    }

    fn create_inner(&mut self, size: usize, mode: AccessMode) -> Result<()> {
        const FN: &str = "create";
        let native = self.detached_key(FN)?.clone();

        let Some(len) = off_t::try_from(size).ok().filter(|&len| len > 0) else {
            return Err(Error::new(
                ErrorKind::InvalidSize,
                FN,
                format_args!("can not create a segment of {size} bytes"),
            ));
        };

        let oflag = libc::O_CREAT | libc::O_EXCL | libc::O_RDWR;
        let fd = self.open_object(&native, oflag, FN)?;

        // The object is ours from here on, remove it again on any failure.
        let attached = self.setup_created(fd, len, size, mode, &native);
        let attached = match attached {
            Ok(attached) => attached,
            Err(err) => {
                if -1 == (self.vtable.shm_unlink)(native.segment_name()) {
                    let errno = (self.vtable.errno)();
                    tracing::warn!(key = %native, errno, "failed to remove segment after failed create");
                }
                return Err(err);
            }
        };

        tracing::debug!(key = %native, size, ?mode, "created segment");
        self.attached = Some(attached);
        Ok(())
    }

    fn setup_created(
        &self,
        fd: OwnedFd,
        len: off_t,
        size: usize,
        mode: AccessMode,
        native: &NativeKey,
    ) -> Result<Attached> {
        // The semaphore must exist before the object has a size. Attaching to an object of size
        // zero fails, so every attacher that gets past that check opens this semaphore and not a
        // stale one we would remove afterwards.
        let semaphore =
            SystemSemaphore::create(native.semaphore_name(), self.permissions, &self.vtable)?;

        let map = match self.size_and_map(&fd, len, size, mode) {
            Ok(map) => map,
            Err(err) => {
                drop(semaphore);
                let unlinked = SystemSemaphore::unlink(native.semaphore_name(), &self.vtable);
                if let Err(unlink) = unlinked {
                    tracing::warn!(key = %native, err = %unlink, "failed to remove semaphore");
                }
                return Err(err);
            }
        };

        Ok(Attached {
            map,
            fd,
            size,
            mode,
            created_by_me: true,
            semaphore,
            native: native.clone(),
        })
    }

    fn size_and_map(
        &self,
        fd: &OwnedFd,
        len: off_t,
        size: usize,
        mode: AccessMode,
    ) -> Result<MmapRaw> {
        const FN: &str = "create";

        if -1 == (self.vtable.ftruncate)(fd.as_raw_fd(), len) {
            return Err(Error::from_errno(FN, (self.vtable.errno)()));
        }

        Self::map(fd, size, mode, FN)
    }

    /// Attach to a segment that was created elsewhere under the same key.
    ///
    /// Fails with [`ErrorKind::NotFound`] if no segment exists. The size of the mapping is the
    /// size of the existing object.
    pub fn attach(&mut self, mode: AccessMode) -> Result<()> {
        self.error.clear();
        let result = self.attach_inner(mode);
        self.error.track(result)
    }

    fn attach_inner(&mut self, mode: AccessMode) -> Result<()> {
        const FN: &str = "attach";
        let native = self.detached_key(FN)?.clone();

        let oflag = match mode {
            AccessMode::ReadOnly => libc::O_RDONLY,
            AccessMode::ReadWrite => libc::O_RDWR,
        };

        let fd = self.open_object(&native, oflag, FN)?;

        let mut size = 0i64;
        if -1 == (self.vtable.fstat_size)(fd.as_raw_fd(), &mut size) {
            return Err(Error::from_errno(FN, (self.vtable.errno)()));
        }

        let Some(size) = usize::try_from(size).ok().filter(|&size| size > 0) else {
            return Err(Error::new(
                ErrorKind::InvalidSize,
                FN,
                format_args!("segment has a size of {size} bytes"),
            ));
        };

        let map = Self::map(&fd, size, mode, FN)?;
        let semaphore =
            SystemSemaphore::open(native.semaphore_name(), self.permissions, &self.vtable)?;

        tracing::debug!(key = %native, size, ?mode, "attached segment");
        self.attached = Some(Attached {
            map,
            fd,
            size,
            mode,
            created_by_me: false,
            semaphore,
            native,
        });

        Ok(())
    }

    /// The native key, checking that we may start attaching.
    fn detached_key(&self, function: &'static str) -> Result<&NativeKey> {
        if self.attached.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                function,
                "segment is already attached",
            ));
        }

        self.native
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::KeyError, function, "no key set"))
    }

    fn open_object(
        &self,
        native: &NativeKey,
        oflag: libc::c_int,
        function: &'static str,
    ) -> Result<OwnedFd> {
        let fd = (self.vtable.shm_open)(native.segment_name(), oflag, self.permissions);

        if fd < 0 {
            return Err(Error::from_errno(function, (self.vtable.errno)()));
        }

        // Safety: `shm_open` returns a fresh descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn map(fd: &OwnedFd, size: usize, mode: AccessMode, function: &'static str) -> Result<MmapRaw> {
        let mut options = MmapOptions::new();
        options.len(size);

        let map = match mode {
            AccessMode::ReadOnly => options.map_raw_read_only(fd),
            AccessMode::ReadWrite => options.map_raw(fd),
        };

        map.map_err(|err| Error::from_io(function, &err))
    }

    /// Unmap the segment and close all handles.
    ///
    /// If this instance created the segment, the segment and its semaphore are also removed from
    /// the OS namespace. A failure to remove them is reported, yet the instance is detached in
    /// any case. Detaching a detached segment succeeds.
    pub fn detach(&mut self) -> Result<()> {
        self.error.clear();
        let result = self.detach_inner();
        self.error.track(result)
    }

    fn detach_inner(&mut self) -> Result<()> {
        let Some(attached) = self.attached.take() else {
            return Ok(());
        };

        let Attached {
            map,
            fd,
            semaphore,
            created_by_me,
            native,
            ..
        } = attached;

        if core::mem::take(&mut self.locked_by_me) {
            if let Err(err) = semaphore.release() {
                tracing::warn!(key = %native, %err, "failed to release lock while detaching");
            }
        }

        drop(map);
        drop(fd);
        drop(semaphore);
        tracing::debug!(key = %native, created_by_me, "detached segment");

        if !created_by_me {
            return Ok(());
        }

        let mut result = Ok(());
        if -1 == (self.vtable.shm_unlink)(native.segment_name()) {
            result = Err(Error::from_errno("detach", (self.vtable.errno)()));
        }

        if let Err(err) = SystemSemaphore::unlink(native.semaphore_name(), &self.vtable) {
            result = result.and(Err(err));
        }

        result
    }

    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// The mode of the current mapping.
    pub fn access_mode(&self) -> Option<AccessMode> {
        self.attached.as_ref().map(|attached| attached.mode)
    }

    /// Whether this instance created the segment it is attached to.
    pub fn is_creator(&self) -> bool {
        self.attached.as_ref().map_or(false, |attached| attached.created_by_me)
    }

    /// The size of the mapping, zero while detached.
    pub fn size(&self) -> usize {
        self.attached.as_ref().map_or(0, |attached| attached.size)
    }

    /// Pointer to the mapped segment, null while detached.
    ///
    /// Writing through the pointer is only valid for a [`AccessMode::ReadWrite`] mapping. Other
    /// processes observe the same bytes, coordinate with them through [`lock`](Self::lock).
    pub fn data(&self) -> *mut u8 {
        self.attached
            .as_ref()
            .map_or(ptr::null_mut(), |attached| attached.map.as_mut_ptr())
    }

    /// Pointer to the mapped segment, null while detached.
    pub fn const_data(&self) -> *const u8 {
        self.attached
            .as_ref()
            .map_or(ptr::null(), |attached| attached.map.as_ptr())
    }

    /// Block until this instance holds the segment's semaphore.
    ///
    /// Succeeds right away if the lock is already held by this instance. Fails with
    /// [`ErrorKind::LockError`] while detached or if the wait is interrupted.
    pub fn lock(&mut self) -> Result<()> {
        self.error.clear();
        let result = self.lock_inner();
        self.error.track(result)
    }

    fn lock_inner(&mut self) -> Result<()> {
        if self.locked_by_me {
            return Ok(());
        }

        self.semaphore("lock")?.acquire()?;
        self.locked_by_me = true;
        tracing::trace!(key = ?self.native, "locked segment");
        Ok(())
    }

    /// Take the semaphore if it is available without blocking.
    pub fn try_lock(&mut self) -> Result<bool> {
        self.error.clear();
        let result = self.try_lock_inner();
        self.error.track(result)
    }

    fn try_lock_inner(&mut self) -> Result<bool> {
        if self.locked_by_me {
            return Ok(true);
        }

        let acquired = self.semaphore("try_lock")?.try_acquire()?;
        self.locked_by_me = acquired;
        Ok(acquired)
    }

    /// Release the semaphore if this instance holds it, otherwise do nothing.
    pub fn unlock(&mut self) -> Result<()> {
        self.error.clear();
        let result = self.unlock_inner();
        self.error.track(result)
    }

    fn unlock_inner(&mut self) -> Result<()> {
        if !self.locked_by_me {
            return Ok(());
        }

        self.semaphore("unlock")?.release()?;
        self.locked_by_me = false;
        tracing::trace!(key = ?self.native, "unlocked segment");
        Ok(())
    }

    /// Lock the segment for the lifetime of the returned guard.
    pub fn locked(&mut self) -> Result<SharedMemoryLocker<'_>> {
        SharedMemoryLocker::new(self)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by_me
    }

    fn semaphore(&self, function: &'static str) -> Result<&SystemSemaphore> {
        self.attached
            .as_ref()
            .map(|attached| &attached.semaphore)
            .ok_or_else(|| Error::new(ErrorKind::LockError, function, "segment is not attached"))
    }

    /// The kind of the last failure, or [`ErrorKind::NoError`].
    pub fn error(&self) -> ErrorKind {
        self.error.kind()
    }

    /// A description of the last failure, empty if the last operation succeeded.
    pub fn error_string(&self) -> String {
        self.error.message()
    }

    /// Remove a segment and its semaphore left behind under `key`, for instance by a crashed
    /// creator.
    ///
    /// Processes still attached keep their mapping. Fails with [`ErrorKind::NotFound`] if there
    /// was no segment under the key.
    pub fn remove(key: &str) -> Result<()> {
        const FN: &str = "remove";
        let vtable = VTable::new_libc();
        let native = NativeKey::derive(key)?;

        if -1 == (vtable.shm_unlink)(native.segment_name()) {
            return Err(Error::from_errno(FN, (vtable.errno)()));
        }

        if -1 == (vtable.sem_unlink)(native.semaphore_name()) {
            let errno = (vtable.errno)();
            if errno != libc::ENOENT {
                return Err(Error::lock(FN, errno));
            }
        }

        tracing::debug!(key = %native, "removed segment");
        Ok(())
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            tracing::warn!(%err, "failed to clean up segment");
        }
    }
}

impl core::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("key", &self.key)
            .field("native", &self.native)
            .field("size", &self.size())
            .field("access_mode", &self.access_mode())
            .field("locked", &self.locked_by_me)
            .finish()
    }
}
