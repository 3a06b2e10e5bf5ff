//! A named POSIX semaphore used as a binary mutex between processes.
use core::ptr::NonNull;
use std::ffi::CStr;

use libc::{mode_t, sem_t};

use crate::{Error, Result, VTable};

/// An open handle to a named system semaphore.
///
/// The handle is closed on drop. The name itself persists in the OS namespace until it is
/// unlinked, see [`SystemSemaphore::unlink`].
pub struct SystemSemaphore {
    sem: NonNull<sem_t>,
    vtable: VTable,
}

// Safety: a `sem_t*` returned by `sem_open` may be used from any thread of the process, every
// operation on it is itself synchronized by the OS.
unsafe impl Send for SystemSemaphore {}
unsafe impl Sync for SystemSemaphore {}

impl SystemSemaphore {
    /// Create the semaphore fresh, holding a single token.
    ///
    /// Any semaphore left under the name, for instance by a crashed creator, is removed first so
    /// that the count starts out at exactly one.
    pub fn create(name: &CStr, mode: mode_t, vtable: &VTable) -> Result<Self> {
        if -1 == (vtable.sem_unlink)(name) {
            let errno = (vtable.errno)();
            if errno != libc::ENOENT {
                return Err(Error::lock("create", errno));
            }
        } else {
            tracing::debug!(name = ?name, "removed stale semaphore");
        }

        Self::open_with(name, libc::O_CREAT | libc::O_EXCL, mode, vtable, "create")
    }

    /// Open the semaphore, creating it with a single token if it does not exist yet.
    pub fn open(name: &CStr, mode: mode_t, vtable: &VTable) -> Result<Self> {
        Self::open_with(name, libc::O_CREAT, mode, vtable, "attach")
    }

    fn open_with(
        name: &CStr,
        oflag: libc::c_int,
        mode: mode_t,
        vtable: &VTable,
        function: &'static str,
    ) -> Result<Self> {
        let sem = (vtable.sem_open)(name, oflag, mode, 1);

        if sem == libc::SEM_FAILED {
            return Err(Error::lock(function, (vtable.errno)()));
        }

        let Some(sem) = NonNull::new(sem) else {
            return Err(Error::lock(function, libc::EINVAL));
        };

        Ok(SystemSemaphore {
            sem,
            vtable: *vtable,
        })
    }

    /// Block until the token is available and take it.
    ///
    /// An interrupted wait is reported, not retried.
    pub fn acquire(&self) -> Result<()> {
        if -1 == (self.vtable.sem_wait)(self.sem.as_ptr()) {
            return Err(Error::lock("lock", (self.vtable.errno)()));
        }

        Ok(())
    }

    /// Take the token if it is available right now.
    pub fn try_acquire(&self) -> Result<bool> {
        if -1 == (self.vtable.sem_trywait)(self.sem.as_ptr()) {
            return match (self.vtable.errno)() {
                libc::EAGAIN => Ok(false),
                errno => Err(Error::lock("try_lock", errno)),
            };
        }

        Ok(true)
    }

    pub fn release(&self) -> Result<()> {
        if -1 == (self.vtable.sem_post)(self.sem.as_ptr()) {
            return Err(Error::lock("unlock", (self.vtable.errno)()));
        }

        Ok(())
    }

    /// Remove the name from the OS namespace. Open handles stay usable.
    pub fn unlink(name: &CStr, vtable: &VTable) -> Result<()> {
        if -1 == (vtable.sem_unlink)(name) {
            return Err(Error::lock("detach", (vtable.errno)()));
        }

        Ok(())
    }
}

impl Drop for SystemSemaphore {
    fn drop(&mut self) {
        if -1 == (self.vtable.sem_close)(self.sem.as_ptr()) {
            tracing::warn!(errno = (self.vtable.errno)(), "failed to close semaphore");
        }
    }
}
