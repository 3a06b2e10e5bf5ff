//! The table of OS functions behind a segment and its semaphore.
use core::ffi::{c_int, c_uint};
use std::ffi::CStr;

use libc::{mode_t, off_t, sem_t};

/// A table of OS functions.
///
/// This enumerates the functions required to create, open and remove the named objects backing a
/// [`SharedMemory`](crate::SharedMemory). A vtable must contain functions that behave according to
/// the POSIX specification of the correspondingly named functions, see the Safety precondition of
/// [`SharedMemory::with_vtable`](crate::SharedMemory::with_vtable). A default table is
/// initialized from `libc`.
///
/// Mapping the object is not part of the table, it goes through `memmap2` on the descriptor
/// returned by `shm_open`.
#[non_exhaustive]
#[derive(Clone, Copy)]
pub struct VTable {
    pub shm_open: fn(&CStr, c_int, mode_t) -> c_int,
    pub shm_unlink: fn(&CStr) -> c_int,
    pub ftruncate: fn(c_int, off_t) -> c_int,
    /// `fstat`, reduced to the size of the object.
    pub fstat_size: fn(c_int, &mut i64) -> c_int,
    /// Returns `SEM_FAILED` on error.
    pub sem_open: fn(&CStr, c_int, mode_t, c_uint) -> *mut sem_t,
    pub sem_wait: fn(*mut sem_t) -> c_int,
    pub sem_trywait: fn(*mut sem_t) -> c_int,
    pub sem_post: fn(*mut sem_t) -> c_int,
    pub sem_close: fn(*mut sem_t) -> c_int,
    pub sem_unlink: fn(&CStr) -> c_int,
    pub errno: fn() -> c_int,
}

impl VTable {
    pub fn new_libc() -> Self {
        fn _shm_open(name: &CStr, oflag: c_int, mode: mode_t) -> c_int {
            // Variadic on some platforms, where the mode must be passed promoted.
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, c_uint::from(mode)) };
            #[cfg(not(any(target_os = "macos", target_os = "ios")))]
            let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, mode) };
            fd
        }

        fn _shm_unlink(name: &CStr) -> c_int {
            unsafe { libc::shm_unlink(name.as_ptr()) }
        }

        fn _ftruncate(fd: c_int, len: off_t) -> c_int {
            unsafe { libc::ftruncate(fd, len) }
        }

        fn _fstat_size(fd: c_int, size: &mut i64) -> c_int {
            let mut uninit = core::mem::MaybeUninit::<libc::stat>::zeroed();
            // Safety: passing the correct pointer to a struct of libc::stat.
            let ret = unsafe { libc::fstat(fd, uninit.as_mut_ptr()) };

            if ret == 0 {
                // Safety: always initialized on return with success.
                let stat = unsafe { uninit.assume_init() };
                *size = i64::from(stat.st_size);
            }

            ret
        }

        fn _sem_open(name: &CStr, oflag: c_int, mode: mode_t, value: c_uint) -> *mut sem_t {
            unsafe { libc::sem_open(name.as_ptr(), oflag, c_uint::from(mode), value) }
        }

        fn _sem_wait(sem: *mut sem_t) -> c_int {
            unsafe { libc::sem_wait(sem) }
        }

        fn _sem_trywait(sem: *mut sem_t) -> c_int {
            unsafe { libc::sem_trywait(sem) }
        }

        fn _sem_post(sem: *mut sem_t) -> c_int {
            unsafe { libc::sem_post(sem) }
        }

        fn _sem_close(sem: *mut sem_t) -> c_int {
            unsafe { libc::sem_close(sem) }
        }

        fn _sem_unlink(name: &CStr) -> c_int {
            unsafe { libc::sem_unlink(name.as_ptr()) }
        }

        fn _errno() -> c_int {
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
        }

        VTable {
            shm_open: _shm_open,
            shm_unlink: _shm_unlink,
            ftruncate: _ftruncate,
            fstat_size: _fstat_size,
            sem_open: _sem_open,
            sem_wait: _sem_wait,
            sem_trywait: _sem_trywait,
            sem_post: _sem_post,
            sem_close: _sem_close,
            sem_unlink: _sem_unlink,
            errno: _errno,
        }
    }
}

impl Default for VTable {
    fn default() -> Self {
        Self::new_libc()
    }
}
