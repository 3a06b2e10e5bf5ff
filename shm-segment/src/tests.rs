use crate::{AccessMode, Error, ErrorKind, NativeKey, SharedMemory, VTable};

fn unique(name: &str) -> String {
    format!("unit-{}-{name}", std::process::id())
}

#[test]
fn native_key_is_stable() {
    let a = NativeKey::derive("demo").unwrap();
    let b = NativeKey::derive("demo").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "/shmseg_demo");
    assert_eq!(a.semaphore_name().to_str().unwrap(), "/shmseg_demo.lock");
}

#[test]
fn native_key_escapes_separators() {
    let key = NativeKey::derive("a/b c_d.é").unwrap();
    assert_eq!(key.as_str(), "/shmseg_a_2Fb_20c_5Fd_2E_C3_A9");

    let name = &key.as_str()[1..];
    assert!(!name.contains('/'));
    assert!(!name.contains('.'));
    assert!(name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
    assert_eq!(key.logical(), "a/b c_d.é");
}

#[test]
fn native_key_distinguishes_escapes() {
    // The escape character itself must not allow two keys to meet.
    let plain = NativeKey::derive("a_2F").unwrap();
    let slash = NativeKey::derive("a/").unwrap();
    assert_ne!(plain, slash);
}

#[test]
fn native_key_from_listing() {
    let key = NativeKey::derive("some/key").unwrap();
    let listed = NativeKey::from_native("shmseg_some_2Fkey").unwrap();
    assert_eq!(key, listed);

    assert!(NativeKey::from_native("sem.shmseg_demo.lock").is_none());
    assert!(NativeKey::from_native("shmseg_").is_none());
    // Not canonical, `a` never gets escaped.
    assert!(NativeKey::from_native("shmseg__61").is_none());
    assert!(NativeKey::from_native("shmseg_lower_2f").is_none());
}

#[test]
fn native_key_rejects_empty_and_long() {
    let err = NativeKey::derive("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyError);

    if cfg!(target_os = "linux") {
        let long = "/".repeat(100);
        let err = NativeKey::derive(&long).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyError);
    }
}

#[test]
fn errno_classification() {
    let kind = |errno| Error::from_errno("test", errno).kind();
    assert_eq!(kind(libc::EEXIST), ErrorKind::AlreadyExists);
    assert_eq!(kind(libc::ENOENT), ErrorKind::NotFound);
    assert_eq!(kind(libc::EACCES), ErrorKind::PermissionDenied);
    assert_eq!(kind(libc::ENOMEM), ErrorKind::OutOfResources);
    assert_eq!(kind(libc::EMFILE), ErrorKind::OutOfResources);
    assert_eq!(kind(libc::ENAMETOOLONG), ErrorKind::KeyError);
    assert_eq!(kind(libc::EIO), ErrorKind::UnknownError);

    let err = Error::lock("lock", libc::EINTR);
    assert_eq!(err.kind(), ErrorKind::LockError);
    assert_eq!(err.raw_os_error(), Some(libc::EINTR));
    assert!(err.to_string().starts_with("lock: "));
}

#[test]
fn set_key_while_attached() {
    let key = unique("set-key");
    let mut memory = SharedMemory::with_key(&key);
    memory.create(16, AccessMode::ReadWrite).unwrap();

    let err = memory.set_key("other").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(memory.error(), ErrorKind::InvalidState);
    assert_eq!(memory.key(), Some(key.as_str()));

    memory.detach().unwrap();
    assert_eq!(memory.error(), ErrorKind::NoError);
    assert!(memory.error_string().is_empty());
    memory.set_key("other").unwrap();
    assert_eq!(memory.native_key().unwrap().as_str(), "/shmseg_other");
}

#[test]
fn create_without_key() {
    let mut memory = SharedMemory::new();
    let err = memory.create(16, AccessMode::ReadWrite).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyError);
    assert!(!memory.is_attached());
}

#[test]
fn error_survives_reads() {
    let mut memory = SharedMemory::with_key(&unique("survives"));
    assert!(memory.attach(AccessMode::ReadOnly).is_err());
    assert_eq!(memory.error(), ErrorKind::NotFound);

    let _ = memory.size();
    let _ = memory.data();
    assert_eq!(memory.error(), ErrorKind::NotFound);
    assert!(memory.error_string().starts_with("attach: "));
}

#[test]
fn lock_while_detached() {
    let mut memory = SharedMemory::with_key(&unique("detached-lock"));
    let err = memory.lock().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockError);
    assert!(!memory.is_locked());

    // Not holding the lock, so there is nothing to release.
    memory.unlock().unwrap();
}

#[test]
fn interrupted_wait_is_reported() {
    fn interrupted(_: *mut libc::sem_t) -> libc::c_int {
        -1
    }

    fn errno_eintr() -> libc::c_int {
        libc::EINTR
    }

    let key = unique("interrupted");
    let mut owner = SharedMemory::with_key(&key);
    owner.create(8, AccessMode::ReadWrite).unwrap();

    let vtable = VTable {
        sem_wait: interrupted,
        errno: errno_eintr,
        ..VTable::new_libc()
    };

    let mut memory = unsafe { SharedMemory::with_vtable(vtable) };
    memory.set_key(&key).unwrap();
    memory.attach(AccessMode::ReadWrite).unwrap();

    let err = memory.lock().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockError);
    assert_eq!(err.raw_os_error(), Some(libc::EINTR));
    assert!(!memory.is_locked());

    // The token was never taken.
    assert!(owner.try_lock().unwrap());
    owner.unlock().unwrap();
}

#[test]
fn failed_semaphore_rolls_back_create() {
    fn failing_open(
        _: &std::ffi::CStr,
        _: libc::c_int,
        _: libc::mode_t,
        _: libc::c_uint,
    ) -> *mut libc::sem_t {
        libc::SEM_FAILED
    }

    let key = unique("rollback");
    let vtable = VTable {
        sem_open: failing_open,
        ..VTable::new_libc()
    };

    let mut memory = unsafe { SharedMemory::with_vtable(vtable) };
    memory.set_key(&key).unwrap();
    let err = memory.create(32, AccessMode::ReadWrite).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockError);
    assert!(!memory.is_attached());
    assert!(memory.data().is_null());
    assert_eq!(memory.size(), 0);

    let mut other = SharedMemory::with_key(&key);
    let err = other.attach(AccessMode::ReadOnly).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
#[cfg(target_os = "linux")]
fn failed_unlink_still_detaches() {
    fn busy_unlink(_: &std::ffi::CStr) -> libc::c_int {
        unsafe { *libc::__errno_location() = libc::EBUSY };
        -1
    }

    let key = unique("busy-unlink");
    let vtable = VTable {
        shm_unlink: busy_unlink,
        ..VTable::new_libc()
    };

    let mut memory = unsafe { SharedMemory::with_vtable(vtable) };
    memory.set_key(&key).unwrap();
    memory.create(32, AccessMode::ReadWrite).unwrap();

    let err = memory.detach().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownError);
    assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
    assert_eq!(memory.error(), ErrorKind::UnknownError);
    assert!(!memory.is_attached());
    assert!(!memory.is_creator());
    assert!(memory.data().is_null());
    assert_eq!(memory.size(), 0);

    // The object was leaked at the OS level, and is still reachable.
    let mut other = SharedMemory::with_key(&key);
    other.attach(AccessMode::ReadOnly).unwrap();
    assert_eq!(other.size(), 32);
    drop(other);

    SharedMemory::remove(&key).unwrap();
}

thread_local! {
    static SIZING_ATTACH: core::cell::RefCell<Option<(String, Option<SharedMemory>)>> =
        core::cell::RefCell::new(None);
}

#[test]
fn attach_while_sizing_shares_the_lock() {
    // Another process attaching between sizing and mapping the new object.
    fn truncate_then_attach(fd: libc::c_int, len: libc::off_t) -> libc::c_int {
        let ret = unsafe { libc::ftruncate(fd, len) };
        SIZING_ATTACH.with(|slot| {
            if let Some((key, memory)) = slot.borrow_mut().as_mut() {
                let mut early = SharedMemory::with_key(key);
                early.attach(AccessMode::ReadWrite).unwrap();
                *memory = Some(early);
            }
        });
        ret
    }

    let key = unique("sizing-attach");
    SIZING_ATTACH.with(|slot| *slot.borrow_mut() = Some((key.clone(), None)));

    let vtable = VTable {
        ftruncate: truncate_then_attach,
        ..VTable::new_libc()
    };

    let mut creator = unsafe { SharedMemory::with_vtable(vtable) };
    creator.set_key(&key).unwrap();
    creator.create(16, AccessMode::ReadWrite).unwrap();

    let mut early = SIZING_ATTACH
        .with(|slot| slot.borrow_mut().take())
        .and_then(|(_, memory)| memory)
        .expect("attached while the segment was sized");

    let mut late = SharedMemory::with_key(&key);
    late.attach(AccessMode::ReadWrite).unwrap();

    assert!(creator.try_lock().unwrap());
    assert!(!early.try_lock().unwrap());
    assert!(!late.try_lock().unwrap());

    creator.unlock().unwrap();
    assert!(early.try_lock().unwrap());
    assert!(!late.try_lock().unwrap());
    assert!(!creator.try_lock().unwrap());
    early.unlock().unwrap();
}

#[test]
fn attach_zero_sized_object() {
    fn empty_stat(_: libc::c_int, size: &mut i64) -> libc::c_int {
        *size = 0;
        0
    }

    let key = unique("zero-sized");
    let mut owner = SharedMemory::with_key(&key);
    owner.create(16, AccessMode::ReadWrite).unwrap();

    let vtable = VTable {
        fstat_size: empty_stat,
        ..VTable::new_libc()
    };

    let mut memory = unsafe { SharedMemory::with_vtable(vtable) };
    memory.set_key(&key).unwrap();
    let err = memory.attach(AccessMode::ReadOnly).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSize);
    assert_eq!(memory.error(), ErrorKind::InvalidSize);
    assert!(!memory.is_attached());
    assert!(memory.data().is_null());
    assert_eq!(memory.size(), 0);
}

#[test]
fn attach_access_denied() {
    fn denied_open(_: &std::ffi::CStr, _: libc::c_int, _: libc::mode_t) -> libc::c_int {
        -1
    }

    fn errno_eacces() -> libc::c_int {
        libc::EACCES
    }

    let key = unique("denied");
    let mut owner = SharedMemory::with_key(&key);
    owner.create(16, AccessMode::ReadOnly).unwrap();

    let vtable = VTable {
        shm_open: denied_open,
        errno: errno_eacces,
        ..VTable::new_libc()
    };

    let mut memory = unsafe { SharedMemory::with_vtable(vtable) };
    memory.set_key(&key).unwrap();
    let err = memory.attach(AccessMode::ReadWrite).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    assert!(!memory.is_attached());
    assert!(memory.data().is_null());
    assert_eq!(memory.size(), 0);
}

#[test]
fn try_with_key_reports_invalid_key() {
    let memory = SharedMemory::try_with_key("demo").unwrap();
    assert_eq!(memory.key(), Some("demo"));

    // An empty key leaves the segment without one, only using it fails.
    let mut memory = SharedMemory::try_with_key("").unwrap();
    assert_eq!(memory.key(), None);
    assert!(memory.native_key().is_none());
    let err = memory.attach(AccessMode::ReadOnly).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyError);

    if cfg!(target_os = "linux") {
        let err = SharedMemory::try_with_key(&"/".repeat(100)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyError);

        let memory = SharedMemory::with_key(&"/".repeat(100));
        assert_eq!(memory.key(), None);
        assert_eq!(memory.error(), ErrorKind::KeyError);
    }
}
