use core::ffi::c_int;
use core::fmt;

/// Classification of the most recent failure of a segment or its lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The last operation succeeded.
    #[default]
    NoError,
    /// The operation is not valid for the current attach state.
    InvalidState,
    /// A zero or otherwise unrepresentable size was requested.
    InvalidSize,
    /// The key is empty or can not be represented in the OS namespace.
    KeyError,
    /// Exclusive creation found an object under the same name.
    AlreadyExists,
    /// No object exists under the name.
    NotFound,
    /// The OS denied the requested access.
    PermissionDenied,
    /// The OS could not allocate the object, the mapping, or a descriptor.
    OutOfResources,
    /// Semaphore acquisition, release or setup failed.
    LockError,
    /// Any other OS failure. The message keeps the OS detail.
    UnknownError,
}

/// A failed operation on a [`SharedMemory`](crate::SharedMemory).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{function}: {message}")]
pub struct Error {
    kind: ErrorKind,
    function: &'static str,
    message: String,
    os: Option<c_int>,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    pub(crate) fn new(kind: ErrorKind, function: &'static str, message: impl fmt::Display) -> Self {
        Error {
            kind,
            function,
            message: message.to_string(),
            os: None,
        }
    }

    /// Classify an `errno` value as reported by `function`.
    pub(crate) fn from_errno(function: &'static str, errno: c_int) -> Self {
        let kind = match errno {
            libc::EACCES | libc::EPERM | libc::EROFS => ErrorKind::PermissionDenied,
            libc::EEXIST => ErrorKind::AlreadyExists,
            libc::ENOENT => ErrorKind::NotFound,
            libc::EMFILE | libc::ENFILE | libc::ENOMEM | libc::ENOSPC | libc::EFBIG => {
                ErrorKind::OutOfResources
            }
            libc::ENAMETOOLONG => ErrorKind::KeyError,
            _ => ErrorKind::UnknownError,
        };

        Self::with_errno(kind, function, errno)
    }

    /// Any semaphore failure is a lock error, whatever the OS says.
    pub(crate) fn lock(function: &'static str, errno: c_int) -> Self {
        Self::with_errno(ErrorKind::LockError, function, errno)
    }

    pub(crate) fn from_io(function: &'static str, err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(function, errno),
            None => Self::new(ErrorKind::UnknownError, function, err),
        }
    }

    fn with_errno(kind: ErrorKind, function: &'static str, errno: c_int) -> Self {
        Error {
            kind,
            function,
            message: std::io::Error::from_raw_os_error(errno).to_string(),
            os: Some(errno),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The name of the operation that failed, such as `create` or `lock`.
    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The raw OS error code, if the failure originated in a system call.
    pub fn raw_os_error(&self) -> Option<c_int> {
        self.os
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoError => "no error",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::InvalidSize => "invalid size",
            ErrorKind::KeyError => "invalid key",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::OutOfResources => "out of resources",
            ErrorKind::LockError => "lock error",
            ErrorKind::UnknownError => "unknown error",
        };

        f.write_str(name)
    }
}

/// The error state of one instance: the last failure, cleared when an operation begins.
#[derive(Default)]
pub(crate) struct LastError {
    error: Option<Error>,
}

impl LastError {
    pub(crate) fn clear(&mut self) {
        self.error = None;
    }

    /// Record the outcome of an operation, passing it through.
    pub(crate) fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.error = Some(err.clone());
        }

        result
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        self.error.as_ref().map_or(ErrorKind::NoError, Error::kind)
    }

    pub(crate) fn message(&self) -> String {
        self.error.as_ref().map_or_else(String::new, Error::to_string)
    }
}
