//! Derive names in the OS shared-object namespace from logical keys.
//!
//! A logical key is any string. The native key is `/shmseg_` followed by the logical key with
//! every byte outside of `[A-Za-z0-9-]` written as `_XX` (uppercase hex). The escaping is
//! reversible, so a name found in `/dev/shm` can be traced back to the key that produced it.
//! Escaped keys never contain `.`, which is what keeps the semaphore suffix from colliding with
//! any segment name.
use core::fmt;
use std::ffi::{CStr, CString};

use crate::{Error, ErrorKind, Result};

pub(crate) const PREFIX: &str = "/shmseg_";
const SEMAPHORE_SUFFIX: &str = ".lock";

/// Longest name, without the leading slash, the platform accepts for a named semaphore.
///
/// glibc stores semaphores as `/dev/shm/sem.<name>`, and the file name is bound by `NAME_MAX`.
#[cfg(target_os = "linux")]
const NAME_LIMIT: Option<usize> = Some(255 - "sem.".len());
/// Elsewhere we let the OS report `ENAMETOOLONG`.
#[cfg(not(target_os = "linux"))]
const NAME_LIMIT: Option<usize> = None;

/// The OS-namespace identity of a segment and its semaphore.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NativeKey {
    segment: CString,
    semaphore: CString,
}

impl NativeKey {
    /// Derive the native key for `logical`.
    ///
    /// Fails with [`ErrorKind::KeyError`] for an empty key or one whose escaped form is too long
    /// for the platform.
    pub fn derive(logical: &str) -> Result<Self> {
        if logical.is_empty() {
            return Err(Error::new(ErrorKind::KeyError, "set_key", "key is empty"));
        }

        let mut name = String::with_capacity(PREFIX.len() + logical.len());
        name.push_str(PREFIX);
        escape_into(logical, &mut name);

        let semaphore_len = name.len() - 1 + SEMAPHORE_SUFFIX.len();
        if NAME_LIMIT.map_or(false, |limit| semaphore_len > limit) {
            return Err(Error::new(
                ErrorKind::KeyError,
                "set_key",
                format_args!("native key of {semaphore_len} bytes exceeds the name limit"),
            ));
        }

        Ok(Self::from_escaped(name))
    }

    /// Parse a name from the OS namespace, as produced by [`NativeKey::derive`].
    ///
    /// The leading slash is optional, since directory listings of `/dev/shm` omit it.
    pub fn from_native(name: &str) -> Option<Self> {
        let name = name.strip_prefix('/').unwrap_or(name);
        let escaped = name.strip_prefix(&PREFIX[1..])?;
        // Only accept the canonical form, so that `derive(logical()) == self`.
        let logical = unescape(escaped)?;
        if logical.is_empty() {
            return None;
        }

        Self::derive(&logical).ok()
    }

    fn from_escaped(name: String) -> Self {
        let semaphore = format!("{name}{SEMAPHORE_SUFFIX}");
        // Escaping removed any NUL byte.
        NativeKey {
            segment: CString::new(name).unwrap_or_default(),
            semaphore: CString::new(semaphore).unwrap_or_default(),
        }
    }

    /// The name of the shared memory object, including the leading slash.
    pub fn as_str(&self) -> &str {
        self.segment.to_str().unwrap_or_default()
    }

    pub fn segment_name(&self) -> &CStr {
        &self.segment
    }

    pub fn semaphore_name(&self) -> &CStr {
        &self.semaphore
    }

    /// Recover the logical key this was derived from.
    pub fn logical(&self) -> String {
        let escaped = &self.as_str()[PREFIX.len()..];
        unescape(escaped).unwrap_or_default()
    }
}

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-'
}

fn escape_into(logical: &str, out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    for &byte in logical.as_bytes() {
        if is_plain(byte) {
            out.push(char::from(byte));
        } else {
            out.push('_');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0xf)]));
        }
    }
}

fn unescape(escaped: &str) -> Option<String> {
    fn nibble(digit: u8) -> Option<u8> {
        match digit {
            b'0'..=b'9' => Some(digit - b'0'),
            b'A'..=b'F' => Some(digit - b'A' + 10),
            _ => None,
        }
    }

    let mut bytes = Vec::with_capacity(escaped.len());
    let mut iter = escaped.bytes();

    while let Some(byte) = iter.next() {
        if is_plain(byte) {
            bytes.push(byte);
        } else if byte == b'_' {
            let hi = nibble(iter.next()?)?;
            let lo = nibble(iter.next()?)?;
            let decoded = hi << 4 | lo;
            // An escaped plain byte is not canonical.
            if is_plain(decoded) {
                return None;
            }
            bytes.push(decoded);
        } else {
            return None;
        }
    }

    String::from_utf8(bytes).ok()
}

impl fmt::Debug for NativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeKey").field(&self.as_str()).finish()
    }
}

impl fmt::Display for NativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
