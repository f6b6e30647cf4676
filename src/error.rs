//! Error taxonomy shared by every public operation

use std::fmt;
use std::io;

/// Failure kinds surfaced by the store, the heaps, and the region manager.
///
/// Every public function returns `crate::result::Result<T>`; no function
/// partially succeeds in a user-visible way. Invariant violations found
/// while reconstituting a pool are not representable here: they abort the
/// process because the pool is unsafe to use (see [`corruption`]).
///
/// [`corruption`]: fn.corruption.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The key, pool, or handle does not exist
    NotFound,
    /// The key or pool already exists (`DONT_STOMP`, `create_pool`)
    AlreadyExists,
    /// The heap (or the free-address window) cannot satisfy the request
    NoSpace,
    /// The caller's authority lacks the required permission
    PermissionDenied,
    /// A region could not be mapped at its recorded address
    AddressConflict,
    /// The map file covers a different length than the backing file
    SizeMismatch,
    /// The named region does not exist
    RegionNotFound,
    /// The pool handle is stale or was never issued
    InvalidHandle,
    /// The pool is still open somewhere
    InUse,
    /// A non-blocking lock acquisition found the entry held
    WouldBlock,
    /// A blocking lock acquisition expired
    Timeout,
    /// An I/O failure that survived its retries
    Transient(String),
    /// Malformed input (zero-size pool, bad flag combination, ...)
    Invalid(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::AlreadyExists => write!(f, "already exists"),
            Error::NoSpace => write!(f, "no space"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::AddressConflict => write!(f, "address conflict"),
            Error::SizeMismatch => write!(f, "size mismatch"),
            Error::RegionNotFound => write!(f, "region not found"),
            Error::InvalidHandle => write!(f, "invalid handle"),
            Error::InUse => write!(f, "in use"),
            Error::WouldBlock => write!(f, "would block"),
            Error::Timeout => write!(f, "timeout"),
            Error::Transient(s) => write!(f, "transient i/o failure: {}", s),
            Error::Invalid(s) => write!(f, "invalid argument: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Error::RegionNotFound,
            io::ErrorKind::AlreadyExists => Error::AlreadyExists,
            _ => Error::Transient(e.to_string()),
        }
    }
}

/// Aborts the process on an invariant violation found during restart.
///
/// Intent-record recovery never returns an error; once a record is seen to
/// be malformed the pool contents cannot be trusted and continuing would
/// turn one bad record into arbitrary data loss.
pub fn corruption(what: &str) -> ! {
    eprintln!("pmstore: pool corruption: {}", what);
    std::process::abort();
}

/// Retries `f` a bounded number of times before surfacing `Transient`.
pub(crate) fn retry_transient<T, F: FnMut() -> io::Result<T>>(mut f: F) -> crate::result::Result<T> {
    const RETRIES: usize = 3;
    let mut last = None;
    for _ in 0..RETRIES {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => last = Some(e),
        }
    }
    Err(Error::Transient(last.unwrap().to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let e: Error = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert_eq!(e, Error::RegionNotFound);
        let e: Error = io::Error::new(io::ErrorKind::PermissionDenied, "x").into();
        assert!(matches!(e, Error::Transient(_)));
    }

    #[test]
    fn retry_surfaces_last_error() {
        let mut n = 0;
        let r: crate::result::Result<()> = retry_transient(|| {
            n += 1;
            Err(io::Error::new(io::ErrorKind::Other, "flush failed"))
        });
        assert_eq!(n, 3);
        assert!(matches!(r, Err(Error::Transient(_))));
    }

    #[test]
    fn retry_stops_on_success() {
        let mut n = 0;
        let r = retry_transient(|| {
            n += 1;
            if n < 2 {
                Err(io::Error::new(io::ErrorKind::Other, "once"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(r, Ok(7));
        assert_eq!(n, 2);
    }
}
