// src/error.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! Error taxonomy for the Industrial I/O object model.
//!
//! Every backend returns a negative errno-style `i32` across its v-table;
//! [`Error::from_errno`] is the single place that maps those codes onto the
//! taxonomy kinds. Application code never sees raw errno values.

use nix::errno::Errno;
use std::ffi::NulError;
use std::num::{ParseFloatError, ParseIntError};

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy.
///
/// Variants correspond one-to-one with the error kinds described in the
/// object model's error handling design: lookups that miss, malformed
/// arguments, unsupported backend operations, and so on.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A device, channel, or attribute lookup found nothing matching.
    #[error("not found: {0}")]
    NotFound(String),

    /// A malformed URI, a mask of the wrong width, or a scan-only
    /// operation applied to a non-scan-element channel.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The backend does not implement this operation (`ENOSYS`/`ENXIO`).
    #[error("unsupported")]
    Unsupported,

    /// Attempt to write a read-only attribute, or cyclic mode on an RX
    /// buffer.
    #[error("permission denied")]
    Permission,

    /// The resource (endpoint, block) is already in use.
    #[error("busy")]
    Busy,

    /// The wait exceeded its configured limit.
    #[error("timed out")]
    Timeout,

    /// Explicit cancellation, via a buffer or a task token.
    #[error("cancelled")]
    Cancelled,

    /// The transport disconnected, or EOF was observed mid-stream.
    #[error("connection broken")]
    Broken,

    /// A protocol framing violation: a non-integer where an integer was
    /// expected, an XML document that does not match the schema, etc.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// An error surfaced from the OS (file I/O, sockets) that does not
    /// otherwise map onto a taxonomy kind.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps a backend return code (0 or positive on success, negative
    /// errno-style on failure) onto a typed [`Error`].
    ///
    /// Retriable conditions (`EAGAIN`, `EINTR`) are never passed here; the
    /// transport layer retries them internally per the propagation policy.
    pub fn from_errno(ret: i32) -> Error {
        let errno = Errno::from_i32(-ret);
        match errno {
            Errno::ENOENT | Errno::ENODEV => Error::NotFound(errno.to_string()),
            Errno::EINVAL => Error::BadArgument(errno.to_string()),
            Errno::ENOSYS | Errno::ENXIO | Errno::EOPNOTSUPP => Error::Unsupported,
            Errno::EPERM | Errno::EACCES | Errno::EROFS => Error::Permission,
            Errno::EBUSY | Errno::EEXIST => Error::Busy,
            Errno::ETIMEDOUT => Error::Timeout,
            Errno::ECANCELED | Errno::EINTR => Error::Cancelled,
            Errno::EPIPE | Errno::ECONNRESET | Errno::ENOTCONN => Error::Broken,
            Errno::ENOMEM => Error::OutOfMemory,
            other => Error::Malformed(other.to_string()),
        }
    }

    /// Checks a raw backend return code, converting negative values into a
    /// typed error and passing positive/zero values through as `result`.
    pub fn check(ret: i32, result: impl FnOnce(i32) -> i32) -> Result<i32> {
        if ret < 0 {
            Err(Error::from_errno(ret))
        }
        else {
            Ok(result(ret))
        }
    }

    /// Inverse of [`from_errno`](Error::from_errno): the representative
    /// negative errno code for this error kind. Used where a task's worker
    /// function must report a typed error through the plain `i32` the task
    /// engine's `Outcome::Done` carries.
    pub fn to_errno(&self) -> i32 {
        let errno = match self {
            Error::NotFound(_) => Errno::ENOENT,
            Error::BadArgument(_) => Errno::EINVAL,
            Error::Unsupported => Errno::ENOSYS,
            Error::Permission => Errno::EACCES,
            Error::Busy => Errno::EBUSY,
            Error::Timeout => Errno::ETIMEDOUT,
            Error::Cancelled => Errno::ECANCELED,
            Error::Broken => Errno::EPIPE,
            Error::Malformed(_) => Errno::EPROTO,
            Error::OutOfMemory => Errno::ENOMEM,
            Error::Io(_) => Errno::EIO,
        };
        -(errno as i32)
    }
}

impl From<NulError> for Error {
    fn from(_: NulError) -> Self {
        Error::BadArgument("string contains an interior NUL".into())
    }
}

impl From<ParseIntError> for Error {
    fn from(e: ParseIntError) -> Self {
        Error::BadArgument(e.to_string())
    }
}

impl From<ParseFloatError> for Error {
    fn from(e: ParseFloatError) -> Self {
        Error::BadArgument(e.to_string())
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::from_errno(-(e as i32))
    }
}
