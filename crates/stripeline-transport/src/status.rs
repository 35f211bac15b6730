//! Numeric per-operation status codes carried in RPC replies.
//!
//! A [`StatusCode`] is not an error type: it is payload. Local I/O failures
//! on either side of a replication are folded into one of these and shipped
//! back through the normal result stream, while transport failures stay in
//! [`crate::error::TransportError`].

use std::fmt;
use std::io;

/// Result code for a single remote operation (`0` is success).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusCode {
    /// Success.
    #[default]
    Ok,
    /// The named file does not exist.
    NoSuchFile,
    /// Access to the file was denied.
    PermissionDenied,
    /// The target filesystem is full.
    NoSpace,
    /// The source file changed (shrank) while it was being sent.
    Expired,
    /// A request argument was out of range.
    InvalidArgument,
    /// Generic input/output failure.
    Io,
    /// The peer violated the protocol.
    Protocol,
    /// The target already exists.
    AlreadyExists,
    /// The target is a directory.
    IsDirectory,
    /// A path component is not a directory.
    NotDirectory,
    /// The target filesystem is read-only.
    ReadOnlyFs,
    /// A code this build does not know about.
    Unknown(i32),
}

impl StatusCode {
    /// Wire value of this status.
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::NoSuchFile => 1,
            StatusCode::PermissionDenied => 2,
            StatusCode::NoSpace => 3,
            StatusCode::Expired => 4,
            StatusCode::InvalidArgument => 5,
            StatusCode::Io => 6,
            StatusCode::Protocol => 7,
            StatusCode::AlreadyExists => 8,
            StatusCode::IsDirectory => 9,
            StatusCode::NotDirectory => 10,
            StatusCode::ReadOnlyFs => 11,
            StatusCode::Unknown(code) => code,
        }
    }

    /// Decodes a wire value.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::NoSuchFile,
            2 => StatusCode::PermissionDenied,
            3 => StatusCode::NoSpace,
            4 => StatusCode::Expired,
            5 => StatusCode::InvalidArgument,
            6 => StatusCode::Io,
            7 => StatusCode::Protocol,
            8 => StatusCode::AlreadyExists,
            9 => StatusCode::IsDirectory,
            10 => StatusCode::NotDirectory,
            11 => StatusCode::ReadOnlyFs,
            other => StatusCode::Unknown(other),
        }
    }

    /// Maps a local I/O error, preferring the raw errno when there is one.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            let mapped = match errno {
                libc::ENOENT => Some(StatusCode::NoSuchFile),
                libc::EACCES | libc::EPERM => Some(StatusCode::PermissionDenied),
                libc::ENOSPC | libc::EDQUOT => Some(StatusCode::NoSpace),
                libc::EINVAL => Some(StatusCode::InvalidArgument),
                libc::EEXIST => Some(StatusCode::AlreadyExists),
                libc::EISDIR => Some(StatusCode::IsDirectory),
                libc::ENOTDIR => Some(StatusCode::NotDirectory),
                libc::EROFS => Some(StatusCode::ReadOnlyFs),
                _ => None,
            };
            if let Some(status) = mapped {
                return status;
            }
        }
        match err.kind() {
            io::ErrorKind::NotFound => StatusCode::NoSuchFile,
            io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            io::ErrorKind::AlreadyExists => StatusCode::AlreadyExists,
            io::ErrorKind::InvalidInput => StatusCode::InvalidArgument,
            io::ErrorKind::UnexpectedEof => StatusCode::Expired,
            _ => StatusCode::Io,
        }
    }

    /// True for [`StatusCode::Ok`].
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Keeps the first failure: records `other` only while `self` is still `Ok`.
    pub fn merge(&mut self, other: StatusCode) {
        if self.is_ok() {
            *self = other;
        }
    }

    /// Records the status of a failed local I/O result, first error wins.
    pub fn merge_io<T>(&mut self, result: &io::Result<T>) {
        if let Err(err) = result {
            self.merge(StatusCode::from_io(err));
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "success"),
            StatusCode::NoSuchFile => write!(f, "no such file or directory"),
            StatusCode::PermissionDenied => write!(f, "permission denied"),
            StatusCode::NoSpace => write!(f, "no space left on device"),
            StatusCode::Expired => write!(f, "file changed during transfer"),
            StatusCode::InvalidArgument => write!(f, "invalid argument"),
            StatusCode::Io => write!(f, "input/output error"),
            StatusCode::Protocol => write!(f, "protocol error"),
            StatusCode::AlreadyExists => write!(f, "already exists"),
            StatusCode::IsDirectory => write!(f, "is a directory"),
            StatusCode::NotDirectory => write!(f, "not a directory"),
            StatusCode::ReadOnlyFs => write!(f, "read-only file system"),
            StatusCode::Unknown(code) => write!(f, "unknown error {}", code),
        }
    }
}
