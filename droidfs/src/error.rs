//! Error taxonomy shared by the node table, page cache, transports and engine.
//!
//! Device-side failures arrive either as an errno from the companion process or as
//! stderr text from the bridge tool; both are folded into [`BridgeError`] so the
//! engine can decide on retry and the kernel glue can map to an errno.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathHint(Option<String>);

impl PathHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) if !path.is_empty() => write!(f, ": {path}"),
            _ => Ok(()),
        }
    }
}

impl From<String> for PathHint {
    fn from(value: String) -> Self {
        Self::some(value)
    }
}

impl From<&str> for PathHint {
    fn from(value: &str) -> Self {
        Self::some(value)
    }
}

impl From<&Path> for PathHint {
    fn from(value: &Path) -> Self {
        Self::some(value.display().to_string())
    }
}

impl From<PathBuf> for PathHint {
    fn from(value: PathBuf) -> Self {
        Self::from(value.as_path())
    }
}

impl From<&PathBuf> for PathHint {
    fn from(value: &PathBuf) -> Self {
        Self::from(value.as_path())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("not found{path}")]
    NotFound { path: PathHint },

    #[error("already exists{path}")]
    AlreadyExists { path: PathHint },

    #[error("not a directory{path}")]
    NotADirectory { path: PathHint },

    #[error("is a directory{path}")]
    IsADirectory { path: PathHint },

    #[error("directory not empty{path}")]
    DirectoryNotEmpty { path: PathHint },

    #[error("operation not supported: {op}")]
    NotSupported { op: &'static str },

    #[error("remote operation timed out")]
    Timeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("remote error (errno {errno}): {message}")]
    Remote { errno: i32, message: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn not_found(path: impl Into<PathHint>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<PathHint>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn remote(errno: i32, message: impl Into<String>) -> Self {
        Self::Remote {
            errno,
            message: message.into(),
        }
    }

    /// Nearest POSIX errno for the kernel boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound { .. } => libc::ENOENT,
            Self::AlreadyExists { .. } => libc::EEXIST,
            Self::NotADirectory { .. } => libc::ENOTDIR,
            Self::IsADirectory { .. } => libc::EISDIR,
            Self::DirectoryNotEmpty { .. } => libc::ENOTEMPTY,
            Self::NotSupported { .. } => libc::ENOSYS,
            Self::Timeout => libc::ETIMEDOUT,
            Self::ConnectionLost(_) => libc::EIO,
            Self::Remote { errno, .. } => *errno,
            Self::InvalidState(_) => libc::EBADF,
            Self::Protocol(_) => libc::EPROTO,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// Inverse of [`errno`](Self::errno) for status codes reported by the device.
    pub fn from_errno(errno: i32, path: impl Into<PathHint>) -> Self {
        match errno {
            libc::ENOENT => Self::NotFound { path: path.into() },
            libc::EEXIST => Self::AlreadyExists { path: path.into() },
            libc::ENOTDIR => Self::NotADirectory { path: path.into() },
            libc::EISDIR => Self::IsADirectory { path: path.into() },
            libc::ENOTEMPTY => Self::DirectoryNotEmpty { path: path.into() },
            libc::ETIMEDOUT => Self::Timeout,
            other => Self::Remote {
                errno: other,
                message: format!("device reported errno {other}{}", path.into()),
            },
        }
    }

    /// Whether an idempotent operation may be reissued after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionLost(_) => true,
            Self::Remote { errno, .. } => {
                matches!(*errno, libc::EAGAIN | libc::EINTR | libc::EBUSY)
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::not_found(PathHint::none()),
            ErrorKind::AlreadyExists => Self::already_exists(PathHint::none()),
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Self::ConnectionLost(err.to_string()),
            ErrorKind::InvalidInput => Self::InvalidArgument(err.to_string()),
            ErrorKind::InvalidData => Self::Protocol(err.to_string()),
            _ => Self::Remote {
                errno: err.raw_os_error().unwrap_or(libc::EIO),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip_for_path_errors() {
        for errno in [
            libc::ENOENT,
            libc::EEXIST,
            libc::ENOTDIR,
            libc::EISDIR,
            libc::ENOTEMPTY,
        ] {
            assert_eq!(BridgeError::from_errno(errno, "/sdcard/a").errno(), errno);
        }
        let denied = BridgeError::from_errno(libc::EACCES, "/data");
        assert_eq!(denied.errno(), libc::EACCES);
        assert!(denied.to_string().contains("/data"));
    }

    #[test]
    fn only_link_failures_are_transient() {
        assert!(BridgeError::Timeout.is_transient());
        assert!(BridgeError::ConnectionLost("eof".into()).is_transient());
        assert!(BridgeError::remote(libc::EAGAIN, "busy").is_transient());
        assert!(!BridgeError::remote(libc::ENOSPC, "full").is_transient());
        assert!(!BridgeError::not_found("/x").is_transient());
        assert!(!BridgeError::NotSupported { op: "symlink" }.is_transient());
    }

    #[test]
    fn io_errors_fold_into_taxonomy() {
        let e: BridgeError = std::io::Error::from(ErrorKind::BrokenPipe).into();
        assert!(matches!(e, BridgeError::ConnectionLost(_)));
        let e: BridgeError = std::io::Error::from(ErrorKind::TimedOut).into();
        assert_eq!(e, BridgeError::Timeout);
    }

    #[test]
    fn path_hint_display() {
        assert_eq!(BridgeError::not_found("/a/b").to_string(), "not found: /a/b");
        assert_eq!(BridgeError::not_found(PathHint::none()).to_string(), "not found");
    }
}
