use std::fmt::Display;
use std::io;

/// A specialized error type for write log operations.
///
/// Errors are `Clone` because a failed append batch fans the same failure out
/// to every operation's persist completion.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// An extent was not aligned to the block size.
    #[error("unaligned extent: offset={offset} length={length}")]
    Unaligned { offset: u64, length: u64 },
    /// The cache is read-only (snapshot or explicitly configured).
    #[error("cache is read-only")]
    ReadOnly,
    /// The pool was created by an incompatible layout version.
    #[error("pool layout version is {found}, expected {expected}")]
    LayoutMismatch { expected: u8, found: u8 },
    /// The pool was created with a different block size.
    #[error("pool block size is {found}, expected {expected}")]
    BlockSizeMismatch { expected: u32, found: u32 },
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Pool create/open/flush failed.
    #[error("pool I/O error: {message}")]
    PoolIo {
        errno: Option<i32>,
        message: String,
    },
    /// The atomic descriptor publish failed; the batch is unobservable.
    #[error("log append transaction aborted: {0}")]
    TransactionAborted(String),
    /// A single payload reservation can never fit the pool.
    #[error("payload reservation of {requested} bytes exceeds pool capacity {capacity}")]
    PayloadTooLarge { requested: u64, capacity: u64 },
    /// The write buffer does not match the extents it should cover.
    #[error("buffer holds {found} bytes but the extents cover {expected}")]
    BufferSizeMismatch { expected: u64, found: u64 },
    /// The cache is shutting down and no longer admits requests.
    #[error("cache is shutting down")]
    ShuttingDown,
    /// On-pmem state failed validation.
    #[error("corrupted pool: {0}")]
    Corruption(String),
}

impl CacheError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// The errno-flavoured code this error surfaces as at the client API.
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::Unaligned { .. }
            | CacheError::LayoutMismatch { .. }
            | CacheError::BlockSizeMismatch { .. }
            | CacheError::BufferSizeMismatch { .. }
            | CacheError::InvalidConfig(_) => libc::EINVAL,
            CacheError::ReadOnly => libc::EROFS,
            CacheError::PoolIo { errno, .. } => errno.unwrap_or(libc::EIO),
            CacheError::TransactionAborted(_) => libc::EIO,
            CacheError::PayloadTooLarge { .. } => libc::ENOSPC,
            CacheError::ShuttingDown => libc::ESHUTDOWN,
            CacheError::Corruption(_) => libc::EIO,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::PoolIo {
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

/// A Result type alias for write log operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(CacheError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(
            CacheError::Unaligned {
                offset: 3,
                length: 512
            }
            .errno(),
            libc::EINVAL
        );
        assert_eq!(
            CacheError::TransactionAborted("tx".to_string()).errno(),
            libc::EIO
        );
    }

    #[test]
    fn io_error_preserves_errno() {
        let err = CacheError::from(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.errno(), libc::ENOSPC);
    }

    #[test]
    fn invalid_config_helper() {
        let err = CacheError::invalid_config("bad pool size");
        assert!(matches!(err, CacheError::InvalidConfig(msg) if msg == "bad pool size"));
    }
}
