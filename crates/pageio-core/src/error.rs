//! Error types for pageio
//!
//! Capacity conditions are not errors here: queues and senders report how
//! much they accepted, and `TrySendError` hands a rejected message back.
//! Reference-count violations on pooled computations panic instead of
//! returning, see `compute`.

use std::fmt;

use crate::io::FileId;

/// Result type for pageio operations
pub type Result<T> = std::result::Result<T, IoError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// OS call failed with this errno
    Os(i32),
    /// No disk thread or engine knows this file
    UnknownFile(FileId),
    /// I/O engine could not be created (errno)
    EngineSetup(i32),
    /// Page-aligned mapping of this many bytes failed
    Mmap(usize),
    /// A load read returned fewer bytes than the file holds
    ShortRead { offset: u64, expected: usize, got: usize },
    /// Configuration rejected by `validate()`
    Config(&'static str),
    /// Could not start a disk thread
    ThreadSpawn,
    /// Every slot of a computation pool is live
    PoolExhausted,
    /// The I/O system is shutting down
    ShutDown,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Os(errno) => write!(f, "os error {}", errno),
            IoError::UnknownFile(id) => write!(f, "unknown file #{}", id.0),
            IoError::EngineSetup(errno) => write!(f, "I/O engine setup failed: errno {}", errno),
            IoError::Mmap(len) => write!(f, "failed to map {} bytes", len),
            IoError::ShortRead { offset, expected, got } => write!(
                f,
                "short read at offset {}: expected {} bytes, got {}",
                offset, expected, got
            ),
            IoError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            IoError::ThreadSpawn => write!(f, "failed to spawn disk thread"),
            IoError::PoolExhausted => write!(f, "computation pool exhausted"),
            IoError::ShutDown => write!(f, "I/O system shut down"),
        }
    }
}

impl std::error::Error for IoError {}

impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> Self {
        IoError::Os(e.raw_os_error().unwrap_or(-1))
    }
}

/// Message handed back by a sender that had no room for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrySendError<T>(pub T);

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender buffer full")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(IoError::UnknownFile(FileId(3)).to_string(), "unknown file #3");
        let e = IoError::ShortRead { offset: 4096, expected: 10, got: 4 };
        assert_eq!(e.to_string(), "short read at offset 4096: expected 10 bytes, got 4");
    }

    #[test]
    fn test_from_io_error() {
        const ENOENT: i32 = 2;
        let e: IoError = std::io::Error::from_raw_os_error(ENOENT).into();
        assert_eq!(e, IoError::Os(ENOENT));
        let e: IoError = std::io::Error::new(std::io::ErrorKind::Other, "x").into();
        assert_eq!(e, IoError::Os(-1));
    }
}
