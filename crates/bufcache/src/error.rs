//! Error types for bufcache

use std::fmt;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations
///
/// Both variants are unrecoverable from the cache's point of view: a device
/// failure means the medium is gone, and exhaustion means every slot in the
/// pool is pinned, which is a resource-management bug in the caller. Neither
/// is retried or papered over here.
#[derive(Debug)]
pub enum Error {
    /// Physical device failure surfaced by the I/O bridge
    Disk(blockdev::Error),

    /// Every slot in the pool has a nonzero reference count
    Exhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Disk(e) => write!(f, "Device error: {}", e),
            Error::Exhausted => write!(f, "No free slots: every cached block is referenced"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Disk(e) => Some(e),
            Error::Exhausted => None,
        }
    }
}

impl From<blockdev::Error> for Error {
    fn from(err: blockdev::Error) -> Self {
        Error::Disk(err)
    }
}
