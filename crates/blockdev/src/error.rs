//! Error types for blockdev

use std::fmt;
use std::io;

use crate::BlockId;

/// Result type alias for block device operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for block device operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Image header parse error
    Parse(String),

    /// Request addressed to a device this backend does not serve
    UnknownDevice(u32),

    /// Block number past the end of the device
    OutOfRange {
        /// Offending block identity
        id: BlockId,
        /// Number of blocks the device holds
        blocks: u32,
    },

    /// Caller buffer does not match the device block size
    SizeMismatch(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Parse(msg) => write!(f, "Parse error: {}", msg),
            Error::UnknownDevice(dev) => write!(f, "Unknown device: {}", dev),
            Error::OutOfRange { id, blocks } => {
                write!(f, "Block {} out of range (device has {} blocks)", id, blocks)
            }
            Error::SizeMismatch(len) => {
                write!(f, "Buffer size {} does not match block size", len)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
