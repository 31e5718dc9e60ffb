//! # blockdev
//!
//! Fixed-size block devices behind one synchronous transfer trait.
//!
//! ## Contents
//! - [`BlockIo`]: whole-block, blocking read/write by (device, block number)
//! - [`DiskImage`]: single-device image file, memory-mapped
//! - [`MemDisk`]: multi-device in-memory store for tests and benchmarks
//! - 1 KB blocks, 16-byte image header

#![warn(missing_docs)]

mod device;
mod disk;
mod error;
mod parser;

pub use device::{BlockId, BlockIo, MemDisk, BLOCK_SIZE};
pub use disk::DiskImage;
pub use error::{Error, Result};
pub use parser::{ImageHeader, HEADER_LEN, IMAGE_MAGIC};
