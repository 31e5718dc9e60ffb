//! # bufcache
//!
//! Fixed-capacity, sharded buffer cache for disk blocks.
//!
//! ## Architecture
//! - **Slot pool**: flat arena of block-sized slots, one in-memory copy per
//!   cached block
//! - **Bucket table**: AHash-sharded directory of slot indices, one
//!   short-hold lock per bucket
//! - **Eviction**: global scan for the unreferenced slot ranked by recency
//!   stamp, with slot migration between buckets
//! - **Access**: per-slot blocking exclusive lock, handed to callers as a
//!   guard; pinning keeps blocks resident without the lock
//!
//! Misses read through a [`BlockIo`] device; writes go through on demand via
//! [`BlockGuard::flush`].

#![warn(missing_docs)]

mod cache;
mod clock;
mod error;
mod pool;
mod stats;

pub use blockdev::{BlockId, BlockIo, BLOCK_SIZE};
pub use cache::{BlockGuard, BufCache, PinHandle, BUCKET_COUNT, SLOT_COUNT};
pub use clock::TickClock;
pub use error::{Error, Result};
pub use stats::CacheStats;
