//! Block identities, the physical I/O trait, and an in-memory device

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Fixed block size in bytes for every device in this crate
pub const BLOCK_SIZE: usize = 1024;

/// Identity of one block: device number plus block number on that device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    /// Device number
    pub dev: u32,
    /// Block number on the device
    pub no: u32,
}

impl BlockId {
    /// Build an identity from device and block numbers
    pub fn new(dev: u32, no: u32) -> Self {
        Self { dev, no }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.no)
    }
}

/// Synchronous block transfer primitive
///
/// Transfers are whole-block and blocking; there are no partial reads or
/// writes. Implementations must be shareable across threads, since many
/// cache callers funnel into one device.
pub trait BlockIo: Send + Sync {
    /// Read the block identified by `id` into `buf` (`BLOCK_SIZE` bytes)
    fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` (`BLOCK_SIZE` bytes) to the block identified by `id`
    fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<()>;
}

/// In-memory multi-device block store
///
/// Backs tests and benchmarks that want device semantics without files.
/// Each registered device is a flat byte vector of `blocks * BLOCK_SIZE`.
pub struct MemDisk {
    devices: RwLock<HashMap<u32, Vec<u8>>>,
}

impl MemDisk {
    /// Create an empty store with no devices
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Register device `dev` with `blocks` zeroed blocks
    ///
    /// Re-registering a device resets its contents.
    pub fn add_device(&self, dev: u32, blocks: u32) {
        let mut devices = self.devices.write();
        devices.insert(dev, vec![0u8; blocks as usize * BLOCK_SIZE]);
    }

    /// Number of blocks on device `dev`
    pub fn blocks(&self, dev: u32) -> Result<u32> {
        let devices = self.devices.read();
        let data = devices.get(&dev).ok_or(Error::UnknownDevice(dev))?;
        Ok((data.len() / BLOCK_SIZE) as u32)
    }

    /// Copy of the current on-device contents of one block
    ///
    /// Bypasses any cache layered above, so tests can compare a cached view
    /// against what the medium actually holds.
    pub fn snapshot(&self, id: BlockId) -> Result<Vec<u8>> {
        let devices = self.devices.read();
        let data = devices.get(&id.dev).ok_or(Error::UnknownDevice(id.dev))?;
        let range = block_range(id, data.len())?;
        Ok(data[range].to_vec())
    }
}

impl Default for MemDisk {
    fn default() -> Self {
        Self::new()
    }
}

fn block_range(id: BlockId, len: usize) -> Result<std::ops::Range<usize>> {
    let start = id.no as usize * BLOCK_SIZE;
    if start + BLOCK_SIZE > len {
        return Err(Error::OutOfRange {
            id,
            blocks: (len / BLOCK_SIZE) as u32,
        });
    }
    Ok(start..start + BLOCK_SIZE)
}

impl BlockIo for MemDisk {
    fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::SizeMismatch(buf.len()));
        }

        let devices = self.devices.read();
        let data = devices.get(&id.dev).ok_or(Error::UnknownDevice(id.dev))?;
        let range = block_range(id, data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::SizeMismatch(buf.len()));
        }

        let mut devices = self.devices.write();
        let data = devices.get_mut(&id.dev).ok_or(Error::UnknownDevice(id.dev))?;
        let range = block_range(id, data.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }
}
