//! Memory-mapped disk image device
//!
//! File layout:
//! - 16-byte header (magic, version, block count)
//! - `block_count * BLOCK_SIZE` bytes of block data

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::device::{BlockId, BlockIo, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::parser::{create_header, parse_header, HEADER_LEN};

/// Current disk image format version
const IMAGE_VERSION: u32 = 1;

/// A single-device disk image backed by a memory-mapped file
pub struct DiskImage {
    /// Device number this image answers for
    dev: u32,

    /// Number of blocks in the image
    blocks: u32,

    /// Mapped image contents (header + block data)
    map: RwLock<MmapMut>,
}

impl DiskImage {
    /// Create a new zero-filled image at `path` serving device `dev`
    ///
    /// # Arguments
    /// * `path` - Image file path
    /// * `dev` - Device number
    /// * `blocks` - Number of blocks to allocate
    pub fn create<P: AsRef<Path>>(path: P, dev: u32, blocks: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_len(HEADER_LEN as u64 + blocks as u64 * BLOCK_SIZE as u64)?;

        // SAFETY: the file was just created and is not mapped elsewhere.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[..HEADER_LEN].copy_from_slice(&create_header(IMAGE_VERSION, blocks));
        map.flush()?;

        Ok(DiskImage {
            dev,
            blocks,
            map: RwLock::new(map),
        })
    }

    /// Open an existing image at `path` serving device `dev`
    pub fn open<P: AsRef<Path>>(path: P, dev: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: the image file is owned by this handle for its lifetime.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let header = parse_header(&map)?;

        let expected = HEADER_LEN + header.block_count as usize * BLOCK_SIZE;
        if map.len() < expected {
            return Err(Error::Parse(format!(
                "Image truncated: {} bytes, header promises {}",
                map.len(),
                expected
            )));
        }

        Ok(DiskImage {
            dev,
            blocks: header.block_count,
            map: RwLock::new(map),
        })
    }

    /// Device number this image serves
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Number of blocks in the image
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// Flush all mapped changes to the backing file
    pub fn sync(&self) -> Result<()> {
        self.map.read().flush()?;
        Ok(())
    }

    fn offset(&self, id: BlockId) -> Result<usize> {
        if id.dev != self.dev {
            return Err(Error::UnknownDevice(id.dev));
        }
        if id.no >= self.blocks {
            return Err(Error::OutOfRange {
                id,
                blocks: self.blocks,
            });
        }
        Ok(HEADER_LEN + id.no as usize * BLOCK_SIZE)
    }
}

impl BlockIo for DiskImage {
    fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::SizeMismatch(buf.len()));
        }

        let offset = self.offset(id)?;
        let map = self.map.read();
        buf.copy_from_slice(&map[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::SizeMismatch(buf.len()));
        }

        let offset = self.offset(id)?;
        let mut map = self.map.write();
        map[offset..offset + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

impl Drop for DiskImage {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}
